//! Kolumn Core
//!
//! Resource model and the analyses that run over a state snapshot:
//! dependency graph construction and ordering, impact analysis, drift
//! detection and collection health.

pub mod collection;
pub mod drift;
pub mod graph;
pub mod provider;
pub mod resource;
