//! Drift resolution against a state document
//!
//! [`StateResolver`] applies "update state" actions to an in-memory copy of
//! a state. Pushing values to live resources needs a provider driver, so
//! "update resource" actions are refused unless a driver is attached.

use kolumn_core::drift::{DriftResolver, FieldTarget};
use kolumn_core::provider::{BoxFuture, ProviderError, ProviderResult};
use parking_lot::Mutex;
use serde_json::Value;

use crate::state::StateDocument;

pub struct StateResolver {
    state: Mutex<StateDocument>,
    driver: Option<Box<dyn DriftResolver>>,
}

impl StateResolver {
    pub fn new(state: StateDocument) -> Self {
        Self {
            state: Mutex::new(state),
            driver: None,
        }
    }

    /// Forward "update resource" actions to `driver`
    pub fn with_driver(mut self, driver: Box<dyn DriftResolver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// The state with every applied update
    pub fn into_state(self) -> StateDocument {
        self.state.into_inner()
    }

    fn set_field(&self, target: &FieldTarget, value: &Value) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let resource = state.find_resource_mut(&target.resource_id).ok_or_else(|| {
            ProviderError::new("resource is not in state").for_resource(&target.resource_id)
        })?;
        let instance = resource.instances.get_mut(target.instance).ok_or_else(|| {
            ProviderError::new(format!("instance {} does not exist", target.instance))
                .for_resource(&target.resource_id)
        })?;

        if value.is_null() {
            instance.attributes.remove(&target.field);
        } else {
            instance
                .attributes
                .insert(target.field.clone(), value.clone());
        }
        Ok(())
    }
}

impl DriftResolver for StateResolver {
    fn update_state_field<'a>(
        &'a self,
        target: &'a FieldTarget,
        value: &'a Value,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move { self.set_field(target, value) })
    }

    fn update_resource_field<'a>(
        &'a self,
        target: &'a FieldTarget,
        value: &'a Value,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            match &self.driver {
                Some(driver) => driver.update_resource_field(target, value).await,
                None => Err(ProviderError::new("no provider driver attached to update live resources")
                    .for_resource(&target.resource_id)),
            }
        })
    }
}
