use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use similar::{ChangeTag, TextDiff};

use kolumn_core::drift::{DriftAnalysis, DriftDetector, DriftSeverity, ResolutionStrategy};
use kolumn_core::graph::{ChangeKind, DependencyGraph, ImpactSeverity, format_cycle};
use kolumn_core::provider::{ResourceObserver, SnapshotObserver};
use kolumn_core::resource::{InstanceStatus, Resource};
use kolumn_core::collection::{Collection, CollectionState};
use kolumn_state::{
    BackendConfig, CollectionManager, DeleteMode, ManagerConfig, StateDocument,
    StateManager, StateResolver, create_backend,
};

#[derive(Parser)]
#[command(name = "kolumn")]
#[command(about = "State, dependency and drift management for Kolumn", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BackendArgs {
    /// State backend: memory, local, sql or s3
    #[arg(long, env = "KOLUMN_BACKEND", default_value = "local", global = true)]
    backend: String,

    /// Backend setting, repeatable (e.g. --set path=.kolumn --set backup_count=5)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    settings: Vec<String>,

    /// Workspace recorded on states that do not name one
    #[arg(long, env = "KOLUMN_WORKSPACE", global = true)]
    workspace: Option<String>,

    /// Environment recorded on states that do not name one
    #[arg(long, env = "KOLUMN_ENVIRONMENT", global = true)]
    environment: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage stored states
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Analyze the dependency graph of a state
    Graph {
        /// State name
        state: String,

        /// Print JSON instead of text
        #[arg(long, global = true)]
        json: bool,

        #[command(subcommand)]
        command: GraphCommands,
    },
    /// Compare a state with observed resource attributes
    Drift {
        /// State name
        state: String,

        /// JSON file mapping resource IDs to observed attributes
        #[arg(long)]
        observed: PathBuf,

        /// Only check these resources (repeatable)
        #[arg(long = "resource")]
        resources: Vec<String>,

        /// Write auto-resolvable drift back to the state
        #[arg(long)]
        apply: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Manage resource collections of a state
    Collection {
        /// State name
        state: String,

        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List stored states
    List,
    /// Show a state summary
    Show {
        name: String,

        /// Print the full document as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a state
    Rm {
        name: String,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Write a state as JSON to a file or stdout
    Export {
        name: String,

        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Store a JSON document under a state name
    Import { name: String, file: PathBuf },
    /// Copy a state to a timestamped backup
    Backup { name: String },
    /// Overwrite a state with one of its backups
    Restore {
        backup: String,

        /// State to overwrite (default: derived from the backup name)
        #[arg(long)]
        target: Option<String>,
    },
    /// Show the differences between two states
    Diff { from: String, to: String },
    /// Upgrade a state to a newer document version
    Migrate {
        name: String,

        /// Target version (default: the current version)
        #[arg(long)]
        to: Option<u32>,
    },
    /// Acquire a lock and print its ID
    Lock {
        name: String,

        #[arg(long, default_value = "manual")]
        operation: String,

        #[arg(long)]
        reason: Option<String>,
    },
    /// Release a lock by ID
    Unlock { name: String, lock_id: String },
}

#[derive(Subcommand)]
enum GraphCommands {
    /// Execution batches for every resource
    Batches,
    /// Execution batches for the given resources only
    Order {
        #[arg(required = true)]
        resources: Vec<String>,
    },
    /// Dependency cycles
    Cycles,
    /// Resources with no dependencies in either direction
    Orphans,
    /// Longest prerequisite chain
    CriticalPath,
    /// Resources affected by a change to one resource
    Impact {
        resource: String,

        /// create, update, replace, delete or destroy
        #[arg(long, default_value = "update")]
        change: String,
    },
    /// Check for missing dependencies and cycles
    Validate {
        /// Validate a single resource
        resource: Option<String>,
    },
}

#[derive(Subcommand)]
enum CollectionCommands {
    /// List collections with their health
    List,
    /// Create an empty collection
    Create {
        name: String,

        #[arg(long)]
        description: Option<String>,
    },
    /// Add a resource to a collection
    Add { collection: String, resource: String },
    /// Remove a resource from a collection
    Remove { collection: String, resource: String },
    /// Record that a collection depends on another
    Depend { collection: String, on: String },
    /// Recompute collection health
    Health {
        /// Only this collection
        name: Option<String>,
    },
    /// Delete a collection
    Delete {
        name: String,

        /// Also delete member resources and their dependencies
        #[arg(long)]
        cascade: bool,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run_command(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_command(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::State { command } => {
            let manager = open_manager(&cli.backend).await?;
            run_state_command(&manager, command).await
        }
        Commands::Graph {
            state,
            json,
            command,
        } => {
            let manager = open_manager(&cli.backend).await?;
            run_graph_command(&manager, &state, command, json).await
        }
        Commands::Drift {
            state,
            observed,
            resources,
            apply,
            json,
        } => {
            let manager = open_manager(&cli.backend).await?;
            run_drift(&manager, &state, &observed, &resources, apply, json).await
        }
        Commands::Collection { state, command } => {
            let manager = open_manager(&cli.backend).await?;
            run_collection_command(&manager, &state, command).await
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kolumn", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Build the backend configuration from `--backend` and `--set` flags
fn backend_config(args: &BackendArgs) -> Result<BackendConfig, String> {
    let mut config = BackendConfig::new(&args.backend);
    for setting in &args.settings {
        let (key, value) = parse_setting(setting)?;
        config = config.with(key, value);
    }
    Ok(config)
}

fn parse_setting(setting: &str) -> Result<(&str, &str), String> {
    match setting.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => Err(format!(
            "Invalid backend setting '{}': expected KEY=VALUE",
            setting
        )),
    }
}

async fn open_manager(args: &BackendArgs) -> Result<StateManager, String> {
    let config = backend_config(args)?;
    let backend = create_backend(&config)
        .await
        .map_err(|e| format!("Failed to open {} backend: {}", args.backend, e))?;

    let defaults = ManagerConfig::default();
    let manager_config = ManagerConfig {
        workspace: args.workspace.clone().unwrap_or(defaults.workspace),
        environment: args.environment.clone().unwrap_or(defaults.environment),
        ..defaults
    };

    let manager = StateManager::new(backend, manager_config);
    if !manager.capabilities().distributed_locking {
        log::debug!(
            "{} backend does not provide distributed locking",
            manager.backend().backend_type()
        );
    }
    Ok(manager)
}

fn confirm(question: &str) -> Result<bool, String> {
    println!("{}", question.yellow().bold());
    println!(
        "  {}",
        "This action cannot be undone. Type 'yes' to confirm.".yellow()
    );
    print!("\n  Enter a value: ");
    std::io::stdout().flush().map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;
    println!();
    Ok(input.trim() == "yes")
}

// ---------------------------------------------------------------------------
// state
// ---------------------------------------------------------------------------

async fn run_state_command(manager: &StateManager, command: StateCommands) -> Result<(), String> {
    match command {
        StateCommands::List => {
            let names = manager.list().await.map_err(|e| e.to_string())?;
            if names.is_empty() {
                println!("{}", "No states stored.".yellow());
            }
            for name in names {
                let lock = manager
                    .current_lock(&name)
                    .await
                    .map_err(|e| e.to_string())?;
                match lock {
                    Some(lock) => println!("{} {}", name, format!("(locked by {})", lock.who).yellow()),
                    None => println!("{}", name),
                }
            }
            Ok(())
        }
        StateCommands::Show { name, json } => {
            let state = manager.get(&name).await.map_err(|e| e.to_string())?;
            if json {
                print_json(&state)
            } else {
                print_state(&name, &state);
                Ok(())
            }
        }
        StateCommands::Rm { name, auto_approve } => {
            manager.get(&name).await.map_err(|e| e.to_string())?;
            if !auto_approve && !confirm(&format!("Do you really want to delete state {}?", name))? {
                println!("{}", "Delete cancelled.".yellow());
                return Ok(());
            }
            manager.delete(&name).await.map_err(|e| e.to_string())?;
            println!("{} Deleted state {}", "✓".green(), name.bold());
            Ok(())
        }
        StateCommands::Export { name, output } => {
            let bytes = manager.export(&name).await.map_err(|e| e.to_string())?;
            match output {
                Some(path) => {
                    fs::write(&path, &bytes)
                        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
                    println!("{} Exported {} to {}", "✓".green(), name.bold(), path.display());
                }
                None => {
                    std::io::stdout()
                        .write_all(&bytes)
                        .map_err(|e| e.to_string())?;
                    println!();
                }
            }
            Ok(())
        }
        StateCommands::Import { name, file } => {
            let bytes =
                fs::read(&file).map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
            let state = manager
                .import(&name, &bytes)
                .await
                .map_err(|e| e.to_string())?;
            println!(
                "{} Imported {} (serial {}, {} resources)",
                "✓".green(),
                name.bold(),
                state.serial,
                state.resources.len()
            );
            Ok(())
        }
        StateCommands::Backup { name } => {
            let backup = manager.backup(&name).await.map_err(|e| e.to_string())?;
            println!("{} Backed up {} to {}", "✓".green(), name.bold(), backup.bold());
            Ok(())
        }
        StateCommands::Restore { backup, target } => {
            let target = match target {
                Some(target) => target,
                None => backup_source(&backup).ok_or_else(|| {
                    format!(
                        "Cannot derive the target state from '{}'; pass --target",
                        backup
                    )
                })?,
            };
            let state = manager
                .restore(&backup, &target)
                .await
                .map_err(|e| e.to_string())?;
            println!(
                "{} Restored {} from {} (serial {})",
                "✓".green(),
                target.bold(),
                backup,
                state.serial
            );
            Ok(())
        }
        StateCommands::Diff { from, to } => {
            let from_json = export_string(manager, &from).await?;
            let to_json = export_string(manager, &to).await?;
            if from_json == to_json {
                println!("{}", "No differences.".green());
            } else {
                print_diff(&from, &to, &from_json, &to_json);
            }
            Ok(())
        }
        StateCommands::Migrate { name, to } => {
            match manager.migrate(&name, to).await.map_err(|e| e.to_string())? {
                Some(record) => println!(
                    "{} Migrated {} from v{} to v{} (backup: {})",
                    "✓".green(),
                    name.bold(),
                    record.from_version,
                    record.to_version,
                    record.backup.as_deref().unwrap_or("none")
                ),
                None => println!("{}", format!("{} is already up-to-date.", name).green()),
            }
            Ok(())
        }
        StateCommands::Lock {
            name,
            operation,
            reason,
        } => {
            let lock = manager
                .lock(&name, &operation, reason.as_deref())
                .await
                .map_err(|e| e.to_string())?;
            println!("{} Locked {}", "✓".green(), name.bold());
            println!("  Lock ID: {}", lock.id);
            if !manager.capabilities().distributed_locking {
                println!(
                    "  {}",
                    format!(
                        "Note: the {} backend does not enforce locks across processes.",
                        manager.backend().backend_type()
                    )
                    .yellow()
                );
            }
            Ok(())
        }
        StateCommands::Unlock { name, lock_id } => {
            manager
                .backend()
                .unlock(&name, &lock_id)
                .await
                .map_err(|e| e.to_string())?;
            println!("{} Unlocked {}", "✓".green(), name.bold());
            Ok(())
        }
    }
}

/// `prod.backup.20260101120000123` -> `prod`
fn backup_source(backup: &str) -> Option<String> {
    backup
        .rsplit_once(".backup.")
        .map(|(source, _)| source.to_string())
        .filter(|source| !source.is_empty())
}

async fn export_string(manager: &StateManager, name: &str) -> Result<String, String> {
    let bytes = manager.export(name).await.map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn print_state(name: &str, state: &StateDocument) {
    println!("{} {}", "State:".cyan().bold(), name.bold());
    println!("  Version:     {}", state.version);
    println!("  Serial:      {}", state.serial);
    println!("  Lineage:     {}", state.lineage);
    println!("  Workspace:   {}", state.metadata.workspace);
    println!("  Environment: {}", state.metadata.environment);
    if let Some(updated) = state.updated_at {
        println!("  Updated:     {}", updated.to_rfc3339());
    }
    println!();

    if state.resources.is_empty() {
        println!("{}", "No resources.".yellow());
    } else {
        println!("{}", "Resources:".cyan().bold());
        for resource in &state.resources {
            println!("  {} {}", status_symbol(resource), resource.id());
        }
    }

    if !state.dependencies.is_empty() {
        println!();
        println!("{}", "Dependencies:".cyan().bold());
        for dependency in &state.dependencies {
            let optional = if dependency.optional { " (optional)" } else { "" };
            println!(
                "  {} -> {} [{}]{}",
                dependency.from, dependency.to, dependency.kind, optional
            );
        }
    }

    if !state.collections.is_empty() {
        println!();
        println!("{}", "Collections:".cyan().bold());
        for collection in &state.collections {
            print_collection_line(collection);
        }
    }
}

fn status_symbol(resource: &Resource) -> colored::ColoredString {
    if resource.has_errors() {
        "✗".red()
    } else if resource.is_healthy() {
        "✓".green()
    } else if resource
        .instances
        .iter()
        .any(|i| i.status == InstanceStatus::Deleting)
    {
        "-".yellow()
    } else {
        "~".yellow()
    }
}

fn print_diff(from: &str, to: &str, original: &str, changed: &str) {
    println!(
        "\n{} {} -> {}:",
        "Diff for".cyan().bold(),
        from,
        to
    );

    let diff = TextDiff::from_lines(original, changed);
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "-".red(),
            ChangeTag::Insert => "+".green(),
            ChangeTag::Equal => " ".normal(),
        };
        print!("{}{}", sign, change);
    }
}

// ---------------------------------------------------------------------------
// graph
// ---------------------------------------------------------------------------

async fn run_graph_command(
    manager: &StateManager,
    state_name: &str,
    command: GraphCommands,
    json: bool,
) -> Result<(), String> {
    let state = manager.get(state_name).await.map_err(|e| e.to_string())?;
    let graph = state.dependency_graph();

    match command {
        GraphCommands::Batches => {
            let batches = graph.execution_batches().map_err(|e| e.to_string())?;
            if json {
                return print_json(&batches);
            }
            print_batches(&batches);
        }
        GraphCommands::Order { resources } => {
            let batches = graph
                .execution_order(&resources)
                .map_err(|e| e.to_string())?;
            if json {
                return print_json(&batches);
            }
            print_batches(&batches);
        }
        GraphCommands::Cycles => {
            let cycles = graph.find_cycles();
            if json {
                return print_json(&cycles);
            }
            if cycles.is_empty() {
                println!("{}", "No dependency cycles.".green());
            }
            for cycle in &cycles {
                println!("  {} {}", "✗".red(), format_cycle(cycle));
            }
        }
        GraphCommands::Orphans => {
            let orphans = graph.orphans();
            if json {
                return print_json(&orphans);
            }
            if orphans.is_empty() {
                println!("{}", "No orphaned resources.".green());
            }
            for orphan in orphans {
                println!("  {}", orphan);
            }
        }
        GraphCommands::CriticalPath => {
            let path = graph.critical_path().map_err(|e| e.to_string())?;
            if json {
                return print_json(&path);
            }
            println!(
                "{} {} resources, {} steps",
                "Critical path:".cyan().bold(),
                path.resources.len(),
                path.length()
            );
            println!("  {}", path.resources.join(" -> "));
        }
        GraphCommands::Impact { resource, change } => {
            let change: ChangeKind = change.parse()?;
            let report = graph
                .impact_analysis(&resource, change)
                .map_err(|e| e.to_string())?;
            if json {
                return print_json(&report);
            }
            if report.is_empty() {
                println!("{}", format!("Nothing depends on {}.", resource).green());
                return Ok(());
            }
            println!(
                "{} {} ({:?})",
                "Impact of changing".cyan().bold(),
                resource.bold(),
                change
            );
            for impact in &report.impacts {
                println!(
                    "  {} {} [{:?}, distance {}, via {}]",
                    impact_symbol(impact.severity),
                    impact.resource,
                    impact.kind,
                    impact.distance,
                    impact.via
                );
            }
        }
        GraphCommands::Validate { resource } => {
            return match resource {
                Some(id) => validate_one(&graph, &id, json),
                None => validate_all(&graph, json),
            };
        }
    }
    Ok(())
}

fn print_batches(batches: &[kolumn_core::graph::ExecutionBatch]) {
    if batches.is_empty() {
        println!("{}", "No resources.".yellow());
        return;
    }
    println!("{}", "Execution Batches:".cyan().bold());
    for batch in batches {
        println!(
            "  {} {}",
            format!("{}.", batch.level + 1).bold(),
            batch.resources.join(", ")
        );
    }
}

fn impact_symbol(severity: ImpactSeverity) -> colored::ColoredString {
    match severity {
        ImpactSeverity::Critical => "!!".red().bold(),
        ImpactSeverity::High => "!".red(),
        ImpactSeverity::Medium => "~".yellow(),
        ImpactSeverity::Low => "-".normal(),
    }
}

fn validate_one(graph: &DependencyGraph, id: &str, json: bool) -> Result<(), String> {
    let validation = graph.validate_resource(id).map_err(|e| e.to_string())?;
    if json {
        print_json(&validation)?;
    } else {
        for missing in &validation.missing {
            let label = if missing.optional { "optional" } else { "missing" };
            println!("  {} {} requires {} ({})", "✗".red(), missing.from, missing.to, label);
        }
        for cycle in &validation.cycles {
            println!("  {} cycle: {}", "✗".red(), format_cycle(cycle));
        }
    }

    if validation.is_valid() {
        if !json {
            println!("{} {} dependencies are valid", "✓".green(), id);
        }
        Ok(())
    } else {
        Err(format!("{} has invalid dependencies", id))
    }
}

fn validate_all(graph: &DependencyGraph, json: bool) -> Result<(), String> {
    let stats = graph.statistics();
    let missing = graph.missing_dependencies();
    let cycles = graph.find_cycles();

    if json {
        print_json(&serde_json::json!({
            "statistics": stats,
            "missing": missing,
            "cycles": cycles,
        }))?;
    } else {
        println!(
            "{} {} resources, {} dependencies, {} orphans",
            "Graph:".cyan().bold(),
            stats.nodes,
            stats.edges,
            stats.orphans
        );
        for dependency in missing {
            println!(
                "  {} {} requires unknown resource {}",
                if dependency.optional { "~".yellow() } else { "✗".red() },
                dependency.from,
                dependency.to
            );
        }
        for cycle in &cycles {
            println!("  {} cycle: {}", "✗".red(), format_cycle(cycle));
        }
    }

    let required_missing = missing.iter().filter(|m| !m.optional).count();
    if cycles.is_empty() && required_missing == 0 {
        if !json {
            println!("{}", "Dependency graph is valid.".green());
        }
        Ok(())
    } else {
        Err(format!(
            "{} missing dependencies, {} cycles",
            required_missing,
            cycles.len()
        ))
    }
}

// ---------------------------------------------------------------------------
// drift
// ---------------------------------------------------------------------------

async fn run_drift(
    manager: &StateManager,
    state_name: &str,
    observed: &Path,
    only: &[String],
    apply: bool,
    json: bool,
) -> Result<(), String> {
    let content = fs::read_to_string(observed)
        .map_err(|e| format!("Failed to read {}: {}", observed.display(), e))?;
    let snapshot: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse {}: {}", observed.display(), e))?;
    let observer = SnapshotObserver::from_json(&snapshot).map_err(|e| e.to_string())?;

    let run = check_drift(manager, state_name, &observer, only, apply).await?;

    if json {
        print_json(&run.analyses)?;
    } else {
        print_drift(&run.analyses);
    }

    if !apply {
        return Ok(());
    }

    println!();
    println!(
        "{} Wrote {} drifted fields back to {}",
        "✓".green(),
        run.applied,
        state_name.bold()
    );
    if !run.needs_review.is_empty() {
        println!(
            "{}",
            "Not applied, review required:".yellow().bold()
        );
        for id in &run.needs_review {
            println!("  {} {}", "!".yellow(), id);
        }
    }
    Ok(())
}

/// Outcome of one drift check
#[derive(Debug)]
struct DriftRun {
    analyses: Vec<DriftAnalysis>,
    /// Fields written back to the state
    applied: usize,
    /// Drifted resources whose strategy is not `UpdateState`
    needs_review: Vec<String>,
}

/// Detect drift, and with `apply` write auto-resolvable drift back.
///
/// With `apply` the state lock is held from the read until the write, so
/// the analyses and the resolutions use the same document.
async fn check_drift(
    manager: &StateManager,
    state_name: &str,
    observer: &dyn ResourceObserver,
    only: &[String],
    apply: bool,
) -> Result<DriftRun, String> {
    if !apply {
        return detect_and_resolve(manager, state_name, observer, only, false).await;
    }

    let lock = manager
        .lock(state_name, "drift", None)
        .await
        .map_err(|e| e.to_string())?;
    let result = detect_and_resolve(manager, state_name, observer, only, true).await;
    let released = manager.unlock(&lock).await;

    match (result, released) {
        (Ok(run), Ok(())) => Ok(run),
        (Ok(_), Err(e)) => Err(format!("Failed to release lock: {}", e)),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(unlock_err)) => {
            log::warn!("Failed to release lock on {}: {}", state_name, unlock_err);
            Err(e)
        }
    }
}

async fn detect_and_resolve(
    manager: &StateManager,
    state_name: &str,
    observer: &dyn ResourceObserver,
    only: &[String],
    apply: bool,
) -> Result<DriftRun, String> {
    let state = manager.get(state_name).await.map_err(|e| e.to_string())?;
    let resources: Vec<Resource> = if only.is_empty() {
        state.resources.clone()
    } else {
        only.iter()
            .map(|id| {
                state
                    .find_resource(id)
                    .cloned()
                    .ok_or_else(|| format!("Resource {} is not in state {}", id, state_name))
            })
            .collect::<Result<_, _>>()?
    };

    let detector = DriftDetector::default();
    let analyses = detector
        .detect_all(&resources, observer)
        .await
        .map_err(|e| e.to_string())?;

    let mut run = DriftRun {
        analyses,
        applied: 0,
        needs_review: Vec::new(),
    };
    if !apply {
        return Ok(run);
    }

    let resolver = StateResolver::new(state);
    for analysis in run.analyses.iter().filter(|a| a.has_drift) {
        if analysis.strategy != ResolutionStrategy::UpdateState {
            run.needs_review.push(analysis.resource_id.clone());
            continue;
        }
        let report = detector.resolve(analysis, Vec::new(), &resolver).await;
        for failed in &report.failed {
            log::warn!("{}: {}", failed.action.target(), failed.error);
        }
        run.applied += report.applied.len();
    }

    if run.applied > 0 {
        manager
            .put(state_name, resolver.into_state())
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(run)
}

fn print_drift(analyses: &[DriftAnalysis]) {
    let drifted: Vec<&DriftAnalysis> = analyses.iter().filter(|a| a.has_drift).collect();
    if drifted.is_empty() {
        println!("{}", "No drift detected. State matches observed resources.".green());
        return;
    }

    println!("{}", "Drift detected:".yellow().bold());
    for analysis in &drifted {
        println!();
        let strategy = match analysis.strategy {
            ResolutionStrategy::Ignore => "ignore".normal(),
            ResolutionStrategy::UpdateState => "update state".green(),
            ResolutionStrategy::PromptUser => "review required".yellow(),
        };
        println!("  {} ({})", analysis.resource_id.bold(), strategy);
        for item in &analysis.items {
            let severity = match item.severity {
                DriftSeverity::Critical => "critical".red().bold(),
                DriftSeverity::High => "high".red(),
                DriftSeverity::Medium => "medium".yellow(),
            };
            println!(
                "    {} [{}].{}: {} → {} ({}, confidence {:.2})",
                "~".yellow(),
                item.instance,
                item.field,
                item.recorded,
                item.observed,
                severity,
                item.confidence
            );
        }
    }

    println!();
    println!(
        "Drift: {} of {} resources.",
        drifted.len().to_string().yellow(),
        analyses.len()
    );
}

// ---------------------------------------------------------------------------
// collection
// ---------------------------------------------------------------------------

async fn run_collection_command(
    manager: &StateManager,
    state_name: &str,
    command: CollectionCommands,
) -> Result<(), String> {
    let collections = CollectionManager::new(manager, state_name);

    match command {
        CollectionCommands::List => {
            let list = collections.list().await.map_err(|e| e.to_string())?;
            if list.is_empty() {
                println!("{}", "No collections.".yellow());
            }
            for collection in &list {
                print_collection_line(collection);
            }
        }
        CollectionCommands::Create { name, description } => {
            collections
                .create(&name, description.as_deref())
                .await
                .map_err(|e| e.to_string())?;
            println!("{} Created collection {}", "✓".green(), name.bold());
        }
        CollectionCommands::Add {
            collection,
            resource,
        } => {
            let updated = collections
                .add_resource(&collection, &resource)
                .await
                .map_err(|e| e.to_string())?;
            print_collection_line(&updated);
        }
        CollectionCommands::Remove {
            collection,
            resource,
        } => {
            let updated = collections
                .remove_resource(&collection, &resource)
                .await
                .map_err(|e| e.to_string())?;
            print_collection_line(&updated);
        }
        CollectionCommands::Depend { collection, on } => {
            collections
                .add_dependency(&collection, &on)
                .await
                .map_err(|e| e.to_string())?;
            println!("{} {} now depends on {}", "✓".green(), collection.bold(), on.bold());
        }
        CollectionCommands::Health { name } => match name {
            Some(name) => {
                collections
                    .refresh_health(&name)
                    .await
                    .map_err(|e| e.to_string())?;
                let collection = collections.get(&name).await.map_err(|e| e.to_string())?;
                print_collection_line(&collection);
            }
            None => {
                for collection in collections.refresh_all().await.map_err(|e| e.to_string())? {
                    print_collection_line(&collection);
                }
            }
        },
        CollectionCommands::Delete {
            name,
            cascade,
            auto_approve,
        } => {
            let mode = if cascade {
                DeleteMode::Cascade
            } else {
                DeleteMode::Unassign
            };
            if cascade
                && !auto_approve
                && !confirm(&format!(
                    "Do you really want to delete collection {} and all of its resources?",
                    name
                ))?
            {
                println!("{}", "Delete cancelled.".yellow());
                return Ok(());
            }

            let removed = collections
                .delete(&name, mode)
                .await
                .map_err(|e| e.to_string())?;
            println!("{} Deleted collection {}", "✓".green(), name.bold());
            for id in removed {
                println!("  {} {}", "-".red().bold(), id);
            }
        }
    }
    Ok(())
}

fn print_collection_line(collection: &Collection) {
    let health = &collection.health;
    let state = match health.state {
        CollectionState::Active => "active".green(),
        CollectionState::Partial => "partial".yellow(),
        CollectionState::Degraded => "degraded".red(),
        CollectionState::Empty => "empty".normal(),
    };
    println!(
        "  {} [{}] {}/{} healthy, {} errors",
        collection.name.bold(),
        state,
        health.healthy,
        health.total,
        health.errors
    );
    if !collection.depends_on.is_empty() {
        println!("    depends on: {}", collection.depends_on.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolumn_core::resource::Instance;
    use kolumn_state::backends::MemoryBackend;
    use serde_json::json;

    const TOPIC: &str = "kafka.topic.events";

    async fn manager_with_topic() -> StateManager {
        let manager = StateManager::new(Box::new(MemoryBackend::new()), ManagerConfig::default());
        let mut state = StateDocument::new();
        state.upsert_resource(
            Resource::new("kafka", "topic", "events").with_instance(
                Instance::new(InstanceStatus::Ready)
                    .with_attribute("tags", json!({"team": "data"}))
                    .with_attribute("config", json!({"partitions": 3})),
            ),
        );
        manager.put("prod", state).await.unwrap();
        manager
    }

    fn observed(attributes: serde_json::Value) -> SnapshotObserver {
        SnapshotObserver::new().with_resource(
            TOPIC,
            vec![attributes.as_object().cloned().unwrap()],
        )
    }

    #[test]
    fn test_parse_setting() {
        assert_eq!(parse_setting("path=.kolumn"), Ok(("path", ".kolumn")));
        assert_eq!(
            parse_setting("url=sqlite://state.db?mode=rwc"),
            Ok(("url", "sqlite://state.db?mode=rwc"))
        );
        assert!(parse_setting("path").is_err());
        assert!(parse_setting("=value").is_err());
    }

    #[test]
    fn test_backend_config_from_flags() {
        let args = BackendArgs {
            backend: "local".to_string(),
            settings: vec!["path=/tmp/kolumn".to_string(), "backup_count=3".to_string()],
            workspace: None,
            environment: None,
        };
        let config = backend_config(&args).unwrap();
        assert_eq!(config.backend_type, "local");
        assert_eq!(config.get_string("path"), Some("/tmp/kolumn"));
        assert_eq!(config.get_u64("backup_count"), Some(3));
    }

    #[test]
    fn test_backup_source() {
        assert_eq!(
            backup_source("prod.backup.20260101120000123"),
            Some("prod".to_string())
        );
        assert_eq!(
            backup_source("team.prod.backup.20260101120000123-1"),
            Some("team.prod".to_string())
        );
        assert_eq!(backup_source("prod"), None);
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "kolumn",
            "graph",
            "prod",
            "impact",
            "pg.table.users",
            "--change",
            "delete",
            "--backend",
            "memory",
            "--set",
            "a=b",
        ])
        .unwrap();
        assert_eq!(cli.backend.backend, "memory");
        assert_eq!(cli.backend.settings, vec!["a=b"]);
        assert!(matches!(
            cli.command,
            Commands::Graph {
                command: GraphCommands::Impact { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn test_drift_apply_writes_auto_resolvable_fields() {
        let manager = manager_with_topic().await;
        let observer = observed(json!({"tags": {"team": "platform"}, "config": {"partitions": 3}}));

        let run = check_drift(&manager, "prod", &observer, &[], true).await.unwrap();
        assert_eq!(run.applied, 1);
        assert!(run.needs_review.is_empty());

        let state = manager.get("prod").await.unwrap();
        assert_eq!(state.serial, 2);
        assert_eq!(
            state.resources[0].instances[0].attributes["tags"],
            json!({"team": "platform"})
        );
        assert!(manager.current_lock("prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drift_apply_skips_analyses_that_need_review() {
        let manager = manager_with_topic().await;
        let observer = observed(json!({"tags": {"team": "platform"}, "config": {"partitions": 6}}));

        let run = check_drift(&manager, "prod", &observer, &[], true).await.unwrap();
        assert_eq!(run.analyses[0].strategy, ResolutionStrategy::PromptUser);
        assert_eq!(run.applied, 0);
        assert_eq!(run.needs_review, vec![TOPIC.to_string()]);

        let state = manager.get("prod").await.unwrap();
        assert_eq!(state.serial, 1);
        assert_eq!(
            state.resources[0].instances[0].attributes["tags"],
            json!({"team": "data"})
        );
    }

    #[tokio::test]
    async fn test_drift_apply_needs_the_state_lock() {
        let manager = manager_with_topic().await;
        let held = manager.lock("prod", "apply", None).await.unwrap();
        let observer = observed(json!({"tags": {"team": "platform"}, "config": {"partitions": 3}}));

        assert!(check_drift(&manager, "prod", &observer, &[], true).await.is_err());
        assert_eq!(manager.get("prod").await.unwrap().serial, 1);

        // detection alone does not lock
        let run = check_drift(&manager, "prod", &observer, &[], false).await.unwrap();
        assert!(run.analyses[0].has_drift);
        assert_eq!(run.applied, 0);

        manager.unlock(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_drift_unknown_resource_filter() {
        let manager = manager_with_topic().await;
        let observer = observed(json!({}));
        let only = vec!["kafka.topic.ghost".to_string()];

        let err = check_drift(&manager, "prod", &observer, &only, false)
            .await
            .unwrap_err();
        assert!(err.contains("kafka.topic.ghost"));
    }
}
