//! depgate CLI - dependency-gated run orchestration.

use std::path::{Path, PathBuf};
use std::num::NonZeroUsize;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use depgate_core::{
    parse_snapshot_date, DependencyMap, Directive, Fulfillment, JobName, RunKey, StepStatus, Version,
};
use depgate_storage::{AuditStore, JsonAuditStore};
use depgate_execution::{
    Dispatcher, EngineConfig, JobCatalog, JournalExecutor, StepReport, UpstreamCompletion,
};

#[derive(Parser)]
#[command(name = "depgate")]
#[command(about = "Dependency-gated run orchestration", long_about = None)]
struct Cli {
    /// Store directory
    #[arg(long, env = "DEPGATE_STORE", default_value = ".depgate", global = true)]
    store: PathBuf,

    /// Audit store backend
    #[arg(long, value_enum, default_value_t = Backend::Json, global = true)]
    backend: Backend,

    /// Job catalog file
    #[arg(long, env = "DEPGATE_CATALOG", global = true)]
    catalog: Option<PathBuf>,

    /// Executor target for submissions
    #[arg(long, env = "DEPGATE_TARGET", default_value = "default", global = true)]
    target: String,

    /// Refuse submissions while this many steps are unfinished on the target
    #[arg(long, env = "DEPGATE_MAX_ACTIVE", global = true)]
    max_active: Option<NonZeroUsize>,

    /// Persist RUNNING/PENDING on run records while polling
    #[arg(long, global = true)]
    persist_transient: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// One JSON file per job and snapshot
    Json,
    /// SQLite database in the store directory
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a dependency notification
    Notify {
        /// Downstream job
        job: String,
        /// Snapshot date (YYYY-MM-DD or YYYYMMDD)
        snapshot: String,
        /// `dep=value` for a fulfilled dependency, bare `dep` for an open one;
        /// none at all disables the run
        dependencies: Vec<String>,
    },
    /// Report an upstream dataset completion to every job depending on it
    Upstream {
        /// Completed dataset
        dataset: String,
        /// Snapshot date
        snapshot: String,
        /// Upstream run identifier
        run_id: String,
        /// Output location of the upstream run
        #[arg(long)]
        location: Option<String>,
    },
    /// Dispatch a raw JSON event (or array of events) from a file or `-`
    Dispatch {
        /// Path, or `-` for stdin
        input: String,
    },
    /// Show a run record
    Show {
        /// Job
        job: String,
        /// Snapshot date
        snapshot: String,
        /// Version (latest by default)
        #[arg(long)]
        version: Option<u32>,
    },
    /// Show every version of a run
    History {
        /// Job
        job: String,
        /// Snapshot date
        snapshot: String,
    },
    /// List tracked runs
    List,
    /// Report a status for a journaled executor step
    Step {
        /// Step identifier
        step_id: String,
        /// New status
        status: String,
        /// Diagnostic message
        #[arg(long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let store = open_store(cli.backend, &cli.store).await?;
    let executor = Arc::new(
        JournalExecutor::new(&cli.store)
            .await
            .context("opening step journal")?
            .with_max_active(cli.max_active),
    );
    let config = EngineConfig::new()
        .with_executor_target(cli.target.clone())
        .with_persist_transient_status(cli.persist_transient);
    let dispatcher = Dispatcher::new(store.clone(), executor.clone(), config);

    match cli.command {
        Commands::Notify { job, snapshot, dependencies } => {
            let job_name = JobName::new(job)?;
            let snapshot_date = parse_snapshot_date(&snapshot)?;
            let dependencies = parse_dependency_args(&dependencies)?;
            let directive = dispatcher
                .dispatch(depgate_core::InboundEvent::DependencyNotification {
                    job_name,
                    snapshot_date,
                    dependencies,
                })
                .await?;
            print_directive(&directive)?;
        }
        Commands::Upstream { dataset, snapshot, run_id, location } => {
            let Some(path) = cli.catalog.as_deref() else {
                bail!("--catalog (or DEPGATE_CATALOG) is required for upstream");
            };
            let catalog = JobCatalog::load(path)
                .await
                .with_context(|| format!("loading catalog {}", path.display()))?;
            let completion = UpstreamCompletion {
                dataset,
                snapshot_date: parse_snapshot_date(&snapshot)?,
                fulfillment: Fulfillment::upstream_run(run_id, location),
            };

            let events = catalog.expand(&completion);
            if events.is_empty() {
                warn!(dataset = %completion.dataset, "no catalog job depends on dataset");
            }
            let mut failures = 0;
            for event in events {
                match dispatcher.dispatch(event).await {
                    Ok(directive) => print_directive(&directive)?,
                    Err(e) => {
                        eprintln!("error: {e}");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} notification(s) failed");
            }
        }
        Commands::Dispatch { input } => {
            let raw = read_input(&input).await?;
            let value: serde_json::Value = serde_json::from_str(&raw).context("parsing event JSON")?;
            let events = match value {
                serde_json::Value::Array(events) => events,
                single => vec![single],
            };
            for event in &events {
                let directive = dispatcher.dispatch_value(event).await?;
                print_directive(&directive)?;
            }
        }
        Commands::Show { job, snapshot, version } => {
            let job_name = JobName::new(job)?;
            let snapshot_date = parse_snapshot_date(&snapshot)?;
            let record = match version {
                Some(v) => Some(store.get_record(&RunKey::new(job_name, snapshot_date, Version::new(v)?)).await?),
                None => store.latest_record(&job_name, snapshot_date).await?,
            };
            let Some(record) = record else {
                println!("Run not found");
                return Ok(());
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::History { job, snapshot } => {
            let job_name = JobName::new(job)?;
            let snapshot_date = parse_snapshot_date(&snapshot)?;
            for record in store.get_records(&job_name, snapshot_date).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::List => {
            let runs = store.list_runs().await?;
            println!("Runs ({})", runs.len());
            for (job_name, snapshot_date) in runs {
                if let Some(latest) = store.latest_record(&job_name, snapshot_date).await? {
                    println!(
                        "  {} | {} | v{} | {}",
                        job_name, snapshot_date, latest.key.version, latest.status
                    );
                }
            }
        }
        Commands::Step { step_id, status, message } => {
            let status: StepStatus = status.parse().map_err(anyhow::Error::msg)?;
            let report = StepReport { status, message };
            let entry = executor.report(&step_id, report).await?;
            info!(run = %entry.run, "step updated");
            println!("{}", serde_json::to_string(&entry)?);
        }
    }

    Ok(())
}

async fn open_store(backend: Backend, root: &Path) -> Result<Arc<dyn AuditStore>> {
    match backend {
        Backend::Json => {
            let store = JsonAuditStore::new(root)
                .await
                .with_context(|| format!("opening JSON store at {}", root.display()))?;
            Ok(Arc::new(store))
        }
        Backend::Sqlite => open_sqlite(root).await,
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(root: &Path) -> Result<Arc<dyn AuditStore>> {
    tokio::fs::create_dir_all(root).await?;
    let path = root.join("depgate.db");
    let store = depgate_storage::SqliteAuditStore::new_from_path(&path)
        .await
        .with_context(|| format!("opening SQLite store at {}", path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_root: &Path) -> Result<Arc<dyn AuditStore>> {
    bail!("this build has no SQLite support; rebuild with `--features sqlite`")
}

/// Parse `dep=value` / `dep` arguments into a dependency map.
fn parse_dependency_args(args: &[String]) -> Result<DependencyMap> {
    let mut dependencies = DependencyMap::new();
    for arg in args {
        let (name, value) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(parse_fulfillment(value)?)),
            None => (arg.as_str(), None),
        };
        if name.is_empty() {
            bail!("empty dependency name in {arg:?}");
        }
        dependencies.insert(name, value);
    }
    Ok(dependencies)
}

/// A JSON object is taken as-is, anything else as a bare run id.
fn parse_fulfillment(raw: &str) -> Result<Fulfillment> {
    if raw.trim_start().starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(raw).context("parsing fulfillment JSON")?;
        return Fulfillment::new(value).context("fulfillment must not be null");
    }
    if raw.is_empty() {
        bail!("empty fulfillment; use a bare dependency name for an open slot");
    }
    Ok(Fulfillment::from(raw))
}

async fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut raw = String::new();
        tokio::io::stdin().read_to_string(&mut raw).await?;
        return Ok(raw);
    }
    tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {input}"))
}

fn print_directive(directive: &Directive) -> Result<()> {
    println!("{}", serde_json::to_string(directive)?);
    Ok(())
}
