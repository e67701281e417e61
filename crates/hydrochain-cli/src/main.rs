//! Hydrochain orchestrator process.
//!
//! Loads settings, resolves the storage backend, scheduler and auxiliary
//! services, then ticks the study until it finishes or Ctrl-C is pressed.
//! Exit code 0 when the study is `Done`, 1 when it ends in `Error` or is
//! interrupted, 2 when startup fails.

use anyhow::Context;
use clap::Parser;
use hydrochain::{
    CommandRunner, Deps, Engine, Exit, ProcessRunner, Settings, StateBackend, Store, StudyState,
};
use hydrochain_persistence::JsonFileStore;
use hydrochain_services::{HookStrategies, Services, SplitStore};
use hydrochain_store_sqlite::SqliteStore;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod settings;

/// Hydrochain - chained hydrothermal planning orchestrator
#[derive(Parser)]
#[command(name = "hydrochain")]
#[command(about = "Runs a chain of planning cases through a batch scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (TOML, JSON or YAML)
    #[arg(short, long, env = "HYDROCHAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "HYDROCHAIN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "HYDROCHAIN_LOG_JSON")]
    json: bool,
}

const EXIT_FAILED: u8 = 1;
const EXIT_STARTUP: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut engine = match start(cli.config.as_deref()).await {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "startup failed");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match engine.run_until(shutdown_signal()).await {
        Ok(Exit::Finished(StudyState::Done)) => ExitCode::SUCCESS,
        Ok(Exit::Finished(state)) => {
            tracing::error!(?state, "study finished unsuccessfully");
            ExitCode::from(EXIT_FAILED)
        }
        Ok(Exit::Interrupted) => ExitCode::from(EXIT_FAILED),
        Err(err) => {
            tracing::error!(error = %err, "orchestrator stopped");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

/// Everything up to and including the boot of the study.
async fn start(config: Option<&Path>) -> anyhow::Result<Engine> {
    let settings = Arc::new(settings::load(config)?);
    tracing::info!(
        study = %settings.study_name,
        base_path = %settings.base_path.display(),
        queue = ?settings.queue_backend,
        state = ?settings.state_backend,
        "starting orchestrator"
    );

    let store = open_store(&settings).await?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(settings.command_timeout()));
    let services = Services::from_settings(&settings).context("building service clients")?;

    let deps = Deps {
        queue: hydrochain_queue::from_settings(&settings, runner.clone()),
        strategies: Arc::new(HookStrategies::new(
            &settings.hooks,
            runner,
            &settings.program_names,
        )),
        chaining: services.chaining,
        flex: services.flex,
        reservoir: services.reservoir,
        store,
        settings,
    };

    let mut engine = Engine::builder().build(deps);
    let report = engine.boot().await.context("booting study")?;
    if !report.is_clean() {
        tracing::warn!(
            abandoned_runs = report.abandoned_runs.len(),
            reverted_cases = report.reverted_cases.len(),
            relinked_cases = report.relinked_cases.len(),
            "recovered from an interrupted execution"
        );
    }
    Ok(engine)
}

async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    let local: Arc<dyn Store> = match settings.state_backend {
        StateBackend::Json => Arc::new(
            JsonFileStore::open(settings.base_path.clone(), settings.sync_format)
                .await
                .context("opening JSON state documents")?,
        ),
        StateBackend::Sqlite => {
            let path = settings.resolve(Path::new(&settings.state_file_name));
            Arc::new(
                SqliteStore::open(&path)
                    .await
                    .with_context(|| format!("opening {}", path.display()))?,
            )
        }
    };

    match hydrochain_services::run_store(settings).context("building run-model client")? {
        Some(runs) => {
            tracing::info!("runs are kept in the run-model service");
            Ok(Arc::new(SplitStore::new(local, runs)))
        }
        None => Ok(local),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C, running until the study finishes");
        std::future::pending::<()>().await;
    }
}
