//! Mission Control
//!
//! REST API for task and agent coordination, dispatching work to an external
//! agent runner over a WebSocket gateway.

use anyhow::{Context, Result};
use clap::Parser;
use mission_control::cli::{Cli, Command};
use mission_control::config::{Config, ConfigLoader};
use mission_control::dashboard::{self, AppState};
use mission_control::db::Database;
use mission_control::gateway::{AgentRunner, DisabledRunner, SharedGateway};
use mission_control::logging;
use mission_control::orchestrator::Orchestrator;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_target(), cli.verbose)?;

    let mut loader = match &cli.config {
        Some(path) => ConfigLoader::load_file(Path::new(path))?,
        None => ConfigLoader::load()?,
    };
    cli.apply_overrides(loader.config_mut());
    if let Some(path) = loader.config_path() {
        info!(path = %path.display(), "Loaded configuration");
    }
    let config = loader.into_config();

    match cli.command() {
        Command::Serve => serve(config).await,
        Command::Check => check(&config),
    }
}

fn open_database(config: &Config) -> Result<Database> {
    let path = &config.server.data_path;
    Database::open(path).with_context(|| format!("opening data file {}", path.display()))
}

async fn serve(config: Config) -> Result<()> {
    let db = Arc::new(open_database(&config)?);
    info!(path = %config.server.data_path.display(), "Data store opened");

    let gateway = config
        .gateway
        .enabled
        .then(|| Arc::new(SharedGateway::new(config.gateway.options())));

    let runner: Arc<dyn AgentRunner> = match &gateway {
        Some(gateway) => Arc::clone(gateway) as Arc<dyn AgentRunner>,
        None => {
            info!("Gateway disabled; dispatched tasks will not be spawned");
            Arc::new(DisabledRunner)
        }
    };
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&db), runner));

    let listener = gateway.as_ref().map(|gateway| {
        let events = gateway.subscribe();
        let handle = orchestrator.spawn_status_listener(events);
        info!(url = %gateway.options().url, "Connecting to agent-runner gateway");
        gateway.client();
        handle
    });

    let server = dashboard::start_server_with_retry(
        AppState::new(Arc::clone(&orchestrator), gateway.clone()),
        &config.server,
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    server.shutdown();
    if let Some(gateway) = &gateway {
        gateway.shutdown().await;
    }
    if let Some(listener) = listener {
        listener.abort();
    }
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let issues = db.check_consistency();
    if issues.is_empty() {
        println!("{}: no issues found", config.server.data_path.display());
        return Ok(());
    }

    for issue in &issues {
        println!("{issue}");
    }
    warn!(count = issues.len(), "Consistency check found issues");
    anyhow::bail!("{} consistency issue(s) found", issues.len())
}
