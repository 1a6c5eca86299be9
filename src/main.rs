use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kanbot_core::{AgentDirectory, AgentGateway};
use kanbot_engine::{OrchestratorConfig, Reconciler, SpawnOrchestrator};
use kanbot_gateway::HttpGateway;
use kanbot_settings::KanbotSettings;
use kanbot_store::Database;
use kanbot_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "kanbot", version, about = "Agent session lifecycle manager for a task board")]
struct Cli {
    /// Settings file to use instead of ~/.kanbot/settings.json.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the periodic reconciler (default).
    Serve,
    /// Run a single reconcile pass and print the report.
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => kanbot_settings::load_settings_from_path(path),
        None => kanbot_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let telemetry = Arc::new(init_telemetry(telemetry_config(&settings)));

    let db_path = kanbot_settings::resolve_path(&settings.server.database_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let reconciler = Arc::new(Reconciler::new(db.clone(), grace_period(&settings)?));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, db, reconciler, telemetry).await,
        Command::Reconcile => {
            let report = reconciler.run().context("reconcile pass failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(
    settings: KanbotSettings,
    db: Database,
    reconciler: Arc<Reconciler>,
    telemetry: Arc<TelemetryGuard>,
) -> anyhow::Result<()> {
    let directory = Arc::new(
        AgentDirectory::new(settings.agents.clone()).context("invalid agent directory")?,
    );
    let gateway: Arc<dyn AgentGateway> = Arc::new(
        HttpGateway::from_settings(&settings.gateway).context("failed to build gateway client")?,
    );
    tracing::info!(
        agents = directory.len(),
        gateway = %settings.gateway.base_url,
        "agent directory loaded"
    );

    let orchestrator = Arc::new(SpawnOrchestrator::new(
        db.clone(),
        directory,
        gateway,
        OrchestratorConfig::from(&settings.gateway),
    ));

    let shutdown = CancellationToken::new();
    let periodic = settings.reconcile.enabled.then(|| {
        Arc::clone(&reconciler).spawn_periodic(
            Duration::from_secs(settings.reconcile.interval_secs),
            shutdown.child_token(),
        )
    });

    let state = Arc::new(
        kanbot_server::HandlerState::new(db, orchestrator, reconciler).with_telemetry(telemetry),
    );
    let config = kanbot_server::ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
    };
    let handle = kanbot_server::start(config, state, shutdown.clone())
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, reconcile = settings.reconcile.enabled, "kanbot ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    shutdown.cancel();
    handle.wait().await;
    if let Some(periodic) = periodic {
        periodic.await.ok();
    }
    Ok(())
}

fn telemetry_config(settings: &KanbotSettings) -> TelemetryConfig {
    TelemetryConfig {
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: kanbot_settings::resolve_path(&settings.logging.log_database_path),
        ..TelemetryConfig::default()
    }
    .with_level_name(&settings.logging.level)
}

fn grace_period(settings: &KanbotSettings) -> anyhow::Result<chrono::Duration> {
    let secs = i64::try_from(settings.reconcile.grace_period_secs)
        .context("reconcile.gracePeriodSecs out of range")?;
    Ok(chrono::Duration::seconds(secs))
}
