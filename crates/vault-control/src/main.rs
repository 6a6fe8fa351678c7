mod opts;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use vault_client::NodeClient;
use vault_control::http::spawn_http_server;
use vault_control::periodic::spawn_periodic;
use vault_control::{
    Collaborators, ControlConfig, ControlPlane, Db, HttpNodeProbe, JsonDirSnapshotBuilder,
    RecoveryService, Task, operator_client,
};
use vault_protocol::api::TaskSource;
use vault_store::FsArtifactStore;

use opts::ControlOpts;

#[derive(Parser, Debug)]
#[command(name = "vault-control", version, about = "Configuration vault control plane")]
struct Cli {
    #[command(flatten)]
    opts: ControlOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the periodic driver and the HTTP surface until interrupted
    Serve,

    /// Record a change for one kind and wait for its publish
    Publish {
        kind: String,
    },

    /// Poll the fleet once and print the convergence overview
    Overview,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    setup_logging();
    let cli = Cli::parse();
    let config = cli.opts.config()?;
    let control = build_control_plane(&cli.opts, config)?;

    match cli.command {
        Command::Serve => serve(control).await,
        Command::Publish { kind } => {
            let kind = control.resolve_kind(&kind)?;
            let result = control
                .request_publish_await(&kind, TaskSource::Interactive)
                .await
                .with_context(|| format!("publish {kind}"))?;
            print_json(&result.summary())
        }
        Command::Overview => {
            control
                .run(Task::PollFleet, TaskSource::Interactive)
                .await
                .context("poll fleet")?;
            print_json(&control.sync_overview()?)
        }
    }
}

fn build_control_plane(opts: &ControlOpts, config: ControlConfig) -> Result<ControlPlane> {
    let db = Db::open(&opts.db).with_context(|| format!("open database {}", opts.db.display()))?;
    let store = FsArtifactStore::open(&opts.artifacts)
        .with_context(|| format!("open artifact store {}", opts.artifacts.display()))?;
    let node_client = NodeClient::new(config.poll_timeout).context("build node client")?;
    let recovery = match &opts.operator_url {
        Some(url) => {
            let client = operator_client(&config, url, opts.operator_token.clone())
                .context("build operator client")?;
            Some(Arc::new(client) as Arc<dyn RecoveryService>)
        }
        None => None,
    };
    let collaborators = Collaborators {
        store: Arc::new(store),
        builder: Arc::new(JsonDirSnapshotBuilder::new(&opts.source)),
        probe: Arc::new(HttpNodeProbe::new(node_client)),
        recovery,
    };
    ControlPlane::new(config, db, collaborators).context("initialize control plane")
}

async fn serve(control: ControlPlane) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = signal_tx.send(());
    });

    let http_config = control.config().http_server.clone();
    let http_bind = http_config.bind;
    let http_handle = spawn_http_server(http_config, control.clone(), shutdown_tx.clone());
    if http_handle.is_some() {
        tracing::info!(
            "HTTP docs available at http://{}/api/docs/ (OpenAPI: /api/openapi.json)",
            http_bind
        );
    }

    let interval = control.config().periodic_interval;
    let periodic = spawn_periodic(control, interval, shutdown_tx);
    periodic.await.context("periodic driver")?;
    if let Some(handle) = http_handle {
        handle.await.context("http server")?;
    }
    tracing::info!("vault-control stopped");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();
}
