use clap::Parser;
use kube::Client;
use microseg_controller::{
    api,
    cluster::ClusterReader,
    config::{self, DaemonConfig},
    firewall::FilterDriver,
    policy::PolicyStore,
    reconciler::Reconciler,
    telemetry::{self, Metrics},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "microseg-controller",
    about = "Node-local micro-segmentation daemon",
    version
)]
struct Cli {
    /// How often to reconcile the node's packet-filter state
    #[arg(long = "sync-interval", default_value = "30s", value_parser = config::parse_interval)]
    sync_interval: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    info!("Starting microseg controller");
    let config = DaemonConfig::from_env()?;
    info!("Configuration loaded");
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let metrics = Arc::new(Metrics::default());
    let store = Arc::new(PolicyStore::new(config.policy_file.clone()));
    let shutdown = shutdown_token();

    let api_state = Arc::new(api::AppState {
        store: store.clone(),
        metrics: metrics.clone(),
        token: config.api_token.clone(),
    });
    let api_task = tokio::spawn(api::serve(
        config.api_bind,
        api_state,
        shutdown.clone(),
    ));

    let reader = ClusterReader::new(client);
    let reconciler = Reconciler::new(&config, FilterDriver::host(), store, metrics.clone());

    info!(
        "Starting sync loop for node {} with interval {:?}",
        config.node_name, cli.sync_interval
    );
    let mut ticker = tokio::time::interval(cli.sync_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // an in-flight sync always runs to completion; the token
                // is only consulted between cycles
                if let Err(err) = reconciler.sync(&reader).await {
                    metrics.record_sync_error();
                    error!("sync error: {}", err);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Shutting down");
    if let Err(err) = api_task.await? {
        error!("api server error: {}", err);
    }

    Ok(())
}

/// Token cancelled on the first SIGINT or SIGTERM; clones go to every
/// long-running task.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cloned = token.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        cloned.cancel();
    });

    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
