use autodrain::cluster::KubeClusterClient;
use autodrain::config::Config;
use autodrain::controller::{Context, Dispatcher, NodeActions, WorkQueue};
use autodrain::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use kube::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting autodrain node health controller");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        poll_interval = ?config.drain.poll_interval,
        drain_timeout = ?config.drain.timeout,
        max_concurrent_actions = config.max_concurrent_actions,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Not ready until both watches are established
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = health_port, "Health server task spawned");

    let ctx = Arc::new(Context::new(
        Arc::new(KubeClusterClient::new(client)),
        config.drain,
        Some(metrics.clone()),
    ));

    let (triggers, receiver) = mpsc::channel(config.queue_capacity);
    let queue = WorkQueue::new(receiver, config.max_concurrent_actions);
    let queue_handle = tokio::spawn(queue.run(
        Arc::new(NodeActions::new(ctx.clone())),
        shutdown_signal.clone(),
    ));

    let mut dispatcher = match Dispatcher::start(
        &ctx,
        triggers,
        config.watch_backoff_max,
        shutdown_signal,
    )
    .await
    {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "Failed to establish cluster watches");
            shutdown_controller.shutdown();
            health_handle.abort();
            return Err(e.into());
        }
    };

    readiness.set_ready();
    info!("Controller ready, watching nodes and cluster events");

    tokio::select! {
        _ = dispatcher.wait() => {
            warn!("Event dispatcher stopped unexpectedly");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
        }
    }

    // Mark not ready so K8s stops sending traffic during shutdown
    readiness.set_not_ready();
    shutdown_controller.shutdown();

    info!("Stopping components...");
    dispatcher.join().await;
    if let Err(e) = queue_handle.await {
        warn!(error = %e, "Work queue task failed");
    }
    health_handle.abort();

    info!("autodrain shut down gracefully");
    Ok(())
}
