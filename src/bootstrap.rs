use crate::config::ControllerConfig;
use crate::k8s::Watcher;
use crate::loadbalancer::{Updater, CHANGE_BUFFER};
use crate::{cloud, k8s, metrics};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub metrics_listen: String,
}

/// Controller lifecycle: init → watch → reconcile → shutdown.
///
/// Startup errors (unreadable config, unreachable cluster, missing cloud
/// configuration) propagate out and exit non-zero. After startup the
/// reconcile loop absorbs every runtime failure.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let cfg = Arc::new(ControllerConfig::load(&args.config_path)?);
    metrics::install(&args.metrics_listen)?;

    let provider = cloud::provider_from_config(&cfg).await?;
    let client = k8s::client_from_config(&cfg.kubernetes).await?;

    let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
    let shutdown = Arc::new(Notify::new());

    // The updater keeps a sender of its own: failed changes are re-enqueued
    // onto the same channel the event source feeds.
    let updater = Updater::new(cfg.clone(), provider, tx.clone())?;

    let watcher = Watcher::new(client, &cfg.kubernetes);
    watcher.spawn(tx, shutdown.clone());

    let updater_handle = tokio::spawn(updater.run(rx, shutdown.clone()));

    tracing::info!(
        "server: controller started, load_balancer_id={}, sync_interval={}s",
        cfg.kubernetes.service_annotation_load_balancer_id,
        cfg.load_balancer.sync_interval,
    );

    wait_for_signal().await?;
    tracing::info!("server: termination signal received, shutting down");
    shutdown.notify_waiters();

    if let Err(e) = updater_handle.await {
        tracing::error!("server: updater task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Block until SIGHUP, SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = hangup.recv() => {}
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
