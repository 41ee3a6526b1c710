//! musicalchairs
//!
//! Keeps a defined number of idle workers ready to receive requests and
//! lets workers report themselves busy.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mc_pool_manager::{
    api,
    config::{Cli, Command, Config},
    reconciler::{PoolReconciler, ReconcileWorker},
    shutdown,
    state::AppState,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let Command::Run(args) = Cli::parse().command;
    let config = Config::from_args(args)?;

    // Prefer RUST_LOG, fall back to --log-level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    info!(
        backend = config.backend.name(),
        listen_addr = %config.listen_addr,
        target_pool_size = config.bounds.target,
        surge_threshold = config.bounds.surge,
        "Starting musicalchairs"
    );

    let (signal, shutdown) = shutdown::channel();

    let registry = match config.backend.connect(shutdown.clone()).await {
        Ok(registry) => {
            info!(backend = registry.backend(), "Registry ready");
            registry
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize registry");
            signal.trigger();
            return Err(e.into());
        }
    };

    // All reconcile passes go through one worker, including the startup pass
    let reconciler = PoolReconciler::new(registry.clone(), config.bounds);
    let (worker, trigger) = ReconcileWorker::new(reconciler, config.resync_interval);
    registry.on_change(trigger.as_change_notify());
    trigger.request();

    let worker_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    let app = api::create_router(AppState::new(registry.clone(), shutdown.clone()));

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.listen_addr, "Failed to bind listener");
            signal.trigger();
            registry.close().await;
            return Err(e.into());
        }
    };
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn({
        let mut shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.wait().await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    // None when Ctrl-C arrived first and the server is still draining
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
        joined = &mut server_handle => Some(joined),
    };

    signal.trigger();

    info!("Waiting for background tasks to shut down...");
    let joined = match finished {
        Some(joined) => Some(joined),
        None => match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle).await {
            Ok(joined) => Some(joined),
            Err(e) => {
                warn!(error = %e, "HTTP server did not shut down in time");
                None
            }
        },
    };
    let outcome = match joined.map(api::server_outcome) {
        Some(Ok(())) => {
            info!("HTTP server exited");
            Ok(())
        }
        Some(Err(e)) => {
            error!(error = %e, "HTTP server failed");
            Err(e)
        }
        None => Ok(()),
    };

    if let Err(e) = tokio::time::timeout(SHUTDOWN_TIMEOUT, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    registry.close().await;

    info!("musicalchairs shutdown complete");
    outcome.map_err(Into::into)
}
