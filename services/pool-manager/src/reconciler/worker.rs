//! Reconcile background worker.
//!
//! Owns the single consumer end of the trigger channel and runs reconcile
//! passes one at a time. Anything that wants the pool re-evaluated (the
//! startup path, registry change notifications, the optional resync timer)
//! holds a [`ReconcileTrigger`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, instrument, warn};

use super::pool::PoolReconciler;
use crate::registry::ChangeNotify;
use crate::shutdown::Shutdown;

/// Requests a reconcile pass.
///
/// Requests coalesce: while one is already queued, further requests are
/// absorbed, since the queued pass will observe the latest state anyway.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<()>,
}

impl ReconcileTrigger {
    /// Ask for a reconcile pass. Never blocks.
    pub fn request(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => debug!("Reconcile already pending"),
            Err(TrySendError::Closed(())) => debug!("Reconcile worker stopped, dropping trigger"),
        }
    }

    /// Adapt this trigger into a registry change callback.
    pub fn as_change_notify(&self) -> ChangeNotify {
        let trigger = self.clone();
        std::sync::Arc::new(move || trigger.request())
    }
}

/// Reconcile worker that serializes all reconcile passes.
pub struct ReconcileWorker {
    reconciler: PoolReconciler,
    rx: mpsc::Receiver<()>,
    resync_interval: Option<Duration>,
}

impl ReconcileWorker {
    /// Create a new reconcile worker and the trigger that feeds it.
    pub fn new(
        reconciler: PoolReconciler,
        resync_interval: Option<Duration>,
    ) -> (Self, ReconcileTrigger) {
        let (tx, rx) = mpsc::channel(1);
        let worker = Self {
            reconciler,
            rx,
            resync_interval: resync_interval.filter(|d| !d.is_zero()),
        };
        (worker, ReconcileTrigger { tx })
    }

    /// Run the reconcile worker until shutdown is signaled.
    ///
    /// Once shutdown fires no new pass starts; a pass already running sees
    /// its registry calls cancelled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let bounds = self.reconciler.bounds();
        info!(
            target_pool_size = bounds.target,
            surge_threshold = bounds.surge,
            resync_interval_secs = self.resync_interval.map(|d| d.as_secs()),
            "Starting reconcile worker"
        );

        let mut resync = self.resync_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        if let Some(interval) = resync.as_mut() {
            // Don't immediately tick on startup - wait for first interval
            interval.tick().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("Reconcile worker shutting down");
                    break;
                }
                received = self.rx.recv() => {
                    if received.is_none() {
                        info!("All reconcile triggers dropped, stopping worker");
                        break;
                    }
                    self.run_pass(&shutdown).await;
                }
                _ = tick(&mut resync) => {
                    debug!("Periodic resync");
                    self.run_pass(&shutdown).await;
                }
            }
        }
    }

    /// Run a single reconcile pass and log its outcome.
    async fn run_pass(&self, shutdown: &Shutdown) {
        match self.reconciler.reconcile(shutdown).await {
            Ok(stats) if stats.created > 0 || stats.deleted > 0 => {
                info!(
                    waiting_observed = stats.waiting_observed,
                    created = stats.created,
                    deleted = stats.deleted,
                    "Reconcile pass complete"
                );
            }
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {
                warn!("Reconcile pass cancelled by shutdown");
            }
            Err(e) => {
                error!(error = %e, "Reconcile pass failed, waiting for next trigger");
            }
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
