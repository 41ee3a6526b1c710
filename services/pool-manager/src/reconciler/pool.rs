//! A single reconcile pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use mc_id::WorkerId;
use mc_reconcile::{select_for_removal, PoolAction, PoolBounds};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, instrument, warn};

use crate::registry::{RegistryError, RegistryResult, WorkerRegistry, WorkerStatus};
use crate::shutdown::Shutdown;

/// Names tried per worker before a collision is treated as a failure.
const MAX_NAME_ATTEMPTS: usize = 8;

/// Statistics from a reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Idle workers observed at the start of the pass.
    pub waiting_observed: usize,

    /// Workers created by this pass.
    pub created: usize,

    /// Workers deleted by this pass.
    pub deleted: usize,
}

/// Applies the create/delete delta between the observed pool and its bounds.
pub struct PoolReconciler {
    registry: Arc<dyn WorkerRegistry>,
    bounds: PoolBounds,
    names: Mutex<StdRng>,
}

impl PoolReconciler {
    /// Create a new pool reconciler.
    pub fn new(registry: Arc<dyn WorkerRegistry>, bounds: PoolBounds) -> Self {
        Self::with_rng(registry, bounds, StdRng::from_os_rng())
    }

    fn with_rng(registry: Arc<dyn WorkerRegistry>, bounds: PoolBounds, rng: StdRng) -> Self {
        Self {
            registry,
            bounds,
            names: Mutex::new(rng),
        }
    }

    /// The configured pool bounds.
    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    /// Run a single reconciliation pass.
    ///
    /// The first failing create or delete aborts the rest of the pass.
    /// Workers already created or deleted stay that way; the next pass
    /// finishes converging.
    #[instrument(skip(self, cancel), fields(pool_target = self.bounds.target, surge = self.bounds.surge))]
    pub async fn reconcile(&self, cancel: &Shutdown) -> RegistryResult<ReconcileStats> {
        let waiting = self
            .registry
            .list_by_status(cancel, WorkerStatus::Waiting)
            .await?;

        let mut stats = ReconcileStats {
            waiting_observed: waiting.len(),
            ..Default::default()
        };

        debug!(waiting = waiting.len(), "Observed idle workers");

        match self.bounds.plan(waiting.len()) {
            PoolAction::ScaleUp(count) => {
                info!(waiting = waiting.len(), to_create = count, "Scaling pool up");
                let mut tried = HashSet::new();
                for _ in 0..count {
                    match self.create_fresh(cancel, &mut tried).await {
                        Ok(id) => {
                            info!(worker_id = %id, "Created worker");
                            stats.created += 1;
                        }
                        Err(e) => {
                            warn!(
                                created = stats.created,
                                error = %e,
                                "Failed to create worker, aborting pass"
                            );
                            return Err(e);
                        }
                    }
                }
            }
            PoolAction::ScaleDown(count) => {
                info!(waiting = waiting.len(), to_delete = count, "Scaling pool down");
                let victims = select_for_removal(
                    waiting,
                    count,
                    |w| w.created_at,
                    |w| w.id.clone(),
                );
                for worker in victims {
                    if let Err(e) = self.registry.delete(cancel, &worker.id).await {
                        warn!(
                            worker_id = %worker.id,
                            deleted = stats.deleted,
                            error = %e,
                            "Failed to delete worker, aborting pass"
                        );
                        return Err(e);
                    }
                    info!(worker_id = %worker.id, "Deleted idle worker");
                    stats.deleted += 1;
                }
            }
            PoolAction::Hold => {
                debug!(waiting = waiting.len(), "Pool within bounds");
            }
        }

        Ok(stats)
    }

    /// Create one worker under a fresh name.
    ///
    /// A name taken by an existing worker, or already tried in this pass,
    /// is replaced by another one, up to [`MAX_NAME_ATTEMPTS`] times.
    async fn create_fresh(
        &self,
        cancel: &Shutdown,
        tried: &mut HashSet<WorkerId>,
    ) -> RegistryResult<WorkerId> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let id = self.next_name();
            if !tried.insert(id.clone()) && attempts < MAX_NAME_ATTEMPTS {
                continue;
            }
            match self.registry.create(cancel, &id).await {
                Ok(()) => return Ok(id),
                Err(RegistryError::AlreadyExists(_)) if attempts < MAX_NAME_ATTEMPTS => {
                    debug!(worker_id = %id, attempts, "Worker name taken, picking another");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_name(&self) -> WorkerId {
        let mut rng = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        WorkerId::generate_with(&mut *rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, RegistryError};
    use rstest::rstest;

    fn names_from_seed(seed: u64, count: usize) -> Vec<WorkerId> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| WorkerId::generate_with(&mut rng)).collect()
    }

    fn setup(bounds: PoolBounds) -> (Arc<MemoryRegistry>, PoolReconciler) {
        let registry = Arc::new(MemoryRegistry::new());
        let reconciler = PoolReconciler::new(registry.clone(), bounds);
        (registry, reconciler)
    }

    #[rstest]
    #[case(0, 3, 0)]
    #[case(2, 1, 0)]
    #[case(3, 0, 0)]
    #[case(5, 0, 0)]
    #[case(6, 0, 1)]
    #[case(9, 0, 4)]
    #[tokio::test]
    async fn test_exact_delta(
        #[case] initial: usize,
        #[case] created: usize,
        #[case] deleted: usize,
    ) {
        let (registry, reconciler) = setup(PoolBounds::new(3, 2));
        registry.seed_many(initial, WorkerStatus::Waiting);

        let stats = reconciler.reconcile(&Shutdown::never()).await.unwrap();

        assert_eq!(stats.waiting_observed, initial);
        assert_eq!(stats.created, created);
        assert_eq!(stats.deleted, deleted);
        assert_eq!(
            registry.count(WorkerStatus::Waiting),
            initial + created - deleted
        );
    }

    #[tokio::test]
    async fn test_scale_down_removes_oldest_waiting_only() {
        let (registry, reconciler) = setup(PoolBounds::new(1, 0));
        let busy = registry.seed_many(2, WorkerStatus::Running);
        let idle = registry.seed_many(3, WorkerStatus::Waiting);

        let stats = reconciler.reconcile(&Shutdown::never()).await.unwrap();

        assert_eq!(stats.deleted, 2);
        assert!(registry.get(&idle[0]).is_none());
        assert!(registry.get(&idle[1]).is_none());
        assert!(registry.get(&idle[2]).is_some());
        for id in &busy {
            assert_eq!(registry.get(id).unwrap().status, WorkerStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_running_workers_do_not_count_toward_pool() {
        let (registry, reconciler) = setup(PoolBounds::new(3, 2));
        registry.seed_many(10, WorkerStatus::Running);

        let stats = reconciler.reconcile(&Shutdown::never()).await.unwrap();

        assert_eq!(stats.created, 3);
        assert_eq!(registry.count(WorkerStatus::Running), 10);
    }

    #[tokio::test]
    async fn test_create_failure_aborts_remaining_creates() {
        let (registry, reconciler) = setup(PoolBounds::new(3, 2));
        registry.fail_creates_after(1);

        let err = reconciler.reconcile(&Shutdown::never()).await.unwrap_err();

        assert!(matches!(err, RegistryError::Backend(_)));
        // No rollback of the create that succeeded
        assert_eq!(registry.count(WorkerStatus::Waiting), 1);
        assert_eq!(registry.creates(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pass_is_distinguishable() {
        let (registry, reconciler) = setup(PoolBounds::new(3, 2));
        let (signal, cancel) = crate::shutdown::channel();
        signal.trigger();

        let err = reconciler.reconcile(&cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(registry.creates(), 0);
    }

    #[tokio::test]
    async fn test_taken_names_are_replaced() {
        let registry = Arc::new(MemoryRegistry::new());
        let taken = names_from_seed(42, 3);
        for id in &taken {
            registry.seed(id.clone(), WorkerStatus::Running);
        }
        // Same seed, so the first three names tried are all taken.
        let reconciler = PoolReconciler::with_rng(
            registry.clone(),
            PoolBounds::new(5, 0),
            StdRng::seed_from_u64(42),
        );

        let stats = reconciler.reconcile(&Shutdown::never()).await.unwrap();

        assert_eq!(stats.created, 5);
        assert_eq!(registry.creates(), 5);
        assert_eq!(registry.count(WorkerStatus::Waiting), 5);
        for id in &taken {
            assert_eq!(registry.get(id).unwrap().status, WorkerStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_name_collisions_are_bounded() {
        let registry = Arc::new(MemoryRegistry::new());
        for id in names_from_seed(9, MAX_NAME_ATTEMPTS) {
            registry.seed(id, WorkerStatus::Running);
        }
        let reconciler = PoolReconciler::with_rng(
            registry.clone(),
            PoolBounds::new(1, 0),
            StdRng::seed_from_u64(9),
        );

        let err = reconciler.reconcile(&Shutdown::never()).await.unwrap_err();

        assert!(matches!(err, RegistryError::AlreadyExists(_)));
        assert_eq!(registry.creates(), 0);
    }
}
