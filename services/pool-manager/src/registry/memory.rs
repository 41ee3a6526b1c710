//! Process-local registry backend.
//!
//! Holds workers in a map. Used by `--in-memory` development runs and by
//! tests, which can also simulate external changes (evictions) and inject
//! backend failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mc_id::WorkerId;
use tracing::debug;

use super::{
    cancellable, ChangeNotify, RegistryError, RegistryResult, Worker, WorkerRegistry,
    WorkerStatus,
};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
struct Record {
    status: WorkerStatus,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workers: BTreeMap<WorkerId, Record>,
    last_created_at: Option<DateTime<Utc>>,
    creates_remaining: Option<usize>,
    deletes_remaining: Option<usize>,
    fail_updates: bool,
    creates: usize,
    deletes: usize,
}

/// In-memory worker registry.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<ChangeNotify>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose operations each take `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener();
        }
    }

    /// Insert a worker directly, as if it existed before startup.
    ///
    /// Does not fire change notifications.
    pub fn seed(&self, id: WorkerId, status: WorkerStatus) {
        let mut inner = self.lock();
        let created_at = inner.next_created_at();
        inner.workers.insert(id, Record { status, created_at });
    }

    /// Insert `count` generated workers in `status`, returning their ids in
    /// creation order.
    pub fn seed_many(&self, count: usize, status: WorkerStatus) -> Vec<WorkerId> {
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            let id = WorkerId::generate();
            if self.get(&id).is_some() {
                continue;
            }
            self.seed(id.clone(), status);
            ids.push(id);
        }
        ids
    }

    /// Remove a worker as the platform would on eviction, notifying listeners.
    pub fn evict(&self, id: &WorkerId) -> bool {
        let removed = self.lock().workers.remove(id).is_some();
        if removed {
            debug!(worker_id = %id, "Simulated external eviction");
            self.notify();
        }
        removed
    }

    /// Change a worker's status from outside the registry API, notifying listeners.
    pub fn set_status_externally(&self, id: &WorkerId, status: WorkerStatus) -> bool {
        let changed = match self.lock().workers.get_mut(id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Allow `n` more creates to succeed, then fail every later one.
    pub fn fail_creates_after(&self, n: usize) {
        self.lock().creates_remaining = Some(n);
    }

    /// Allow `n` more deletes to succeed, then fail every later one.
    pub fn fail_deletes_after(&self, n: usize) {
        self.lock().deletes_remaining = Some(n);
    }

    /// Make every status update fail with a backend error.
    pub fn fail_updates(&self, fail: bool) {
        self.lock().fail_updates = fail;
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.creates_remaining = None;
        inner.deletes_remaining = None;
        inner.fail_updates = false;
    }

    /// Look up a single worker.
    pub fn get(&self, id: &WorkerId) -> Option<Worker> {
        self.lock().workers.get(id).map(|r| to_worker(id, r))
    }

    /// All workers, ordered by id.
    pub fn snapshot(&self) -> Vec<Worker> {
        self.lock()
            .workers
            .iter()
            .map(|(id, r)| to_worker(id, r))
            .collect()
    }

    /// Number of workers in `status`.
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.lock()
            .workers
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Successful creates through the registry API.
    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    /// Successful deletes through the registry API.
    pub fn deletes(&self) -> usize {
        self.lock().deletes
    }

    /// Highest number of registry operations ever observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn finish_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Inner {
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created_at = match self.last_created_at {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(created_at);
        created_at
    }
}

fn to_worker(id: &WorkerId, record: &Record) -> Worker {
    Worker {
        id: id.clone(),
        status: record.status,
        created_at: Some(record.created_at),
    }
}

fn take_budget(budget: &mut Option<usize>) -> bool {
    match budget {
        None => true,
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
    }
}

/// Counts a call as in flight for as long as it lives.
struct CallGuard<'a>(&'a MemoryRegistry);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_call();
    }
}

#[async_trait]
impl WorkerRegistry for MemoryRegistry {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn list_by_status(
        &self,
        cancel: &Shutdown,
        status: WorkerStatus,
    ) -> RegistryResult<Vec<Worker>> {
        cancellable(cancel, async {
            let _guard = CallGuard(self);
            self.simulate_call().await;
            Ok(self
                .lock()
                .workers
                .iter()
                .filter(|(_, r)| r.status == status)
                .map(|(id, r)| to_worker(id, r))
                .collect())
        })
        .await
    }

    async fn create(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()> {
        cancellable(cancel, async {
            let _guard = CallGuard(self);
            self.simulate_call().await;
            let mut inner = self.lock();
            if !take_budget(&mut inner.creates_remaining) {
                return Err(RegistryError::Backend("injected create failure".to_string()));
            }
            if inner.workers.contains_key(id) {
                return Err(RegistryError::AlreadyExists(id.clone()));
            }
            let created_at = inner.next_created_at();
            inner.workers.insert(
                id.clone(),
                Record {
                    status: WorkerStatus::Waiting,
                    created_at,
                },
            );
            inner.creates += 1;
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        cancel: &Shutdown,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> RegistryResult<()> {
        cancellable(cancel, async {
            let _guard = CallGuard(self);
            self.simulate_call().await;
            let mut inner = self.lock();
            if inner.fail_updates {
                return Err(RegistryError::Backend("injected update failure".to_string()));
            }
            match inner.workers.get_mut(id) {
                Some(record) => {
                    record.status = status;
                    Ok(())
                }
                None => Err(RegistryError::NotFound(id.clone())),
            }
        })
        .await
    }

    async fn delete(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()> {
        cancellable(cancel, async {
            let _guard = CallGuard(self);
            self.simulate_call().await;
            let mut inner = self.lock();
            if !take_budget(&mut inner.deletes_remaining) {
                return Err(RegistryError::Backend("injected delete failure".to_string()));
            }
            if inner.workers.remove(id).is_none() {
                return Err(RegistryError::NotFound(id.clone()));
            }
            inner.deletes += 1;
            Ok(())
        })
        .await
    }

    fn on_change(&self, notify: ChangeNotify) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notify);
    }

    async fn health_check(&self, cancel: &Shutdown) -> RegistryResult<()> {
        cancellable(cancel, async { Ok(()) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> WorkerId {
        WorkerId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_list_waiting() {
        let registry = MemoryRegistry::new();
        let cancel = Shutdown::never();

        registry.create(&cancel, &id("mc-worker-sunny-otter")).await.unwrap();

        let waiting = registry
            .list_by_status(&cancel, WorkerStatus::Waiting)
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id.as_str(), "mc-worker-sunny-otter");
        assert!(waiting[0].created_at.is_some());
        assert_eq!(registry.creates(), 1);
    }

    #[tokio::test]
    async fn test_create_collision_is_error() {
        let registry = MemoryRegistry::new();
        let cancel = Shutdown::never();
        let worker = id("mc-worker-brave-heron");

        registry.create(&cancel, &worker).await.unwrap();
        registry
            .update_status(&cancel, &worker, WorkerStatus::Running)
            .await
            .unwrap();

        let err = registry.create(&cancel, &worker).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
        // The existing record was not overwritten
        assert_eq!(registry.get(&worker).unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_are_not_found() {
        let registry = MemoryRegistry::new();
        let cancel = Shutdown::never();
        let missing = id("does-not-exist");

        let err = registry
            .update_status(&cancel, &missing, WorkerStatus::Running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = registry.delete(&cancel, &missing).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_created_at_is_strictly_increasing() {
        let registry = MemoryRegistry::new();
        let ids = registry.seed_many(5, WorkerStatus::Waiting);
        let times: Vec<_> = ids
            .iter()
            .map(|i| registry.get(i).unwrap().created_at.unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_evict_notifies_listeners() {
        let registry = MemoryRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry.on_change(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let ids = registry.seed_many(2, WorkerStatus::Waiting);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(registry.evict(&ids[0]));
        assert!(!registry.evict(&ids[0]));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(WorkerStatus::Waiting), 1);
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let registry = MemoryRegistry::new();
        let cancel = Shutdown::never();
        registry.fail_creates_after(1);

        registry.create(&cancel, &id("a1")).await.unwrap();
        let err = registry.create(&cancel, &id("a2")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Backend(_)));

        registry.heal();
        registry.create(&cancel, &id("a3")).await.unwrap();
        assert_eq!(registry.creates(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_operation_does_not_mutate() {
        let registry = MemoryRegistry::with_latency(Duration::from_secs(30));
        let (signal, cancel) = crate::shutdown::channel();

        let slow_id = id("slow-worker");
        let create = registry.create(&cancel, &slow_id);
        signal.trigger();
        let err = create.await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(registry.snapshot().is_empty());
    }
}
