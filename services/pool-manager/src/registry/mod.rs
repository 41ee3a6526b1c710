//! Worker registry: the backing store of worker records.
//!
//! The reconciler and the HTTP boundary only ever see the pool through
//! [`WorkerRegistry`]. Three backends implement it:
//!
//! - [`KubernetesRegistry`]: workers are labelled pods; reads come from a
//!   watch-fed local cache, which also drives change notifications
//! - [`PostgresRegistry`]: workers are rows; no change notifications
//! - [`MemoryRegistry`]: process-local, for development and tests
//!
//! Every operation takes a [`Shutdown`] handle and fails with
//! [`RegistryError::Cancelled`] if shutdown fires first.

mod error;
pub mod kubernetes;
pub mod memory;
pub mod postgres;

pub use error::{RegistryError, RegistryResult};
pub use kubernetes::{KubernetesConfig, KubernetesRegistry, WorkerTemplate};
pub use memory::MemoryRegistry;
pub use postgres::{DbConfig, PostgresRegistry};

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mc_id::WorkerId;
use serde::{Deserialize, Serialize};

use crate::shutdown::Shutdown;

/// Lifecycle status of a worker.
///
/// A worker that is being removed is simply absent from every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Idle and available for assignment.
    Waiting,

    /// Assigned and busy.
    Running,

    /// Work finished. Nothing in this service sets it yet.
    Complete,
}

impl WorkerStatus {
    /// The label/column value stored by the backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Complete => "Complete",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Running" => Ok(Self::Running),
            "Complete" => Ok(Self::Complete),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// A worker as observed through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: WorkerId,
    pub status: WorkerStatus,

    /// When the backend created the worker, if it reports one.
    pub created_at: Option<DateTime<Utc>>,
}

/// Callback invoked when the backing state changes outside direct calls.
pub type ChangeNotify = Arc<dyn Fn() + Send + Sync>;

/// Capability set of a worker registry backend.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// All workers currently in `status`, in no particular order.
    async fn list_by_status(
        &self,
        cancel: &Shutdown,
        status: WorkerStatus,
    ) -> RegistryResult<Vec<Worker>>;

    /// Create a worker in `Waiting`. A name collision is an error.
    async fn create(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()>;

    /// Set a worker's status. Fails with `NotFound` for an unknown id.
    async fn update_status(
        &self,
        cancel: &Shutdown,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> RegistryResult<()>;

    /// Remove a worker. Deleting an unknown id is an error.
    async fn delete(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()>;

    /// Register a callback fired at least once per external state change.
    ///
    /// Backends that cannot observe external changes ignore it.
    fn on_change(&self, notify: ChangeNotify);

    /// Check that the backend is reachable.
    async fn health_check(&self, cancel: &Shutdown) -> RegistryResult<()>;

    /// Release backend resources once shutdown has fired.
    async fn close(&self) {}
}

/// Run a registry operation, failing with `Cancelled` if shutdown fires first.
pub(crate) async fn cancellable<T, F>(cancel: &Shutdown, op: F) -> RegistryResult<T>
where
    F: Future<Output = RegistryResult<T>>,
{
    if cancel.is_triggered() {
        return Err(RegistryError::Cancelled);
    }

    let mut cancel = cancel.clone();
    tokio::select! {
        biased;
        _ = cancel.wait() => Err(RegistryError::Cancelled),
        result = op => result,
    }
}
