//! Application state shared across request handlers.

use std::sync::Arc;

use crate::registry::WorkerRegistry;
use crate::shutdown::Shutdown;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<dyn WorkerRegistry>,
    shutdown: Shutdown,
}

impl AppState {
    pub fn new(registry: Arc<dyn WorkerRegistry>, shutdown: Shutdown) -> Self {
        Self {
            inner: Arc::new(AppStateInner { registry, shutdown }),
        }
    }

    pub fn registry(&self) -> &dyn WorkerRegistry {
        self.inner.registry.as_ref()
    }

    /// Process shutdown, used to abandon in-flight registry calls.
    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }
}
