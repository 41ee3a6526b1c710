//! HTTP API handlers and routing.

mod busy;
pub mod error;
mod health;

use axum::Router;
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use busy::BusyRequest;
pub use health::HealthResponse;

/// Create the router with the status endpoint, health checks and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(busy::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Why the HTTP server task ended abnormally.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("HTTP server failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP server task panicked: {0}")]
    Panicked(#[from] JoinError),
}

/// Flatten the joined result of a spawned `axum::serve` task.
pub fn server_outcome(joined: Result<std::io::Result<()>, JoinError>) -> Result<(), ServeError> {
    joined?.map_err(ServeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_is_ok() {
        assert!(server_outcome(Ok(Ok(()))).is_ok());
    }

    #[test]
    fn test_io_failure_is_reported() {
        let err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let outcome = server_outcome(Ok(Err(err)));
        assert!(matches!(outcome, Err(ServeError::Io(_))));
    }

    #[tokio::test]
    async fn test_panicked_task_is_reported() {
        async fn crashing_server() -> std::io::Result<()> {
            panic!("serve loop crashed")
        }

        let joined = tokio::spawn(crashing_server()).await;

        assert!(matches!(server_outcome(joined), Err(ServeError::Panicked(_))));
    }
}
