//! Registry error types.

use mc_id::WorkerId;
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The referenced worker does not exist.
    #[error("worker not found: {0}")]
    NotFound(WorkerId),

    /// A worker with this id already exists.
    #[error("worker already exists: {0}")]
    AlreadyExists(WorkerId),

    /// Transport or API failure in the backing system.
    #[error("registry backend error: {0}")]
    Backend(String),

    /// The operation was cancelled by shutdown before it completed.
    #[error("registry operation cancelled")]
    Cancelled,
}

impl RegistryError {
    /// Returns true if this error is a missing worker.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this error came from cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<kube::Error> for RegistryError {
    fn from(e: kube::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
