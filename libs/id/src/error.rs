//! Error types for worker id parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating a worker id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty (or whitespace only).
    #[error("worker id cannot be empty")]
    Empty,

    /// The id exceeds the maximum object name length.
    #[error("worker id is {len} characters, maximum is {max}")]
    TooLong { len: usize, max: usize },

    /// The id contains a character outside `[a-z0-9.-]`.
    #[error("invalid character {found:?} in worker id at position {position}")]
    InvalidCharacter { found: char, position: usize },

    /// The id starts or ends with a non-alphanumeric character.
    #[error("worker id must start and end with a lowercase letter or digit")]
    InvalidBoundary,
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
