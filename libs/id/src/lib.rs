//! # mc-id
//!
//! Worker identifiers for the musicalchairs pool manager.
//!
//! ## Design Principles
//!
//! - Worker ids are system-generated and never reused
//! - Generated ids are human-readable: `mc-worker-{adjective}-{noun}-{suffix}`
//! - Ids reported back from outside are parsed strictly but without
//!   requiring the generated prefix, so an unknown but well-formed id is a
//!   registry miss rather than a parse failure
//!
//! ## Id Format
//!
//! Any id must be a valid Kubernetes object name, because the orchestration
//! backend uses it verbatim as the pod name:
//!
//! - `mc-worker-sunny-otter-k3x9q` (generated)
//! - `mc-worker-brave-heron` (externally supplied)

mod error;
mod types;
mod words;

pub use error::IdError;
pub use types::*;
