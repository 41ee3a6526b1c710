//! musicalchairs pool manager library.
//!
//! Keeps a pool of idle workers between a target size and a surge ceiling,
//! and lets workers report themselves busy over HTTP. The crate ships the
//! `musicalchairs` binary; the library surface exists for integration tests.

pub mod api;
pub mod config;
pub mod reconciler;
pub mod registry;
pub mod shutdown;
pub mod state;
