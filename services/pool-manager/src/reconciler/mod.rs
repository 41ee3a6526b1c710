//! Pool reconciliation.
//!
//! The reconciler is responsible for:
//! - Reading the idle (`Waiting`) workers from the registry
//! - Creating workers when the pool is below target
//! - Removing the oldest idle workers when the pool exceeds the surge band
//!
//! Passes are level-triggered: each one re-reads the full pool, so missed
//! or duplicated triggers are harmless. [`ReconcileWorker`] is the only
//! place passes run, which serializes them.

mod pool;
mod worker;

pub use pool::{PoolReconciler, ReconcileStats};
pub use worker::{ReconcileTrigger, ReconcileWorker};
