//! Pool reconciliation primitives.
//!
//! This library holds the pure decision logic of the worker pool
//! reconciler, separated from any registry I/O:
//!
//! - **Bounds**: the tolerated band of idle workers, `[target, target + surge]`.
//! - **Plan**: how many workers to create or remove given the observed count.
//! - **Selection**: which idle workers to remove on scale-down.
//!
//! # Invariants
//!
//! - Decisions depend only on the observed count and static bounds
//!   (level-triggered), never on what changed since the last pass
//! - Applying a plan lands the count inside the bounds, so an immediate
//!   second plan is always [`PoolAction::Hold`]
//! - Selection is deterministic given the same candidates, regardless of
//!   the order the backend listed them in

use std::cmp::Ordering;

/// Default number of idle workers kept ready.
pub const DEFAULT_TARGET_POOL_SIZE: u32 = 3;

/// Default number of extra idle workers tolerated above target.
pub const DEFAULT_SURGE_THRESHOLD: u32 = 2;

/// The tolerated band of idle (`Waiting`) workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    /// Desired count of idle workers.
    pub target: u32,

    /// Extra idle workers tolerated above target before scale-down fires.
    pub surge: u32,
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET_POOL_SIZE,
            surge: DEFAULT_SURGE_THRESHOLD,
        }
    }
}

/// What a reconcile pass should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    /// Create this many new workers.
    ScaleUp(usize),

    /// Remove this many idle workers.
    ScaleDown(usize),

    /// The pool is within bounds.
    Hold,
}

impl PoolAction {
    /// Returns true if no registry writes are needed.
    pub fn is_hold(&self) -> bool {
        matches!(self, Self::Hold)
    }
}

/// Where an observed idle count sits relative to the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Fewer idle workers than target.
    BelowTarget,

    /// Inside `[target, target + surge]`.
    WithinBounds,

    /// More idle workers than `target + surge`.
    AboveSurge,
}

impl PoolBounds {
    /// Create bounds from a target and surge threshold.
    pub fn new(target: u32, surge: u32) -> Self {
        Self { target, surge }
    }

    /// Lower edge of the band.
    pub fn lower(&self) -> usize {
        self.target as usize
    }

    /// Upper edge of the band (`target + surge`).
    pub fn upper(&self) -> usize {
        (self.target as usize).saturating_add(self.surge as usize)
    }

    /// Classify an observed idle count.
    pub fn status(&self, waiting: usize) -> PoolStatus {
        if waiting < self.lower() {
            PoolStatus::BelowTarget
        } else if waiting > self.upper() {
            PoolStatus::AboveSurge
        } else {
            PoolStatus::WithinBounds
        }
    }

    /// Returns true if the observed idle count needs no action.
    pub fn contains(&self, waiting: usize) -> bool {
        self.status(waiting) == PoolStatus::WithinBounds
    }

    /// Calculate the action for an observed idle count.
    ///
    /// Scale-up fills to exactly `target`; scale-down trims to exactly
    /// `target + surge`. The surge band is the hysteresis that keeps the
    /// pool from thrashing between the two.
    pub fn plan(&self, waiting: usize) -> PoolAction {
        match self.status(waiting) {
            PoolStatus::BelowTarget => PoolAction::ScaleUp(self.lower() - waiting),
            PoolStatus::AboveSurge => PoolAction::ScaleDown(waiting - self.upper()),
            PoolStatus::WithinBounds => PoolAction::Hold,
        }
    }
}

/// Select `count` candidates for removal, oldest first.
///
/// `created_at` returns the creation time of a candidate (any `Ord` type);
/// candidates with no known creation time are removed before dated ones.
/// Ties are broken by `tie_break` so the result never depends on the order
/// in which the backend listed the candidates.
pub fn select_for_removal<T, C, K, FC, FK>(
    candidates: Vec<T>,
    count: usize,
    created_at: FC,
    tie_break: FK,
) -> Vec<T>
where
    C: Ord,
    K: Ord,
    FC: Fn(&T) -> Option<C>,
    FK: Fn(&T) -> K,
{
    let mut candidates = candidates;
    candidates.sort_by(|a, b| match (created_at(a), created_at(b)) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (ca, cb) => ca.cmp(&cb).then_with(|| tie_break(a).cmp(&tie_break(b))),
    });
    candidates.truncate(count);
    candidates
}
