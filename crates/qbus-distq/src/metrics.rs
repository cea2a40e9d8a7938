//! Engine counters.
//!
//! Lock-free telemetry for the queue hot paths. All counters are relaxed
//! `AtomicU64` — readers may observe stale values but never torn ones.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global engine metrics singleton.
pub static ENGINE_METRICS: EngineMetrics = EngineMetrics::new();

/// Atomic counters for queue activity.
pub struct EngineMetrics {
    /// Nodes linked into an incoming list.
    pub nodes_queued_total: AtomicU64,
    /// Nodes dropped because their destination was already closed.
    pub nodes_discarded_total: AtomicU64,
    /// Per-destination commits.
    pub nodes_committed_total: AtomicU64,
    /// Transaction commits (one per stage).
    pub tx_committed_total: AtomicU64,
    /// Peek calls, including fast-path hits.
    pub peeks_total: AtomicU64,
    /// Full chain synchronizations triggered by an unordered queue front.
    pub syncs_total: AtomicU64,
    /// Entries handed to consumers.
    pub pops_total: AtomicU64,
    /// Queues closed.
    pub finalized_total: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes_queued_total: AtomicU64::new(0),
            nodes_discarded_total: AtomicU64::new(0),
            nodes_committed_total: AtomicU64::new(0),
            tx_committed_total: AtomicU64::new(0),
            peeks_total: AtomicU64::new(0),
            syncs_total: AtomicU64::new(0),
            pops_total: AtomicU64::new(0),
            finalized_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_node_queued(&self) {
        self.nodes_queued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_node_discarded(&self) {
        self.nodes_discarded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_node_committed(&self) {
        self.nodes_committed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx_committed(&self) {
        self.tx_committed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_peek(&self) {
        self.peeks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pop(&self) {
        self.pops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finalize(&self) {
        self.finalized_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            nodes_queued_total: self.nodes_queued_total.load(Ordering::Relaxed),
            nodes_discarded_total: self.nodes_discarded_total.load(Ordering::Relaxed),
            nodes_committed_total: self.nodes_committed_total.load(Ordering::Relaxed),
            tx_committed_total: self.tx_committed_total.load(Ordering::Relaxed),
            peeks_total: self.peeks_total.load(Ordering::Relaxed),
            syncs_total: self.syncs_total.load(Ordering::Relaxed),
            pops_total: self.pops_total.load(Ordering::Relaxed),
            finalized_total: self.finalized_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub nodes_queued_total: u64,
    pub nodes_discarded_total: u64,
    pub nodes_committed_total: u64,
    pub tx_committed_total: u64,
    pub peeks_total: u64,
    pub syncs_total: u64,
    pub pops_total: u64,
    pub finalized_total: u64,
}

impl std::fmt::Display for EngineMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "distq(queued={} discarded={} committed={} tx={} peeks={} syncs={} pops={} finalized={})",
            self.nodes_queued_total,
            self.nodes_discarded_total,
            self.nodes_committed_total,
            self.tx_committed_total,
            self.peeks_total,
            self.syncs_total,
            self.pops_total,
            self.finalized_total,
        )
    }
}
