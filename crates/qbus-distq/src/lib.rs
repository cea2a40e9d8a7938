//! Distributed queues with transactional multicast ordering.
//!
//! Every peer owns a queue and a monotonically growing clock; senders stage a
//! set of per-destination queue nodes under one transaction and commit them
//! with a single frozen timestamp. The result is one global, total order over
//! all deliveries — consistent with causality — without any central broker,
//! global sequence, or process-wide lock.
//!
//! The moving parts, leaves first:
//!
//! - [`stamp`]: the timestamp algebra. Clocks tick by two and stay even while
//!   tentative; setting the low bit commits and freezes a value.
//! - [`Tx`] / [`Node`]: one transaction carries one atomic timestamp and is
//!   retained by every node queued under it; a node is one pending delivery
//!   to one destination peer.
//! - [`Peer`]: a lock-free multi-producer incoming list, an owner-local busy
//!   list for still-tentative deliveries, and an owner-local ready map sorted
//!   by committed timestamp.
//!
//! Producer paths (`Node::queue`, `Node::commit`, `Tx::commit`) are wait-free
//! and run concurrently with each other and with the receiver. Receiver paths
//! (`Peer::peek`, `Peer::pop`, `Peer::finalize`) serialize on a per-peer
//! mutex; no lock is ever taken across peers.
//!
//! The sole release/acquire edge is the per-peer committed counter: the
//! increment in [`Node::commit`] pairs with the load in [`Peer::poll`] and
//! carries visibility of all message state. Clock synchronization is a scalar
//! optimization with relaxed ordering throughout; upgrading everything to
//! sequentially consistent operations would hide bugs without adding
//! guarantees.

mod metrics;
mod node;
mod peer;
pub mod stamp;
mod wait;

#[cfg(test)]
mod ordering_tests;

pub use metrics::{EngineMetrics, EngineMetricsSnapshot, ENGINE_METRICS};
pub use node::{Node, Tx};
pub use peer::{Chain, Peer};
pub use wait::WaitQueue;

/// Report a violated engine contract without unwinding.
///
/// Evaluates to the condition so call sites can early-return like the
/// underlying checks require. Contract violations are programming errors;
/// they must never tear down engine state mid-operation.
macro_rules! warn_on {
    ($cond:expr) => {{
        let cond = $cond;
        if cond {
            ::tracing::warn!(
                target: "qbus::distq",
                condition = stringify!($cond),
                "engine contract violation"
            );
        }
        cond
    }};
}

pub(crate) use warn_on;
