//! Received events.

use std::sync::Arc;

use qbus_core::Payload;

/// One delivery retrieved from a peer's queue, translated into ids valid
/// on the receiving peer.
#[derive(Debug)]
pub enum Event {
    /// A payload delivery.
    Message {
        /// Id of the object the message was addressed to.
        object: u64,
        /// The shared payload bytes.
        payload: Arc<Payload>,
        /// Handle ids installed on this peer for the transferred
        /// capabilities, in transfer order.
        handles: Vec<u64>,
    },
    /// A handle on one of this peer's objects dropped its last public
    /// reference.
    HandleReleased {
        /// Id of the object the released handle pointed to.
        object: u64,
    },
    /// The object behind one of this peer's handles was destroyed; the
    /// handle id is retired.
    ObjectDestroyed {
        /// Id of the handle, or 0 if the handle was never published on
        /// this peer.
        handle: u64,
    },
    /// An object owned by this peer finished destruction.
    ObjectReleased {
        /// Id of the destroyed object.
        object: u64,
    },
}
