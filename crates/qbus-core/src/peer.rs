//! The core peer: a queue endpoint for message carriers.

use std::sync::Arc;

use qbus_distq as distq;

use crate::message::{message_from_node, unref_node, Message};

/// A local endpoint owning a distributed queue.
///
/// Receiver operations (`peek_message`, `pop_message`, `finalize`) must be
/// serialized by the caller, like the engine requires; producer-side
/// staging needs no coordination.
pub struct Peer {
    queue: distq::Peer,
}

impl Peer {
    /// A new peer with an open, empty queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: distq::Peer::new(),
        })
    }

    /// The underlying queue.
    #[must_use]
    pub fn queue(&self) -> &distq::Peer {
        &self.queue
    }

    /// Whether a message is ready for retrieval.
    #[must_use]
    pub fn poll(&self) -> bool {
        self.queue.poll()
    }

    /// Peek at the next ready message.
    ///
    /// The returned message stays valid until it is popped or the queue is
    /// finalized.
    #[must_use]
    pub fn peek_message(&self) -> Option<&Message> {
        let node = self.queue.peek()?;
        // Safety: every node queued by this crate is embedded in a
        // Message, and queue membership keeps the carrier alive.
        Some(unsafe { &*message_from_node(node) })
    }

    /// Drop `message` from the queue front and return the queue's
    /// references on it.
    ///
    /// `message` must be the result of the preceding
    /// [`peek_message`](Self::peek_message); it must not be used after
    /// this call.
    pub fn pop_message(&self, message: &Message) {
        self.queue.pop(message.node());
        // Safety: the pop handed us the queue's node reference.
        unsafe { unref_node(message.node()) };
    }

    /// Close the queue and tear down everything still linked.
    ///
    /// Pending carriers are released; senders queueing against this peer
    /// from now on have their nodes absorbed. Idempotent.
    pub fn finalize(&self) {
        for node in self.queue.finalize() {
            // Safety: chain nodes carry the queue's reference, and every
            // node this crate queues is embedded in a Message.
            unsafe { unref_node(node.as_ref()) };
        }
    }
}
