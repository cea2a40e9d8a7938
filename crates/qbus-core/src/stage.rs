//! Staged transactions.
//!
//! A stage is scoped to one sender peer and accumulates messages on a
//! singly-linked list. Committing runs a three-phase protocol:
//!
//! 1. *Adopt*: rather than allocating a transaction context, the embedded
//!    transaction of the first staged message is claimed and used for the
//!    whole stage.
//! 2. *Submit*: every staged node is claimed and queued on its destination,
//!    forward-syncing the transaction to each destination clock.
//! 3. *Settle*: the transaction commits once against the sender's clock,
//!    then every node commits on its destination and the stage's reference
//!    moves to the destination queue.
//!
//! Once submit begins the stage cannot fail: every staged message reaches
//! its destination's incoming list or, if the destination closed, is
//! absorbed. Failures (allocation, quotas) can only happen earlier, while
//! the stage is still being built.

use std::sync::Arc;

use crate::message::{message_ref, unref_node, unref_tx, Message, MSG_TAIL};
use crate::peer::Peer;
use crate::warn_on;
use crate::{CustomCarrier, Handle, Object};

/// A transaction builder rooted at one sender peer.
pub struct Stage {
    peer: Arc<Peer>,
    list: *mut Message,
}

// Safety: the raw list links point into carriers the stage holds
// references on.
unsafe impl Send for Stage {}

impl Stage {
    /// An empty stage sending from `peer`.
    #[must_use]
    pub fn new(peer: &Arc<Peer>) -> Self {
        Self {
            peer: Arc::clone(peer),
            list: MSG_TAIL,
        }
    }

    /// Whether nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list == MSG_TAIL
    }

    /// Push `message` onto the stage list with one container reference.
    ///
    /// # Safety
    ///
    /// The container must be alive, and the staged-once guard
    /// (`message.staged()`) must have been checked under the lock that
    /// covers the message's ancillary lists.
    unsafe fn push(&mut self, message: &Message) {
        message.set_next(self.list);
        self.list = std::ptr::from_ref(message).cast_mut();
        unsafe { message_ref(message) };
    }

    /// Stage a payload delivery.
    pub fn add_custom(&mut self, carrier: &Arc<CustomCarrier>) {
        let message = carrier.message();
        if warn_on!(message.staged()) {
            return;
        }
        // Safety: `carrier` keeps the container alive.
        unsafe { self.push(message) };
    }

    /// Stage the release of `handle`.
    ///
    /// Releasing detaches the handle from its object: once the release
    /// settles, the handle owner no longer observes messages on it. A
    /// handle that a racing destruction already detached is skipped — the
    /// destruction flushes it anyway.
    pub fn add_release(&mut self, handle: &Arc<Handle>) {
        let mut attached = handle.object().attached().lock();
        let message = handle.release_message();
        if warn_on!(message.staged()) {
            return;
        }

        let position = attached
            .handles
            .iter()
            .position(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(handle)));
        if let Some(position) = position {
            attached.handles.swap_remove(position);
            // Safety: `handle` keeps the container alive; the staged-once
            // guard ran under the object's attachment lock.
            unsafe { self.push(message) };
        }
    }

    /// Stage the destruction of `object`.
    ///
    /// Collects one destruction notification per attached handle and
    /// clears the attachment list while holding its lock, so a racing
    /// transfer that finds the list empty knows to deliver the destruction
    /// through its own queue. The object's own release message is staged
    /// to the owner as well.
    pub fn add_destruction(&mut self, object: &Arc<Object>) {
        let mut attached = object.attached().lock();
        let message = object.release_message();
        if warn_on!(message.staged() || !Arc::ptr_eq(object.owner(), &self.peer)) {
            return;
        }

        attached.destroyed = true;

        // Safety: `object` keeps the container alive.
        unsafe { self.push(message) };

        for weak in attached.handles.drain(..) {
            let Some(handle) = weak.upgrade() else {
                continue;
            };
            let destruction = handle.destruction_message();
            if warn_on!(destruction.staged()) {
                continue;
            }
            // Safety: `handle` keeps the container alive; the guard ran
            // under the attachment lock.
            unsafe { self.push(destruction) };
        }
    }

    /// Stage a destruction notification for a freshly created handle whose
    /// object turned out to be destroyed already (a transfer racing a
    /// destruction; see [`Handle::launch`]). The notification is ordered
    /// within this stage's transaction, right alongside the transfer.
    pub fn add_destruction_notice(&mut self, handle: &Arc<Handle>) {
        let message = handle.destruction_message();
        if warn_on!(message.staged()) {
            return;
        }
        // Safety: `handle` keeps the container alive; the handle is
        // unattached and privately owned, so no list lock applies.
        unsafe { self.push(message) };
    }

    /// Commit the stage as one transaction.
    ///
    /// Empty stages are a no-op. Submit and settle run back to back with
    /// no allocation or destination lock in between, keeping the window in
    /// which other senders can bump destination clocks minimal.
    pub fn commit(&mut self) {
        if self.list == MSG_TAIL {
            return;
        }

        // Adopt the first staged message's embedded transaction for the
        // whole stage.
        //
        // Safety: the stage list holds a container reference per message.
        let first = unsafe { &*self.list };
        unsafe { message_ref(first) };
        let tx = first.tx();
        tx.claim();

        self.submit(tx);
        self.settle(tx);

        tracing::debug!(
            target: "qbus::stage",
            timestamp = tx.timestamp(),
            "stage committed"
        );

        // Safety: drops the claim established above.
        unsafe { unref_tx(tx) };
    }

    fn submit(&self, tx: &qbus_distq::Tx) {
        let mut cursor = self.list;
        while cursor != MSG_TAIL {
            // Safety: the stage list holds a container reference per
            // message.
            let message = unsafe { &*cursor };
            let destination = message.destination();
            message.node().claim();
            // Safety: the node and tx are embedded in carriers the
            // reference protocol keeps alive for the whole queue
            // membership.
            unsafe { message.node().queue(tx, destination.queue()) };
            cursor = message.next_link();
        }
    }

    fn settle(&mut self, tx: &qbus_distq::Tx) {
        tx.commit(self.peer.queue());

        while self.list != MSG_TAIL {
            // Safety: as in `submit`.
            let message = unsafe { &*self.list };
            self.list = message.next_link();
            message.set_next(std::ptr::null_mut());

            let destination = message.destination();
            message.node().commit(destination.queue());
            // Safety: drops the stage's claim on the node; the queue's
            // reference keeps the carrier alive for the receiver.
            unsafe { unref_node(message.node()) };
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        warn_on!(self.list != MSG_TAIL);
    }
}
