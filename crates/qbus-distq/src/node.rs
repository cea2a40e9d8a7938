//! Queue nodes and transactions.
//!
//! A [`Tx`] represents one atomically ordered multicast: a single atomic
//! timestamp plus a reference count. A [`Node`] is one pending delivery to
//! one destination peer; it retains its transaction while queued and carries
//! the link fields for the destination's lists.
//!
//! Both types embed in a larger message carrier and start with a reference
//! count of zero; [`claim`](Node::claim) establishes the first reference.
//! The engine itself never frees anything — when a count drops to zero the
//! embedding layer reclaims the carrier.

use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crate::peer::Peer;
use crate::stamp::{AtomicStamp, Stamp};
use crate::{warn_on, ENGINE_METRICS};

/// One atomically ordered multicast transaction.
#[derive(Debug)]
pub struct Tx {
    n_refs: AtomicUsize,
    timestamp: AtomicStamp,
}

impl Tx {
    /// A new, unclaimed transaction with a tentative zero timestamp.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            n_refs: AtomicUsize::new(0),
            timestamp: AtomicStamp::new(0),
        }
    }

    /// Establish the first reference on an unclaimed transaction.
    pub fn claim(&self) {
        warn_on!(self.n_refs.load(Ordering::Relaxed) != 0);
        self.n_refs.store(1, Ordering::Relaxed);
    }

    /// Acquire an additional reference.
    pub fn retain(&self) {
        self.n_refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; returns true if it was the last.
    pub fn release(&self) -> bool {
        if self.n_refs.fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            return true;
        }
        false
    }

    /// Current reference count.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.n_refs.load(Ordering::Relaxed)
    }

    /// Current timestamp value.
    #[must_use]
    pub fn timestamp(&self) -> Stamp {
        self.timestamp.get()
    }

    /// Whether the timestamp has been committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.timestamp.is_committed()
    }

    pub(crate) fn stamp(&self) -> &AtomicStamp {
        &self.timestamp
    }

    /// Commit this transaction against the sender's clock.
    ///
    /// Forward-syncs the transaction timestamp to the sender's clock, then
    /// sets the low bit. From here on the timestamp is frozen; no further
    /// modification can happen on a committed timestamp. No barriers are
    /// involved — the publish edge is the committed counter in
    /// [`Node::commit`].
    pub fn commit(&self, sender: &Peer) {
        self.timestamp.force_sync(sender.clock());
        let ts = self.timestamp.commit();
        ENGINE_METRICS.record_tx_committed();
        tracing::trace!(target: "qbus::distq", timestamp = ts, "transaction committed");
    }
}

impl Default for Tx {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        warn_on!(self.n_refs.load(Ordering::Relaxed) != 0);
    }
}

/// One pending delivery to one destination peer.
///
/// A node is linked into at most one of the destination's three queues at
/// any time: the lock-free incoming list, the owner-local busy list, or the
/// owner-local ready map. The `userdata` tag is opaque to the engine; the
/// embedding layer uses it to recover the carrier type.
#[derive(Debug)]
pub struct Node {
    n_refs: AtomicUsize,
    userdata: u32,
    /// Resolved timestamp, set exactly once when the node moves to the
    /// ready map. Zero means unresolved; resolved values are odd. Owner
    /// writes serialize through the peer mutex; the atomic only makes the
    /// scalar shareable.
    timestamp: AtomicI64,
    tx: AtomicPtr<Tx>,
    next_queue: AtomicPtr<Node>,
    in_ready: AtomicBool,
}

impl Node {
    /// A new, unclaimed node carrying the given user tag.
    #[must_use]
    pub const fn new(userdata: u32) -> Self {
        Self {
            n_refs: AtomicUsize::new(0),
            userdata,
            timestamp: AtomicI64::new(0),
            tx: AtomicPtr::new(ptr::null_mut()),
            next_queue: AtomicPtr::new(ptr::null_mut()),
            in_ready: AtomicBool::new(false),
        }
    }

    /// Establish the first reference on an unclaimed node.
    pub fn claim(&self) {
        warn_on!(self.n_refs.load(Ordering::Relaxed) != 0);
        self.n_refs.store(1, Ordering::Relaxed);
    }

    /// Acquire an additional reference.
    pub fn retain(&self) {
        self.n_refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; returns true if it was the last.
    pub fn release(&self) -> bool {
        if self.n_refs.fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            return true;
        }
        false
    }

    /// Current reference count.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.n_refs.load(Ordering::Relaxed)
    }

    /// The embedding layer's tag.
    #[must_use]
    pub fn userdata(&self) -> u32 {
        self.userdata
    }

    /// Resolved timestamp, or 0 while the node has not reached the ready
    /// map.
    #[must_use]
    pub fn resolved_timestamp(&self) -> Stamp {
        self.timestamp.load(Ordering::Relaxed)
    }

    /// Whether the node is linked into an incoming or busy list.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        !self.next_queue.load(Ordering::Relaxed).is_null()
    }

    /// Whether the node currently sits in a ready map.
    #[must_use]
    pub fn in_ready(&self) -> bool {
        self.in_ready.load(Ordering::Relaxed)
    }

    /// Whether a transaction is attached.
    #[must_use]
    pub fn has_tx(&self) -> bool {
        !self.tx.load(Ordering::Relaxed).is_null()
    }

    /// Detach and return the node's transaction.
    ///
    /// The caller inherits the reference the node held on the transaction.
    pub fn finalize(&self) -> Option<NonNull<Tx>> {
        let tx = self.tx.swap(ptr::null_mut(), Ordering::Relaxed);
        NonNull::new(tx)
    }

    /// Queue this node on a destination peer under the given transaction.
    ///
    /// Links the node at the head of the destination's incoming list via
    /// compare-exchange and forward-syncs the transaction timestamp to the
    /// destination's clock. As soon as the link succeeds the receiver may
    /// dequeue the node; the transfer takes immediate effect. The successful
    /// compare-exchange pairs with the receiver-side exchange so all prior
    /// stores to the node are visible on the other side.
    ///
    /// If the destination queue is closed, the owner has settled all
    /// destructions and any further operation would order after them; the
    /// node is dropped immediately, emulating an instant dequeue-and-discard.
    ///
    /// Takes one additional reference on the node and on `tx`; both are
    /// handed to the destination queue.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the node and `tx` stay pinned and
    /// alive for as long as they are referenced by the destination queue.
    /// The reference protocol provides this whenever both are claimed before
    /// queueing and their carrier is only reclaimed once the counts drop to
    /// zero (after the matching pop or teardown of the finalize chain).
    pub unsafe fn queue(&self, tx: &Tx, dest: &Peer) {
        if warn_on!(self.has_tx() || self.is_linked()) {
            return;
        }

        self.retain();
        tx.retain();
        self.tx
            .store(ptr::from_ref(tx).cast_mut(), Ordering::Relaxed);

        let this = ptr::from_ref(self).cast_mut();
        let mut head = dest.incoming_head();
        loop {
            if head.is_null() {
                // Closed queue: never link, never deliver.
                self.next_queue.store(ptr::null_mut(), Ordering::Relaxed);
                warn_on!(self.release());
                ENGINE_METRICS.record_node_discarded();
                tracing::debug!(
                    target: "qbus::distq",
                    userdata = self.userdata,
                    "destination closed, node discarded"
                );
                return;
            }
            self.next_queue.store(head, Ordering::Relaxed);
            match dest.incoming_publish(head, this) {
                Ok(()) => break,
                Err(current) => head = current,
            }
        }

        // The link above made the node visible; now read the destination
        // clock and raise the transaction to it.
        tx.stamp().force_sync(dest.clock());
        ENGINE_METRICS.record_node_queued();
    }

    /// Publish this node to its destination.
    ///
    /// Increments the destination's committed counter with release ordering
    /// — the one edge that makes the message state visible to
    /// [`Peer::poll`](crate::Peer::poll) — and wakes the destination's
    /// waiter. The counter can be negative when entries were received ahead
    /// of their sender's bookkeeping; the wakeup is skipped then, since the
    /// receiver evidently is making progress on its own.
    ///
    /// Afterwards the destination clock is forward-synced past the
    /// transaction timestamp. Every receiver syncs its clock on retrieval
    /// anyway; syncing early here narrows — but does not close — the window
    /// in which side-channel communication between receivers can produce a
    /// message that is unordered against this one. Closing it entirely would
    /// require holding a lock across all destinations of the transaction,
    /// which this engine deliberately avoids.
    pub fn commit(&self, dest: &Peer) {
        let tx = self.tx.load(Ordering::Relaxed);
        if warn_on!(tx.is_null()) {
            return;
        }

        if dest.committed_inc() > 0 {
            dest.waitq().wake();
        }

        // Safety: the queue reference protocol keeps the tx alive while
        // this node holds it.
        let ts = unsafe { (*tx).timestamp() } + 1;
        dest.clock_sync(ts);
        ENGINE_METRICS.record_node_committed();
    }

    pub(crate) fn tx_ptr(&self) -> *mut Tx {
        self.tx.load(Ordering::Relaxed)
    }

    pub(crate) fn next_link(&self) -> *mut Node {
        self.next_queue.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: *mut Node) {
        self.next_queue.store(next, Ordering::Relaxed);
    }

    pub(crate) fn next_slot(&self) -> *const AtomicPtr<Node> {
        &self.next_queue
    }

    /// Record the committed timestamp this node resolved at, once.
    pub(crate) fn resolve_timestamp(&self, ts: Stamp) {
        if self.timestamp.load(Ordering::Relaxed) == 0 {
            self.timestamp.store(ts, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_in_ready(&self, value: bool) {
        self.in_ready.store(value, Ordering::Relaxed);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        warn_on!(self.n_refs.load(Ordering::Relaxed) != 0);
        warn_on!(self.has_tx());
        warn_on!(self.is_linked());
        warn_on!(self.in_ready());
    }
}
