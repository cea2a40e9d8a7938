//! Per-peer queues.
//!
//! Each peer owns three views of its pending deliveries:
//!
//! - `incoming`: a lock-free multi-producer singly-linked list. Producers
//!   swing the head with compare-exchange; the owner drains the whole list
//!   with one exchange. The head uses three sentinel states: [`TAIL`] for
//!   "empty but open", null for "closed", anything else is a live node.
//! - `busy`: an owner-local singly-linked list of drained nodes whose
//!   transactions have not committed yet.
//! - `ready`: an owner-local map ordered by `(timestamp, tx identity, node
//!   identity)`. Timestamps can tie when two sends issue from the same
//!   sender at the same tick; the identity tie-breaks give every receiver
//!   the same well-defined order.
//!
//! Receiver operations serialize on the peer's own mutex. Producers never
//! touch it, and no lock is ever held across more than one peer.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::node::Node;
use crate::stamp::{self, AtomicStamp, Stamp};
use crate::wait::WaitQueue;
use crate::{warn_on, ENGINE_METRICS};

/// Tail sentinel for the singly-linked queue lists.
///
/// A plain null-terminated list cannot distinguish "empty" from "closed";
/// the non-null dangling tail marker encodes the former, null the latter,
/// and it also makes "is this node linked?" an O(1) check.
pub(crate) const TAIL: *mut Node = ptr::without_provenance_mut(usize::MAX);

/// Sort key for the ready map: the lexicographic order the whole system
/// agrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    timestamp: Stamp,
    tx: usize,
    node: usize,
}

impl ReadyKey {
    fn of(node: &Node) -> Self {
        Self {
            timestamp: node.resolved_timestamp(),
            tx: node.tx_ptr() as usize,
            node: ptr::from_ref(node) as usize,
        }
    }
}

/// Owner-only queue state, serialized by the peer mutex.
struct LocalQueue {
    /// Last value the clock was synchronized to during maintenance.
    local: Stamp,
    /// Busy list head. [`TAIL`]-terminated while open, null once finalized.
    /// Atomic only for uniform slot-walking with the node links.
    busy: AtomicPtr<Node>,
    ready: BTreeMap<ReadyKey, NonNull<Node>>,
    /// Cached leftmost and rightmost ready nodes.
    ready_first: Option<NonNull<Node>>,
    ready_last: Option<NonNull<Node>>,
}

// Safety: the raw node pointers in the owner queue are kept alive by the
// queue's node references; the mutex serializes all access.
unsafe impl Send for LocalQueue {}

/// A local endpoint owning a queue and a clock.
pub struct Peer {
    /// The peer's tentative clock; always even.
    clock: AtomicStamp,
    /// Committed-but-undelivered entries. Incremented with release ordering
    /// by producers, read with acquire ordering by [`Peer::poll`]; this pair
    /// is the engine's only publish edge. Briefly negative when a receiver
    /// outruns its sender's bookkeeping.
    n_committed: AtomicI64,
    waitq: WaitQueue,
    incoming: AtomicPtr<Node>,
    local: Mutex<LocalQueue>,
}

impl Peer {
    /// A new peer with an empty, open queue and a zero clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: AtomicStamp::new(0),
            n_committed: AtomicI64::new(0),
            waitq: WaitQueue::new(),
            incoming: AtomicPtr::new(TAIL),
            local: Mutex::new(LocalQueue {
                local: 0,
                busy: AtomicPtr::new(TAIL),
                ready: BTreeMap::new(),
                ready_first: None,
                ready_last: None,
            }),
        }
    }

    /// Current clock value.
    #[must_use]
    pub fn clock(&self) -> Stamp {
        self.clock.get()
    }

    /// The peer's wait primitive. The engine only wakes it; blocking on it
    /// (and cancellation) is the caller's business.
    #[must_use]
    pub fn waitq(&self) -> &WaitQueue {
        &self.waitq
    }

    /// Query the queue for readiness.
    ///
    /// Returns true if entries are ready to be retrieved; the next
    /// [`peek`](Self::peek) is then guaranteed to return one. The acquire
    /// load pairs with the release increment on the send side, so an
    /// observed "ready" implies the commit timestamps on the respective
    /// messages are visible too.
    #[must_use]
    pub fn poll(&self) -> bool {
        self.n_committed.load(Ordering::Acquire) > 0
    }

    /// Peek at the queue front.
    ///
    /// Returns the front of the queue, or `None` if no entry is ready. The
    /// returned node stays valid until it is popped, the queue is finalized,
    /// or the caller's serialization of receiver operations ends.
    ///
    /// If the front entry is unchanged since the last call this is O(1).
    /// For a new front the queue performs maintenance: committed entries
    /// are fetched from the incoming list and sorted into the ready map,
    /// and — if the candidate front has not been ordered against the local
    /// clock yet — every still-tentative transaction intersecting the queue
    /// is synchronized past the ready tail, so nothing in flight can order
    /// before the returned entry anymore.
    ///
    /// The caller must serialize receiver operations (`peek`, `pop`,
    /// `finalize`) against each other; producers need no coordination.
    #[must_use]
    pub fn peek(&self) -> Option<&Node> {
        let mut guard = self.local.lock();
        let q = &mut *guard;
        ENGINE_METRICS.record_peek();

        if q.ready_first.is_none() {
            // Nothing staged for retrieval, but the incoming list may hold
            // committed entries. Fetch and sort them.
            self.prefetch(q);
            q.ready_first?;
        }

        // Safety: ready membership holds a node reference; the owner mutex
        // is held.
        let first = unsafe { q.ready_first.unwrap().as_ref() };
        if first.resolved_timestamp() >= q.local {
            // The front has not been synchronized against our clock, so
            // entries still in flight could order before it. Sync the whole
            // incoming+busy chain against the ready tail to resolve every
            // conflict at once.
            let to = unsafe { q.ready_last.unwrap().as_ref() }.resolved_timestamp() + 1;
            self.sync(q, to);
            warn_on!(q.ready_first.is_none());
        }

        q.ready_first.map(|node| unsafe { &*node.as_ptr() })
    }

    /// Drop the queue front.
    ///
    /// `node` must be the entry returned by the previous
    /// [`peek`](Self::peek); only the front can be dropped. The caller
    /// inherits the queue's reference on the node.
    ///
    /// The committed counter is decremented without ordering — receiver
    /// operations are serialized anyway. This can push the counter below
    /// zero when an entry is retrieved before its sender finished its
    /// bookkeeping; the next [`poll`](Self::poll) reconciles.
    pub fn pop(&self, node: &Node) {
        let mut guard = self.local.lock();
        let popped = Self::pop_ready(&mut guard);
        warn_on!(popped != Some(NonNull::from(node)));

        self.n_committed.fetch_sub(1, Ordering::Relaxed);
        ENGINE_METRICS.record_pop();
    }

    /// Close the queue and return everything still linked.
    ///
    /// The incoming list is atomically replaced with the closed sentinel;
    /// from here on [`Node::queue`](crate::Node::queue) against this peer
    /// discards its node. The former incoming entries, the busy list, and
    /// the ready map are concatenated into one chain handed to the caller
    /// for reference teardown. Idempotent: later calls return an empty
    /// chain.
    #[must_use]
    pub fn finalize(&self) -> Chain {
        let mut guard = self.local.lock();
        let q = &mut *guard;

        let drained = self.incoming.swap(ptr::null_mut(), Ordering::Acquire);
        if drained.is_null() {
            return Chain::empty();
        }

        // Append the ex-incoming entries after the busy list.
        //
        // Safety: all linked nodes are kept alive by their queue
        // references; the owner mutex is held.
        unsafe {
            let mut slot: *const AtomicPtr<Node> = &q.busy;
            loop {
                let node = (*slot).load(Ordering::Relaxed);
                if node == TAIL {
                    break;
                }
                slot = (*node).next_slot();
            }
            (*slot).store(drained, Ordering::Relaxed);
        }

        let mut head = q.busy.load(Ordering::Relaxed);
        q.busy.store(ptr::null_mut(), Ordering::Relaxed);

        // Prepend all ready entries.
        for node in std::mem::take(&mut q.ready).into_values() {
            unsafe {
                node.as_ref().set_in_ready(false);
                node.as_ref().set_next(head);
            }
            head = node.as_ptr();
        }
        q.ready_first = None;
        q.ready_last = None;

        ENGINE_METRICS.record_finalize();
        tracing::debug!(target: "qbus::distq", "queue closed");
        Chain { head }
    }

    /// Move committed entries from the busy and incoming lists into the
    /// ready map. Drains the incoming list exactly once, after the first
    /// busy pass, then re-walks what the drain appended.
    fn prefetch(&self, q: &mut LocalQueue) {
        let LocalQueue {
            busy,
            ready,
            ready_first,
            ready_last,
            ..
        } = q;

        let mut slot: *const AtomicPtr<Node> = busy;
        for pass in 0..2 {
            // Safety: linked nodes are kept alive by their queue
            // references; the owner mutex serializes list surgery.
            unsafe {
                loop {
                    let node = (*slot).load(Ordering::Relaxed);
                    if node == TAIL {
                        break;
                    }
                    if warn_on!(node.is_null()) {
                        return;
                    }
                    let ts = (*(*node).tx_ptr()).timestamp();
                    if stamp::is_committed(ts) {
                        (*slot).store((*node).next_link(), Ordering::Relaxed);
                        (*node).set_next(ptr::null_mut());
                        (*node).resolve_timestamp(ts);
                        Self::push_ready(
                            ready,
                            ready_first,
                            ready_last,
                            NonNull::new_unchecked(node),
                        );
                    } else {
                        slot = (*node).next_slot();
                    }
                }
                if pass == 0 {
                    (*slot).store(self.incoming.swap(TAIL, Ordering::Acquire), Ordering::Relaxed);
                }
            }
        }
    }

    /// Synchronize the queue against `to`: raise the local clock and force
    /// every still-tentative transaction in the busy and incoming lists to
    /// at least `to`. Transactions that turn out committed are promoted
    /// into the ready map. A transaction that adopts `to` here may still
    /// commit at a higher value later — which is exactly what allows it to
    /// overtake everything currently ready.
    fn sync(&self, q: &mut LocalQueue, to: Stamp) {
        if warn_on!(stamp::is_committed(to) || to <= q.local) {
            return;
        }

        q.local = to;
        self.clock.force_sync(to);
        ENGINE_METRICS.record_sync();

        let LocalQueue {
            busy,
            ready,
            ready_first,
            ready_last,
            ..
        } = q;

        let mut slot: *const AtomicPtr<Node> = busy;
        for pass in 0..2 {
            // Safety: as in `prefetch`.
            unsafe {
                loop {
                    let node = (*slot).load(Ordering::Relaxed);
                    if node == TAIL {
                        break;
                    }
                    if warn_on!(node.is_null()) {
                        return;
                    }
                    let ts = (*(*node).tx_ptr()).stamp().try_sync(to);
                    if stamp::is_committed(ts) {
                        (*slot).store((*node).next_link(), Ordering::Relaxed);
                        (*node).set_next(ptr::null_mut());
                        (*node).resolve_timestamp(ts);
                        Self::push_ready(
                            ready,
                            ready_first,
                            ready_last,
                            NonNull::new_unchecked(node),
                        );
                    } else {
                        slot = (*node).next_slot();
                    }
                }
                if pass == 0 {
                    (*slot).store(self.incoming.swap(TAIL, Ordering::Acquire), Ordering::Relaxed);
                }
            }
        }
    }

    fn push_ready(
        ready: &mut BTreeMap<ReadyKey, NonNull<Node>>,
        ready_first: &mut Option<NonNull<Node>>,
        ready_last: &mut Option<NonNull<Node>>,
        node: NonNull<Node>,
    ) {
        // Safety: caller hands over a live node under the owner mutex.
        let key = ReadyKey::of(unsafe { node.as_ref() });
        unsafe { node.as_ref().set_in_ready(true) };
        ready.insert(key, node);
        *ready_first = ready.first_key_value().map(|(_, n)| *n);
        *ready_last = ready.last_key_value().map(|(_, n)| *n);
    }

    fn pop_ready(q: &mut LocalQueue) -> Option<NonNull<Node>> {
        let (_, node) = q.ready.pop_first()?;
        // Safety: ready membership held a node reference.
        unsafe { node.as_ref().set_in_ready(false) };
        q.ready_first = q.ready.first_key_value().map(|(_, n)| *n);
        q.ready_last = q.ready.last_key_value().map(|(_, n)| *n);
        Some(node)
    }

    pub(crate) fn incoming_head(&self) -> *mut Node {
        self.incoming.load(Ordering::Relaxed)
    }

    /// Swing the incoming head from `current` to `node`. The release on
    /// success publishes all prior stores to the node; the receiver's
    /// draining exchange acquires them.
    pub(crate) fn incoming_publish(
        &self,
        current: *mut Node,
        node: *mut Node,
    ) -> Result<(), *mut Node> {
        self.incoming
            .compare_exchange(current, node, Ordering::Release, Ordering::Relaxed)
            .map(drop)
    }

    pub(crate) fn committed_inc(&self) -> i64 {
        self.n_committed.fetch_add(1, Ordering::Release) + 1
    }

    pub(crate) fn clock_sync(&self, to: Stamp) {
        self.clock.force_sync(to);
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        // The committed counter is not checked: entries committed after the
        // queue was finalized leave it meaningless.
        let incoming = self.incoming.load(Ordering::Relaxed);
        warn_on!(!incoming.is_null() && incoming != TAIL);

        let q = self.local.get_mut();
        let busy = q.busy.load(Ordering::Relaxed);
        warn_on!(!busy.is_null() && busy != TAIL);
        warn_on!(!q.ready.is_empty());
        warn_on!(q.ready_first.is_some());
        warn_on!(q.ready_last.is_some());
    }
}

/// A detached chain of nodes returned by [`Peer::finalize`].
///
/// Yields every node that was still linked when the queue closed, in no
/// particular order. Each yielded node carries the reference the queue held
/// on it; the consumer must release it (and the node's transaction) for the
/// carrier to be reclaimed.
pub struct Chain {
    head: *mut Node,
}

// Safety: chain nodes are exclusively owned by the chain once detached.
unsafe impl Send for Chain {}

impl Chain {
    pub(crate) fn empty() -> Self {
        Self { head: TAIL }
    }

    /// Whether the chain holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head == TAIL || self.head.is_null()
    }
}

impl Iterator for Chain {
    type Item = NonNull<Node>;

    fn next(&mut self) -> Option<NonNull<Node>> {
        if self.is_empty() {
            return None;
        }
        let node = self.head;
        // Safety: the node was linked in the finalized queue and is kept
        // alive by the reference the chain inherited.
        unsafe {
            self.head = (*node).next_link();
            (*node).set_next(ptr::null_mut());
        }
        NonNull::new(node)
    }
}
