//! The message carrier.
//!
//! A message embeds the engine's transaction and node by value and knows —
//! through a weak back-reference — which container it lives in. Reference
//! forwarding maps the engine's node and transaction counts onto the
//! container's strong count: while a node or transaction is referenced, its
//! container cannot go away; when the last engine reference drops, exactly
//! one container reference is returned.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use qbus_distq::{Node, Tx};

use crate::payload::CustomCarrier;
use crate::peer::Peer;
use crate::warn_on;
use crate::{Handle, Object};

/// Tail sentinel for stage lists; distinguishes "unstaged" (null) from
/// "staged, last in list".
pub(crate) const MSG_TAIL: *mut Message = ptr::without_provenance_mut(usize::MAX);

/// Carrier kind, stored as the engine node's user tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// User payload delivery to an explicit destination.
    Custom = 0,
    /// Object teardown notification, delivered to the object owner.
    ObjectRelease = 1,
    /// A handle dropped its last public reference; delivered to the owner
    /// of the handle's object.
    HandleRelease = 2,
    /// The handle's object was destroyed; delivered to the handle owner.
    HandleDestruction = 3,
}

impl MessageKind {
    /// Recover the kind from an engine node tag.
    #[must_use]
    pub fn from_userdata(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Custom),
            1 => Some(Self::ObjectRelease),
            2 => Some(Self::HandleRelease),
            3 => Some(Self::HandleDestruction),
            _ => None,
        }
    }
}

/// Weak back-reference to the allocation a message is embedded in.
pub(crate) enum Carrier {
    Custom(Weak<CustomCarrier>),
    Object(Weak<Object>),
    Handle(Weak<Handle>),
}

impl Carrier {
    /// Take one strong reference on the container.
    ///
    /// # Safety
    ///
    /// The container's strong count must be non-zero (the forwarding
    /// protocol guarantees a live container whenever a message is
    /// reachable).
    unsafe fn retain(&self) {
        match self {
            Carrier::Custom(weak) => unsafe { Arc::increment_strong_count(weak.as_ptr()) },
            Carrier::Object(weak) => unsafe { Arc::increment_strong_count(weak.as_ptr()) },
            Carrier::Handle(weak) => unsafe { Arc::increment_strong_count(weak.as_ptr()) },
        }
    }
}

/// One message: stage linkage, embedded transaction, embedded queue node,
/// and the back-reference to its container.
pub struct Message {
    /// Stage list link. Null while unstaged; a message can be staged at
    /// most once at a time.
    next: AtomicPtr<Message>,
    tx: Tx,
    node: Node,
    carrier: Carrier,
}

impl Message {
    pub(crate) fn new(kind: MessageKind, carrier: Carrier) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            tx: Tx::new(),
            node: Node::new(kind as u32),
            carrier,
        }
    }

    /// The carrier kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_userdata(self.node.userdata()).expect("message node carries a valid tag")
    }

    /// The embedded transaction.
    #[must_use]
    pub fn tx(&self) -> &Tx {
        &self.tx
    }

    /// The embedded queue node.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Whether the message currently sits on a stage list.
    #[must_use]
    pub fn staged(&self) -> bool {
        !self.next.load(Ordering::Relaxed).is_null()
    }

    pub(crate) fn next_link(&self) -> *mut Message {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: *mut Message) {
        self.next.store(next, Ordering::Relaxed);
    }

    /// The destination peer this message delivers to, determined by kind:
    /// custom messages name their destination explicitly, releases go to
    /// the object owner, destructions to the handle owner.
    pub(crate) fn destination(&self) -> Arc<Peer> {
        match (&self.carrier, self.kind()) {
            (Carrier::Custom(weak), MessageKind::Custom) => {
                let carrier = weak.upgrade().expect("staged carrier is alive");
                Arc::clone(carrier.target().owner())
            }
            (Carrier::Object(weak), MessageKind::ObjectRelease) => {
                let object = weak.upgrade().expect("staged object is alive");
                Arc::clone(object.owner())
            }
            (Carrier::Handle(weak), MessageKind::HandleRelease) => {
                let handle = weak.upgrade().expect("staged handle is alive");
                Arc::clone(handle.object().owner())
            }
            (Carrier::Handle(weak), MessageKind::HandleDestruction) => {
                let handle = weak.upgrade().expect("staged handle is alive");
                Arc::clone(handle.owner())
            }
            _ => unreachable!("carrier and kind always match"),
        }
    }

    /// Upgrade to the containing custom carrier, if this is a custom
    /// message.
    #[must_use]
    pub fn as_custom(&self) -> Option<Arc<CustomCarrier>> {
        match &self.carrier {
            Carrier::Custom(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Upgrade to the containing object, if this is an object message.
    #[must_use]
    pub fn as_object(&self) -> Option<Arc<Object>> {
        match &self.carrier {
            Carrier::Object(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Upgrade to the containing handle, if this is a handle message.
    #[must_use]
    pub fn as_handle(&self) -> Option<Arc<Handle>> {
        match &self.carrier {
            Carrier::Handle(weak) => weak.upgrade(),
            _ => None,
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        warn_on!(self.staged());
    }
}

/// Take one container reference through a message.
///
/// # Safety
///
/// The container must be alive (strong count non-zero).
pub(crate) unsafe fn message_ref(message: &Message) {
    unsafe { message.carrier.retain() };
}

/// Return one container reference through a message.
///
/// `message` may dangle once the count drops; nothing is touched after the
/// decrement.
///
/// # Safety
///
/// The caller must own one forwarded container reference.
pub(crate) unsafe fn message_unref(message: *const Message) {
    unsafe {
        match &(*message).carrier {
            Carrier::Custom(weak) => release_container(weak),
            Carrier::Object(weak) => release_container(weak),
            Carrier::Handle(weak) => release_container(weak),
        }
    }
}

/// Drop one strong reference on a container reached through its weak
/// back-reference. The clone pins the allocation (not the value), so the
/// final decrement can drop the container without invalidating the pointer
/// handed to it.
///
/// # Safety
///
/// The caller must own the strong reference being returned.
unsafe fn release_container<T>(weak: &Weak<T>) {
    let weak = Weak::clone(weak);
    unsafe { Arc::decrement_strong_count(weak.as_ptr()) };
}

/// Recover the message embedding `node`.
///
/// # Safety
///
/// `node` must be embedded in a [`Message`] (every node the core layer
/// queues is).
pub(crate) unsafe fn message_from_node(node: &Node) -> *const Message {
    unsafe {
        ptr::from_ref(node)
            .byte_sub(mem::offset_of!(Message, node))
            .cast()
    }
}

/// Recover the message embedding `tx`.
///
/// # Safety
///
/// `tx` must be embedded in a [`Message`].
pub(crate) unsafe fn message_from_tx(tx: &Tx) -> *const Message {
    unsafe {
        ptr::from_ref(tx)
            .byte_sub(mem::offset_of!(Message, tx))
            .cast()
    }
}

/// Drop one transaction reference; returns a container reference when it
/// was the last.
///
/// # Safety
///
/// The caller must own the reference, and the tx must be embedded in a
/// [`Message`].
pub(crate) unsafe fn unref_tx(tx: &Tx) {
    if tx.release() {
        unsafe { message_unref(message_from_tx(tx)) };
    }
}

/// Drop one node reference. When it was the last, the node's transaction
/// reference and one container reference are returned as well.
///
/// # Safety
///
/// The caller must own the reference, and the node must be embedded in a
/// [`Message`].
pub(crate) unsafe fn unref_node(node: &Node) {
    if node.release() {
        if let Some(tx) = node.finalize() {
            unsafe { unref_tx(tx.as_ref()) };
        }
        unsafe { message_unref(message_from_node(node)) };
    }
}
