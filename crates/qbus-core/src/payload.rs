//! User payload carriers.
//!
//! One send produces one [`Payload`] — an immutable byte buffer shared by
//! every destination — and one [`CustomCarrier`] per destination, holding
//! the message, the transferred handles, and the destination peer.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::message::{Carrier, Message, MessageKind};
use crate::peer::Peer;
use crate::{Handle, Object};

/// Payloads up to this size store inline, without a heap allocation.
pub const PAYLOAD_INLINE_BYTES: usize = 64;

/// Transfers up to this count store inline, without a heap allocation.
pub const CUSTOM_INLINE_HANDLES: usize = 4;

/// An immutable byte buffer shared across the destinations of one send.
pub struct Payload {
    bytes: SmallVec<[u8; PAYLOAD_INLINE_BYTES]>,
}

impl Payload {
    /// Copy `bytes` into a shared payload.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            bytes: SmallVec::from_slice(bytes),
        })
    }

    /// The payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// One pending payload delivery to one destination object.
pub struct CustomCarrier {
    message: Message,
    target: Arc<Object>,
    payload: Arc<Payload>,
    transfers: SmallVec<[Arc<Handle>; CUSTOM_INLINE_HANDLES]>,
}

impl CustomCarrier {
    /// A new delivery of `payload` addressed to `target`, carrying
    /// `transfers`. The delivery lands on the queue of the target's owner.
    ///
    /// The transferred handles must already be owned by the destination
    /// peer; they are attached to their objects separately (see
    /// [`Handle::launch`]).
    #[must_use]
    pub fn new(
        target: &Arc<Object>,
        payload: Arc<Payload>,
        transfers: SmallVec<[Arc<Handle>; CUSTOM_INLINE_HANDLES]>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            message: Message::new(MessageKind::Custom, Carrier::Custom(weak.clone())),
            target: Arc::clone(target),
            payload,
            transfers,
        })
    }

    /// The embedded message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The object this delivery is addressed to.
    #[must_use]
    pub fn target(&self) -> &Arc<Object> {
        &self.target
    }

    /// The destination peer: the owner of the target object.
    #[must_use]
    pub fn destination(&self) -> &Arc<Peer> {
        self.target.owner()
    }

    /// The shared payload.
    #[must_use]
    pub fn payload(&self) -> &Arc<Payload> {
        &self.payload
    }

    /// The transferred handles.
    #[must_use]
    pub fn transfers(&self) -> &[Arc<Handle>] {
        &self.transfers
    }
}
