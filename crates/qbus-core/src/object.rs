//! Objects.
//!
//! An object is an owner-controlled entity addressed only through handles.
//! It keeps a list of the handles attached to it — the set that receives a
//! destruction notification when the object goes away — and embeds its own
//! release message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::message::{Carrier, Message, MessageKind};
use crate::peer::Peer;
use crate::warn_on;
use crate::Handle;

/// The attachment list of an object, plus the destruction marker.
///
/// Everything that decides "which handles learn about this object's end"
/// lives under one lock: a release detaches its handle here, a destruction
/// drains the list and sets the marker, and a transfer that finds the
/// marker set knows it must deliver the destruction through its own
/// transaction instead.
pub(crate) struct Attachments {
    pub(crate) handles: Vec<Weak<Handle>>,
    pub(crate) destroyed: bool,
}

pub struct Object {
    owner: Arc<Peer>,
    attached: Mutex<Attachments>,
    /// Embedded release message; staged when the object is destroyed.
    release: Message,
    /// Opaque cookie for the naming layer; 0 while unset.
    tag: AtomicU64,
}

impl Object {
    /// A new object owned by `owner`.
    #[must_use]
    pub fn new(owner: &Arc<Peer>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            owner: Arc::clone(owner),
            attached: Mutex::new(Attachments {
                handles: Vec::new(),
                destroyed: false,
            }),
            release: Message::new(MessageKind::ObjectRelease, Carrier::Object(weak.clone())),
            tag: AtomicU64::new(0),
        })
    }

    /// The owning peer.
    #[must_use]
    pub fn owner(&self) -> &Arc<Peer> {
        &self.owner
    }

    /// The naming layer's cookie.
    #[must_use]
    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Relaxed)
    }

    /// Set the naming layer's cookie.
    pub fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    /// Whether the object has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.attached.lock().destroyed
    }

    pub(crate) fn release_message(&self) -> &Message {
        &self.release
    }

    pub(crate) fn attached(&self) -> &Mutex<Attachments> {
        &self.attached
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        warn_on!(self
            .attached
            .get_mut()
            .handles
            .iter()
            .any(|weak| weak.strong_count() > 0));
    }
}
