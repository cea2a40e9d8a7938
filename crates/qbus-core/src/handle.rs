//! Handles.
//!
//! A handle is a transferable capability pointing to an object. It embeds
//! two messages: a release notification (to the object owner, when the
//! handle's last public reference goes away) and a destruction notification
//! (to the handle owner, when the object is destroyed).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::message::{Carrier, Message, MessageKind};
use crate::peer::Peer;
use crate::warn_on;
use crate::Object;

pub struct Handle {
    owner: Arc<Peer>,
    object: Arc<Object>,
    release: Message,
    destruction: Message,
    /// Opaque cookie for the naming layer; 0 while unset.
    tag: AtomicU64,
}

impl Handle {
    /// A new handle on `object`, owned by `owner`. The handle is not yet
    /// attached; see [`launch`](Self::launch).
    #[must_use]
    pub fn new(owner: &Arc<Peer>, object: &Arc<Object>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Handle>| Self {
            owner: Arc::clone(owner),
            object: Arc::clone(object),
            release: Message::new(MessageKind::HandleRelease, Carrier::Handle(weak.clone())),
            destruction: Message::new(
                MessageKind::HandleDestruction,
                Carrier::Handle(weak.clone()),
            ),
            tag: AtomicU64::new(0),
        })
    }

    /// Attach the handle to its object.
    ///
    /// Attached handles receive a destruction notification when the object
    /// is destroyed. Returns false without attaching if the object has
    /// already been destroyed — the caller must then deliver the
    /// destruction itself, ordered within its own transaction (see
    /// [`Stage::add_destruction_notice`](crate::Stage::add_destruction_notice)).
    /// Attaching twice is a contract violation.
    #[must_use]
    pub fn launch(self: &Arc<Self>) -> bool {
        let mut attached = self.object.attached().lock();
        if attached.destroyed {
            return false;
        }
        let already = attached
            .handles
            .iter()
            .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(self)));
        if warn_on!(already) {
            return true;
        }
        attached.handles.push(Arc::downgrade(self));
        true
    }

    /// The owning peer.
    #[must_use]
    pub fn owner(&self) -> &Arc<Peer> {
        &self.owner
    }

    /// The object this handle points to.
    #[must_use]
    pub fn object(&self) -> &Arc<Object> {
        &self.object
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

    pub(crate) fn release_message(&self) -> &Message {
        &self.release
    }

    pub(crate) fn destruction_message(&self) -> &Message {
        &self.destruction
    }
}
