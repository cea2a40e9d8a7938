//! Local, capability-based IPC with globally ordered multicast.
//!
//! Peers exchange messages that reference opaque *objects* through
//! transferable *handles*. Object owners can destroy their objects,
//! invalidating every outstanding handle with a notification. All
//! message-affecting events — payload sends, handle releases, object
//! destructions — observe one global, total order that is consistent with
//! causality, established without a central broker or any global lock.
//!
//! ```
//! use qbus::{Bus, Event};
//!
//! let bus = Bus::new();
//! let server = bus.create_peer(1000);
//! let client = bus.create_peer(1001);
//!
//! // give the client a capability on a server object
//! let (object_id, handle_id) = bus.pair(&server, &client).unwrap();
//!
//! client.send(&[handle_id], b"ping", &[]).unwrap();
//! match server.recv().unwrap() {
//!     Event::Message { object, payload, .. } => {
//!         assert_eq!(object, object_id);
//!         assert_eq!(payload.as_bytes(), b"ping");
//!     }
//!     other => panic!("unexpected event: {other:?}"),
//! }
//! ```

mod event;
mod peer;

pub use event::Event;
pub use peer::Peer;
pub use qbus_acct::{Acct, AcctLimits, ChargeType};
pub use qbus_core::Payload;
pub use qbus_error::{QbusError, Result};

/// The underlying queue engine, for embedders that bring their own
/// carrier layer.
pub use qbus_distq as distq;

/// The bus: an accounting registry handing out peers.
///
/// The bus itself holds no routing state — peers address each other purely
/// through capabilities, and every peer owns its own queue and clock.
pub struct Bus {
    acct: Acct,
}

impl Bus {
    /// A bus with default resource limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(AcctLimits::default())
    }

    /// A bus with explicit per-user resource limits.
    #[must_use]
    pub fn with_limits(limits: AcctLimits) -> Self {
        Self {
            acct: Acct::new(limits),
        }
    }

    /// Create a peer accounted to `user`.
    #[must_use]
    pub fn create_peer(&self, user: u32) -> Peer {
        let resource = self.acct.map(user);
        Peer::new(resource.subscribe(user))
    }

    /// Create an object on `owner` and a first handle to it on `holder`.
    ///
    /// Returns the object id (valid on `owner`) and the handle id (valid
    /// on `holder`). This is the bootstrap primitive: every further
    /// capability flows through [`Peer::send`] transfers.
    pub fn pair(&self, owner: &Peer, holder: &Peer) -> Result<(u64, u64)> {
        peer::pair_install(owner, holder)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod api_tests;
