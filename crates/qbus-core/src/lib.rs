//! Message carriers, objects, handles, and staged transactions.
//!
//! This crate gives the queue engine its payloads. A [`Message`] embeds the
//! engine's transaction and node by value — one allocation covers the
//! carrier, its ordering state, and its queue linkage. Four carrier kinds
//! exist: user payload deliveries ([`CustomCarrier`]), and the three
//! lifecycle notifications embedded in [`Object`] (release) and [`Handle`]
//! (release and destruction).
//!
//! A [`Stage`] collects any mix of these against one sender peer and
//! commits them as a single transaction: every destination observes the
//! same committed timestamp, so no receiver ever sees a third delivery
//! slipped between two halves of one multicast.

mod handle;
mod message;
mod object;
mod payload;
mod peer;
mod stage;

pub use handle::Handle;
pub use message::{Message, MessageKind};
pub use object::Object;
pub use payload::{CustomCarrier, Payload, CUSTOM_INLINE_HANDLES, PAYLOAD_INLINE_BYTES};
pub use peer::Peer;
pub use stage::Stage;

/// Report a violated protocol contract without unwinding.
macro_rules! warn_on {
    ($cond:expr) => {{
        let cond = $cond;
        if cond {
            ::tracing::warn!(
                target: "qbus::core",
                condition = stringify!($cond),
                "carrier contract violation"
            );
        }
        cond
    }};
}

pub(crate) use warn_on;
