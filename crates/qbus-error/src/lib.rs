//! Error types shared across the qbus workspace.
//!
//! The engine itself surfaces almost nothing here: queue operations cannot
//! fail once a transaction is submitted, and contract violations are
//! reported through non-unwinding runtime warnings rather than errors. The
//! variants below cover the edges where requests are still refusable —
//! allocation, accounting, and the id-based call surface.

use thiserror::Error;

/// Primary error type for qbus operations.
#[derive(Error, Debug)]
pub enum QbusError {
    /// Allocation of a message, payload, or stage element failed before
    /// submit.
    #[error("out of memory while building a transaction")]
    OutOfMemory,

    /// A quota or resource limit was exceeded.
    #[error("resource quota exceeded: {kind}")]
    QuotaExceeded {
        /// Name of the exhausted charge slot.
        kind: &'static str,
    },

    /// An object id did not resolve on the calling peer.
    #[error("no such object: {id}")]
    NoSuchObject { id: u64 },

    /// A handle id did not resolve on the calling peer.
    #[error("no such handle: {id}")]
    NoSuchHandle { id: u64 },

    /// The same id was named twice in one request that requires unique
    /// entries.
    #[error("duplicate id in request: {id}")]
    DuplicateId { id: u64 },

    /// More public references were released than are held.
    #[error("handle {id} released more often than acquired")]
    ReleaseOverflow { id: u64 },

    /// No message is ready for retrieval.
    #[error("no message ready")]
    WouldBlock,

    /// The peer has been finalized and accepts no further operations.
    #[error("peer is shut down")]
    Shutdown,

    /// An argument failed validation before any state was touched.
    #[error("invalid argument: {what}")]
    InvalidArgument { what: &'static str },
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, QbusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            QbusError::NoSuchHandle { id: 6 }.to_string(),
            "no such handle: 6"
        );
        assert_eq!(
            QbusError::QuotaExceeded { kind: "bytes" }.to_string(),
            "resource quota exceeded: bytes"
        );
        assert_eq!(
            QbusError::ReleaseOverflow { id: 8 }.to_string(),
            "handle 8 released more often than acquired"
        );
    }
}
