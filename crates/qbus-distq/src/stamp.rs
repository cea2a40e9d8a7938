//! Timestamp algebra.
//!
//! All clocks and transaction timestamps are 64-bit signed counters that
//! advance by two per tick. A clock starts at 0 and therefore stays even for
//! as long as it is *tentative* — it may still grow. Setting the low bit
//! marks a value as *committed*: a committed timestamp is strictly greater
//! than the clock value it originated from and never changes again. The
//! even/odd split lets a single 64-bit compare-exchange communicate both the
//! value and the freeze without a companion flag.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::warn_on;

/// A timestamp or clock value.
pub type Stamp = i64;

/// Whether `ts` is committed (frozen), i.e. its low bit is set.
#[inline]
#[must_use]
pub fn is_committed(ts: Stamp) -> bool {
    ts & 1 != 0
}

/// An atomically synchronizable timestamp.
///
/// Synchronization uses relaxed compare-exchange loops throughout: the value
/// of a timestamp conveys no state change by itself. Any data associated
/// with a specific timestamp must establish its own ordering (the queue does
/// so through the committed counter's release/acquire pair).
#[derive(Debug)]
pub struct AtomicStamp(AtomicI64);

impl AtomicStamp {
    /// A new timestamp at the given value.
    #[must_use]
    pub const fn new(value: Stamp) -> Self {
        Self(AtomicI64::new(value))
    }

    /// Current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Stamp {
        self.0.load(Ordering::Relaxed)
    }

    /// Whether the current value is committed.
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        is_committed(self.get())
    }

    /// Raise this timestamp to at least `to`.
    ///
    /// The synchronization is forced: the timestamp must not be committed
    /// (a committed value cannot change anymore), and `to` must be a
    /// tentative (even) value. Violations are reported and ignored.
    pub fn force_sync(&self, to: Stamp) {
        if warn_on!(is_committed(to)) {
            return;
        }

        let mut value = self.0.load(Ordering::Relaxed);
        loop {
            if value >= to || warn_on!(is_committed(value)) {
                return;
            }
            match self
                .0
                .compare_exchange(value, to, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => value = current,
            }
        }
    }

    /// Try to raise this timestamp to at least `to`.
    ///
    /// Like [`force_sync`](Self::force_sync), but if the timestamp is
    /// already committed the synchronization is skipped. Returns the value
    /// of the timestamp after the operation.
    pub fn try_sync(&self, to: Stamp) -> Stamp {
        if warn_on!(is_committed(to)) {
            return self.get();
        }

        let mut value = self.0.load(Ordering::Relaxed);
        loop {
            if value >= to || is_committed(value) {
                return value;
            }
            match self
                .0
                .compare_exchange(value, to, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return to,
                Err(current) => value = current,
            }
        }
    }

    /// Commit the timestamp: set the low bit, freezing the value.
    ///
    /// Returns the committed value. Marking the timestamp as committed only
    /// settles the scalar; it does not order against other operations.
    pub fn commit(&self) -> Stamp {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
