//! Fair-distribution resource accounting.
//!
//! A registry maps an accounting key (typically a user id) to a resource;
//! each resource tracks per-subscriber usage tables; a charge pins one
//! usage table and records what has been drawn through it.
//!
//! The quota rule allows every subscriber `(n·⌈log₂ n⌉ + n)⁻¹` of the
//! *remaining* assets, where `n` is the number of active subscribers plus
//! one. Regardless of how many subscribers join, each is guaranteed a share
//! proportional to `(n·log₂ n²)⁻¹` of the total — a quasilinear guarantee
//! without predicting the subscriber count upfront. To avoid a division the
//! check computes the reserve required if `n` subscribers drew the same
//! amount and compares that against the remaining assets, with checked
//! arithmetic throughout so combined requests cannot overflow the
//! counters.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use qbus_error::{QbusError, Result};

/// Charge slots tracked per subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ChargeType {
    Objects = 0,
    Handles = 1,
    Messages = 2,
    Bytes = 3,
}

/// Number of charge slots.
pub const N_CHARGE_TYPES: usize = 4;

impl ChargeType {
    /// Slot name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ChargeType::Objects => "objects",
            ChargeType::Handles => "handles",
            ChargeType::Messages => "messages",
            ChargeType::Bytes => "bytes",
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => ChargeType::Objects,
            1 => ChargeType::Handles,
            2 => ChargeType::Messages,
            _ => ChargeType::Bytes,
        }
    }
}

/// Per-slot amounts.
pub type Amounts = [u32; N_CHARGE_TYPES];

/// Total assets granted to each resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcctLimits {
    pub totals: Amounts,
}

impl AcctLimits {
    /// Build limits from individual slot totals.
    #[must_use]
    pub const fn new(objects: u32, handles: u32, messages: u32, bytes: u32) -> Self {
        Self {
            totals: [objects, handles, messages, bytes],
        }
    }
}

impl Default for AcctLimits {
    fn default() -> Self {
        Self::new(1024, 16 * 1024, 16 * 1024, 16 * 1024 * 1024)
    }
}

/// Ceiled base-2 logarithm.
fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        (value - 1).ilog2() + 1
    }
}

/// Whether `amount` can be drawn from `assets` by a subscriber already
/// holding `share`, with `n_usages` active subscribers on the resource.
///
/// Checks `(share + amount)·(n·⌈log₂ n⌉ + n) − share ≤ assets` for
/// `n = n_usages + 1`; any intermediate overflow means the request cannot
/// be granted either.
fn quota_allows(assets: u32, share: u32, n_usages: usize, amount: u32) -> bool {
    let Ok(n_usages) = u32::try_from(n_usages) else {
        return false;
    };
    let Some(n) = n_usages.checked_add(1) else {
        return false;
    };

    let fraction = ceil_log2(n);
    let minimum = fraction
        .checked_mul(n)
        .and_then(|f| f.checked_add(n))
        .and_then(|f| share.checked_add(amount).and_then(|s| s.checked_mul(f)))
        .and_then(|m| m.checked_sub(share));

    match minimum {
        Some(minimum) => assets >= minimum,
        None => false,
    }
}

struct UsageSlot {
    share: Amounts,
    usage: Weak<Usage>,
}

struct ResourceInner {
    usages: HashMap<u32, UsageSlot>,
    assets: Amounts,
}

/// One accounted resource, keyed in the registry.
pub struct Resource {
    key: u32,
    inner: Mutex<ResourceInner>,
}

impl Resource {
    fn new(key: u32, limits: &AcctLimits) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: Mutex::new(ResourceInner {
                usages: HashMap::new(),
                assets: limits.totals,
            }),
        })
    }

    /// The registry key this resource is mapped under.
    #[must_use]
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Remaining assets per slot.
    #[must_use]
    pub fn remaining(&self) -> Amounts {
        self.inner.lock().assets
    }

    /// Subscribe to this resource under `key`, yielding an empty charge.
    ///
    /// A subscription pins the usage table associated with `key`; all
    /// charges performed through the returned [`Charge`] draw from it.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, key: u32) -> Charge {
        let mut inner = self.inner.lock();
        let usage = inner
            .usages
            .get(&key)
            .and_then(|slot| slot.usage.upgrade());
        let usage = match usage {
            Some(usage) => usage,
            None => {
                let usage = Arc::new(Usage {
                    key,
                    resource: Arc::clone(self),
                });
                inner.usages.insert(
                    key,
                    UsageSlot {
                        share: [0; N_CHARGE_TYPES],
                        usage: Arc::downgrade(&usage),
                    },
                );
                usage
            }
        };
        drop(inner);

        Charge {
            usage,
            amounts: Mutex::new([0; N_CHARGE_TYPES]),
        }
    }
}

/// A pinned usage table on a resource.
pub struct Usage {
    key: u32,
    resource: Arc<Resource>,
}

impl Drop for Usage {
    fn drop(&mut self) {
        let mut inner = self.resource.inner.lock();
        if let Some(slot) = inner.usages.get(&self.key) {
            if slot.usage.strong_count() == 0 {
                if slot.share.iter().any(|&s| s != 0) {
                    tracing::warn!(
                        target: "qbus::acct",
                        key = self.key,
                        "usage dropped with outstanding share"
                    );
                }
                inner.usages.remove(&self.key);
            }
        }
    }
}

/// An accounting subscription plus the amounts drawn through it.
///
/// Dropping the charge releases everything it still holds.
pub struct Charge {
    usage: Arc<Usage>,
    amounts: Mutex<Amounts>,
}

impl Charge {
    /// Request `amounts` against the resource quotas.
    ///
    /// Either all slots are granted or none: a slot that fails its quota
    /// reverts the slots granted earlier in the same request.
    pub fn request(&self, amounts: &Amounts) -> Result<()> {
        let resource = &self.usage.resource;
        let mut inner = resource.inner.lock();
        let mut held = self.amounts.lock();

        let ResourceInner { usages, assets } = &mut *inner;
        let n_usages = usages.len();
        let slot = usages
            .get_mut(&self.usage.key)
            .expect("subscription pins its usage slot");

        for index in 0..N_CHARGE_TYPES {
            let amount = amounts[index];
            if amount == 0 {
                continue;
            }

            if quota_allows(assets[index], slot.share[index], n_usages, amount) {
                held[index] += amount;
                slot.share[index] += amount;
                assets[index] -= amount;
                continue;
            }

            // revert the slots granted so far and fail
            for prior in 0..index {
                assets[prior] += amounts[prior];
                slot.share[prior] -= amounts[prior];
                held[prior] -= amounts[prior];
            }
            let kind = ChargeType::from_index(index).name();
            tracing::debug!(
                target: "qbus::acct",
                resource = resource.key,
                user = self.usage.key,
                kind,
                amount,
                "charge denied by quota"
            );
            return Err(QbusError::QuotaExceeded { kind });
        }

        Ok(())
    }

    /// Release `amounts` previously granted through this charge.
    ///
    /// Charges may be split: one request can be returned by several
    /// releases, as long as the numbers add up. Releasing more than held
    /// is a contract violation; the slot is skipped.
    pub fn release(&self, amounts: &Amounts) {
        let resource = &self.usage.resource;
        let mut inner = resource.inner.lock();
        let mut held = self.amounts.lock();

        let ResourceInner { usages, assets } = &mut *inner;
        let slot = usages
            .get_mut(&self.usage.key)
            .expect("subscription pins its usage slot");

        for index in 0..N_CHARGE_TYPES {
            let amount = amounts[index];
            if amount > held[index] {
                tracing::warn!(
                    target: "qbus::acct",
                    kind = ChargeType::from_index(index).name(),
                    amount,
                    held = held[index],
                    "released more than charged"
                );
                continue;
            }
            assets[index] += amount;
            slot.share[index] -= amount;
            held[index] -= amount;
        }
    }

    /// Release everything still held by this charge.
    pub fn release_all(&self) {
        let amounts = *self.amounts.lock();
        self.release(&amounts);
    }

    /// Amounts currently held.
    #[must_use]
    pub fn held(&self) -> Amounts {
        *self.amounts.lock()
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// The accounting registry: one resource per key, created on demand.
pub struct Acct {
    limits: AcctLimits,
    resources: Mutex<HashMap<u32, Weak<Resource>>>,
}

impl Acct {
    /// A new registry handing each resource the given limits.
    #[must_use]
    pub fn new(limits: AcctLimits) -> Self {
        Self {
            limits,
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Map the resource for `key`, creating it if needed.
    #[must_use]
    pub fn map(&self, key: u32) -> Arc<Resource> {
        let mut resources = self.resources.lock();
        if let Some(resource) = resources.get(&key).and_then(Weak::upgrade) {
            return resource;
        }
        resources.retain(|_, weak| weak.strong_count() > 0);
        let resource = Resource::new(key, &self.limits);
        resources.insert(key, Arc::downgrade(&resource));
        resource
    }
}

impl Default for Acct {
    fn default() -> Self {
        Self::new(AcctLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn quota_basic() {
        // one subscriber, n = 2: fraction = 1*2 + 2 = 4, so a quarter of
        // the remaining assets can be drawn at once
        assert!(quota_allows(100, 0, 1, 25));
        assert!(!quota_allows(100, 0, 1, 26));

        // an existing share raises the bar for the next draw
        assert!(quota_allows(90, 10, 1, 15));
        assert!(!quota_allows(90, 10, 1, 16));

        // after a full draw the remaining assets grant nothing more
        assert!(!quota_allows(75, 25, 1, 1));

        // overflow never grants
        assert!(!quota_allows(u32::MAX, u32::MAX, 1, u32::MAX));
    }

    #[test]
    fn subscribe_and_charge() {
        let acct = Acct::new(AcctLimits::new(64, 64, 64, 1024));
        let resource = acct.map(1000);
        let charge = resource.subscribe(1000);

        charge
            .request(&[4, 2, 1, 128])
            .expect("within quota");
        assert_eq!(charge.held(), [4, 2, 1, 128]);
        assert_eq!(resource.remaining(), [60, 62, 63, 896]);

        charge.release(&[4, 0, 0, 0]);
        assert_eq!(charge.held(), [0, 2, 1, 128]);
        assert_eq!(resource.remaining(), [64, 62, 63, 896]);

        charge.release_all();
        assert_eq!(resource.remaining(), [64, 64, 64, 1024]);
    }

    #[test]
    fn denied_request_reverts_partial_slots() {
        let acct = Acct::new(AcctLimits::new(64, 4, 64, 1024));
        let resource = acct.map(7);
        let charge = resource.subscribe(7);

        // the handles slot cannot grant 4 of 4 under the quota rule, so
        // the objects slot granted before it must be returned
        let denied = charge.request(&[8, 4, 0, 0]);
        assert!(matches!(
            denied,
            Err(qbus_error::QbusError::QuotaExceeded { kind: "handles" })
        ));
        assert_eq!(charge.held(), [0; N_CHARGE_TYPES]);
        assert_eq!(resource.remaining(), [64, 4, 64, 1024]);
    }

    #[test]
    fn charge_drop_releases() {
        let acct = Acct::default();
        let resource = acct.map(1);
        let before = resource.remaining();
        {
            let charge = resource.subscribe(1);
            charge.request(&[1, 1, 1, 1]).expect("within quota");
            assert_ne!(resource.remaining(), before);
        }
        assert_eq!(resource.remaining(), before);
    }

    #[test]
    fn resource_reclaimed_when_unused() {
        let acct = Acct::default();
        let resource = acct.map(42);
        let again = acct.map(42);
        assert!(Arc::ptr_eq(&resource, &again));
        drop(again);
        drop(resource);

        // a fresh mapping starts from full limits again
        let fresh = acct.map(42);
        assert_eq!(fresh.remaining(), AcctLimits::default().totals);
    }

    proptest! {
        /// Assets plus outstanding shares always equal the configured
        /// totals, and no release can push a counter past them.
        #[test]
        fn conservation(ops in proptest::collection::vec((0u32..4, 0u32..64, prop::bool::ANY), 1..64)) {
            let totals = AcctLimits::new(256, 256, 256, 256);
            let acct = Acct::new(totals);
            let resource = acct.map(0);
            let users: Vec<Charge> = (0..4).map(|u| resource.subscribe(u)).collect();

            for (user, amount, is_release) in ops {
                let charge = &users[user as usize];
                let mut amounts = [0; N_CHARGE_TYPES];
                amounts[(amount % 4) as usize] = amount;
                if is_release {
                    let held = charge.held();
                    let mut back = [0; N_CHARGE_TYPES];
                    for i in 0..N_CHARGE_TYPES {
                        back[i] = held[i].min(amounts[i]);
                    }
                    charge.release(&back);
                } else {
                    let _ = charge.request(&amounts);
                }

                let remaining = resource.remaining();
                let held_sum: Vec<u32> = (0..N_CHARGE_TYPES)
                    .map(|i| users.iter().map(|c| c.held()[i]).sum())
                    .collect();
                for i in 0..N_CHARGE_TYPES {
                    prop_assert_eq!(remaining[i] + held_sum[i], totals.totals[i]);
                }
            }
        }
    }
}
