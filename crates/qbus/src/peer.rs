//! The id-based peer surface.
//!
//! Objects and handles are addressed by per-peer 64-bit ids (always even,
//! allocated from a per-peer sequence). All naming state sits behind one
//! peer mutex; that same mutex serializes the receiver side, as the queue
//! requires. Nothing here ever locks two peers at once except
//! [`Bus::pair`](crate::Bus::pair), which orders the two locks by address.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;

use qbus_acct::{Amounts, Charge, ChargeType};
use qbus_core as core;
use qbus_core::{CustomCarrier, Handle, MessageKind, Object, Payload, Stage};
use qbus_error::{QbusError, Result};

use crate::Event;

/// Naming state, guarded by the peer mutex.
struct PeerState {
    shutdown: bool,
    id_seq: u64,
    objects: BTreeMap<u64, Arc<Object>>,
    handles: BTreeMap<u64, HandleEntry>,
}

struct HandleEntry {
    handle: Arc<Handle>,
    /// Public references the peer holds on this handle id. The id retires
    /// when the count drops to zero.
    n_public: u64,
}

impl PeerState {
    fn new() -> Self {
        Self {
            shutdown: false,
            id_seq: 0,
            objects: BTreeMap::new(),
            handles: BTreeMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.id_seq += 1;
        self.id_seq << 1
    }

    /// Publish an object id, assigning one on first contact.
    fn install_object(&mut self, object: &Arc<Object>) -> u64 {
        let id = match object.tag() {
            0 => {
                let id = self.next_id();
                object.set_tag(id);
                id
            }
            id => id,
        };
        self.objects.entry(id).or_insert_with(|| Arc::clone(object));
        id
    }

    /// Publish a handle id and take one public reference on it.
    fn install_handle(&mut self, handle: &Arc<Handle>) -> u64 {
        let id = match handle.tag() {
            0 => {
                let id = self.next_id();
                handle.set_tag(id);
                id
            }
            id => id,
        };
        let entry = self.handles.entry(id).or_insert_with(|| HandleEntry {
            handle: Arc::clone(handle),
            n_public: 0,
        });
        entry.n_public += 1;
        id
    }
}

/// A bus endpoint.
///
/// Dropping the peer finalizes it: all owned objects are destroyed, all
/// held handles released, and the queue flushed — each as one globally
/// ordered transaction.
pub struct Peer {
    core: Arc<core::Peer>,
    state: Mutex<PeerState>,
    charge: Charge,
}

impl Peer {
    pub(crate) fn new(charge: Charge) -> Self {
        Self {
            core: core::Peer::new(),
            state: Mutex::new(PeerState::new()),
            charge,
        }
    }

    /// Whether a delivery is ready for [`recv`](Self::recv).
    #[must_use]
    pub fn poll(&self) -> bool {
        self.core.poll()
    }

    /// Send `payload` to the objects behind `destinations`, transferring
    /// new handles on the objects behind `transfers` to every destination
    /// peer.
    ///
    /// The whole send is one transaction: every destination observes it at
    /// the same timestamp, and no destination observes any other delivery
    /// between its parts.
    pub fn send(&self, destinations: &[u64], payload: &[u8], transfers: &[u64]) -> Result<()> {
        if destinations.is_empty() {
            return Err(QbusError::InvalidArgument {
                what: "no destinations",
            });
        }

        // resolve everything under the naming lock
        let (targets, transfer_objects) = {
            let state = self.state.lock();
            if state.shutdown {
                return Err(QbusError::Shutdown);
            }

            let mut targets = Vec::with_capacity(destinations.len());
            for &id in destinations {
                let entry = state
                    .handles
                    .get(&id)
                    .ok_or(QbusError::NoSuchHandle { id })?;
                targets.push(Arc::clone(entry.handle.object()));
            }

            let mut transfer_objects = Vec::with_capacity(transfers.len());
            for &id in transfers {
                let entry = state
                    .handles
                    .get(&id)
                    .ok_or(QbusError::NoSuchHandle { id })?;
                transfer_objects.push(Arc::clone(entry.handle.object()));
            }
            (targets, transfer_objects)
        };

        // charge the burst before building anything
        let amounts = send_amounts(destinations.len(), payload.len(), transfers.len())?;
        self.charge.request(&amounts)?;

        let shared = Payload::new(payload);
        let mut stage = Stage::new(&self.core);
        for target in &targets {
            let mut handles: SmallVec<[Arc<Handle>; core::CUSTOM_INLINE_HANDLES]> =
                SmallVec::new();
            let mut dead: SmallVec<[Arc<Handle>; core::CUSTOM_INLINE_HANDLES]> = SmallVec::new();
            for object in &transfer_objects {
                let handle = Handle::new(target.owner(), object);
                if !handle.launch() {
                    // the object was destroyed while we were sending; the
                    // destruction rides along in this very transaction
                    dead.push(Arc::clone(&handle));
                }
                handles.push(handle);
            }
            let carrier = CustomCarrier::new(target, Arc::clone(&shared), handles);
            stage.add_custom(&carrier);
            for handle in &dead {
                stage.add_destruction_notice(handle);
            }
        }
        stage.commit();

        // the charge bounds the in-flight burst; the transaction is
        // delivered, so return it
        self.charge.release(&amounts);
        Ok(())
    }

    /// Retrieve the next ready delivery, or [`QbusError::WouldBlock`] if
    /// none is ready.
    pub fn recv(&self) -> Result<Event> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(QbusError::Shutdown);
        }

        let Some(message) = self.core.peek_message() else {
            return Err(QbusError::WouldBlock);
        };

        let event = match message.kind() {
            MessageKind::Custom => {
                let carrier = message.as_custom().expect("queued carrier is alive");
                let handles = carrier
                    .transfers()
                    .iter()
                    .map(|handle| state.install_handle(handle))
                    .collect();
                Event::Message {
                    object: carrier.target().tag(),
                    payload: Arc::clone(carrier.payload()),
                    handles,
                }
            }
            MessageKind::HandleRelease => {
                let handle = message.as_handle().expect("queued handle is alive");
                Event::HandleReleased {
                    object: handle.object().tag(),
                }
            }
            MessageKind::HandleDestruction => {
                let handle = message.as_handle().expect("queued handle is alive");
                let id = handle.tag();
                if id != 0 {
                    state.handles.remove(&id);
                }
                Event::ObjectDestroyed { handle: id }
            }
            MessageKind::ObjectRelease => {
                let object = message.as_object().expect("queued object is alive");
                Event::ObjectReleased {
                    object: object.tag(),
                }
            }
        };

        self.core.pop_message(message);
        Ok(event)
    }

    /// Retrieve the next delivery, blocking until one is ready.
    pub fn recv_blocking(&self) -> Result<Event> {
        loop {
            match self.recv() {
                Err(QbusError::WouldBlock) => {
                    let queue = self.core.queue();
                    queue.waitq().wait_until(|| queue.poll());
                }
                other => return other,
            }
        }
    }

    /// Retrieve the next delivery, blocking up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event> {
        match self.recv() {
            Err(QbusError::WouldBlock) => {
                let queue = self.core.queue();
                if queue.waitq().wait_for(timeout, || queue.poll()) {
                    self.recv()
                } else {
                    Err(QbusError::WouldBlock)
                }
            }
            other => other,
        }
    }

    /// Destroy the objects behind `object_ids`, atomically.
    ///
    /// Every holder of a handle on any of them observes one destruction
    /// transaction; the ids retire. Duplicate ids are rejected before
    /// anything is staged.
    pub fn destroy(&self, object_ids: &[u64]) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(QbusError::Shutdown);
        }

        let mut collected: BTreeMap<u64, Arc<Object>> = BTreeMap::new();
        for &id in object_ids {
            let object = state.objects.get(&id).ok_or(QbusError::NoSuchObject { id })?;
            if collected.insert(id, Arc::clone(object)).is_some() {
                return Err(QbusError::DuplicateId { id });
            }
        }

        let mut stage = Stage::new(&self.core);
        for object in collected.values() {
            stage.add_destruction(object);
        }
        stage.commit();

        let count = u32::try_from(collected.len()).unwrap_or(u32::MAX);
        for id in collected.keys() {
            state.objects.remove(id);
        }
        drop(state);

        self.charge.release(&amounts_of(ChargeType::Objects, count));
        Ok(())
    }

    /// Take additional public references on `handle_ids`.
    ///
    /// The whole request is validated before any count changes.
    pub fn acquire(&self, handle_ids: &[u64]) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(QbusError::Shutdown);
        }

        let mut counts: BTreeMap<u64, u64> = BTreeMap::new();
        for &id in handle_ids {
            if !state.handles.contains_key(&id) {
                return Err(QbusError::NoSuchHandle { id });
            }
            *counts.entry(id).or_default() += 1;
        }

        for (id, n) in counts {
            let entry = state.handles.get_mut(&id).expect("validated above");
            entry.n_public += n;
        }
        Ok(())
    }

    /// Drop public references on `handle_ids`, atomically.
    ///
    /// Handles whose count reaches zero retire their id and notify their
    /// object's owner in one transaction. Releasing more references than
    /// held fails before any count changes.
    pub fn release(&self, handle_ids: &[u64]) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(QbusError::Shutdown);
        }

        let mut counts: BTreeMap<u64, u64> = BTreeMap::new();
        for &id in handle_ids {
            let entry = state.handles.get(&id).ok_or(QbusError::NoSuchHandle { id })?;
            let count = counts.entry(id).or_default();
            if *count >= entry.n_public {
                return Err(QbusError::ReleaseOverflow { id });
            }
            *count += 1;
        }

        let mut stage = Stage::new(&self.core);
        for (&id, &n) in &counts {
            let entry = state.handles.get_mut(&id).expect("validated above");
            entry.n_public -= n;
            if entry.n_public == 0 {
                stage.add_release(&entry.handle);
            }
        }
        stage.commit();

        for (&id, _) in &counts {
            if state
                .handles
                .get(&id)
                .is_some_and(|entry| entry.n_public == 0)
            {
                state.handles.remove(&id);
            }
        }
        Ok(())
    }

    /// Shut the peer down.
    ///
    /// Destroys all owned objects in one transaction, releases all held
    /// handles in another, and flushes and closes the queue in between —
    /// from here on, senders targeting this peer have their deliveries
    /// absorbed. Idempotent; also runs on drop.
    pub fn finalize(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;

        let mut stage = Stage::new(&self.core);
        for object in state.objects.values() {
            stage.add_destruction(object);
        }
        stage.commit();
        state.objects.clear();

        self.core.finalize();

        let mut stage = Stage::new(&self.core);
        for entry in state.handles.values() {
            stage.add_release(&entry.handle);
        }
        stage.commit();
        state.handles.clear();

        drop(state);
        self.charge.release_all();
        tracing::debug!(target: "qbus::peer", "peer finalized");
    }

    /// Number of objects currently published on this peer.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Number of handles currently published on this peer.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub(crate) fn core(&self) -> &Arc<core::Peer> {
        &self.core
    }

    pub(crate) fn charge(&self) -> &Charge {
        &self.charge
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Install a fresh object/handle pairing on two (not necessarily
/// distinct) peers. Used by [`Bus::pair`](crate::Bus::pair).
pub(crate) fn pair_install(owner: &Peer, holder: &Peer) -> Result<(u64, u64)> {
    owner.charge().request(&amounts_of(ChargeType::Objects, 1))?;
    if let Err(denied) = holder.charge().request(&amounts_of(ChargeType::Handles, 1)) {
        owner.charge().release(&amounts_of(ChargeType::Objects, 1));
        return Err(denied);
    }

    let result = if std::ptr::eq(owner, holder) {
        let mut state = owner.state.lock();
        if state.shutdown {
            Err(QbusError::Shutdown)
        } else {
            Ok(install_pair(owner, holder).publish_same(&mut state))
        }
    } else {
        // lock the two naming states in address order
        let mut owner_state;
        let mut holder_state;
        if std::ptr::from_ref(owner) < std::ptr::from_ref(holder) {
            owner_state = owner.state.lock();
            holder_state = holder.state.lock();
        } else {
            holder_state = holder.state.lock();
            owner_state = owner.state.lock();
        }
        if owner_state.shutdown || holder_state.shutdown {
            Err(QbusError::Shutdown)
        } else {
            Ok(install_pair(owner, holder).publish(&mut owner_state, &mut holder_state))
        }
    };

    if result.is_err() {
        owner.charge().release(&amounts_of(ChargeType::Objects, 1));
        holder.charge().release(&amounts_of(ChargeType::Handles, 1));
    }
    result
}

struct FreshPair {
    object: Arc<Object>,
    handle: Arc<Handle>,
}

impl FreshPair {
    fn publish(self, owner_state: &mut PeerState, holder_state: &mut PeerState) -> (u64, u64) {
        let object_id = owner_state.install_object(&self.object);
        let handle_id = holder_state.install_handle(&self.handle);
        (object_id, handle_id)
    }

    /// Publish both ends on one peer (a peer paired with itself).
    fn publish_same(self, state: &mut PeerState) -> (u64, u64) {
        let object_id = state.install_object(&self.object);
        let handle_id = state.install_handle(&self.handle);
        (object_id, handle_id)
    }
}

fn install_pair(owner: &Peer, holder: &Peer) -> FreshPair {
    let object = Object::new(owner.core());
    let handle = Handle::new(holder.core(), &object);
    let launched = handle.launch();
    debug_assert!(launched, "a fresh object cannot be destroyed yet");
    FreshPair { object, handle }
}

fn amounts_of(kind: ChargeType, amount: u32) -> Amounts {
    let mut amounts = [0; qbus_acct::N_CHARGE_TYPES];
    amounts[kind as usize] = amount;
    amounts
}

fn send_amounts(n_destinations: usize, n_bytes: usize, n_transfers: usize) -> Result<Amounts> {
    let overflow = || QbusError::InvalidArgument {
        what: "send exceeds accountable size",
    };

    let destinations = u32::try_from(n_destinations).map_err(|_| overflow())?;
    let bytes = u32::try_from(n_bytes).map_err(|_| overflow())?;
    let transfers = u32::try_from(n_transfers).map_err(|_| overflow())?;

    let mut amounts = [0; qbus_acct::N_CHARGE_TYPES];
    amounts[ChargeType::Messages as usize] = destinations;
    amounts[ChargeType::Bytes as usize] = bytes.checked_mul(destinations).ok_or_else(overflow)?;
    amounts[ChargeType::Handles as usize] =
        transfers.checked_mul(destinations).ok_or_else(overflow)?;
    Ok(amounts)
}
