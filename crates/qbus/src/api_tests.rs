//! End-to-end tests of the id-based surface.

use std::time::Duration;

use crate::{Bus, Event, QbusError};

#[test]
fn pair_send_recv() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);

    let (object_id, handle_id) = bus.pair(&server, &client).expect("pair");
    assert_eq!(server.object_count(), 1);
    assert_eq!(client.handle_count(), 1);

    assert!(!server.poll());
    client.send(&[handle_id], b"ping", &[]).expect("send");
    assert!(server.poll());

    match server.recv().expect("recv") {
        Event::Message {
            object,
            payload,
            handles,
        } => {
            assert_eq!(object, object_id);
            assert_eq!(payload.as_bytes(), b"ping");
            assert!(handles.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!server.poll());
    assert!(matches!(server.recv(), Err(QbusError::WouldBlock)));
}

#[test]
fn send_to_unknown_handle_fails() {
    let bus = Bus::new();
    let peer = bus.create_peer(1);
    assert!(matches!(
        peer.send(&[42], b"x", &[]),
        Err(QbusError::NoSuchHandle { id: 42 })
    ));
    assert!(matches!(
        peer.send(&[], b"x", &[]),
        Err(QbusError::InvalidArgument { .. })
    ));
}

#[test]
fn transfer_installs_handle() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let worker = bus.create_peer(3);

    // client talks to server; worker owns an object the client holds
    let (_, to_server) = bus.pair(&server, &client).expect("pair");
    let (worker_object, to_worker) = bus.pair(&worker, &client).expect("pair");

    // client hands its worker capability to the server
    client
        .send(&[to_server], b"introduce", &[to_worker])
        .expect("send with transfer");

    let installed = match server.recv().expect("recv") {
        Event::Message { handles, .. } => {
            assert_eq!(handles.len(), 1);
            handles[0]
        }
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(server.handle_count(), 1);

    // the transferred capability reaches the worker's object
    server.send(&[installed], b"hi worker", &[]).expect("send");
    match worker.recv().expect("recv") {
        Event::Message { object, payload, .. } => {
            assert_eq!(object, worker_object);
            assert_eq!(payload.as_bytes(), b"hi worker");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn multicast_is_atomic_per_destination() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);

    let (object_id, h1) = bus.pair(&server, &client).expect("pair");
    // a second capability on the same server
    let (object2_id, h2) = bus.pair(&server, &client).expect("pair");

    // one send to both objects: the server sees both parts back to back
    client.send(&[h1, h2], b"both", &[]).expect("send");

    let first = server.recv().expect("first");
    let second = server.recv().expect("second");
    let mut objects = Vec::new();
    for event in [first, second] {
        match event {
            Event::Message { object, payload, .. } => {
                assert_eq!(payload.as_bytes(), b"both");
                objects.push(object);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    objects.sort_unstable();
    let mut expected = vec![object_id, object2_id];
    expected.sort_unstable();
    assert_eq!(objects, expected);
}

#[test]
fn destroy_notifies_holders() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);

    let (object_id, handle_id) = bus.pair(&server, &client).expect("pair");
    server.destroy(&[object_id]).expect("destroy");
    assert_eq!(server.object_count(), 0);

    // the owner observes completion, the holder the destruction
    match server.recv().expect("owner event") {
        Event::ObjectReleased { object } => assert_eq!(object, object_id),
        other => panic!("unexpected event: {other:?}"),
    }
    match client.recv().expect("holder event") {
        Event::ObjectDestroyed { handle } => assert_eq!(handle, handle_id),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(client.handle_count(), 0);

    // the id is gone
    assert!(matches!(
        server.destroy(&[object_id]),
        Err(QbusError::NoSuchObject { .. })
    ));
    assert!(matches!(
        client.send(&[handle_id], b"late", &[]),
        Err(QbusError::NoSuchHandle { .. })
    ));
}

#[test]
fn destroy_rejects_duplicates() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let (object_id, _) = bus.pair(&server, &client).expect("pair");

    assert!(matches!(
        server.destroy(&[object_id, object_id]),
        Err(QbusError::DuplicateId { .. })
    ));
    // nothing was staged; the object is still there
    assert_eq!(server.object_count(), 1);
    assert!(!server.poll());
}

#[test]
fn acquire_release_lifecycle() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);

    let (object_id, handle_id) = bus.pair(&server, &client).expect("pair");

    // two more public references, then release all three
    client.acquire(&[handle_id, handle_id]).expect("acquire");
    client.release(&[handle_id, handle_id]).expect("release two");
    assert_eq!(client.handle_count(), 1);
    assert!(!server.poll());

    client.release(&[handle_id]).expect("release last");
    assert_eq!(client.handle_count(), 0);

    // the owner learns the object lost its last handle
    match server.recv().expect("release event") {
        Event::HandleReleased { object } => assert_eq!(object, object_id),
        other => panic!("unexpected event: {other:?}"),
    }

    // over-release fails up front
    assert!(matches!(
        client.release(&[handle_id]),
        Err(QbusError::NoSuchHandle { .. })
    ));
}

#[test]
fn release_overflow_changes_nothing() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let (_, handle_id) = bus.pair(&server, &client).expect("pair");

    assert!(matches!(
        client.release(&[handle_id, handle_id]),
        Err(QbusError::ReleaseOverflow { .. })
    ));
    assert_eq!(client.handle_count(), 1);
    assert!(!server.poll());
}

#[test]
fn finalize_absorbs_and_rejects() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let (_, handle_id) = bus.pair(&server, &client).expect("pair");

    server.finalize();
    assert!(matches!(server.recv(), Err(QbusError::Shutdown)));

    // sending into the void is silently absorbed
    client.send(&[handle_id], b"into the void", &[]).expect("send");
    // finalizing twice is fine
    server.finalize();
}

#[test]
fn peer_drop_finalizes() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let (_, handle_id) = bus.pair(&server, &client).expect("pair");

    drop(server);
    // the holder learns its handle's object died
    match client.recv_timeout(Duration::from_secs(1)).expect("event") {
        Event::ObjectDestroyed { handle } => assert_eq!(handle, handle_id),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn quota_denies_oversized_send() {
    let bus = Bus::with_limits(crate::AcctLimits::new(16, 16, 16, 64));
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let (_, handle_id) = bus.pair(&server, &client).expect("pair");

    // the bytes quota cannot cover this burst
    let denied = client.send(&[handle_id], &[0u8; 64], &[]);
    assert!(matches!(
        denied,
        Err(QbusError::QuotaExceeded { kind: "bytes" })
    ));
    assert!(!server.poll());

    // small sends still pass
    client.send(&[handle_id], b"ok", &[]).expect("send");
    assert!(server.poll());
}

#[test]
fn recv_blocking_wakes_on_send() {
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let client = bus.create_peer(2);
    let (_, handle_id) = bus.pair(&server, &client).expect("pair");

    std::thread::scope(|scope| {
        let receiver = scope.spawn(|| server.recv_blocking().expect("blocking recv"));
        // give the receiver a moment to park
        std::thread::sleep(Duration::from_millis(20));
        client.send(&[handle_id], b"wake up", &[]).expect("send");
        match receiver.join().expect("receiver thread") {
            Event::Message { payload, .. } => assert_eq!(payload.as_bytes(), b"wake up"),
            other => panic!("unexpected event: {other:?}"),
        }
    });
}

#[test]
fn random_op_soak() {
    // A seeded storm of pair/send/recv/destroy/acquire/release against
    // three peers; stale ids are expected and must fail cleanly, and the
    // final drain and shutdown must leave nothing dangling.
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let bus = Bus::new();
    let peers: Vec<_> = (0..3u32).map(|user| bus.create_peer(user)).collect();
    let mut rng = StdRng::seed_from_u64(0xb15_b05);
    let mut handles: Vec<Vec<u64>> = vec![Vec::new(); peers.len()];
    let mut objects: Vec<Vec<u64>> = vec![Vec::new(); peers.len()];

    for _ in 0..400 {
        let p = rng.random_range(0..peers.len());
        match rng.random_range(0..6) {
            0 => {
                let holder = rng.random_range(0..peers.len());
                if let Ok((object_id, handle_id)) = bus.pair(&peers[p], &peers[holder]) {
                    objects[p].push(object_id);
                    handles[holder].push(handle_id);
                }
            }
            1 => {
                if let Some(&id) = handles[p].first() {
                    let _ = peers[p].send(&[id], b"soak", &[]);
                }
            }
            2 => match peers[p].recv() {
                Ok(Event::Message { handles: new, .. }) => handles[p].extend(new),
                Ok(Event::ObjectDestroyed { handle }) => {
                    handles[p].retain(|&id| id != handle);
                }
                Ok(_) | Err(_) => {}
            },
            3 => {
                if let Some(id) = objects[p].pop() {
                    let _ = peers[p].destroy(&[id]);
                }
            }
            4 => {
                if let Some(&id) = handles[p].last() {
                    if peers[p].acquire(&[id]).is_ok() {
                        let _ = peers[p].release(&[id]);
                    }
                }
            }
            _ => {
                if let Some(id) = handles[p].pop() {
                    let _ = peers[p].release(&[id]);
                }
            }
        }
    }

    for (index, peer) in peers.iter().enumerate() {
        while let Ok(event) = peer.recv() {
            if let Event::ObjectDestroyed { handle } = event {
                handles[index].retain(|&id| id != handle);
            }
        }
        peer.finalize();
    }
}

#[test]
fn cross_peer_ordering_is_observed() {
    // Two clients hammer one server; the server's event stream must be one
    // interleaving of both send sequences (per-sender FIFO preserved).
    let bus = Bus::new();
    let server = bus.create_peer(1);
    let alice = bus.create_peer(2);
    let bob = bus.create_peer(3);

    let (_, alice_handle) = bus.pair(&server, &alice).expect("pair");
    let (_, bob_handle) = bus.pair(&server, &bob).expect("pair");

    const PER_SENDER: u8 = 50;
    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..PER_SENDER {
                alice.send(&[alice_handle], &[b'a', i], &[]).expect("send");
            }
        });
        scope.spawn(|| {
            for i in 0..PER_SENDER {
                bob.send(&[bob_handle], &[b'b', i], &[]).expect("send");
            }
        });
    });

    let mut next_a = 0u8;
    let mut next_b = 0u8;
    for _ in 0..(2 * PER_SENDER as usize) {
        match server.recv_timeout(Duration::from_secs(5)).expect("event") {
            Event::Message { payload, .. } => {
                let bytes = payload.as_bytes();
                match bytes[0] {
                    b'a' => {
                        assert_eq!(bytes[1], next_a, "alice's sends arrived out of order");
                        next_a += 1;
                    }
                    b'b' => {
                        assert_eq!(bytes[1], next_b, "bob's sends arrived out of order");
                        next_b += 1;
                    }
                    other => panic!("unexpected sender marker {other}"),
                }
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(next_a, PER_SENDER);
    assert_eq!(next_b, PER_SENDER);
}
