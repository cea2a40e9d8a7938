//! Randomized and concurrent ordering tests.
//!
//! These check the system-wide properties the engine promises: timestamps
//! returned by a peer never decrease, all receivers agree on one total
//! order, deliveries belonging to one transaction are never interleaved
//! with a third party, and every reference unwinds exactly once.

use std::ptr;

use proptest::prelude::*;

use crate::{stamp, Node, Peer, Tx};

/// A transaction with its per-destination nodes, heap-pinned like a real
/// message carrier.
struct TestMsg {
    tx: Tx,
    nodes: Vec<Node>,
}

impl TestMsg {
    fn new(n_nodes: usize) -> Box<Self> {
        let msg = Box::new(Self {
            tx: Tx::new(),
            nodes: (0..n_nodes).map(|i| Node::new(i as u32)).collect(),
        });
        msg.tx.claim();
        for node in &msg.nodes {
            node.claim();
        }
        msg
    }

    /// Release the claims established by [`new`](Self::new); every count
    /// must reach zero here, exactly once.
    fn teardown(&self) {
        for node in &self.nodes {
            assert_eq!(node.refs(), 1, "only the claim may remain");
            assert!(node.release());
        }
        assert_eq!(self.tx.refs(), 1, "only the claim may remain");
        assert!(self.tx.release());
    }
}

/// Drop the queue's references on a just-popped node.
fn release_delivery(node: &Node) {
    let tx = node.finalize().expect("delivered node carries its tx");
    // Safety: the claim in TestMsg keeps the tx alive past this release.
    unsafe { tx.as_ref().release() };
    node.release();
}

#[test]
fn stress_global_total_order() {
    const SENDERS: usize = 4;
    const RECEIVERS: usize = 3;
    const PER_SENDER: usize = 64;

    let receivers: Vec<Peer> = (0..RECEIVERS).map(|_| Peer::new()).collect();
    let msgs: Vec<Vec<Box<TestMsg>>> = (0..SENDERS)
        .map(|_| (0..PER_SENDER).map(|_| TestMsg::new(RECEIVERS)).collect())
        .collect();

    let orders: Vec<Vec<(i64, usize)>> = std::thread::scope(|scope| {
        let receivers = &receivers;
        for sender_msgs in &msgs {
            scope.spawn(move || {
                let sender = Peer::new();
                for msg in sender_msgs {
                    for (node, dest) in msg.nodes.iter().zip(receivers) {
                        // Safety: nodes and tx outlive the scope; claims
                        // hold them past every release below.
                        unsafe { node.queue(&msg.tx, dest) };
                    }
                    msg.tx.commit(&sender);
                    for (node, dest) in msg.nodes.iter().zip(receivers) {
                        node.commit(dest);
                    }
                }
            });
        }

        let consumers: Vec<_> = receivers
            .iter()
            .map(|receiver| {
                scope.spawn(move || {
                    let mut seen = Vec::with_capacity(SENDERS * PER_SENDER);
                    while seen.len() < SENDERS * PER_SENDER {
                        let Some(front) = receiver.peek() else {
                            std::thread::yield_now();
                            continue;
                        };
                        let ts = front.resolved_timestamp();
                        let tx_id = front.tx_ptr() as usize;
                        receiver.pop(front);
                        release_delivery(front);
                        seen.push((ts, tx_id));
                    }
                    seen
                })
            })
            .collect();

        consumers
            .into_iter()
            .map(|handle| handle.join().expect("consumer thread"))
            .collect()
    });

    for order in &orders {
        assert_eq!(order.len(), SENDERS * PER_SENDER);
        // timestamps never decrease, and ties resolve by tx identity
        for pair in order.windows(2) {
            assert!(
                pair[0] < pair[1],
                "delivery order must follow (timestamp, tx): {pair:?}"
            );
        }
    }

    // every receiver agrees on the one total order
    for order in &orders[1..] {
        assert_eq!(order, &orders[0]);
    }

    for sender_msgs in &msgs {
        for msg in sender_msgs {
            msg.teardown();
        }
    }
}

#[test]
fn stress_multicast_atomicity() {
    // Several deliveries of one transaction aimed at the same receiver must
    // come out adjacent: no third transaction lands in between.
    const SENDERS: usize = 4;
    const PER_SENDER: usize = 32;
    const FANOUT: usize = 3;

    let receiver = Peer::new();
    let msgs: Vec<Vec<Box<TestMsg>>> = (0..SENDERS)
        .map(|_| (0..PER_SENDER).map(|_| TestMsg::new(FANOUT)).collect())
        .collect();

    let order: Vec<usize> = std::thread::scope(|scope| {
        let receiver = &receiver;
        for sender_msgs in &msgs {
            scope.spawn(move || {
                let sender = Peer::new();
                for msg in sender_msgs {
                    for node in &msg.nodes {
                        // Safety: as in stress_global_total_order.
                        unsafe { node.queue(&msg.tx, receiver) };
                    }
                    msg.tx.commit(&sender);
                    for node in &msg.nodes {
                        node.commit(receiver);
                    }
                }
            });
        }

        let consumer = scope.spawn(move || {
            let total = SENDERS * PER_SENDER * FANOUT;
            let mut seen = Vec::with_capacity(total);
            while seen.len() < total {
                let Some(front) = receiver.peek() else {
                    std::thread::yield_now();
                    continue;
                };
                let tx_id = front.tx_ptr() as usize;
                receiver.pop(front);
                release_delivery(front);
                seen.push(tx_id);
            }
            seen
        });
        consumer.join().expect("consumer thread")
    });

    let mut runs: Vec<(usize, usize)> = Vec::new();
    for tx_id in order {
        match runs.last_mut() {
            Some((last, count)) if *last == tx_id => *count += 1,
            _ => runs.push((tx_id, 1)),
        }
    }
    for (tx_id, count) in &runs {
        assert_eq!(
            *count, FANOUT,
            "deliveries of tx {tx_id:#x} were interleaved"
        );
    }

    for sender_msgs in &msgs {
        for msg in sender_msgs {
            msg.teardown();
        }
    }
}

/// Token schedule for the randomized interleaving: three tokens per
/// transaction (queue, tx-commit, node-commit in that order), plus
/// `usize::MAX` tokens that peek.
fn schedule() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1..8usize).prop_flat_map(|n| {
        let mut tokens: Vec<usize> = (0..n * 3).map(|i| i / 3).collect();
        tokens.extend(std::iter::repeat(usize::MAX).take(n));
        (Just(n), Just(tokens).prop_shuffle())
    })
}

proptest! {
    /// Any interleaving of unicast sends into one receiver yields a
    /// delivery order sorted by `(timestamp, tx identity)`, with peeked
    /// timestamps never decreasing along the way.
    #[test]
    fn randomized_interleaving((n, tokens) in schedule()) {
        let sender = Peer::new();
        let receiver = Peer::new();
        let msgs: Vec<Box<TestMsg>> = (0..n).map(|_| TestMsg::new(1)).collect();
        let mut step = vec![0usize; n];
        let mut last_peek: Option<(i64, usize)> = None;

        let mut run_op = |tx_index: usize, step: &mut Vec<usize>| {
            let msg = &msgs[tx_index];
            match step[tx_index] {
                0 => unsafe { msg.nodes[0].queue(&msg.tx, &receiver) },
                1 => msg.tx.commit(&sender),
                2 => msg.nodes[0].commit(&receiver),
                _ => return,
            }
            step[tx_index] += 1;
        };

        for token in tokens {
            if token == usize::MAX {
                if let Some(front) = receiver.peek() {
                    let key = (front.resolved_timestamp(), front.tx_ptr() as usize);
                    if let Some(prev) = last_peek {
                        prop_assert!(key >= prev, "peek went backwards: {prev:?} -> {key:?}");
                    }
                    last_peek = Some(key);
                }
            } else {
                run_op(token, &mut step);
            }
        }

        // finish every transaction, then drain
        for tx_index in 0..n {
            while step[tx_index] < 3 {
                run_op(tx_index, &mut step);
            }
        }

        let mut delivered = Vec::with_capacity(n);
        while let Some(front) = receiver.peek() {
            prop_assert!(stamp::is_committed(front.resolved_timestamp()));
            let key = (front.resolved_timestamp(), front.tx_ptr() as usize);
            receiver.pop(front);
            release_delivery(front);
            delivered.push(key);
        }

        prop_assert_eq!(delivered.len(), n);
        for pair in delivered.windows(2) {
            prop_assert!(pair[0] < pair[1], "unsorted delivery: {:?}", pair);
        }

        for msg in &msgs {
            msg.teardown();
        }
    }
}

#[test]
fn loom_publish_edge() {
    // Model of the engine's one release/acquire pair: the committed counter
    // publishes the commit timestamp. An observed "ready" must imply the
    // frozen timestamp is visible, on every interleaving.
    use loom::sync::atomic::{AtomicI64, Ordering};
    use loom::sync::Arc;
    use loom::thread;

    loom::model(|| {
        let timestamp = Arc::new(AtomicI64::new(0));
        let committed = Arc::new(AtomicI64::new(0));

        let producer = {
            let timestamp = Arc::clone(&timestamp);
            let committed = Arc::clone(&committed);
            thread::spawn(move || {
                timestamp.store(5, Ordering::Relaxed);
                committed.fetch_add(1, Ordering::Release);
            })
        };

        let consumer = {
            let timestamp = Arc::clone(&timestamp);
            let committed = Arc::clone(&committed);
            thread::spawn(move || {
                if committed.load(Ordering::Acquire) > 0 {
                    let ts = timestamp.load(Ordering::Relaxed);
                    assert!(
                        stamp::is_committed(ts),
                        "ready implies a committed timestamp, got {ts}"
                    );
                }
            })
        };

        producer.join().expect("producer must join");
        consumer.join().expect("consumer must join");
    });
}

#[test]
fn single_membership_invariant() {
    // A node is linked into at most one of incoming/busy/ready at any
    // owner-observable point.
    let sender = Peer::new();
    let receiver = Peer::new();
    let msg = TestMsg::new(1);
    let node = &msg.nodes[0];

    assert!(!node.is_linked() && !node.in_ready());

    unsafe { node.queue(&msg.tx, &receiver) };
    assert!(node.is_linked() && !node.in_ready());

    msg.tx.commit(&sender);
    node.commit(&receiver);
    assert!(node.is_linked() && !node.in_ready());

    let front = receiver.peek().expect("entry ready");
    assert!(ptr::eq(front, node));
    assert!(!node.is_linked() && node.in_ready());

    receiver.pop(node);
    assert!(!node.is_linked() && !node.in_ready());

    release_delivery(node);
    msg.teardown();
}

#[test]
fn commit_finality() {
    // Once committed, a transaction timestamp never changes — not even
    // when the receiver synchronizes its queue past it.
    let sender = Peer::new();
    let receiver = Peer::new();
    let early = TestMsg::new(1);
    let late = TestMsg::new(1);

    unsafe { early.nodes[0].queue(&early.tx, &receiver) };
    early.tx.commit(&sender);
    early.nodes[0].commit(&receiver);
    let frozen = early.tx.timestamp();

    // peek syncs the queue; the committed stamp must not move
    unsafe { late.nodes[0].queue(&late.tx, &receiver) };
    let front = receiver.peek().expect("early entry ready");
    assert!(ptr::eq(front, &early.nodes[0]));
    assert_eq!(early.tx.timestamp(), frozen);

    late.tx.commit(&sender);
    late.nodes[0].commit(&receiver);
    assert_eq!(early.tx.timestamp(), frozen);

    for msg in [&early, &late] {
        let front = receiver.peek().expect("entry ready");
        assert!(ptr::eq(front, &msg.nodes[0]));
        receiver.pop(front);
        release_delivery(front);
    }
    early.teardown();
    late.teardown();
}
