//! Delivery guarantees per channel under loss, duplication and reordering.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{Pair, filter, has_ack, init_tracing, test_config};
use netchannel::prelude::*;
use netchannel::transport::Unit;

fn numbered(i: u32) -> Bytes {
    Bytes::from(i.to_le_bytes().to_vec())
}

fn number(payload: &Bytes) -> u32 {
    u32::from_le_bytes(payload[..4].try_into().unwrap())
}

#[test]
fn test_reliable_ordered_survives_lossy_link() {
    init_tracing();
    let mut pair = Pair::new(7, test_config(), test_config());
    pair.connect();
    {
        let mut net = pair.net.state();
        net.loss = 0.2;
        net.reorder = true;
        net.duplicate = 0.1;
    }

    let channel = ChannelId::reliable_ordered(1).unwrap();
    for i in 0..300 {
        pair.send_blocking(channel, numbered(i));
    }
    let delivered = pair.run_until(Duration::from_secs(60), |pair| {
        pair.b.received(channel).len() >= 300
    });

    assert!(delivered, "only {} delivered", pair.b.received(channel).len());
    let order: Vec<u32> = pair.b.received(channel).iter().map(number).collect();
    assert_eq!(order, (0..300).collect::<Vec<_>>());
    assert_eq!(pair.a.count(|e| matches!(e, PeerEvent::ReceiptFailed { .. })), 0);
}

#[test]
fn test_reliable_unordered_delivers_each_message_once() {
    let mut pair = Pair::new(11, test_config(), test_config());
    pair.connect();
    {
        let mut net = pair.net.state();
        net.loss = 0.1;
        net.duplicate = 0.5;
        net.reorder = true;
    }

    let channel = ChannelId::RELIABLE_UNORDERED;
    for i in 0..200 {
        pair.send_blocking(channel, numbered(i));
    }
    pair.run_until(Duration::from_secs(60), |pair| {
        pair.b.received(channel).len() >= 200
    });
    // let stragglers and duplicates drain
    pair.run(Duration::from_secs(2));

    let received: Vec<u32> = pair.b.received(channel).iter().map(number).collect();
    let distinct: HashSet<u32> = received.iter().copied().collect();
    assert_eq!(received.len(), 200);
    assert_eq!(distinct, (0..200).collect());
    assert!(pair.b.peer.stats(pair.a.addr).unwrap().duplicates_dropped > 0);
}

#[test]
fn test_reliable_sequenced_never_goes_backwards() {
    let mut pair = Pair::new(3, test_config(), test_config());
    pair.connect();
    {
        let mut net = pair.net.state();
        net.loss = 0.1;
        net.reorder = true;
    }

    let channel = ChannelId::reliable_sequenced(4).unwrap();
    for i in 0..100 {
        pair.send_blocking(channel, numbered(i));
        pair.tick();
    }
    pair.run(Duration::from_secs(10));

    let received: Vec<u32> = pair.b.received(channel).iter().map(number).collect();
    assert!(received.windows(2).all(|w| w[0] < w[1]), "{received:?}");
    // every message was acknowledged, delivered or not
    assert_eq!(pair.a.handle.in_flight(pair.b.addr, channel), 0);
}

#[test]
fn test_sequenced_drops_stale_messages() {
    let mut pair = Pair::new(5, test_config(), test_config());
    pair.connect();
    pair.net.state().reorder = true;

    let channel = ChannelId::sequenced(2).unwrap();
    for i in 0..50 {
        pair.a.handle.send(pair.b.addr, channel, numbered(i)).unwrap();
    }
    pair.run(Duration::from_millis(100));

    let received: Vec<u32> = pair.b.received(channel).iter().map(number).collect();
    assert!(!received.is_empty());
    assert!(received.windows(2).all(|w| w[0] < w[1]), "{received:?}");
}

#[test]
fn test_unreliable_delivers_in_any_order() {
    let mut pair = Pair::new(9, test_config(), test_config());
    pair.connect();

    for i in 0..20 {
        pair.a
            .handle
            .send(pair.b.addr, ChannelId::UNRELIABLE, numbered(i))
            .unwrap();
    }
    pair.run(Duration::from_millis(50));

    let mut received: Vec<u32> = pair
        .b
        .received(ChannelId::UNRELIABLE)
        .iter()
        .map(number)
        .collect();
    received.sort_unstable();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
}

#[test]
fn test_out_of_order_arrival_delivered_in_order() {
    let mut pair = Pair::new(1, test_config(), test_config());
    pair.connect();
    let channel = ChannelId::reliable_ordered(1).unwrap();

    // hold A's user traffic so it can be released as C, A, B
    let held: Arc<Mutex<Vec<Vec<Unit>>>> = Arc::default();
    let sink = Arc::clone(&held);
    pair.net.state().filter = filter(move |_, _, units| {
        let user = units.iter().any(|u| matches!(u, Unit::User { .. }));
        if user {
            sink.lock().unwrap().push(units.to_vec());
        }
        user
    });

    for payload in ["A", "B", "C"] {
        pair.a.handle.send(pair.b.addr, channel, payload).unwrap();
        pair.tick();
    }
    pair.net.state().filter = None;

    let datagrams = std::mem::take(&mut *held.lock().unwrap());
    assert_eq!(datagrams.len(), 3);
    for index in [2, 0, 1] {
        let mut datagram = bytes::BytesMut::new();
        for unit in &datagrams[index] {
            unit.encode(&mut datagram);
        }
        let (a, b) = (pair.a.addr, pair.b.addr);
        pair.net.state().inject(a, b, datagram.to_vec());
        pair.tick();
    }

    assert_eq!(
        pair.b.received(channel),
        vec![Bytes::from("A"), Bytes::from("B"), Bytes::from("C")]
    );
}

#[test]
fn test_dropped_acks_cause_backed_off_resends() {
    let mut pair = Pair::new(2, test_config(), test_config());
    pair.connect();
    let (a, b) = (pair.a.addr, pair.b.addr);
    let channel = ChannelId::RELIABLE_UNORDERED;
    let dropped_acks = 3;

    let mut remaining = dropped_acks;
    pair.net.state().filter = filter(move |from, _, units| {
        if from == b && has_ack(units) && remaining > 0 {
            remaining -= 1;
            return true;
        }
        false
    });
    pair.net.state().log.clear();

    pair.a.handle.send(b, channel, "once").unwrap();
    pair.run(Duration::from_secs(3));

    // transmissions of the message, with the time each left A
    let sends: Vec<_> = pair
        .net
        .state()
        .log
        .iter()
        .filter(|(_, from, _, units)| {
            *from == a && units.iter().any(|u| matches!(u, Unit::User { .. }))
        })
        .map(|(at, ..)| *at)
        .collect();
    assert_eq!(sends.len(), dropped_acks + 1);
    let gaps: Vec<Duration> = sends.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|w| w[0] < w[1]), "{gaps:?}");

    assert_eq!(pair.b.received(channel), vec![Bytes::from("once")]);
    assert_eq!(pair.a.peer.stats(b).unwrap().messages_resent, dropped_acks as u64);
    assert_eq!(pair.b.peer.stats(a).unwrap().duplicates_dropped, dropped_acks as u64);
    assert_eq!(pair.a.handle.in_flight(b, channel), 0);
}

#[test]
fn test_large_messages_fragment_and_reassemble() {
    let config = PeerConfig {
        reassembly_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let mut pair = Pair::new(4, config.clone(), config);
    pair.connect();
    {
        let mut net = pair.net.state();
        net.loss = 0.1;
        net.reorder = true;
    }

    let channel = ChannelId::reliable_ordered(3).unwrap();
    let messages: Vec<Bytes> = (0..5u8)
        .map(|n| Bytes::from(vec![n; 3000 + n as usize * 101]))
        .collect();
    for message in &messages {
        pair.send_blocking(channel, message.clone());
    }
    pair.run_until(Duration::from_secs(60), |pair| {
        pair.b.received(channel).len() >= messages.len()
    });

    assert_eq!(pair.b.received(channel), messages);
}

#[test]
fn test_expired_group_ignores_late_fragment() {
    let mut pair = Pair::new(6, test_config(), test_config());
    pair.connect();
    let (a, b) = (pair.a.addr, pair.b.addr);

    // hold back the last of four fragments
    let held: Arc<Mutex<Option<Vec<Unit>>>> = Arc::default();
    let sink = Arc::clone(&held);
    pair.net.state().filter = filter(move |_, _, units| {
        let last = units
            .iter()
            .any(|u| matches!(u, Unit::Fragment { fragment: f, .. } if f.index == 3 && f.count == 4));
        if last {
            *sink.lock().unwrap() = Some(units.to_vec());
        }
        last
    });

    pair.a
        .handle
        .send(b, ChannelId::UNRELIABLE, Bytes::from(vec![7u8; 900]))
        .unwrap();
    pair.tick();
    pair.net.state().filter = None;

    // the reassembly timeout passes
    pair.run(Duration::from_millis(600));
    let late = held.lock().unwrap().take().expect("fragment was held");
    let mut datagram = bytes::BytesMut::new();
    for unit in &late {
        unit.encode(&mut datagram);
    }
    pair.net.state().inject(a, b, datagram.to_vec());
    pair.tick();

    assert!(pair.b.received(ChannelId::UNRELIABLE).is_empty());
    assert_eq!(pair.b.peer.status(a), Some(ConnectionStatus::Connected));

    // the channel still works
    pair.a
        .handle
        .send(b, ChannelId::UNRELIABLE, Bytes::from(vec![8u8; 900]))
        .unwrap();
    pair.tick();
    assert_eq!(
        pair.b.received(ChannelId::UNRELIABLE),
        vec![Bytes::from(vec![8u8; 900])]
    );
}
