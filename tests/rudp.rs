use anyhow::Result;

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use peerlink::{
    Transmit,
    config::RudpConfig,
    rudp::{
        ChannelId, CredentialProvider, Framing, ListenerEvent, RudpChannelConfig, RudpListener,
        RudpListenerOptions, RudpState,
    },
};
use codec::{
    crypto::Password,
    data_frame::DataFrame,
    message::attributes::reliability_flags::ACK_ONLY,
};

const A_ADDR: &str = "10.0.0.1:7000";
const B_ADDR: &str = "10.0.0.2:7000";

struct Creds;

impl CredentialProvider for Creds {
    fn password(&self, username: &str, realm: &str) -> Option<Password> {
        (username == "peer").then(|| Password::long_term("peer", realm, "secret"))
    }
}

fn listener(prefer_compact: bool, cwnd_initial: u32) -> RudpListener<Creds> {
    RudpListener::new(RudpListenerOptions {
        realm: "realm".to_string(),
        credentials: Creds,
        channel_range: 0x4000..=0x7FFF,
        channel: RudpChannelConfig {
            prefer_compact,
            timing: RudpConfig {
                cwnd_initial,
                ..RudpConfig::default()
            },
            pattern: "/500,1000,1500,2000,2500///".parse().unwrap(),
        },
    })
}

/// shuttle every queued datagram between the two endpoints until both
/// are quiet.
fn pump(
    a: &mut RudpListener<Creds>,
    a_addr: SocketAddr,
    b: &mut RudpListener<Creds>,
    b_addr: SocketAddr,
    now: Instant,
) {
    loop {
        let mut progressed = false;

        while let Some(transmit) = a.poll_transmit() {
            assert_eq!(transmit.destination, b_addr);
            b.handle_input(a_addr, &transmit.payload, now);
            progressed = true;
        }

        while let Some(transmit) = b.poll_transmit() {
            assert_eq!(transmit.destination, a_addr);
            a.handle_input(b_addr, &transmit.payload, now);
            progressed = true;
        }

        if !progressed {
            break;
        }
    }
}

fn connect_pair(
    alice: &mut RudpListener<Creds>,
    bob: &mut RudpListener<Creds>,
    now: Instant,
) -> (ChannelId, ChannelId) {
    let a_addr: SocketAddr = A_ADDR.parse().unwrap();
    let b_addr: SocketAddr = B_ADDR.parse().unwrap();

    let id_a = alice.connect(b_addr, "peer", "secret", now).unwrap();

    // open -> 401 challenge -> authenticated open -> waiting.
    pump(alice, a_addr, bob, b_addr, now);

    let waiting = loop {
        match bob.poll_event() {
            Some(ListenerEvent::ChannelWaiting {
                remote,
                remote_channel,
                username,
            }) => {
                assert_eq!(remote, a_addr);
                assert_eq!(username, "peer");
                break remote_channel;
            }
            Some(_) => continue,
            None => panic!("no channel-open surfaced"),
        }
    };

    let id_b = bob.accept(a_addr, waiting, now).unwrap();
    pump(alice, a_addr, bob, b_addr, now);

    assert_eq!(alice.channel(&id_a).unwrap().state(), RudpState::Connected);
    assert_eq!(bob.channel(&id_b).unwrap().state(), RudpState::Connected);

    (id_a, id_b)
}

#[test]
fn open_handshake_and_data_round_trip() -> Result<()> {
    let now = Instant::now();
    let a_addr: SocketAddr = A_ADDR.parse()?;
    let b_addr: SocketAddr = B_ADDR.parse()?;

    let mut alice = listener(true, 4);
    let mut bob = listener(true, 4);
    let (id_a, id_b) = connect_pair(&mut alice, &mut bob, now);

    // both sides advertised the compact capability.
    assert_eq!(alice.channel(&id_a).unwrap().framing(), Framing::Compact);
    assert_eq!(bob.channel(&id_b).unwrap().framing(), Framing::Compact);

    alice
        .channel_mut(&id_a)
        .unwrap()
        .send(b"hello over rudp", now)?;
    pump(&mut alice, a_addr, &mut bob, b_addr, now);

    let received = bob.channel_mut(&id_b).unwrap().read().unwrap();
    assert_eq!(&received[..], b"hello over rudp");
    assert!(bob.channel_mut(&id_b).unwrap().read().is_none());

    // bob owes a standalone ack within the delayed-ack window.
    let ack_at = bob.poll_timeout().unwrap();
    assert!(ack_at <= now + Duration::from_millis(200));

    bob.handle_timeout(ack_at);
    pump(&mut alice, a_addr, &mut bob, b_addr, ack_at);

    // everything acknowledged: no retransmission clock left, just the
    // keep-alive.
    let next = alice.poll_timeout().unwrap();
    assert!(next >= now + Duration::from_secs(29));

    Ok(())
}

#[test]
fn lost_packet_is_retransmitted_alone_and_delivered_in_order() -> Result<()> {
    let now = Instant::now();
    let a_addr: SocketAddr = A_ADDR.parse()?;
    let b_addr: SocketAddr = B_ADDR.parse()?;

    let mut alice = listener(true, 8);
    let mut bob = listener(true, 8);
    let (id_a, id_b) = connect_pair(&mut alice, &mut bob, now);

    for payload in [&b"one"[..], b"two", b"three", b"four", b"five"] {
        alice.channel_mut(&id_a).unwrap().send(payload, now)?;
    }

    let frames: Vec<Transmit> = std::iter::from_fn(|| alice.poll_transmit()).collect();
    assert_eq!(frames.len(), 5);
    let base = DataFrame::decode(&frames[0].payload)?.sequence;

    // packet 3 never arrives.
    for (index, frame) in frames.iter().enumerate() {
        if index != 2 {
            assert!(bob.handle_input(a_addr, &frame.payload, now));
        }
    }

    // in-order delivery stops at the hole.
    assert_eq!(&bob.channel_mut(&id_b).unwrap().read().unwrap()[..], b"one");
    assert_eq!(&bob.channel_mut(&id_b).unwrap().read().unwrap()[..], b"two");
    assert!(bob.channel_mut(&id_b).unwrap().read().is_none());

    // the delayed ack reports the gap.
    let ack_at = now + Duration::from_millis(200);
    bob.handle_timeout(ack_at);

    let ack = bob.poll_transmit().unwrap();
    let frame = DataFrame::decode(&ack.payload)?;
    assert_ne!(frame.flags & ACK_ONLY, 0);
    assert_eq!(frame.gsnr, (base + 4) & 0x00FF_FFFF);
    assert_eq!(frame.gsnfr, (base + 1) & 0x00FF_FFFF);
    // bits {0, 1, 3, 4} set, bit 2 (the missing packet) clear.
    assert_eq!(frame.ack_vector & 0x1F, 0b11011);

    assert!(alice.handle_input(b_addr, &ack.payload, ack_at));

    // two newer acks only: no fast retransmit yet.
    assert!(alice.poll_transmit().is_none());

    // the retransmission clock recovers exactly the missing packet.
    let rto_at = alice.poll_timeout().unwrap();
    assert!(rto_at <= now + Duration::from_secs(1));
    alice.handle_timeout(rto_at);

    let retransmit = alice.poll_transmit().unwrap();
    let frame = DataFrame::decode(&retransmit.payload)?;
    assert_eq!(frame.sequence, (base + 2) & 0x00FF_FFFF);
    assert!(alice.poll_transmit().is_none());

    assert!(bob.handle_input(a_addr, &retransmit.payload, rto_at));

    for expected in [&b"three"[..], b"four", b"five"] {
        let received = bob.channel_mut(&id_b).unwrap().read().unwrap();
        assert_eq!(&received[..], expected);
    }

    Ok(())
}

#[test]
fn shutdown_handshake_reaches_both_sides() -> Result<()> {
    let now = Instant::now();
    let a_addr: SocketAddr = A_ADDR.parse()?;
    let b_addr: SocketAddr = B_ADDR.parse()?;

    let mut alice = listener(true, 4);
    let mut bob = listener(true, 4);
    let (id_a, id_b) = connect_pair(&mut alice, &mut bob, now);

    alice.channel_mut(&id_a).unwrap().shutdown(now);
    assert_eq!(
        alice.channel(&id_a).unwrap().state(),
        RudpState::ShuttingDown
    );

    let fin = alice.poll_transmit().unwrap();
    assert!(bob.handle_input(a_addr, &fin.payload, now));

    // the peer observes the shutdown after acknowledging the FIN.
    assert_eq!(bob.channel(&id_b).unwrap().state(), RudpState::Shutdown);

    let ack = bob.poll_transmit().unwrap();
    assert!(alice.handle_input(b_addr, &ack.payload, now));
    assert_eq!(alice.channel(&id_a).unwrap().state(), RudpState::Shutdown);

    Ok(())
}

#[test]
fn shutdown_completes_even_when_the_ack_is_lost() -> Result<()> {
    let now = Instant::now();

    let mut alice = listener(true, 4);
    let mut bob = listener(true, 4);
    let (id_a, _) = connect_pair(&mut alice, &mut bob, now);

    alice.channel_mut(&id_a).unwrap().shutdown(now);
    while alice.poll_transmit().is_some() {
        // the FIN goes nowhere.
    }

    // one RTO (capped at 500 ms) later the channel is down regardless.
    let deadline = alice.poll_timeout().unwrap();
    assert!(deadline <= now + Duration::from_millis(500));

    alice.handle_timeout(deadline);
    assert_eq!(alice.channel(&id_a).unwrap().state(), RudpState::Shutdown);

    Ok(())
}

#[test]
fn stun_framing_is_used_when_compact_is_not_negotiated() -> Result<()> {
    let now = Instant::now();
    let a_addr: SocketAddr = A_ADDR.parse()?;
    let b_addr: SocketAddr = B_ADDR.parse()?;

    let mut alice = listener(true, 4);
    let mut bob = listener(false, 4);
    let (id_a, id_b) = connect_pair(&mut alice, &mut bob, now);

    assert_eq!(alice.channel(&id_a).unwrap().framing(), Framing::Stun);
    assert_eq!(bob.channel(&id_b).unwrap().framing(), Framing::Stun);

    alice.channel_mut(&id_a).unwrap().send(b"fallback", now)?;

    // the data packet is a STUN indication, not a compact frame.
    let transmit = alice.poll_transmit().unwrap();
    assert_eq!(transmit.payload[0] >> 6, 0);
    assert!(bob.handle_input(a_addr, &transmit.payload, now));

    let received = bob.channel_mut(&id_b).unwrap().read().unwrap();
    assert_eq!(&received[..], b"fallback");

    Ok(())
}

#[test]
fn keep_alive_consumes_a_sequence_number_but_is_not_delivered() -> Result<()> {
    let now = Instant::now();
    let a_addr: SocketAddr = A_ADDR.parse()?;
    let b_addr: SocketAddr = B_ADDR.parse()?;

    let mut alice = listener(true, 4);
    let mut bob = listener(true, 4);
    let (id_a, id_b) = connect_pair(&mut alice, &mut bob, now);

    let idle = now + Duration::from_secs(30);
    alice.handle_timeout(idle);

    let keep_alive = alice.poll_transmit().expect("keep-alive frame");
    assert!(bob.handle_input(a_addr, &keep_alive.payload, idle));

    // acknowledged, never surfaced as data.
    assert!(bob.channel_mut(&id_b).unwrap().read().is_none());
    let ack_at = bob.poll_timeout().unwrap();
    bob.handle_timeout(ack_at);
    let ack = bob.poll_transmit().expect("keep-alive acknowledgement");
    assert!(alice.handle_input(b_addr, &ack.payload, ack_at));
    assert_eq!(alice.channel(&id_a).unwrap().state(), RudpState::Connected);

    Ok(())
}

#[test]
fn channel_numbers_are_unique_per_remote() {
    let now = Instant::now();
    let b_addr: SocketAddr = B_ADDR.parse().unwrap();

    let mut alice = listener(true, 4);
    let first = alice.connect(b_addr, "peer", "secret", now).unwrap();
    let second = alice.connect(b_addr, "peer", "secret", now).unwrap();

    assert_ne!(first.local_channel, second.local_channel);
}
