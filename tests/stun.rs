use anyhow::Result;
use bytes::BytesMut;

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use peerlink::{
    backoff::BackoffPattern,
    discovery::{DiscoveryEvent, StunDiscovery, StunDiscoveryOptions},
    requester::RequesterManager,
};
use codec::{
    Attributes,
    message::{
        Message, MessageEncoder, RfcVariant,
        attributes::XorMappedAddress,
        methods::{BINDING_REQUEST, BINDING_RESPONSE},
    },
};

fn pattern() -> BackoffPattern {
    "/500,1000,1500,2000,2500///".parse().unwrap()
}

fn binding_response(request: &[u8], mapped: SocketAddr) -> Result<Vec<u8>> {
    let mut attributes = Attributes::default();
    let message = Message::decode(request, &mut attributes)?;
    assert_eq!(message.method(), BINDING_REQUEST);

    let mut buf = BytesMut::with_capacity(128);
    let mut encoder = MessageEncoder::extend(BINDING_RESPONSE, &message, &mut buf);
    encoder.append::<XorMappedAddress>(mapped);
    encoder.flush(None)?;

    Ok(buf.to_vec())
}

#[test]
fn binding_discovery_uses_one_request() -> Result<()> {
    let now = Instant::now();
    let server: SocketAddr = "203.0.113.1:3478".parse()?;
    let mapped: SocketAddr = "203.0.113.7:48000".parse()?;

    let mut discovery = StunDiscovery::new(
        StunDiscoveryOptions {
            servers: vec![server],
            pattern: pattern(),
            keep_warm_ping_period: None,
            rfc: RfcVariant::Rfc5389,
        },
        now,
    );

    // exactly one request goes on the wire.
    let request = discovery.poll_transmit().expect("initial binding request");
    assert_eq!(request.destination, server);
    assert!(discovery.poll_transmit().is_none());

    let response = binding_response(&request.payload, mapped)?;
    assert!(RequesterManager::global().handle_packet(server, &response, now));

    discovery.handle_timeout(now);

    assert!(discovery.is_complete());
    assert_eq!(discovery.mapped_address(), Some(mapped));
    assert_eq!(discovery.poll_event(), Some(DiscoveryEvent::Completed(mapped)));
    assert!(discovery.poll_transmit().is_none());

    Ok(())
}

#[test]
fn discovery_fails_over_to_the_next_candidate() -> Result<()> {
    let mut now = Instant::now();
    let dead: SocketAddr = "203.0.113.1:3478".parse()?;
    let alive: SocketAddr = "203.0.113.2:3478".parse()?;
    let mapped: SocketAddr = "203.0.113.7:48000".parse()?;

    let mut discovery = StunDiscovery::new(
        StunDiscoveryOptions {
            servers: vec![dead, alive],
            pattern: "/100,100,100/10/3/".parse().unwrap(),
            keep_warm_ping_period: None,
            rfc: RfcVariant::Rfc5389,
        },
        now,
    );

    // burn through the first candidate's schedule without answering.
    let mut request = discovery.poll_transmit().expect("first request");
    assert_eq!(request.destination, dead);

    for _ in 0..32 {
        let Some(deadline) = discovery.poll_timeout() else {
            break;
        };

        now = deadline;
        discovery.handle_timeout(now);
        if let Some(next) = discovery.poll_transmit() {
            request = next;
            if request.destination == alive {
                break;
            }
        }
    }

    assert_eq!(request.destination, alive);

    let response = binding_response(&request.payload, mapped)?;
    assert!(RequesterManager::global().handle_packet(alive, &response, now));
    discovery.handle_timeout(now);

    assert_eq!(discovery.mapped_address(), Some(mapped));
    assert_eq!(discovery.active_server(), Some(alive));

    Ok(())
}

#[test]
fn keep_warm_pings_rebind_periodically() -> Result<()> {
    let now = Instant::now();
    let server: SocketAddr = "203.0.113.1:3478".parse()?;
    let mapped: SocketAddr = "203.0.113.7:48000".parse()?;

    let mut discovery = StunDiscovery::new(
        StunDiscoveryOptions {
            servers: vec![server],
            pattern: pattern(),
            keep_warm_ping_period: Some(Duration::from_secs(15)),
            rfc: RfcVariant::Rfc5389,
        },
        now,
    );

    let request = discovery.poll_transmit().expect("binding request");
    let response = binding_response(&request.payload, mapped)?;
    assert!(RequesterManager::global().handle_packet(server, &response, now));
    discovery.handle_timeout(now);
    assert!(discovery.is_complete());

    // nothing more to send until the ping period elapses.
    assert!(discovery.poll_transmit().is_none());
    let ping_at = discovery.poll_timeout().expect("keep-warm deadline");
    assert_eq!(ping_at, now + Duration::from_secs(15));

    discovery.handle_timeout(ping_at);
    let ping = discovery.poll_transmit().expect("keep-warm binding");
    assert_eq!(ping.destination, server);

    // an unchanged mapping produces no further event.
    let response = binding_response(&ping.payload, mapped)?;
    assert!(RequesterManager::global().handle_packet(server, &response, ping_at));
    discovery.handle_timeout(ping_at);
    assert_eq!(discovery.poll_event(), Some(DiscoveryEvent::Completed(mapped)));
    assert_eq!(discovery.poll_event(), None);

    Ok(())
}

#[test]
fn lost_keep_warm_ping_restarts_the_candidate_walk() -> Result<()> {
    let mut now = Instant::now();
    let server: SocketAddr = "203.0.113.1:3478".parse()?;
    let mapped: SocketAddr = "203.0.113.7:48000".parse()?;
    let period = Duration::from_secs(15);

    let mut discovery = StunDiscovery::new(
        StunDiscoveryOptions {
            servers: vec![server],
            pattern: "/100,100,100/10/3/".parse().unwrap(),
            keep_warm_ping_period: Some(period),
            rfc: RfcVariant::Rfc5389,
        },
        now,
    );

    let request = discovery.poll_transmit().expect("binding request");
    let response = binding_response(&request.payload, mapped)?;
    assert!(RequesterManager::global().handle_packet(server, &response, now));
    discovery.handle_timeout(now);
    assert!(discovery.is_complete());

    // the keep-warm ping fires and goes unanswered.
    let ping_at = discovery.poll_timeout().expect("keep-warm deadline");
    discovery.handle_timeout(ping_at);
    let ping = discovery.poll_transmit().expect("keep-warm binding");
    assert_eq!(ping.destination, server);

    // exhaust the ping's schedule; the walk restarts from the first
    // candidate (a fresh transaction, not another ping retransmission)
    // instead of going quiet.
    let ping_tid = ping.payload[8..20].to_vec();
    let mut retry = None;
    for _ in 0..32 {
        if retry.is_some() {
            break;
        }

        let Some(deadline) = discovery.poll_timeout() else {
            break;
        };

        now = deadline;
        discovery.handle_timeout(now);
        while let Some(transmit) = discovery.poll_transmit() {
            if transmit.payload[8..20] != ping_tid[..] {
                retry = Some(transmit);
            }
        }
    }

    let retry = retry.expect("walk restarted after the lost ping");
    assert_eq!(retry.destination, server);

    // answering the retry re-arms the periodic refresh.
    let response = binding_response(&retry.payload, mapped)?;
    assert!(RequesterManager::global().handle_packet(server, &response, now));
    discovery.handle_timeout(now);

    assert_eq!(discovery.mapped_address(), Some(mapped));
    assert_eq!(discovery.poll_timeout(), Some(now + period));

    Ok(())
}
