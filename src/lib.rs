//! ## peerlink
//!
//! Connectivity and reliability core for peer-to-peer media and data
//! applications behind NATs and firewalls:
//!
//! - [`backoff`] - the retry pattern/timer engine every retransmission
//!   in this crate is driven by.
//! - [`requester`] - one-shot STUN transactions and the process-wide
//!   transaction-id registry.
//! - [`discovery`] - server-reflexive address discovery with keep-warm
//!   pings.
//! - [`turn`] - TURN relay allocation, permissions, channel binding and
//!   the Send/Data and ChannelData relay paths.
//! - [`rudp`] - reliable, in-order channels layered on datagrams, with
//!   ACK vectors, RTO estimation and STUN-based channel setup.
//! - [`driver`] - the tokio socket loop gluing a sans-IO endpoint to a
//!   UDP socket.
//!
//! The wire codec lives in the sibling `peerlink-codec` crate.
//!
//! Every protocol component is a single-owner state machine driven by
//! four calls (`handle_input`, `handle_timeout`, `poll_transmit`,
//! `poll_timeout`); time always comes in from the caller, which makes
//! the protocol logic deterministic under test.  DNS, sockets and the
//! clock are consumed contracts, never owned.

pub mod backoff;
pub mod background;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod driver;
pub mod requester;
pub mod rudp;
pub mod turn;

use bytes::Bytes;

use std::net::SocketAddr;

/// One datagram an endpoint wants on the wire.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub payload: Bytes,
}
