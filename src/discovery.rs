//! STUN binding discovery.
//!
//! Walks a resolved, ordered server candidate list and learns the
//! server-reflexive address from the first Binding transaction that
//! succeeds, then optionally keeps the NAT mapping warm with periodic
//! re-bindings.

use bytes::BytesMut;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use codec::{
    Attributes,
    message::{
        Message, MessageEncoder, RfcVariant,
        attributes::{MappedAddress, XorMappedAddress},
        methods::{BINDING_REQUEST, Method, MethodType},
    },
};

use crate::{
    Transmit,
    backoff::BackoffPattern,
    requester::{RequesterEvent, StunRequester, generate_tid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// the reflexive address was learned (or changed on a keep-warm
    /// ping).
    Completed(SocketAddr),
    /// every candidate timed out.
    Failed,
}

pub struct StunDiscoveryOptions {
    /// candidates in SRV order, see [`crate::dns::order_records`].
    pub servers: Vec<SocketAddr>,
    pub pattern: BackoffPattern,
    /// re-binding period; zero or `None` disables the keep-warm pings.
    pub keep_warm_ping_period: Option<Duration>,
    pub rfc: RfcVariant,
}

pub struct StunDiscovery {
    options: StunDiscoveryOptions,
    /// index of the candidate the current requester talks to.
    index: usize,
    requester: Option<StunRequester>,
    /// the current requester is a keep-warm ping, not part of the
    /// candidate walk.
    pinging: bool,
    mapped: Option<SocketAddr>,
    active_server: Option<SocketAddr>,
    next_ping: Option<Instant>,
    events: VecDeque<DiscoveryEvent>,
    failed: bool,
}

impl StunDiscovery {
    pub fn new(options: StunDiscoveryOptions, now: Instant) -> Self {
        let mut this = Self {
            index: 0,
            requester: None,
            pinging: false,
            mapped: None,
            active_server: None,
            next_ping: None,
            events: VecDeque::new(),
            failed: false,
            options,
        };

        match this.options.servers.first().copied() {
            Some(server) => this.start_binding(server, now),
            None => {
                this.failed = true;
                this.events.push_back(DiscoveryEvent::Failed);
            }
        }

        this
    }

    /// the discovery ran to completion, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.failed || self.mapped.is_some()
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.mapped
    }

    pub fn active_server(&self) -> Option<SocketAddr> {
        self.active_server
    }

    pub fn poll_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.requester.as_ref()?.poll_transmit()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let requester = self.requester.as_ref().and_then(|it| it.poll_timeout());
        match (requester, self.next_ping) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(ping) = self.next_ping
            && ping <= now
            && self.requester.is_none()
            && let Some(server) = self.active_server
        {
            self.next_ping = None;
            self.pinging = true;
            self.start_binding(server, now);
        }

        enum Outcome {
            Pending,
            Completed(SocketAddr, SocketAddr),
            TimedOut,
        }

        let mut outcome = Outcome::Pending;
        {
            let Some(requester) = &self.requester else {
                return;
            };

            requester.handle_timeout(now);

            while let Some(event) = requester.poll_event() {
                match event {
                    RequesterEvent::ResponseReceived { bytes, .. } => {
                        match self.reflexive_of(&bytes) {
                            Some(address) => {
                                requester.accept_response();
                                outcome = Outcome::Completed(requester.server(), address);
                                break;
                            }
                            // not a usable binding response, keep
                            // retransmitting until one arrives.
                            None => requester.reject_response(),
                        }
                    }
                    RequesterEvent::TimedOut => {
                        outcome = Outcome::TimedOut;
                        break;
                    }
                }
            }
        }

        match outcome {
            Outcome::Pending => {}
            Outcome::Completed(server, address) => {
                self.requester = None;
                self.finish(server, address, now);
            }
            Outcome::TimedOut => {
                self.requester = None;
                self.next_candidate(now);
            }
        }
    }

    pub fn cancel(&mut self) {
        if let Some(requester) = self.requester.take() {
            requester.cancel();
        }

        self.pinging = false;
        self.next_ping = None;
    }

    fn start_binding(&mut self, server: SocketAddr, now: Instant) {
        let tid = generate_tid();
        let mut buf = BytesMut::with_capacity(128);

        // a plain binding request: no credential, no attributes.
        if MessageEncoder::new(BINDING_REQUEST, &tid, &mut buf)
            .flush(None)
            .is_err()
        {
            self.failed = true;
            self.events.push_back(DiscoveryEvent::Failed);
            return;
        }

        self.requester = Some(StunRequester::new(
            server,
            buf.freeze(),
            self.options.pattern.clone(),
            now,
        ));
    }

    fn finish(&mut self, server: SocketAddr, address: SocketAddr, now: Instant) {
        let changed = self.mapped != Some(address);
        self.pinging = false;
        self.mapped = Some(address);
        self.active_server = Some(server);

        if changed {
            self.events.push_back(DiscoveryEvent::Completed(address));
        }

        if let Some(period) = self.options.keep_warm_ping_period
            && !period.is_zero()
        {
            self.next_ping = Some(now + period);
        }
    }

    fn next_candidate(&mut self, now: Instant) {
        // a timed-out keep-warm ping restarts the walk from the top of
        // the candidate list; an ordinary timeout advances it.
        if self.pinging {
            self.pinging = false;
            self.index = 0;
        } else {
            self.index += 1;
        }

        if let Some(server) = self.options.servers.get(self.index).copied() {
            self.start_binding(server, now);
            return;
        }

        // the list is exhausted.  Before any success that is fatal;
        // with a mapping already learned the periodic refresh stays
        // armed and tries again next period.
        if self.mapped.is_none() {
            self.failed = true;
            self.events.push_back(DiscoveryEvent::Failed);
        } else if let Some(period) = self.options.keep_warm_ping_period
            && !period.is_zero()
        {
            self.next_ping = Some(now + period);
        }
    }

    fn reflexive_of(&self, bytes: &[u8]) -> Option<SocketAddr> {
        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).ok()?;

        if message.method() != Method::Binding(MethodType::Response) {
            return None;
        }

        match self.options.rfc {
            RfcVariant::Rfc3489 => message.get::<MappedAddress>(),
            RfcVariant::Rfc5389 => message
                .get::<XorMappedAddress>()
                .or_else(|| message.get::<MappedAddress>()),
        }
    }
}
