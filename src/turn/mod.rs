//! TURN client: relay allocation, permissions, channel binding and the
//! data relay paths over UDP or TCP.
//!
//! The client is a sans-IO state machine: the embedding socket loop
//! feeds it datagrams through [`TurnClient::handle_input`], drives the
//! clocks through [`TurnClient::handle_timeout`] and flushes
//! [`TurnClient::poll_transmit`].

pub mod channels;
pub mod servers;

pub use self::{
    channels::ChannelTable,
    servers::{ServerCandidate, merge_candidates},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    ops::RangeInclusive,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::{
    Attributes,
    channel_data::ChannelData,
    crypto::Password,
    message::{
        Message, MessageEncoder,
        attributes::{
            AlternateServer, ChannelNumber, Data, DontFragment, ErrorCode, ErrorKind, Lifetime,
            Nonce, Realm, RequestedTransport, Software, Transport, UserName, XorMappedAddress,
            XorPeerAddress, XorRelayedAddress,
        },
        methods::{
            ALLOCATE_REQUEST, CHANNEL_BIND_REQUEST, CREATE_PERMISSION_REQUEST, DATA_INDICATION,
            Method, REFRESH_REQUEST, SEND_INDICATION,
        },
    },
};

use self::servers::CandidateList;
use crate::{
    Transmit,
    backoff::BackoffPattern,
    config,
    requester::{StunTransaction, generate_tid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// created, nothing sent yet.
    Pending,
    /// probing candidates with an unauthenticated Allocate to learn the
    /// realm and nonce.
    Discovering,
    /// authenticated Allocate in flight.
    Allocating,
    /// relay usable; data flows.
    Ready,
    /// a Refresh is in flight; data keeps flowing.
    Refreshing,
    /// zero-lifetime Refresh in flight.
    ShuttingDown,
    /// terminal.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnError {
    UserRequestedShutdown,
    DnsLookupFailure,
    FailedToConnectToAnyServer,
    AuthenticationFailed,
    RefreshTimeout,
    UnexpectedSocketFailure,
    BogusDataOnSocketReceived,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    StateChanged(TurnState),
    /// relayed data from a peer, unwrapped from a Data indication or a
    /// ChannelData frame.
    Data { peer: SocketAddr, bytes: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// the allocation is not in a state that can relay data.
    NotReady,
    /// the message could not be encoded.
    Codec,
}

impl std::error::Error for SendError {}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Cached (realm, nonce) per server identity, so a re-created client
/// skips one 401 round trip.  Entries expire on the server-supplied
/// timeout.
#[derive(Default)]
pub struct NonceCache {
    map: Mutex<HashMap<SocketAddr, (String, String, Instant)>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, server: SocketAddr, realm: &str, nonce: &str, expires_at: Instant) {
        self.map
            .lock()
            .insert(server, (realm.to_string(), nonce.to_string(), expires_at));
    }

    pub fn get(&self, server: &SocketAddr, now: Instant) -> Option<(String, String)> {
        let mut map = self.map.lock();
        match map.get(server) {
            Some((realm, nonce, expires_at)) if *expires_at > now => {
                Some((realm.clone(), nonce.clone()))
            }
            Some(_) => {
                map.remove(server);
                None
            }
            None => None,
        }
    }
}

pub struct TurnClientOptions {
    /// failover order, see [`merge_candidates`].
    pub servers: Vec<ServerCandidate>,
    pub username: String,
    pub password: String,
    pub software: Option<String>,
    /// retransmission schedule for every request.
    pub pattern: BackoffPattern,
    pub channel_range: RangeInclusive<u16>,
    pub use_channel_binding: bool,
    pub dont_fragment: bool,
    /// requested allocation lifetime in seconds; the server may clamp.
    pub lifetime: Option<u32>,
    pub nonce_cache: Option<Arc<NonceCache>>,
}

impl Default for TurnClientOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            username: String::new(),
            password: String::new(),
            software: None,
            pattern: BackoffPattern::parse(crate::backoff::DEFAULT_PATTERN)
                .unwrap_or_default(),
            channel_range: config::DEFAULT_CHANNEL_RANGE,
            use_channel_binding: true,
            dont_fragment: false,
            lifetime: None,
            nonce_cache: None,
        }
    }
}

struct Auth {
    realm: String,
    nonce: String,
    password: Password,
}

#[derive(Clone)]
enum RequestKind {
    Allocate { authenticated: bool },
    Refresh { lifetime: u32 },
    CreatePermission { peers: Vec<SocketAddr> },
    ChannelBind { peer: SocketAddr, number: u16 },
}

struct PendingRequest {
    kind: RequestKind,
    transaction: StunTransaction,
    /// 438 is honored once per request.
    stale_retries: u8,
}

struct Permission {
    /// a representative peer address for re-issuing the permission.
    peer: SocketAddr,
    confirmed: bool,
    refresh_at: Instant,
}

/// TURN client allocation.
///
/// Owned by the application and destroyed by [`shutdown`]
/// (zero-lifetime Refresh) or an unrecoverable error; errors never
/// propagate past the allocation itself.
///
/// [`shutdown`]: TurnClient::shutdown
pub struct TurnClient {
    options: TurnClientOptions,
    state: TurnState,
    last_error: Option<TurnError>,
    candidates: CandidateList,
    auth: Option<Auth>,
    requests: Vec<PendingRequest>,
    relayed: Option<SocketAddr>,
    reflexive: Option<SocketAddr>,
    lifetime: u32,
    refresh_at: Option<Instant>,
    refresh_failures: u8,
    permissions: HashMap<IpAddr, Permission>,
    permission_batch: Vec<SocketAddr>,
    queued_sends: HashMap<IpAddr, Vec<(SocketAddr, Bytes, bool)>>,
    channels: ChannelTable,
    events: VecDeque<TurnEvent>,
    transmits: VecDeque<Transmit>,
}

impl TurnClient {
    pub fn new(options: TurnClientOptions, now: Instant) -> Self {
        let channels = ChannelTable::new(options.channel_range.clone());
        let candidates = CandidateList::new(options.servers.clone());

        let mut this = Self {
            state: TurnState::Pending,
            last_error: None,
            auth: None,
            requests: Vec::with_capacity(4),
            relayed: None,
            reflexive: None,
            lifetime: options.lifetime.unwrap_or(config::DEFAULT_ALLOCATION_LIFETIME),
            refresh_at: None,
            refresh_failures: 0,
            permissions: HashMap::with_capacity(8),
            permission_batch: Vec::new(),
            queued_sends: HashMap::with_capacity(8),
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            candidates,
            channels,
            options,
        };

        this.start_allocation(now);
        this
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn last_error(&self) -> Option<TurnError> {
        self.last_error
    }

    pub fn is_relaying_udp(&self) -> bool {
        matches!(self.state, TurnState::Ready | TurnState::Refreshing)
            && self
                .candidates
                .current()
                .is_some_and(|it| it.transport == Transport::Udp)
    }

    pub fn active_server(&self) -> Option<ServerCandidate> {
        self.candidates.current()
    }

    /// the relayed transport address peers send to.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.relayed
    }

    /// the server-reflexive address of this client.
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.reflexive
    }

    pub fn lifetime(&self) -> u32 {
        self.lifetime
    }

    pub fn poll_event(&mut self) -> Option<TurnEvent> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }

        self.requests
            .iter_mut()
            .find_map(|it| it.transaction.poll_transmit())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state == TurnState::Shutdown {
            return None;
        }

        let mut deadline: Option<Instant> = None;
        let mut fold = |candidate: Option<Instant>| {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };

        for request in &self.requests {
            fold(request.transaction.poll_timeout());
        }

        fold(self.refresh_at);
        fold(self.channels.next_refresh());
        fold(
            self.permissions
                .values()
                .filter(|it| it.confirmed)
                .map(|it| it.refresh_at)
                .min(),
        );

        deadline
    }

    /// Advance every clock to `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == TurnState::Shutdown {
            return;
        }

        // drive the outstanding transactions; exhausted ones fail over.
        let mut timed_out = Vec::new();
        self.requests.retain_mut(|request| {
            request.transaction.handle_timeout(now);
            if request.transaction.is_complete() {
                timed_out.push(request.kind.clone());
                false
            } else {
                true
            }
        });

        for kind in timed_out {
            self.handle_request_timeout(kind, now);
        }

        if self.state == TurnState::Shutdown {
            return;
        }

        // allocation refresh at 75% of the lifetime.
        if let Some(refresh_at) = self.refresh_at
            && refresh_at <= now
            && self.state == TurnState::Ready
        {
            self.refresh_at = None;
            self.state_change(TurnState::Refreshing);
            self.issue_refresh(self.lifetime, now);
        }

        // permissions are re-issued every 4 minutes.
        let due: Vec<SocketAddr> = self
            .permissions
            .values()
            .filter(|it| it.confirmed && it.refresh_at <= now)
            .map(|it| it.peer)
            .collect();
        if !due.is_empty() {
            for peer in &due {
                if let Some(permission) = self.permissions.get_mut(&peer.ip()) {
                    permission.confirmed = false;
                }
            }

            self.permission_batch.extend(due);
        }

        self.maybe_issue_permissions(now);

        // channel bindings are refreshed at 9 of their 10 minutes.
        for (peer, number) in self.channels.due_for_refresh(now) {
            // the deadline moves ahead so the in-flight rebind is not
            // re-issued on the next tick.
            self.channels.touch(number, now + config::CHANNEL_BIND_REFRESH);
            self.issue_channel_bind(peer, number, now);
        }
    }

    /// Offer an inbound packet.  Returns true when the packet belonged
    /// to this allocation.
    pub fn handle_input(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        if self.state == TurnState::Shutdown {
            return false;
        }

        // everything this client cares about comes from the active
        // server.
        if !self.candidates.current().is_some_and(|it| it.address == from) {
            return false;
        }

        if bytes.len() < 4 {
            return false;
        }

        match bytes[0] {
            0x00..=0x03 => self.handle_stun(bytes, now),
            0x40..=0x7F => self.handle_channel_data(bytes),
            _ => {
                log::warn!("turn: dropped bogus packet from {from}, first byte {:#x}", bytes[0]);
                false
            }
        }
    }

    /// Relay data to a peer.
    ///
    /// Uses ChannelData framing when the peer has a confirmed channel,
    /// falls back to a Send indication, and transparently installs the
    /// permission first, queueing the payload until the server confirms
    /// it.  With `bind_channel_if_possible` a channel binding is started
    /// on the first send to the peer.
    pub fn send_to(
        &mut self,
        peer: SocketAddr,
        bytes: &[u8],
        bind_channel_if_possible: bool,
        now: Instant,
    ) -> Result<(), SendError> {
        if !matches!(self.state, TurnState::Ready | TurnState::Refreshing) {
            return Err(SendError::NotReady);
        }

        if let Some(binding) = self.channels.get_by_peer(&peer)
            && binding.confirmed
        {
            let mut buf = BytesMut::with_capacity(bytes.len() + 4);
            ChannelData {
                number: binding.number,
                bytes,
            }
            .encode(&mut buf);

            let transmit = self.to_server(buf.freeze());
            self.transmits.push_back(transmit);
            return Ok(());
        }

        let permitted = self
            .permissions
            .get(&peer.ip())
            .is_some_and(|it| it.confirmed);

        if permitted {
            self.send_indication(peer, bytes)?;

            if bind_channel_if_possible
                && self.options.use_channel_binding
                && self.channels.get_by_peer(&peer).is_none()
                && let Some(number) = self
                    .channels
                    .bind(peer, now + config::CHANNEL_BIND_REFRESH)
            {
                self.issue_channel_bind(peer, number, now);
            }

            return Ok(());
        }

        // no permission yet: queue and make sure one is on its way.
        self.queued_sends.entry(peer.ip()).or_default().push((
            peer,
            Bytes::copy_from_slice(bytes),
            bind_channel_if_possible,
        ));
        self.ensure_permission(peer, now);

        Ok(())
    }

    /// Explicitly install a relay permission for `peer` (and any other
    /// peers waiting in the same batch).
    pub fn create_permission(&mut self, peer: SocketAddr, now: Instant) {
        if !matches!(self.state, TurnState::Ready | TurnState::Refreshing) {
            return;
        }

        self.ensure_permission(peer, now);
    }

    /// Bind a channel to `peer` ahead of time.
    pub fn bind_channel(&mut self, peer: SocketAddr, now: Instant) -> Option<u16> {
        if !matches!(self.state, TurnState::Ready | TurnState::Refreshing) {
            return None;
        }

        if let Some(binding) = self.channels.get_by_peer(&peer) {
            return Some(binding.number);
        }

        let number = self.channels.bind(peer, now + config::CHANNEL_BIND_REFRESH)?;
        self.issue_channel_bind(peer, number, now);
        Some(number)
    }

    /// Idempotent: releases the allocation with a zero-lifetime Refresh
    /// and transitions to Shutdown.
    pub fn shutdown(&mut self, now: Instant) {
        match self.state {
            TurnState::Shutdown | TurnState::ShuttingDown => {}
            TurnState::Ready | TurnState::Refreshing => {
                for request in &mut self.requests {
                    request.transaction.cancel();
                }
                self.requests.clear();

                self.state_change(TurnState::ShuttingDown);
                self.issue_refresh(0, now);
            }
            _ => self.terminate(TurnError::UserRequestedShutdown),
        }
    }

    fn start_allocation(&mut self, now: Instant) {
        let Some(candidate) = self.candidates.current() else {
            self.terminate(if self.options.servers.is_empty() {
                TurnError::DnsLookupFailure
            } else {
                TurnError::FailedToConnectToAnyServer
            });
            return;
        };

        // a cached (realm, nonce) skips the discovery round trip.
        if self.auth.is_none()
            && let Some(cache) = &self.options.nonce_cache
            && let Some((realm, nonce)) = cache.get(&candidate.address, now)
        {
            self.auth = Some(self.make_auth(realm, nonce));
        }

        let authenticated = self.auth.is_some();
        self.state_change(if authenticated {
            TurnState::Allocating
        } else {
            TurnState::Discovering
        });

        self.issue_allocate(authenticated, now);
    }

    fn issue_allocate(&mut self, authenticated: bool, now: Instant) {
        let lifetime = self.options.lifetime;
        let dont_fragment = self.options.dont_fragment && self.is_current_udp();
        let request = self.encode(ALLOCATE_REQUEST, authenticated, |encoder| {
            encoder.append::<RequestedTransport>(Transport::Udp);
            if dont_fragment {
                encoder.append::<DontFragment>(());
            }
            if let Some(lifetime) = lifetime {
                encoder.append::<Lifetime>(lifetime);
            }
        });

        self.issue(RequestKind::Allocate { authenticated }, request, now);
    }

    fn issue_refresh(&mut self, lifetime: u32, now: Instant) {
        let request = self.encode(REFRESH_REQUEST, true, |encoder| {
            encoder.append::<Lifetime>(lifetime);
        });

        self.issue(RequestKind::Refresh { lifetime }, request, now);
    }

    fn issue_channel_bind(&mut self, peer: SocketAddr, number: u16, now: Instant) {
        let request = self.encode(CHANNEL_BIND_REQUEST, true, |encoder| {
            encoder.append::<ChannelNumber>(number);
            encoder.append::<XorPeerAddress>(peer);
        });

        self.issue(RequestKind::ChannelBind { peer, number }, request, now);
    }

    fn ensure_permission(&mut self, peer: SocketAddr, now: Instant) {
        if self.permissions.contains_key(&peer.ip()) {
            return;
        }

        self.permissions.insert(
            peer.ip(),
            Permission {
                confirmed: false,
                refresh_at: now + config::PERMISSION_REFRESH,
                peer,
            },
        );
        self.permission_batch.push(peer);
        self.maybe_issue_permissions(now);
    }

    fn maybe_issue_permissions(&mut self, now: Instant) {
        if self.permission_batch.is_empty() {
            return;
        }

        if !matches!(self.state, TurnState::Ready | TurnState::Refreshing) {
            return;
        }

        // one CreatePermission at a time; later arrivals ride the next
        // batch.
        if self
            .requests
            .iter()
            .any(|it| matches!(it.kind, RequestKind::CreatePermission { .. }))
        {
            return;
        }

        let peers = std::mem::take(&mut self.permission_batch);
        let request = self.encode(CREATE_PERMISSION_REQUEST, true, |encoder| {
            for peer in &peers {
                encoder.append::<XorPeerAddress>(*peer);
            }
        });

        self.issue(RequestKind::CreatePermission { peers }, request, now);
    }

    fn send_indication(&mut self, peer: SocketAddr, bytes: &[u8]) -> Result<(), SendError> {
        let dont_fragment = self.options.dont_fragment && self.is_current_udp();
        let tid = generate_tid();
        let mut buf = BytesMut::with_capacity(bytes.len() + 64);

        {
            let mut encoder = MessageEncoder::new(SEND_INDICATION, &tid, &mut buf);
            encoder.append::<XorPeerAddress>(peer);
            if dont_fragment {
                encoder.append::<DontFragment>(());
            }
            encoder.append::<Data>(bytes);
            encoder.flush(None).map_err(|_| SendError::Codec)?;
        }

        let transmit = self.to_server(buf.freeze());
        self.transmits.push_back(transmit);
        Ok(())
    }

    fn handle_stun(&mut self, bytes: &[u8], now: Instant) -> bool {
        let mut attributes = Attributes::default();
        let Ok(message) = Message::decode(bytes, &mut attributes) else {
            log::warn!("turn: undecodable stun packet from server");
            return false;
        };

        if message.method() == DATA_INDICATION {
            let (Some(peer), Some(data)) =
                (message.get::<XorPeerAddress>(), message.get::<Data>())
            else {
                return true;
            };

            self.events.push_back(TurnEvent::Data {
                peer,
                bytes: Bytes::copy_from_slice(data),
            });
            return true;
        }

        if !message.method().is_response() {
            return false;
        }

        let Some(at) = self
            .requests
            .iter()
            .position(|it| it.transaction.matches(message.token()))
        else {
            return false;
        };

        // success responses are integrity protected once we have a
        // credential; a forged one is dropped, the transaction keeps
        // retransmitting.
        if !message.method().is_error()
            && let Some(auth) = &self.auth
            && message.checksum(&auth.password).is_err()
        {
            log::warn!("turn: response failed the integrity check");
            return true;
        }

        let mut request = self.requests.remove(at);
        request.transaction.succeed();

        if message.method().is_error() {
            self.handle_error_response(request, &message, now);
        } else {
            self.handle_success_response(request.kind, &message, now);
        }

        true
    }

    fn handle_success_response(&mut self, kind: RequestKind, message: &Message, now: Instant) {
        match kind {
            RequestKind::Allocate { .. } => {
                self.relayed = message.get::<XorRelayedAddress>();
                self.reflexive = message.get::<XorMappedAddress>();
                self.lifetime = message
                    .get::<Lifetime>()
                    .unwrap_or(config::DEFAULT_ALLOCATION_LIFETIME);

                self.schedule_refresh(now);
                self.refresh_failures = 0;
                self.state_change(TurnState::Ready);
                self.maybe_issue_permissions(now);
            }
            RequestKind::Refresh { lifetime: 0 } => {
                self.terminate(TurnError::UserRequestedShutdown);
            }
            RequestKind::Refresh { .. } => {
                if let Some(lifetime) = message.get::<Lifetime>() {
                    self.lifetime = lifetime;
                }

                self.schedule_refresh(now);
                self.refresh_failures = 0;
                if self.state == TurnState::Refreshing {
                    self.state_change(TurnState::Ready);
                }
            }
            RequestKind::CreatePermission { peers } => {
                for peer in peers {
                    if let Some(permission) = self.permissions.get_mut(&peer.ip()) {
                        permission.confirmed = true;
                        permission.refresh_at = now + config::PERMISSION_REFRESH;
                    }

                    // flush everything that waited on this permission.
                    if let Some(queued) = self.queued_sends.remove(&peer.ip()) {
                        for (peer, bytes, bind) in queued {
                            let _ = self.send_to(peer, &bytes, bind, now);
                        }
                    }
                }

                self.maybe_issue_permissions(now);
            }
            RequestKind::ChannelBind { number, .. } => {
                self.channels.confirm(number, now + config::CHANNEL_BIND_REFRESH);
            }
        }
    }

    fn handle_error_response(&mut self, request: PendingRequest, message: &Message, now: Instant) {
        let kind = message.get::<ErrorCode>().and_then(|it| it.kind());

        match kind {
            // authentication challenge: learn realm and nonce, retry
            // once with credentials.
            Some(ErrorKind::Unauthorized) => {
                let authenticated =
                    matches!(request.kind, RequestKind::Allocate { authenticated: true });

                if authenticated || self.auth.is_some() && !matches!(request.kind, RequestKind::Allocate { .. }) {
                    // wrong credentials; this server will not have us.
                    self.last_error = Some(TurnError::AuthenticationFailed);
                    self.failover(now);
                    return;
                }

                let (Some(realm), Some(nonce)) =
                    (message.get::<Realm>(), message.get::<Nonce>())
                else {
                    self.failover(now);
                    return;
                };

                self.remember_nonce(realm, nonce, now);
                self.auth = Some(self.make_auth(realm.to_string(), nonce.to_string()));
                self.state_change(TurnState::Allocating);
                self.issue_allocate(true, now);
            }
            // stale nonce: record the new nonce and resend immediately.
            Some(ErrorKind::StaleNonce) if request.stale_retries == 0 => {
                let Some(nonce) = message.get::<Nonce>() else {
                    self.failover(now);
                    return;
                };

                if let Some(auth) = &mut self.auth {
                    auth.nonce = nonce.to_string();
                }
                if let (Some(auth), Some(candidate)) = (&self.auth, self.candidates.current()) {
                    if let Some(cache) = &self.options.nonce_cache {
                        cache.store(
                            candidate.address,
                            &auth.realm,
                            nonce,
                            now + config::NONCE_CACHE_LIFETIME,
                        );
                    }
                }

                self.reissue(request.kind, request.stale_retries + 1, now);
            }
            Some(ErrorKind::TryAlternate) => {
                if let Some(alternate) = message.get::<AlternateServer>() {
                    let transport = self
                        .candidates
                        .current()
                        .map(|it| it.transport)
                        .unwrap_or(Transport::Udp);
                    self.candidates.insert_next(ServerCandidate {
                        address: alternate,
                        transport,
                    });
                }

                self.failover(now);
            }
            _ => match request.kind {
                RequestKind::Allocate { .. } => self.failover(now),
                RequestKind::Refresh { lifetime: 0 } => {
                    // a 437 on shutdown means the allocation is already
                    // gone, which is what we wanted.
                    self.terminate(TurnError::UserRequestedShutdown);
                }
                RequestKind::Refresh { .. } => self.refresh_failed(now),
                RequestKind::CreatePermission { peers } => {
                    log::warn!("turn: create permission rejected: {kind:?}");
                    for peer in peers {
                        self.permissions.remove(&peer.ip());
                        self.queued_sends.remove(&peer.ip());
                    }
                }
                RequestKind::ChannelBind { number, .. } => {
                    log::warn!("turn: channel bind rejected: {kind:?}");
                    self.channels.unbind(number);
                }
            },
        }
    }

    fn handle_request_timeout(&mut self, kind: RequestKind, now: Instant) {
        match kind {
            RequestKind::Allocate { .. } => self.failover(now),
            RequestKind::Refresh { lifetime: 0 } => {
                self.terminate(TurnError::UserRequestedShutdown)
            }
            RequestKind::Refresh { .. } => self.refresh_failed(now),
            RequestKind::CreatePermission { peers } => {
                log::warn!("turn: create permission timed out");
                for peer in peers {
                    self.permissions.remove(&peer.ip());
                    self.queued_sends.remove(&peer.ip());
                }
            }
            RequestKind::ChannelBind { number, .. } => {
                log::warn!("turn: channel bind timed out");
                self.channels.unbind(number);
            }
        }
    }

    /// a Refresh failed; a second consecutive failure gives up on the
    /// allocation.
    fn refresh_failed(&mut self, now: Instant) {
        self.refresh_failures += 1;
        if self.refresh_failures >= 2 {
            self.terminate(TurnError::RefreshTimeout);
            return;
        }

        self.issue_refresh(self.lifetime, now);
    }

    fn failover(&mut self, now: Instant) {
        // credentials are per-server.
        self.auth = None;

        if self.candidates.advance().is_none() {
            self.terminate(TurnError::FailedToConnectToAnyServer);
            return;
        }

        self.start_allocation(now);
    }

    fn handle_channel_data(&mut self, bytes: &[u8]) -> bool {
        let Ok(data) = ChannelData::decode(bytes) else {
            log::warn!("turn: malformed channel data frame");
            return false;
        };

        let Some(binding) = self.channels.get_by_number(data.number()) else {
            log::warn!("turn: channel data for unknown channel {:#x}", data.number());
            return true;
        };

        self.events.push_back(TurnEvent::Data {
            peer: binding.peer,
            bytes: Bytes::copy_from_slice(data.as_bytes()),
        });

        true
    }

    fn reissue(&mut self, kind: RequestKind, stale_retries: u8, now: Instant) {
        match kind {
            RequestKind::Allocate { authenticated } => {
                self.issue_allocate(authenticated, now);
            }
            RequestKind::Refresh { lifetime } => self.issue_refresh(lifetime, now),
            RequestKind::CreatePermission { peers } => {
                self.permission_batch.extend(peers);
                self.maybe_issue_permissions(now);
                return;
            }
            RequestKind::ChannelBind { peer, number } => {
                self.issue_channel_bind(peer, number, now)
            }
        }

        if let Some(request) = self.requests.last_mut() {
            request.stale_retries = stale_retries;
        }
    }

    fn issue(&mut self, kind: RequestKind, request: Option<Bytes>, now: Instant) {
        let Some(candidate) = self.candidates.current() else {
            self.terminate(TurnError::FailedToConnectToAnyServer);
            return;
        };

        let Some(request) = request else {
            log::warn!("turn: failed to encode request");
            self.terminate(TurnError::UnexpectedSocketFailure);
            return;
        };

        self.requests.push(PendingRequest {
            transaction: StunTransaction::new(
                candidate.address,
                request,
                self.options.pattern.clone(),
                now,
            ),
            stale_retries: 0,
            kind,
        });
    }

    fn encode(
        &self,
        method: Method,
        authenticated: bool,
        build: impl FnOnce(&mut MessageEncoder),
    ) -> Option<Bytes> {
        let tid = generate_tid();
        let mut buf = BytesMut::with_capacity(512);

        {
            let mut encoder = MessageEncoder::new(method, &tid, &mut buf);
            if let Some(software) = &self.options.software {
                encoder.append::<Software>(software);
            }

            build(&mut encoder);

            match (authenticated, &self.auth) {
                (true, Some(auth)) => {
                    encoder.append::<UserName>(&self.options.username);
                    encoder.append::<Realm>(&auth.realm);
                    encoder.append::<Nonce>(&auth.nonce);
                    encoder.flush(Some(&auth.password)).ok()?;
                }
                _ => encoder.flush(None).ok()?,
            }
        }

        Some(buf.freeze())
    }

    fn make_auth(&self, realm: String, nonce: String) -> Auth {
        Auth {
            password: Password::long_term(
                &self.options.username,
                &realm,
                &self.options.password,
            ),
            realm,
            nonce,
        }
    }

    fn remember_nonce(&self, realm: &str, nonce: &str, now: Instant) {
        if let (Some(cache), Some(candidate)) =
            (&self.options.nonce_cache, self.candidates.current())
        {
            cache.store(
                candidate.address,
                realm,
                nonce,
                now + config::NONCE_CACHE_LIFETIME,
            );
        }
    }

    fn schedule_refresh(&mut self, now: Instant) {
        // refresh at 75% of the granted lifetime.
        let delay = Duration::from_secs(u64::from(self.lifetime) * 3 / 4);
        self.refresh_at = Some(now + delay);
    }

    fn to_server(&self, payload: Bytes) -> Transmit {
        let destination = self
            .candidates
            .current()
            .map(|it| it.address)
            // unreachable in Ready states, but never panic on it.
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        Transmit {
            destination,
            payload,
        }
    }

    fn is_current_udp(&self) -> bool {
        self.candidates
            .current()
            .is_some_and(|it| it.transport == Transport::Udp)
    }

    fn state_change(&mut self, state: TurnState) {
        if self.state == state {
            return;
        }

        log::debug!("turn: state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.events.push_back(TurnEvent::StateChanged(state));
    }

    fn terminate(&mut self, error: TurnError) {
        if self.state == TurnState::Shutdown {
            return;
        }

        for request in &mut self.requests {
            request.transaction.cancel();
        }

        self.requests.clear();
        self.channels.clear();
        self.permissions.clear();
        self.queued_sends.clear();
        self.permission_batch.clear();
        self.refresh_at = None;
        self.last_error = Some(error);
        self.state_change(TurnState::Shutdown);
    }
}
