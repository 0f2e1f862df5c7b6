use bytes::{Bytes, BytesMut};
use rand::Rng;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::{
    crypto::Password,
    data_frame::DataFrame,
    message::{
        Message, MessageEncoder,
        attributes::{
            AckVector, ChannelNumber, CongestionControl, Data, ErrorCode, ErrorKind, Gsnfr, Gsnr,
            NextSequenceNumber, Nonce, Realm, ReliabilityFlags, UserName,
            reliability_flags::{ACK_ONLY, COMPACT_FRAMING, FIN, KEEP_ALIVE},
        },
        methods::{CHANNEL_OPEN_REQUEST, CHANNEL_TRANSFER_INDICATION, Method, MethodType},
    },
};

use super::{rto::RtoEstimator, sequence::Seq};
use crate::{
    Transmit,
    backoff::BackoffPattern,
    config::RudpConfig,
    requester::{StunTransaction, generate_tid},
};

/// receive buffer cap: packets buffered ahead of the in-order point.
const RECV_BUFFER_LIMIT: usize = 1024;
/// hard window bound from the sequence space.
const SEQ_WINDOW: u32 = 1 << 23;
/// flow control cap on outstanding packets.
const WINDOW_LIMIT: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpState {
    /// channel-open request in flight, unauthenticated.
    Connecting,
    /// re-issuing the open with credentials after the challenge.
    Negotiating,
    Connected,
    /// FIN sent, waiting for the peer acknowledgement.
    ShuttingDown,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpError {
    OpenTimedOut,
    OpenRejected,
    /// the peer violated an invariant; the channel is unusable.
    ProtocolViolation,
    Cancelled,
}

impl std::error::Error for RudpError {}

impl std::fmt::Display for RudpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpEvent {
    StateChanged(RudpState),
}

/// Which wire form the data path uses, decided at channel open: compact
/// frames when both sides advertise the capability, STUN indications
/// otherwise.  Inbound, both are always accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Stun,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RudpChannelConfig {
    pub prefer_compact: bool,
    pub timing: RudpConfig,
    pub pattern: BackoffPattern,
}

impl Default for RudpChannelConfig {
    fn default() -> Self {
        Self {
            prefer_compact: true,
            timing: RudpConfig::default(),
            pattern: BackoffPattern::parse(crate::backoff::DEFAULT_PATTERN).unwrap_or_default(),
        }
    }
}

struct SentPacket {
    seq: Seq,
    flags: u8,
    payload: Bytes,
    sent_at: Instant,
    retransmitted: bool,
    fast_retransmitted: bool,
    acked: bool,
}

struct OpenHandshake {
    transaction: StunTransaction,
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
    stale_retried: bool,
}

/// One reliable, in-order channel over a datagram transport.
///
/// Delivery to the application through [`read`](Self::read) is strict
/// in sender order; the wire side retransmits on the estimated RTO,
/// acknowledges with a GSNR-anchored 64-bit vector and keeps the path
/// warm when idle.
pub struct RudpChannel {
    state: RudpState,
    last_error: Option<RudpError>,
    remote: SocketAddr,
    local_channel: u16,
    remote_channel: u16,
    framing: Framing,
    config: RudpChannelConfig,
    keep_alive: Duration,
    delayed_ack: Duration,
    open: Option<OpenHandshake>,

    // send side
    send_next: Seq,
    send_base: Seq,
    send_buf: VecDeque<SentPacket>,
    queued: VecDeque<(u8, Bytes)>,
    cwnd: u32,
    acked_since_increase: u32,
    rto: RtoEstimator,
    rto_deadline: Option<Instant>,
    probe_deadline: Option<Instant>,
    fin_seq: Option<Seq>,
    fin_deadline: Option<Instant>,

    // receive side
    recv_next: Seq,
    recv_started: bool,
    gsnr: Seq,
    recv_buf: HashMap<u32, (u8, Bytes)>,
    peer_fin: Option<Seq>,
    delayed_ack_at: Option<Instant>,
    inbound: VecDeque<Bytes>,

    last_send: Instant,
    events: VecDeque<RudpEvent>,
    transmits: VecDeque<Transmit>,
}

impl RudpChannel {
    /// Client side: start the channel-open handshake toward `remote`.
    pub fn connect(
        remote: SocketAddr,
        local_channel: u16,
        username: &str,
        password: &str,
        config: RudpChannelConfig,
        now: Instant,
    ) -> Self {
        let mut this = Self::bare(
            remote,
            local_channel,
            0,
            RudpState::Connecting,
            Framing::Stun,
            config,
            now,
        );

        let request = this.encode_open(username, None, None, password);
        this.open = Some(OpenHandshake {
            transaction: StunTransaction::new(
                remote,
                request,
                this.config.pattern.clone(),
                now,
            ),
            username: username.to_string(),
            password: password.to_string(),
            realm: None,
            nonce: None,
            stale_retried: false,
        });

        this
    }

    /// Listener side: the open handshake already completed, the channel
    /// is live.
    pub(crate) fn accept(
        remote: SocketAddr,
        local_channel: u16,
        remote_channel: u16,
        first_remote_seq: Seq,
        compact: bool,
        config: RudpChannelConfig,
        now: Instant,
    ) -> Self {
        let framing = if compact {
            Framing::Compact
        } else {
            Framing::Stun
        };

        let mut this = Self::bare(
            remote,
            local_channel,
            remote_channel,
            RudpState::Connected,
            framing,
            config,
            now,
        );

        this.recv_next = first_remote_seq;
        this.gsnr = first_remote_seq.prev();
        this
    }

    fn bare(
        remote: SocketAddr,
        local_channel: u16,
        remote_channel: u16,
        state: RudpState,
        framing: Framing,
        config: RudpChannelConfig,
        now: Instant,
    ) -> Self {
        let send_next = Seq::new(rand::rng().random::<u32>());
        let timing = &config.timing;

        Self {
            state,
            last_error: None,
            keep_alive: Duration::from_secs(timing.keep_alive),
            delayed_ack: Duration::from_millis(timing.delayed_ack),
            rto: RtoEstimator::new(
                Duration::from_millis(timing.initial_rto),
                Duration::from_millis(timing.min_rto),
                Duration::from_millis(timing.max_rto),
            ),
            cwnd: timing.cwnd_initial.max(1),
            acked_since_increase: 0,
            open: None,
            send_base: send_next,
            send_buf: VecDeque::with_capacity(64),
            queued: VecDeque::new(),
            rto_deadline: None,
            probe_deadline: None,
            fin_seq: None,
            fin_deadline: None,
            recv_next: Seq::default(),
            recv_started: false,
            gsnr: Seq::default(),
            recv_buf: HashMap::with_capacity(64),
            peer_fin: None,
            delayed_ack_at: None,
            inbound: VecDeque::new(),
            last_send: now,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            remote,
            local_channel,
            remote_channel,
            framing,
            config,
            send_next,
        }
    }

    pub fn state(&self) -> RudpState {
        self.state
    }

    pub fn last_error(&self) -> Option<RudpError> {
        self.last_error
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_channel(&self) -> u16 {
        self.local_channel
    }

    pub fn remote_channel(&self) -> u16 {
        self.remote_channel
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// the sequence number the next outgoing data packet will carry.
    pub fn next_sequence(&self) -> Seq {
        self.send_next
    }

    /// the oldest sequence number not yet contiguously acknowledged.
    pub fn send_base(&self) -> Seq {
        self.send_base
    }

    /// whether the open transaction carries this STUN transaction id.
    pub fn matches_token(&self, token: &[u8]) -> bool {
        self.open
            .as_ref()
            .is_some_and(|it| it.transaction.matches(token))
    }

    /// In-order application data, one packet payload at a time.
    pub fn read(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<RudpEvent> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }

        self.open
            .as_mut()
            .and_then(|it| it.transaction.poll_transmit())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state == RudpState::Shutdown {
            return None;
        }

        let keep_alive = (self.state == RudpState::Connected)
            .then(|| self.last_send + self.keep_alive);

        [
            self.open.as_ref().and_then(|it| it.transaction.poll_timeout()),
            self.rto_deadline,
            self.probe_deadline,
            self.delayed_ack_at,
            self.fin_deadline,
            keep_alive,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Queue application data; transmitted as the window allows.
    pub fn send(&mut self, bytes: &[u8], now: Instant) -> Result<(), RudpError> {
        match self.state {
            RudpState::Shutdown | RudpState::ShuttingDown => {
                return Err(self.last_error.unwrap_or(RudpError::Cancelled));
            }
            _ => {}
        }

        self.queued.push_back((0, Bytes::copy_from_slice(bytes)));
        self.pump_send(now);
        Ok(())
    }

    /// Send a FIN and wait one RTO (at most 500 ms) for the peer to
    /// acknowledge before going down.
    pub fn shutdown(&mut self, now: Instant) {
        match self.state {
            RudpState::Shutdown | RudpState::ShuttingDown => {}
            RudpState::Connected => {
                // the FIN bypasses the window so it goes out now.
                let seq = self.transmit_packet(FIN, Bytes::new(), now);
                self.fin_seq = Some(seq);
                self.fin_deadline =
                    Some(now + self.rto.rto().min(Duration::from_millis(500)));
                self.state_change(RudpState::ShuttingDown);
            }
            _ => {
                if let Some(open) = &mut self.open {
                    open.transaction.cancel();
                }

                self.last_error = Some(RudpError::Cancelled);
                self.state_change(RudpState::Shutdown);
            }
        }
    }

    /// Advance every clock.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == RudpState::Shutdown {
            return;
        }

        // channel-open retransmissions and exhaustion.
        if let Some(open) = &mut self.open {
            open.transaction.handle_timeout(now);
            if open.transaction.is_complete() && !matches!(self.state, RudpState::Connected) {
                self.open = None;
                self.fail(RudpError::OpenTimedOut);
                return;
            }
        }

        // retransmission timer: oldest unacked goes again, window
        // halves.
        if let Some(deadline) = self.rto_deadline
            && deadline <= now
        {
            self.retransmit_front(now);
        }

        // the delayed standalone acknowledgement.
        if let Some(deadline) = self.delayed_ack_at
            && deadline <= now
        {
            self.delayed_ack_at = None;
            self.emit_ack(now);
        }

        // closed-window probe.
        if let Some(deadline) = self.probe_deadline
            && deadline <= now
        {
            self.probe_deadline = (!self.queued.is_empty())
                .then(|| now + self.rto.rto());
            self.emit_ack(now);
        }

        // shutdown grace: go down even when the final ACK was lost.
        if let Some(deadline) = self.fin_deadline
            && deadline <= now
        {
            self.fin_deadline = None;
            self.state_change(RudpState::Shutdown);
            return;
        }

        // idle keep-alive, sequence consumed but never delivered.
        if self.state == RudpState::Connected
            && now.saturating_duration_since(self.last_send) >= self.keep_alive
        {
            self.transmit_packet(KEEP_ALIVE, Bytes::new(), now);
        }

        self.pump_send(now);
    }

    /// A STUN message from the remote: open responses on the client
    /// side, transfer indications when STUN framing is in use.
    pub fn handle_message(&mut self, message: &Message, now: Instant) -> bool {
        if self.state == RudpState::Shutdown {
            return false;
        }

        match message.method() {
            Method::ChannelOpen(MethodType::Response) => self.open_succeeded(message, now),
            Method::ChannelOpen(MethodType::Error) => self.open_challenged(message, now),
            Method::ChannelTransferIndication => {
                if message.get::<ChannelNumber>() != Some(self.local_channel) {
                    return false;
                }

                let (Some(seq), Some(gsnr), Some(gsnfr), Some(vector)) = (
                    message.get::<NextSequenceNumber>(),
                    message.get::<Gsnr>(),
                    message.get::<Gsnfr>(),
                    message.get::<AckVector>(),
                ) else {
                    return true;
                };

                let flags = message.get::<ReliabilityFlags>().unwrap_or(0);
                let payload = message.get::<Data>().unwrap_or(&[]);
                self.on_packet(
                    flags,
                    Seq::new(seq),
                    Seq::new(gsnr),
                    Seq::new(gsnfr),
                    vector,
                    payload,
                    now,
                );
                true
            }
            _ => false,
        }
    }

    /// A compact data frame from the remote.
    pub fn handle_frame(&mut self, frame: &DataFrame, now: Instant) -> bool {
        if self.state == RudpState::Shutdown || frame.channel != self.local_channel {
            return false;
        }

        self.on_packet(
            frame.flags,
            Seq::new(frame.sequence),
            Seq::new(frame.gsnr),
            Seq::new(frame.gsnfr),
            frame.ack_vector,
            frame.payload,
            now,
        );
        true
    }

    fn open_succeeded(&mut self, message: &Message, now: Instant) -> bool {
        let Some(open) = &mut self.open else {
            return false;
        };

        if !open.transaction.matches(message.token()) {
            return false;
        }

        // once the realm is known the response must carry a valid
        // integrity attribute.
        if let Some(realm) = &open.realm {
            let password = Password::long_term(&open.username, realm, &open.password);
            if message.checksum(&password).is_err() {
                log::warn!("rudp: open response failed the integrity check");
                return true;
            }
        }

        let (Some(remote_channel), Some(first_seq)) = (
            message.get::<ChannelNumber>(),
            message.get::<NextSequenceNumber>(),
        ) else {
            open.transaction.succeed();
            self.open = None;
            self.fail(RudpError::ProtocolViolation);
            return true;
        };

        let peer_flags = message.get::<ReliabilityFlags>().unwrap_or(0);

        open.transaction.succeed();
        self.open = None;
        self.remote_channel = remote_channel;
        self.recv_next = Seq::new(first_seq);
        self.gsnr = self.recv_next.prev();
        self.framing = if self.config.prefer_compact && peer_flags & COMPACT_FRAMING != 0 {
            Framing::Compact
        } else {
            Framing::Stun
        };

        self.state_change(RudpState::Connected);
        self.pump_send(now);
        true
    }

    fn open_challenged(&mut self, message: &Message, now: Instant) -> bool {
        let Some(open) = &mut self.open else {
            return false;
        };

        if !open.transaction.matches(message.token()) {
            return false;
        }

        let kind = message.get::<ErrorCode>().and_then(|it| it.kind());
        match kind {
            Some(ErrorKind::Unauthorized) if open.realm.is_none() => {
                let (Some(realm), Some(nonce)) =
                    (message.get::<Realm>(), message.get::<Nonce>())
                else {
                    self.open = None;
                    self.fail(RudpError::OpenRejected);
                    return true;
                };

                open.transaction.succeed();
                open.realm = Some(realm.to_string());
                open.nonce = Some(nonce.to_string());
                self.reissue_open(now);
                self.state_change(RudpState::Negotiating);
            }
            Some(ErrorKind::StaleNonce) if !open.stale_retried => {
                let Some(nonce) = message.get::<Nonce>() else {
                    self.open = None;
                    self.fail(RudpError::OpenRejected);
                    return true;
                };

                open.transaction.succeed();
                open.nonce = Some(nonce.to_string());
                open.stale_retried = true;
                self.reissue_open(now);
            }
            _ => {
                self.open = None;
                self.fail(RudpError::OpenRejected);
            }
        }

        true
    }

    fn reissue_open(&mut self, now: Instant) {
        let Some(open) = self.open.take() else {
            return;
        };

        let request = self.encode_open(
            &open.username,
            open.realm.as_deref(),
            open.nonce.as_deref(),
            &open.password,
        );

        self.open = Some(OpenHandshake {
            transaction: StunTransaction::new(
                self.remote,
                request,
                self.config.pattern.clone(),
                now,
            ),
            ..open
        });
    }

    fn encode_open(
        &self,
        username: &str,
        realm: Option<&str>,
        nonce: Option<&str>,
        password: &str,
    ) -> Bytes {
        let tid = generate_tid();
        let mut buf = BytesMut::with_capacity(256);

        {
            let mut encoder = MessageEncoder::new(CHANNEL_OPEN_REQUEST, &tid, &mut buf);
            encoder.append::<ChannelNumber>(self.local_channel);
            encoder.append::<NextSequenceNumber>(self.send_next.value());
            encoder.append::<CongestionControl>(vec![0]);
            encoder.append::<ReliabilityFlags>(if self.config.prefer_compact {
                COMPACT_FRAMING
            } else {
                0
            });

            let credential = match (realm, nonce) {
                (Some(realm), Some(nonce)) => {
                    encoder.append::<UserName>(username);
                    encoder.append::<Realm>(realm);
                    encoder.append::<Nonce>(nonce);
                    Some(Password::long_term(username, realm, password))
                }
                _ => None,
            };

            // encoding into a fresh buffer cannot fail.
            if encoder.flush(credential.as_ref()).is_err() {
                log::warn!("rudp: failed to encode channel open");
            }
        }

        buf.freeze()
    }

    fn pump_send(&mut self, now: Instant) {
        if self.state != RudpState::Connected {
            return;
        }

        while self.in_flight() < self.window() {
            let Some((flags, payload)) = self.queued.pop_front() else {
                break;
            };

            self.transmit_packet(flags, payload, now);
        }

        // window closed with data waiting: probe with ACKs every RTO.
        if !self.queued.is_empty() && self.in_flight() >= self.window() {
            if self.probe_deadline.is_none() {
                self.probe_deadline = Some(now + self.rto.rto());
            }
        } else {
            self.probe_deadline = None;
        }
    }

    fn transmit_packet(&mut self, flags: u8, payload: Bytes, now: Instant) -> Seq {
        let seq = self.send_next;
        self.send_next = self.send_next.next();

        self.emit_data(seq, flags, &payload, now);
        self.send_buf.push_back(SentPacket {
            sent_at: now,
            retransmitted: false,
            fast_retransmitted: false,
            acked: false,
            payload,
            flags,
            seq,
        });

        if self.rto_deadline.is_none() {
            self.rto_deadline = Some(now + self.rto.rto());
        }

        seq
    }

    fn retransmit_front(&mut self, now: Instant) {
        let Some(front) = self.send_buf.front_mut() else {
            self.rto_deadline = None;
            return;
        };

        front.retransmitted = true;
        front.sent_at = now;
        let (seq, flags, payload) = (front.seq, front.flags, front.payload.clone());
        self.emit_data(seq, flags, &payload, now);

        // multiplicative decrease.
        self.cwnd = (self.cwnd / 2).max(1);
        self.acked_since_increase = 0;
        self.rto_deadline = Some(now + self.rto.rto());
    }

    fn on_packet(
        &mut self,
        flags: u8,
        seq: Seq,
        gsnr: Seq,
        gsnfr: Seq,
        vector: u64,
        payload: &[u8],
        now: Instant,
    ) {
        self.on_ack(gsnr, gsnfr, vector, now);

        if flags & ACK_ONLY != 0 {
            return;
        }

        // every sequence-consuming packet is acknowledged, wanted or
        // not.
        self.schedule_ack(now);

        // old or duplicate: already delivered, nothing more to do.
        if seq.lt(self.recv_next) {
            return;
        }

        // too far ahead of the in-order point.
        let distance = self.recv_next.distance_to(seq);
        if distance >= SEQ_WINDOW || self.recv_buf.len() >= RECV_BUFFER_LIMIT {
            return;
        }

        if self.gsnr.lt(seq) || !self.recv_started {
            self.gsnr = seq;
        }
        self.recv_started = true;

        if flags & FIN != 0 {
            self.peer_fin = Some(seq);
        }

        if seq == self.recv_next {
            self.accept_in_order(flags, Bytes::copy_from_slice(payload));

            // flush whatever became contiguous.
            while let Some((flags, payload)) = self.recv_buf.remove(&self.recv_next.value()) {
                self.accept_in_order(flags, payload);
            }
        } else {
            // buffered out-of-order; the ack vector marks it received.
            self.recv_buf
                .entry(seq.value())
                .or_insert((flags, Bytes::copy_from_slice(payload)));
        }

        // the peer is done once its FIN position is fully drained.
        if let Some(fin) = self.peer_fin
            && fin.lt(self.recv_next)
            && self.state == RudpState::Connected
        {
            self.emit_ack(now);
            self.state_change(RudpState::Shutdown);
        }
    }

    fn accept_in_order(&mut self, flags: u8, payload: Bytes) {
        self.recv_next = self.recv_next.next();

        // keep-alives and bare FINs consume sequence space but are not
        // application data.
        if flags & (KEEP_ALIVE | FIN) == 0 && !payload.is_empty() {
            self.inbound.push_back(payload);
        }
    }

    fn on_ack(&mut self, gsnr: Seq, gsnfr: Seq, vector: u64, now: Instant) {
        let mut samples = Vec::new();
        let mut newly_acked = 0u32;

        for packet in self.send_buf.iter_mut() {
            if packet.acked {
                continue;
            }

            let in_vector = {
                let i = packet.seq.distance_to(gsnr);
                i < 64 && vector & (1u64 << i) != 0
            };

            if packet.seq.le(gsnfr) || in_vector {
                packet.acked = true;
                newly_acked += 1;
                if !packet.retransmitted {
                    samples.push(now.saturating_duration_since(packet.sent_at));
                }
            }
        }

        // Karn: only never-retransmitted packets feed the estimator.
        for sample in samples {
            self.rto.on_sample(sample);
        }

        // slide the base over the contiguously acknowledged prefix.
        let mut advanced = false;
        while self.send_buf.front().is_some_and(|it| it.acked) {
            let Some(packet) = self.send_buf.pop_front() else {
                break;
            };

            self.send_base = packet.seq.next();
            advanced = true;

            if self.fin_seq == Some(packet.seq) && self.state == RudpState::ShuttingDown {
                self.fin_deadline = None;
                self.state_change(RudpState::Shutdown);
                return;
            }
        }

        if newly_acked > 0 {
            // additive increase, one packet per window's worth of acks.
            self.acked_since_increase += newly_acked;
            if self.acked_since_increase >= self.cwnd {
                self.acked_since_increase = 0;
                self.cwnd = (self.cwnd + 1).min(self.config.timing.cwnd_max.min(WINDOW_LIMIT));
            }
        }

        // fast retransmit: the oldest unacked packet has a gap with at
        // least three acknowledged packets beyond it.
        if let Some(front) = self.send_buf.front()
            && !front.acked
            && !front.fast_retransmitted
        {
            let front_seq = front.seq;
            let newer_acked = self
                .send_buf
                .iter()
                .filter(|it| it.acked && front_seq.lt(it.seq))
                .count();

            if newer_acked >= 3 {
                if let Some(front) = self.send_buf.front_mut() {
                    front.fast_retransmitted = true;
                }

                self.retransmit_front(now);
            }
        }

        // re-arm the retransmission clock for the new oldest packet.
        self.rto_deadline = self
            .send_buf
            .iter()
            .find(|it| !it.acked)
            .map(|it| it.sent_at + self.rto.rto());

        if advanced {
            self.pump_send(now);
        }
    }

    fn schedule_ack(&mut self, now: Instant) {
        if self.delayed_ack_at.is_none() {
            self.delayed_ack_at = Some(now + self.delayed_ack);
        }
    }

    fn emit_ack(&mut self, now: Instant) {
        self.delayed_ack_at = None;
        self.emit_data(self.send_next, ACK_ONLY, &Bytes::new(), now);
    }

    fn emit_data(&mut self, seq: Seq, flags: u8, payload: &Bytes, now: Instant) {
        if self.remote_channel == 0 {
            return;
        }

        let (gsnr, gsnfr, vector) = self.ack_fields();
        let bytes = match self.framing {
            Framing::Compact => {
                let mut buf = BytesMut::with_capacity(payload.len() + 32);
                DataFrame {
                    channel: self.remote_channel,
                    sequence: seq.value(),
                    gsnr: gsnr.value(),
                    gsnfr: gsnfr.value(),
                    ack_vector: vector,
                    payload: &payload[..],
                    flags,
                }
                .encode(&mut buf);
                buf.freeze()
            }
            Framing::Stun => {
                let tid = generate_tid();
                let mut buf = BytesMut::with_capacity(payload.len() + 96);
                {
                    let mut encoder =
                        MessageEncoder::new(CHANNEL_TRANSFER_INDICATION, &tid, &mut buf);
                    encoder.append::<ChannelNumber>(self.remote_channel);
                    encoder.append::<NextSequenceNumber>(seq.value());
                    encoder.append::<Gsnr>(gsnr.value());
                    encoder.append::<Gsnfr>(gsnfr.value());
                    encoder.append::<AckVector>(vector);
                    encoder.append::<ReliabilityFlags>(flags);
                    if !payload.is_empty() {
                        encoder.append::<Data>(payload);
                    }

                    if encoder.flush(None).is_err() {
                        log::warn!("rudp: failed to encode transfer indication");
                        return;
                    }
                }
                buf.freeze()
            }
        };

        // any outgoing packet carries the ack fields, so a pending
        // standalone ack becomes redundant.
        if flags & ACK_ONLY == 0 {
            self.delayed_ack_at = None;
        }

        self.last_send = now;
        self.transmits.push_back(Transmit {
            destination: self.remote,
            payload: bytes,
        });
    }

    /// acknowledgement fields describing our receive state.
    fn ack_fields(&self) -> (Seq, Seq, u64) {
        let gsnfr = self.recv_next.prev();
        if !self.recv_started {
            return (gsnfr, gsnfr, 0);
        }

        let mut vector = 0u64;
        for i in 0..64u32 {
            let seq = self.gsnr.sub(i);
            let received =
                seq.lt(self.recv_next) || self.recv_buf.contains_key(&seq.value());
            if received {
                vector |= 1 << i;
            }
        }

        (self.gsnr, gsnfr, vector)
    }

    fn in_flight(&self) -> u32 {
        self.send_buf.iter().filter(|it| !it.acked).count() as u32
    }

    fn window(&self) -> u32 {
        self.cwnd.min(self.config.timing.cwnd_max).min(WINDOW_LIMIT)
    }

    fn fail(&mut self, error: RudpError) {
        self.last_error = Some(error);
        self.state_change(RudpState::Shutdown);
    }

    fn state_change(&mut self, state: RudpState) {
        if self.state == state {
            return;
        }

        log::debug!(
            "rudp: channel {:#x} {:?} -> {:?}",
            self.local_channel,
            self.state,
            state
        );
        self.state = state;
        self.events.push_back(RudpEvent::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(channel: u16, sequence: u32, payload: &[u8]) -> DataFrame<'_> {
        DataFrame {
            flags: 0,
            gsnr: 0,
            gsnfr: 0,
            ack_vector: 0,
            channel,
            sequence,
            payload,
        }
    }

    fn accepted(first_remote_seq: u32, now: Instant) -> RudpChannel {
        RudpChannel::accept(
            "10.0.0.9:9000".parse().unwrap(),
            0x4000,
            0x4001,
            Seq::new(first_remote_seq),
            true,
            RudpChannelConfig::default(),
            now,
        )
    }

    #[test]
    fn ack_vector_evaluates_across_the_sequence_wrap() {
        let now = Instant::now();
        let mut channel = accepted(0x00FF_FFFF, now);

        // the packet right before the wrap arrives in order, the one at
        // zero is lost, the one after is buffered.
        assert!(channel.handle_frame(&data(0x4000, 0x00FF_FFFF, b"a"), now));
        assert!(channel.handle_frame(&data(0x4000, 1, b"c"), now));

        let (gsnr, gsnfr, vector) = channel.ack_fields();
        assert_eq!(gsnr.value(), 1);
        assert_eq!(gsnfr.value(), 0x00FF_FFFF);
        // bit 0 the buffered packet, bit 1 the hole at zero, bit 2 the
        // delivered packet from before the wrap.
        assert_eq!(vector & 0b111, 0b101);

        // the hole fills and everything is delivered in sender order.
        assert!(channel.handle_frame(&data(0x4000, 0, b"b"), now));
        assert_eq!(&channel.read().unwrap()[..], b"a");
        assert_eq!(&channel.read().unwrap()[..], b"b");
        assert_eq!(&channel.read().unwrap()[..], b"c");
        assert!(channel.read().is_none());

        let (_, gsnfr, _) = channel.ack_fields();
        assert_eq!(gsnfr.value(), 1);
    }

    #[test]
    fn out_of_window_packets_are_dropped_but_acknowledged() {
        let now = Instant::now();
        let mut channel = accepted(100, now);

        assert!(channel.handle_frame(&data(0x4000, 100, b"ok"), now));
        assert_eq!(&channel.read().unwrap()[..], b"ok");

        // way beyond the half-space window: dropped, ack still owed.
        let far = (101 + SEQ_WINDOW) & 0x00FF_FFFF;
        assert!(channel.handle_frame(&data(0x4000, far, b"no"), now));
        assert!(channel.read().is_none());
        assert!(channel.poll_timeout().is_some_and(|it| it <= now + channel.delayed_ack));

        // duplicates are dropped silently but acknowledged too.
        assert!(channel.handle_frame(&data(0x4000, 100, b"ok"), now));
        assert!(channel.read().is_none());
    }
}
