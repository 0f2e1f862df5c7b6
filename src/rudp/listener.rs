use bytes::{Bytes, BytesMut};
use rand::{Rng, distr::Alphanumeric};

use std::{
    collections::VecDeque,
    net::SocketAddr,
    ops::RangeInclusive,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::{
    Attributes,
    crypto::Password,
    data_frame::DataFrame,
    message::{
        Message, MessageEncoder,
        attributes::{
            ChannelNumber, ErrorAttr, ErrorCode, ErrorKind, MessageIntegrity,
            NextSequenceNumber, Nonce, Realm, ReliabilityFlags, UserName,
            reliability_flags::COMPACT_FRAMING,
        },
        methods::{CHANNEL_OPEN_ERROR, CHANNEL_OPEN_RESPONSE, Method, MethodType},
    },
};

use super::{
    channel::{RudpChannel, RudpChannelConfig, RudpState},
    sequence::Seq,
};
use crate::{Transmit, config};

const NONCE_LIFETIME: Duration = Duration::from_secs(600);
const NONCE_LENGTH: usize = 16;

/// Who a channel talks to: the remote transport address and our local
/// channel number, which the remote stamps on every frame it sends us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub remote: SocketAddr,
    pub local_channel: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// an authenticated channel-open is waiting for the application to
    /// [`accept`](RudpListener::accept) or
    /// [`reject`](RudpListener::reject) it.
    ChannelWaiting {
        remote: SocketAddr,
        remote_channel: u16,
        username: String,
    },
    ChannelStateChanged { id: ChannelId, state: RudpState },
}

/// Supplies the long-term credential for a username within our realm.
pub trait CredentialProvider {
    fn password(&self, username: &str, realm: &str) -> Option<Password>;
}

pub struct RudpListenerOptions<T> {
    pub realm: String,
    pub credentials: T,
    pub channel_range: RangeInclusive<u16>,
    pub channel: RudpChannelConfig,
}

struct PendingOpen {
    token: [u8; 12],
    remote_channel: u16,
    first_seq: Seq,
    peer_flags: u8,
    username: String,
    password: Password,
    /// cached success response, replayed on request retransmissions.
    response: Option<Bytes>,
}

/// Reliable-channel endpoint for one local socket.
///
/// Owns every channel, inbound and outbound, multiplexing datagrams by
/// (remote address, local channel number) and running the nonce/realm
/// handshake for fresh channel opens.
pub struct RudpListener<T> {
    options: RudpListenerOptions<T>,
    channels: HashMap<ChannelId, RudpChannel>,
    pending: HashMap<(SocketAddr, u16), PendingOpen>,
    nonces: HashMap<SocketAddr, (String, Instant)>,
    next_channel: u16,
    events: VecDeque<ListenerEvent>,
    transmits: VecDeque<Transmit>,
}

impl<T: CredentialProvider> RudpListener<T> {
    pub fn new(options: RudpListenerOptions<T>) -> Self {
        Self {
            channels: HashMap::with_capacity(16),
            pending: HashMap::with_capacity(4),
            nonces: HashMap::with_capacity(16),
            next_channel: *options.channel_range.start(),
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            options,
        }
    }

    /// Open an outbound channel toward `remote`.
    ///
    /// Returns `None` when no channel number is free for that remote.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        username: &str,
        password: &str,
        now: Instant,
    ) -> Option<ChannelId> {
        let local_channel = self.allocate_channel(remote)?;
        let channel = RudpChannel::connect(
            remote,
            local_channel,
            username,
            password,
            self.options.channel.clone(),
            now,
        );

        let id = ChannelId {
            remote,
            local_channel,
        };
        self.channels.insert(id, channel);
        Some(id)
    }

    /// Accept a waiting channel open; the success response goes out and
    /// the channel becomes connected.
    pub fn accept(
        &mut self,
        remote: SocketAddr,
        remote_channel: u16,
        now: Instant,
    ) -> Option<ChannelId> {
        let local_channel = self.allocate_channel(remote)?;
        let pending = self.pending.get_mut(&(remote, remote_channel))?;

        let compact = self.options.channel.prefer_compact
            && pending.peer_flags & COMPACT_FRAMING != 0;

        let channel = RudpChannel::accept(
            remote,
            local_channel,
            remote_channel,
            pending.first_seq,
            compact,
            self.options.channel.clone(),
            now,
        );

        // the response answers the open request: our channel number and
        // our first sequence number.
        let mut buf = BytesMut::with_capacity(256);
        {
            let mut encoder =
                MessageEncoder::new(CHANNEL_OPEN_RESPONSE, &pending.token, &mut buf);
            encoder.append::<ChannelNumber>(local_channel);
            encoder.append::<NextSequenceNumber>(channel.next_sequence().value());
            encoder.append::<ReliabilityFlags>(if self.options.channel.prefer_compact {
                COMPACT_FRAMING
            } else {
                0
            });

            if encoder.flush(Some(&pending.password)).is_err() {
                log::warn!("rudp: failed to encode open response");
                return None;
            }
        }

        log::debug!(
            "rudp: accepted channel open from {remote} for {:?}",
            pending.username
        );

        let response = buf.freeze();
        pending.response = Some(response.clone());
        self.transmits.push_back(Transmit {
            destination: remote,
            payload: response,
        });

        let id = ChannelId {
            remote,
            local_channel,
        };
        self.channels.insert(id, channel);
        self.events.push_back(ListenerEvent::ChannelStateChanged {
            id,
            state: RudpState::Connected,
        });

        Some(id)
    }

    /// Turn a waiting channel open down with a 403.
    pub fn reject(&mut self, remote: SocketAddr, remote_channel: u16) {
        let Some(pending) = self.pending.remove(&(remote, remote_channel)) else {
            return;
        };

        let mut buf = BytesMut::with_capacity(128);
        {
            let mut encoder = MessageEncoder::new(CHANNEL_OPEN_ERROR, &pending.token, &mut buf);
            encoder.append::<ErrorCode>(ErrorAttr::from(ErrorKind::Forbidden));
            if encoder.flush(None).is_err() {
                return;
            }
        }

        self.transmits.push_back(Transmit {
            destination: remote,
            payload: buf.freeze(),
        });
    }

    pub fn channel(&self, id: &ChannelId) -> Option<&RudpChannel> {
        self.channels.get(id)
    }

    pub fn channel_mut(&mut self, id: &ChannelId) -> Option<&mut RudpChannel> {
        self.channels.get_mut(id)
    }

    pub fn poll_event(&mut self) -> Option<ListenerEvent> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }

        self.channels
            .values_mut()
            .find_map(|it| it.poll_transmit())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.channels.values().filter_map(|it| it.poll_timeout()).min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for channel in self.channels.values_mut() {
            channel.handle_timeout(now);
        }

        self.sweep();
    }

    /// Idempotent: shut every channel down.
    pub fn shutdown(&mut self, now: Instant) {
        for channel in self.channels.values_mut() {
            channel.shutdown(now);
        }

        self.pending.clear();
        self.sweep();
    }

    /// Classify and route one inbound datagram.
    pub fn handle_input(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        if bytes.len() < 4 {
            return false;
        }

        let handled = match bytes[0] {
            0x00..=0x03 => self.handle_stun(from, bytes, now),
            0x40..=0x7F => self.handle_data_frame(from, bytes, now),
            _ => {
                log::warn!("rudp: dropped non-protocol packet from {from}");
                false
            }
        };

        self.sweep();
        handled
    }

    fn handle_stun(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        let mut attributes = Attributes::default();
        let Ok(message) = Message::decode(bytes, &mut attributes) else {
            log::warn!("rudp: undecodable stun packet from {from}");
            return false;
        };

        match message.method() {
            Method::ChannelOpen(MethodType::Request) => {
                self.handle_open(from, &message, now);
                true
            }
            Method::ChannelOpen(MethodType::Response)
            | Method::ChannelOpen(MethodType::Error) => {
                // client-side open transactions are matched by token.
                for channel in self.channels.values_mut() {
                    if channel.remote_address() == from
                        && channel.matches_token(message.token())
                    {
                        return channel.handle_message(&message, now);
                    }
                }

                false
            }
            Method::ChannelTransferIndication => {
                let Some(number) = message.get::<ChannelNumber>() else {
                    return false;
                };

                let id = ChannelId {
                    remote: from,
                    local_channel: number,
                };
                match self.channels.get_mut(&id) {
                    Some(channel) => channel.handle_message(&message, now),
                    None => {
                        log::warn!("rudp: transfer for unknown channel {number:#x} from {from}");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn handle_data_frame(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        let Ok(frame) = DataFrame::decode(bytes) else {
            log::warn!("rudp: malformed data frame from {from}");
            return false;
        };

        let id = ChannelId {
            remote: from,
            local_channel: frame.channel,
        };
        match self.channels.get_mut(&id) {
            Some(channel) => channel.handle_frame(&frame, now),
            None => {
                log::warn!(
                    "rudp: data frame for unknown channel {:#x} from {from}",
                    frame.channel
                );
                false
            }
        }
    }

    fn handle_open(&mut self, from: SocketAddr, message: &Message, now: Instant) {
        let Some(remote_channel) = message.get::<ChannelNumber>() else {
            return;
        };

        // a retransmission of an accepted open replays the response.
        if let Some(pending) = self.pending.get(&(from, remote_channel)) {
            if let Some(response) = &pending.response {
                self.transmits.push_back(Transmit {
                    destination: from,
                    payload: response.clone(),
                });
            }

            return;
        }

        let Some(first_seq) = message.get::<NextSequenceNumber>() else {
            return;
        };

        // an unauthenticated open gets the realm/nonce challenge.
        let (Some(username), Some(_)) =
            (message.get::<UserName>(), message.get::<MessageIntegrity>())
        else {
            self.challenge(from, message, ErrorKind::Unauthorized, now);
            return;
        };

        // the nonce must be the one we handed this remote, and fresh.
        let fresh = self
            .nonces
            .get(&from)
            .filter(|(_, expires)| *expires > now)
            .is_some_and(|(nonce, _)| message.get::<Nonce>() == Some(nonce.as_str()));
        if !fresh {
            self.challenge(from, message, ErrorKind::StaleNonce, now);
            return;
        }

        let Some(password) = self
            .options
            .credentials
            .password(username, &self.options.realm)
        else {
            self.challenge(from, message, ErrorKind::Unauthorized, now);
            return;
        };

        if message.checksum(&password).is_err() {
            log::warn!("rudp: open from {from} failed the integrity check");
            return;
        }

        self.pending.insert(
            (from, remote_channel),
            PendingOpen {
                token: message.token().try_into().unwrap_or_default(),
                first_seq: Seq::new(first_seq),
                peer_flags: message.get::<ReliabilityFlags>().unwrap_or(0),
                username: username.to_string(),
                response: None,
                remote_channel,
                password,
            },
        );

        self.events.push_back(ListenerEvent::ChannelWaiting {
            remote: from,
            remote_channel,
            username: username.to_string(),
        });
    }

    fn challenge(&mut self, from: SocketAddr, message: &Message, kind: ErrorKind, now: Instant) {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        self.nonces
            .insert(from, (nonce.clone(), now + NONCE_LIFETIME));

        let Ok(token) = <[u8; 12]>::try_from(message.token()) else {
            return;
        };

        let mut buf = BytesMut::with_capacity(192);
        {
            let mut encoder = MessageEncoder::new(CHANNEL_OPEN_ERROR, &token, &mut buf);
            encoder.append::<ErrorCode>(ErrorAttr::from(kind));
            encoder.append::<Realm>(&self.options.realm);
            encoder.append::<Nonce>(&nonce);
            if encoder.flush(None).is_err() {
                return;
            }
        }

        self.transmits.push_back(Transmit {
            destination: from,
            payload: buf.freeze(),
        });
    }

    /// Allocate a local channel number not currently used with this
    /// remote address.
    fn allocate_channel(&mut self, remote: SocketAddr) -> Option<u16> {
        let range = self.options.channel_range.clone();
        let size = (*range.end() - *range.start()) as usize + 1;

        for _ in 0..size {
            let candidate = self.next_channel;
            self.next_channel = if candidate == *range.end() {
                *range.start()
            } else {
                candidate + 1
            };

            let id = ChannelId {
                remote,
                local_channel: candidate,
            };
            if !self.channels.contains_key(&id) {
                return Some(candidate);
            }
        }

        None
    }

    /// Remove a channel, typically after observing its Shutdown state
    /// and draining any remaining reads.
    pub fn remove(&mut self, id: &ChannelId) -> Option<RudpChannel> {
        let channel = self.channels.remove(id)?;
        self.pending
            .retain(|key, _| !(key.0 == id.remote && key.1 == channel.remote_channel()));
        Some(channel)
    }

    /// Surface channel state changes as listener events.
    fn sweep(&mut self) {
        for (id, channel) in self.channels.iter_mut() {
            while let Some(event) = channel.poll_event() {
                let super::channel::RudpEvent::StateChanged(state) = event;
                self.events
                    .push_back(ListenerEvent::ChannelStateChanged { id: *id, state });
            }
        }
    }
}

/// default listener channel range.
pub fn default_channel_range() -> RangeInclusive<u16> {
    config::DEFAULT_CHANNEL_RANGE
}
