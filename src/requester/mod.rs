//! STUN requester and process-wide transaction routing.
//!
//! [`StunTransaction`] is the single-owner retransmission engine that
//! TURN, RUDP and discovery embed directly.  [`StunRequester`] wraps a
//! transaction in a shared handle registered with the
//! [`RequesterManager`] singleton, for callers that receive packets from
//! an arbitrary socket loop and need them routed by transaction id.

pub mod manager;
pub mod transaction;

pub use self::{
    manager::RequesterManager,
    transaction::{StunTransaction, TransactionState},
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use crate::{Transmit, backoff::BackoffPattern};

/// Generate a fresh 96-bit transaction id.
///
/// `rand::rng` is a CSPRNG, so ids are unpredictable and collisions
/// between concurrently live requesters do not occur in practice.
pub fn generate_tid() -> [u8; 12] {
    let mut tid = [0u8; 12];
    rand::rng().fill(&mut tid);
    tid
}

#[derive(Debug, Clone)]
pub enum RequesterEvent {
    /// A packet with our transaction id arrived.  The owner inspects it
    /// and settles the requester with [`StunRequester::accept_response`]
    /// or keeps it retransmitting with
    /// [`StunRequester::reject_response`].
    ResponseReceived { from: SocketAddr, bytes: Bytes },
    /// The schedule was exhausted without an accepted response.
    TimedOut,
}

pub(crate) struct RequesterInner {
    transaction: StunTransaction,
    events: VecDeque<RequesterEvent>,
    timed_out_emitted: bool,
}

impl RequesterInner {
    pub(crate) fn handle_response(&mut self, from: SocketAddr, bytes: &[u8], _now: Instant) -> bool {
        if !self.transaction.matches(&bytes[8..20]) {
            return false;
        }

        self.events.push_back(RequesterEvent::ResponseReceived {
            from,
            bytes: Bytes::copy_from_slice(bytes),
        });

        true
    }

    fn drive(&mut self, now: Instant) {
        self.transaction.handle_timeout(now);
        if self.transaction.state() == TransactionState::TimedOut && !self.timed_out_emitted {
            self.timed_out_emitted = true;
            self.events.push_back(RequesterEvent::TimedOut);
        }
    }
}

/// One outbound STUN request with process-wide response routing.
///
/// The requester registers its transaction id with the global
/// [`RequesterManager`] on construction and unregisters when dropped;
/// it is auto-completed by an accepted response, permanent failure or
/// [`cancel`](Self::cancel).
pub struct StunRequester {
    inner: Arc<Mutex<RequesterInner>>,
    tid: [u8; 12],
}

impl StunRequester {
    /// `request` is a fully encoded STUN message; its transaction id is
    /// taken from the wire bytes.
    pub fn new(server: SocketAddr, request: Bytes, pattern: BackoffPattern, now: Instant) -> Self {
        let transaction = StunTransaction::new(server, request, pattern, now);
        let tid = *transaction.tid();

        let inner = Arc::new(Mutex::new(RequesterInner {
            transaction,
            events: VecDeque::new(),
            timed_out_emitted: false,
        }));

        RequesterManager::global().register(tid, &inner);
        Self { inner, tid }
    }

    pub fn tid(&self) -> &[u8; 12] {
        &self.tid
    }

    pub fn server(&self) -> SocketAddr {
        self.inner.lock().transaction.server()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().transaction.is_complete()
    }

    pub fn total_tries(&self) -> usize {
        self.inner.lock().transaction.total_tries()
    }

    pub fn poll_transmit(&self) -> Option<Transmit> {
        self.inner.lock().transaction.poll_transmit()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.inner.lock().transaction.poll_timeout()
    }

    pub fn handle_timeout(&self, now: Instant) {
        self.inner.lock().drive(now);
    }

    pub fn poll_event(&self) -> Option<RequesterEvent> {
        self.inner.lock().events.pop_front()
    }

    /// The response was valid for this request; the requester completes
    /// and stops retransmitting.
    pub fn accept_response(&self) {
        self.inner.lock().transaction.succeed();
    }

    /// The response did not settle the request; retransmission
    /// continues on the schedule.
    pub fn reject_response(&self) {}

    /// Skip the rest of a retry-after wait.
    pub fn retry_request_now(&self, now: Instant) {
        self.inner.lock().transaction.retry_now(now);
    }

    pub fn cancel(&self) {
        self.inner.lock().transaction.cancel();
    }
}

impl Drop for StunRequester {
    fn drop(&mut self) {
        self.inner.lock().transaction.cancel();
        RequesterManager::global().unregister(&self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;
    use codec::message::{MessageEncoder, methods::BINDING_REQUEST};

    fn request(tid: &[u8; 12]) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        MessageEncoder::new(BINDING_REQUEST, tid, &mut buf)
            .flush(None)
            .unwrap();
        buf.freeze()
    }

    #[test]
    fn tids_are_unique() {
        let a = generate_tid();
        let b = generate_tid();
        assert_ne!(a, b);
    }

    #[test]
    fn manager_routes_by_transaction_id() {
        let now = Instant::now();
        let server: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        let pattern: BackoffPattern = "/500,1000///".parse().unwrap();

        let tid = generate_tid();
        let requester = StunRequester::new(server, request(&tid), pattern, now);

        // a response-shaped packet with a different id is nobody's.
        let other = request(&generate_tid());
        assert!(!RequesterManager::global().handle_packet(server, &other, now));

        // the matching packet is routed and surfaces as an event.
        let response = request(&tid);
        assert!(RequesterManager::global().handle_packet(server, &response, now));

        match requester.poll_event() {
            Some(RequesterEvent::ResponseReceived { from, .. }) => assert_eq!(from, server),
            other => panic!("unexpected event: {:?}", other.is_some()),
        }

        requester.accept_response();
        assert!(requester.is_complete());

        // once complete, late duplicates are no longer claimed.
        assert!(!RequesterManager::global().handle_packet(server, &response, now));
    }

    #[test]
    fn unregisters_on_drop() {
        let now = Instant::now();
        let server: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        let pattern: BackoffPattern = "/500///".parse().unwrap();

        let tid = generate_tid();
        let response = request(&tid);

        {
            let _requester = StunRequester::new(server, request(&tid), pattern, now);
            assert!(RequesterManager::global().handle_packet(server, &response, now));
        }

        assert!(!RequesterManager::global().handle_packet(server, &response, now));
    }
}
