use bytes::Bytes;

use std::{net::SocketAddr, time::Instant};

use crate::{
    Transmit,
    backoff::{BackoffPattern, BackoffState, BackoffTimer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// retransmitting on the pattern schedule.
    Running,
    Succeeded,
    TimedOut,
    Cancelled,
}

impl TransactionState {
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One outstanding STUN request.
///
/// The transaction owns the encoded request bytes and a back-off timer;
/// it retransmits whenever the timer reaches AttemptNow and reports
/// TimedOut when the schedule is exhausted.  A response is matched by
/// transaction id through [`matches`](Self::matches) whatever the timer
/// state, so late replies arriving during a retry-after wait are
/// consumed exactly like replies during an attempt.
#[derive(Debug)]
pub struct StunTransaction {
    tid: [u8; 12],
    server: SocketAddr,
    request: Bytes,
    timer: BackoffTimer,
    total_tries: usize,
    pending_send: bool,
    state: TransactionState,
}

impl StunTransaction {
    /// Start the transaction: the first attempt is armed and the request
    /// is queued for transmission immediately.
    pub fn new(server: SocketAddr, request: Bytes, pattern: BackoffPattern, now: Instant) -> Self {
        let mut tid = [0u8; 12];
        if let Some(bytes) = request.get(8..20) {
            tid.copy_from_slice(bytes);
        }

        let mut timer = BackoffTimer::new(pattern);
        timer.notify_attempting(now);

        Self {
            state: TransactionState::Running,
            pending_send: true,
            total_tries: 1,
            request,
            server,
            timer,
            tid,
        }
    }

    pub fn tid(&self) -> &[u8; 12] {
        &self.tid
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn request(&self) -> &Bytes {
        &self.request
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// how many times the request has been put on the wire.
    pub fn total_tries(&self) -> usize {
        self.total_tries
    }

    /// whether a packet with this transaction id belongs to us and we
    /// are still interested in it.
    pub fn matches(&self, token: &[u8]) -> bool {
        self.state == TransactionState::Running && token == self.tid
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if self.state != TransactionState::Running || !self.pending_send {
            return None;
        }

        self.pending_send = false;
        Some(Transmit {
            destination: self.server,
            payload: self.request.clone(),
        })
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        (self.state == TransactionState::Running)
            .then(|| self.timer.poll_timeout())
            .flatten()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state != TransactionState::Running {
            return;
        }

        self.timer.handle_timeout(now);
        self.drive(now);
    }

    /// Skip the rest of a retry-after wait and retransmit immediately.
    pub fn retry_now(&mut self, now: Instant) {
        if self.state != TransactionState::Running {
            return;
        }

        self.timer.notify_try_again_now();
        self.drive(now);
    }

    /// The owner accepted a response; terminal.
    pub fn succeed(&mut self) {
        if self.state == TransactionState::Running {
            self.timer.notify_succeeded();
            self.state = TransactionState::Succeeded;
        }
    }

    pub fn cancel(&mut self) {
        if self.state == TransactionState::Running {
            self.timer.cancel();
            self.state = TransactionState::Cancelled;
        }
    }

    fn drive(&mut self, now: Instant) {
        while let Some(state) = self.timer.poll_state_change() {
            match state {
                BackoffState::AttemptNow => {
                    self.timer.notify_attempting(now);
                    self.pending_send = true;
                    self.total_tries += 1;
                }
                BackoffState::AllFailed => {
                    self.state = TransactionState::TimedOut;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;
    use codec::message::{MessageEncoder, methods::BINDING_REQUEST};

    use std::time::Duration;

    fn request() -> Bytes {
        let token = [7u8; 12];
        let mut buf = BytesMut::with_capacity(128);
        MessageEncoder::new(BINDING_REQUEST, &token, &mut buf)
            .flush(None)
            .unwrap();
        buf.freeze()
    }

    #[test]
    fn retransmits_on_schedule_until_exhausted() {
        let now = Instant::now();
        let server = "127.0.0.1:3478".parse().unwrap();
        let pattern = "/500,1000,1500,2000,2500///".parse().unwrap();
        let mut transaction = StunTransaction::new(server, request(), pattern, now);

        // the first send is queued immediately, then one per schedule
        // step.
        assert!(transaction.poll_transmit().is_some());
        assert!(transaction.poll_transmit().is_none());

        let mut now = now;
        for _ in 0..4 {
            now = transaction.poll_timeout().unwrap();
            transaction.handle_timeout(now);
            assert!(transaction.poll_transmit().is_some());
        }

        assert_eq!(transaction.total_tries(), 5);

        // the fifth attempt times out, the schedule is done.
        now = transaction.poll_timeout().unwrap();
        transaction.handle_timeout(now);
        assert_eq!(transaction.state(), TransactionState::TimedOut);
        assert!(transaction.poll_transmit().is_none());
        assert!(transaction.poll_timeout().is_none());
    }

    #[test]
    fn late_response_matches_while_waiting() {
        let now = Instant::now();
        let server = "127.0.0.1:3478".parse().unwrap();
        let pattern = "/100,200/5000/3/".parse().unwrap();
        let mut transaction = StunTransaction::new(server, request(), pattern, now);

        // the first attempt times out, we are in the retry-after wait.
        transaction.handle_timeout(now + Duration::from_millis(100));
        assert!(transaction.matches(&[7u8; 12]));
        assert!(!transaction.matches(&[8u8; 12]));

        transaction.succeed();
        assert!(transaction.is_complete());
        assert!(!transaction.matches(&[7u8; 12]));
    }
}
