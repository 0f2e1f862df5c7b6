use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use super::BackoffPattern;

/// State of a back-off timer.
///
/// ```text
/// AttemptNow -> Attempting -> WaitingAfterFailure -> AttemptNow -> ..
///                   |    \                      \
///                   |     `-> Succeeded          `-> AllFailed
/// ```
///
/// Transitions are driven only by the explicit `notify_*` calls or by
/// elapsed time from the attempt-timeout and retry-after clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// an attempt should be started now.
    AttemptNow,
    /// an attempt is running against its attempt-timeout clock.
    Attempting,
    /// the last attempt failed, the retry-after clock is running.
    WaitingAfterFailure,
    /// terminal, `notify_succeeded` was called.
    Succeeded,
    /// terminal, the schedule is exhausted.
    AllFailed,
}

impl BackoffState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::AllFailed)
    }
}

/// Walks a [`BackoffPattern`], one attempt-timeout clock and one
/// retry-after clock at a time.
///
/// ```
/// use std::time::{Duration, Instant};
/// use peerlink::backoff::{BackoffPattern, BackoffState, BackoffTimer};
///
/// let now = Instant::now();
/// let pattern: BackoffPattern = "/100,200/1000/3/".parse().unwrap();
/// let mut timer = BackoffTimer::new(pattern);
///
/// timer.notify_attempting(now);
/// assert_eq!(timer.state(), BackoffState::Attempting);
///
/// // the attempt-timeout clock fires after 100ms.
/// let now = now + Duration::from_millis(100);
/// timer.handle_timeout(now);
/// assert_eq!(timer.state(), BackoffState::WaitingAfterFailure);
/// assert_eq!(timer.total_failures(), 1);
/// ```
#[derive(Debug)]
pub struct BackoffTimer {
    pattern: BackoffPattern,
    state: BackoffState,
    /// index of the attempt currently running or about to run.
    attempt: usize,
    total_failures: usize,
    attempt_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    events: VecDeque<BackoffState>,
}

impl BackoffTimer {
    pub fn new(pattern: BackoffPattern) -> Self {
        Self::with_failures(pattern, 0)
    }

    /// Resume a schedule that already failed `total_failures` times, the
    /// way a component re-creates its timer after backgrounding.
    pub fn with_failures(pattern: BackoffPattern, total_failures: usize) -> Self {
        Self {
            state: BackoffState::AttemptNow,
            attempt: total_failures,
            attempt_deadline: None,
            retry_deadline: None,
            events: VecDeque::new(),
            total_failures,
            pattern,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn pattern(&self) -> &BackoffPattern {
        &self.pattern
    }

    pub fn total_failures(&self) -> usize {
        self.total_failures
    }

    /// time at which the next retry is supposed to occur.
    pub fn next_retry_after_time(&self) -> Option<Instant> {
        self.retry_deadline
    }

    /// An attempt has started; arms the attempt-timeout clock.
    pub fn notify_attempting(&mut self, now: Instant) {
        if !matches!(self.state, BackoffState::AttemptNow) {
            return;
        }

        self.attempt_deadline = self
            .pattern
            .attempt_timeout(self.attempt)
            .map(|timeout| now + timeout);
        self.transition(BackoffState::Attempting);
    }

    /// Same effect as the attempt-timeout clock expiring, advanced
    /// immediately.
    pub fn notify_attempt_failed(&mut self, now: Instant) {
        if !matches!(
            self.state,
            BackoffState::Attempting | BackoffState::AttemptNow
        ) {
            return;
        }

        self.fail(now);
    }

    /// During WaitingAfterFailure, skip the rest of the retry-after
    /// delay.  Invalid in any other state.
    pub fn notify_try_again_now(&mut self) {
        if !matches!(self.state, BackoffState::WaitingAfterFailure) {
            return;
        }

        self.retry_deadline = None;
        self.transition(BackoffState::AttemptNow);
    }

    /// Terminal success; cancels both clocks.
    pub fn notify_succeeded(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        self.clear_deadlines();
        self.transition(BackoffState::Succeeded);
    }

    /// Idempotent; stops the clocks without emitting further events.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        self.clear_deadlines();
        self.state = BackoffState::AllFailed;
        self.events.clear();
    }

    /// The next deadline either clock is armed for.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.attempt_deadline, self.retry_deadline) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }

    /// Advance the clocks to `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.attempt_deadline
            && deadline <= now
        {
            self.attempt_deadline = None;
            self.fail(now);
        }

        if let Some(deadline) = self.retry_deadline
            && deadline <= now
        {
            self.retry_deadline = None;
            self.transition(BackoffState::AttemptNow);
        }
    }

    /// Drain the ordered, coalesced state transitions.
    pub fn poll_state_change(&mut self) -> Option<BackoffState> {
        self.events.pop_front()
    }

    /// remaining retry-after delay, for diagnostics.
    pub fn next_retry_after(&self, now: Instant) -> Option<Duration> {
        self.retry_deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn fail(&mut self, now: Instant) {
        self.attempt_deadline = None;
        self.total_failures += 1;

        if let Some(max) = self.pattern.max_attempts()
            && self.total_failures >= max
        {
            self.clear_deadlines();
            self.transition(BackoffState::AllFailed);
            return;
        }

        match self.pattern.retry_duration(self.attempt) {
            Some(delay) if !delay.is_zero() => {
                self.retry_deadline = Some(now + delay);
                self.attempt += 1;
                self.transition(BackoffState::WaitingAfterFailure);
            }
            // no retry-after delay configured: the next attempt can
            // start immediately.
            _ => {
                self.attempt += 1;
                self.transition(BackoffState::AttemptNow);
            }
        }
    }

    fn clear_deadlines(&mut self) {
        self.attempt_deadline = None;
        self.retry_deadline = None;
    }

    fn transition(&mut self, state: BackoffState) {
        if self.state == state {
            return;
        }

        self.state = state;

        // coalesce: a subscriber that has not yet drained the previous
        // transition to the same state learns nothing new from a
        // duplicate.
        if self.events.back() != Some(&state) {
            self.events.push_back(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(text: &str) -> BackoffPattern {
        text.parse().unwrap()
    }

    #[test]
    fn exhaustion_walks_the_whole_schedule() {
        // three attempts, 100/200ms attempt timeouts, 1s retry delay.
        let start = Instant::now();
        let mut timer = BackoffTimer::new(pattern("/100,200/1000/3/"));

        timer.notify_attempting(start);
        timer.notify_attempt_failed(start);
        assert_eq!(timer.state(), BackoffState::WaitingAfterFailure);

        let now = start + Duration::from_millis(1000);
        timer.handle_timeout(now);
        assert_eq!(timer.state(), BackoffState::AttemptNow);

        timer.notify_attempting(now);
        timer.notify_attempt_failed(now);
        assert_eq!(timer.state(), BackoffState::WaitingAfterFailure);

        let now = now + Duration::from_millis(1000);
        timer.handle_timeout(now);
        assert_eq!(timer.state(), BackoffState::AttemptNow);

        timer.notify_attempting(now);
        timer.notify_attempt_failed(now);

        assert_eq!(timer.state(), BackoffState::AllFailed);
        assert_eq!(timer.total_failures(), 3);

        let transitions: Vec<_> =
            std::iter::from_fn(|| timer.poll_state_change()).collect();
        assert_eq!(
            transitions,
            [
                BackoffState::Attempting,
                BackoffState::WaitingAfterFailure,
                BackoffState::AttemptNow,
                BackoffState::Attempting,
                BackoffState::WaitingAfterFailure,
                BackoffState::AttemptNow,
                BackoffState::Attempting,
                BackoffState::AllFailed,
            ]
        );
    }

    #[test]
    fn attempt_timeout_expiry_counts_as_failure() {
        let start = Instant::now();
        let mut timer = BackoffTimer::new(pattern("/100,200/1000/3/"));

        timer.notify_attempting(start);
        assert_eq!(timer.poll_timeout(), Some(start + Duration::from_millis(100)));

        timer.handle_timeout(start + Duration::from_millis(100));
        assert_eq!(timer.state(), BackoffState::WaitingAfterFailure);
        assert_eq!(timer.total_failures(), 1);

        // second attempt uses the second enumerated timeout.
        timer.handle_timeout(start + Duration::from_millis(1100));
        timer.notify_attempting(start + Duration::from_millis(1100));
        assert_eq!(
            timer.poll_timeout(),
            Some(start + Duration::from_millis(1300))
        );
    }

    #[test]
    fn schedule_sum_matches_pattern() {
        // the sum of emitted waits up to AllFailed equals the sum taken
        // straight from the pattern.
        let p = pattern("/100,200,300/50,60/3/");
        let mut timer = BackoffTimer::new(p.clone());

        let mut now = Instant::now();
        let mut total = Duration::ZERO;
        timer.notify_attempting(now);

        while timer.state() != BackoffState::AllFailed {
            let deadline = timer.poll_timeout().unwrap();
            total += deadline - now;
            now = deadline;
            timer.handle_timeout(now);
            timer.notify_attempting(now);
        }

        let expected: Duration = (0..3)
            .filter_map(|i| p.attempt_timeout(i))
            .chain((0..2).filter_map(|i| p.retry_duration(i)))
            .sum();
        assert_eq!(total, expected);
    }

    #[test]
    fn try_again_now_skips_the_wait() {
        let start = Instant::now();
        let mut timer = BackoffTimer::new(pattern("/100/1000/3/"));

        // invalid outside WaitingAfterFailure.
        timer.notify_try_again_now();
        assert_eq!(timer.state(), BackoffState::AttemptNow);

        timer.notify_attempting(start);
        timer.notify_attempt_failed(start);
        assert_eq!(timer.state(), BackoffState::WaitingAfterFailure);

        timer.notify_try_again_now();
        assert_eq!(timer.state(), BackoffState::AttemptNow);
        assert_eq!(timer.poll_timeout(), None);
    }

    #[test]
    fn succeeded_is_terminal() {
        let start = Instant::now();
        let mut timer = BackoffTimer::new(pattern("/100/1000/3/"));

        timer.notify_attempting(start);
        timer.notify_succeeded();
        assert_eq!(timer.state(), BackoffState::Succeeded);
        assert_eq!(timer.poll_timeout(), None);

        // late failures are ignored.
        timer.notify_attempt_failed(start);
        assert_eq!(timer.state(), BackoffState::Succeeded);
    }

    #[test]
    fn cancel_is_idempotent() {
        let start = Instant::now();
        let mut timer = BackoffTimer::new(pattern("/100/1000/3/"));

        timer.notify_attempting(start);
        timer.cancel();
        timer.cancel();
        assert_eq!(timer.state(), BackoffState::AllFailed);
        assert_eq!(timer.poll_timeout(), None);
        assert_eq!(timer.poll_state_change(), None);
    }

    #[test]
    fn empty_retry_segment_means_immediate_retry() {
        let start = Instant::now();
        let mut timer = BackoffTimer::new(pattern("/500,1000,1500,2000,2500///"));

        timer.notify_attempting(start);
        timer.notify_attempt_failed(start);
        assert_eq!(timer.state(), BackoffState::AttemptNow);
        assert_eq!(timer.total_failures(), 1);
    }
}
