//! Application backgrounding (OS suspend) coordination.
//!
//! Components that must quiesce before the process is suspended
//! subscribe here.  On `notify_going_to_background` every subscriber
//! receives a [`BackgroundingNotifier`]; holding it signals "still
//! busy", dropping it signals readiness.  The caller polls the returned
//! [`BackgroundingQuery`] until every notifier is gone or its deadline
//! passes.

use parking_lot::Mutex;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

pub trait BackgroundingHandler: Send {
    /// The process is about to suspend; finish pending work, then drop
    /// the notifier.
    fn on_going_to_background(&self, notifier: BackgroundingNotifier);

    /// The process resumed.  Restart timers with some jitter so a fleet
    /// of components does not fire all at once.
    fn on_returning_from_background(&self);
}

/// Held by a subscriber until it is ready to suspend.
pub struct BackgroundingNotifier {
    outstanding: Arc<AtomicUsize>,
}

impl BackgroundingNotifier {
    /// Explicit form of dropping the notifier.
    pub fn ready(self) {}
}

impl Drop for BackgroundingNotifier {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Progress of one going-to-background round.
pub struct BackgroundingQuery {
    outstanding: Arc<AtomicUsize>,
    deadline: Instant,
}

impl BackgroundingQuery {
    /// how many subscribers still hold their notifier.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// every subscriber quiesced, or the deadline bounds the wait.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.outstanding() == 0 || now >= self.deadline
    }
}

/// Subscription registry, one per process.
#[derive(Default)]
pub struct Backgrounding {
    subscribers: Mutex<Vec<Box<dyn BackgroundingHandler>>>,
}

impl Backgrounding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Box<dyn BackgroundingHandler>) {
        self.subscribers.lock().push(handler);
    }

    pub fn notify_going_to_background(&self, deadline: Instant) -> BackgroundingQuery {
        let subscribers = self.subscribers.lock();
        let outstanding = Arc::new(AtomicUsize::new(subscribers.len()));

        for handler in subscribers.iter() {
            handler.on_going_to_background(BackgroundingNotifier {
                outstanding: outstanding.clone(),
            });
        }

        BackgroundingQuery {
            outstanding,
            deadline,
        }
    }

    pub fn notify_returning_from_background(&self) {
        for handler in self.subscribers.lock().iter() {
            handler.on_returning_from_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    struct Slow {
        parked: Arc<Mutex<Vec<BackgroundingNotifier>>>,
    }

    impl BackgroundingHandler for Slow {
        fn on_going_to_background(&self, notifier: BackgroundingNotifier) {
            self.parked.lock().push(notifier);
        }

        fn on_returning_from_background(&self) {}
    }

    #[test]
    fn waits_for_every_notifier() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let backgrounding = Backgrounding::new();
        backgrounding.subscribe(Box::new(Slow {
            parked: parked.clone(),
        }));
        backgrounding.subscribe(Box::new(Slow {
            parked: parked.clone(),
        }));

        let now = Instant::now();
        let query = backgrounding.notify_going_to_background(now + Duration::from_secs(5));
        assert_eq!(query.outstanding(), 2);
        assert!(!query.is_ready(now));

        parked.lock().pop();
        assert_eq!(query.outstanding(), 1);

        parked.lock().clear();
        assert!(query.is_ready(now));
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let backgrounding = Backgrounding::new();
        backgrounding.subscribe(Box::new(Slow {
            parked: Arc::new(Mutex::new(Vec::new())),
        }));

        let now = Instant::now();
        let query = backgrounding.notify_going_to_background(now + Duration::from_secs(5));

        // the subscriber never quiesces; the deadline caps the wait.
        assert!(!query.is_ready(now));
        assert!(query.is_ready(now + Duration::from_secs(6)));
    }
}
