//! One-shot broadcast signal for runner/waiter rendezvous.
//!
//! Each waiter that joins an in-flight computation owns one [`OnceSignal`].
//! The runner fans a terminal [`Outcome`] out to every registered signal
//! after its row transition commits, never before, so a waiter that wakes
//! and re-dispatches is guaranteed to observe the terminal state (or a
//! later one). A signal accepts exactly one outcome; late deliveries are
//! dropped, which makes stale notifications to a waiter that already timed
//! out and re-dispatched harmless.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Terminal outcome delivered to waiters of an in-flight computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The runner completed and cached a value.
    Completed,
    /// The runner failed or died; the entry was cleared.
    Failed,
}

/// A one-shot signal slot settable by one thread and awaited by another.
#[derive(Debug, Default)]
pub struct OnceSignal {
    state: Mutex<Option<Outcome>>,
    cond: Condvar,
}

impl OnceSignal {
    /// Creates an empty signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an outcome, waking all waiting threads.
    ///
    /// The first delivery wins; later calls are no-ops.
    pub fn set(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Blocks until an outcome is delivered or `timeout` elapses.
    ///
    /// Returns `None` on timeout. Tolerates spurious wakeups by waiting
    /// against an absolute deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self.cond.wait_for(&mut state, deadline - now).timed_out() {
                return *state;
            }
        }
        *state
    }

    /// Returns the delivered outcome without blocking, if any.
    pub fn peek(&self) -> Option<Outcome> {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn set_before_wait_returns_immediately() {
        let signal = OnceSignal::new();
        signal.set(Outcome::Completed);
        assert_eq!(
            signal.wait_timeout(Duration::from_millis(10)),
            Some(Outcome::Completed)
        );
    }

    #[test]
    fn wait_times_out_without_delivery() {
        let signal = OnceSignal::new();
        assert_eq!(signal.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn first_delivery_wins() {
        let signal = OnceSignal::new();
        signal.set(Outcome::Failed);
        signal.set(Outcome::Completed);
        assert_eq!(signal.peek(), Some(Outcome::Failed));
    }

    #[test]
    fn cross_thread_delivery_wakes_waiter() {
        let signal = Arc::new(OnceSignal::new());
        let waker = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.set(Outcome::Completed);
        });
        let observed = signal.wait_timeout(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(observed, Some(Outcome::Completed));
    }

    #[test]
    fn broadcast_reaches_multiple_waiters() {
        let signal = Arc::new(OnceSignal::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(5));
        signal.set(Outcome::Failed);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(Outcome::Failed));
        }
    }
}
