//! One-shot wake signal
//!
//! A consumer that finds its queue empty parks here with a timeout; the
//! producer fires the signal when the queue transitions to non-empty and a
//! wait was requested. The flag is cleared on every successful wait, so each
//! signal wakes at most one wait cycle.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub(crate) struct WakeSignal {
    flagged: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking a parked waiter if there is one.
    pub fn signal(&self) {
        let mut flagged = self.flagged.lock();
        *flagged = true;
        self.cond.notify_one();
    }

    /// Park until the signal fires or `timeout` elapses.
    ///
    /// Returns `true` if signaled (and clears the flag), `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flagged = self.flagged.lock();
        while !*flagged {
            if self.cond.wait_until(&mut flagged, deadline).timed_out() {
                break;
            }
        }
        let fired = *flagged;
        *flagged = false;
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_before_wait_returns_immediately() {
        let signal = WakeSignal::new();
        signal.signal();
        assert!(signal.wait(Duration::from_millis(10)));
        // One-shot: the flag was consumed by the first wait.
        assert!(!signal.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_times_out_without_signal() {
        let signal = WakeSignal::new();
        let start = Instant::now();
        assert!(!signal.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let signal = Arc::new(WakeSignal::new());
        let remote = signal.clone();
        let waiter = thread::spawn(move || remote.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(waiter.join().unwrap());
    }
}
