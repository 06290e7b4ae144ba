//! One-shot completion signal.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A value handed from the write queue worker to a thread blocked on it.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.ready.notify_all();
    }

    /// Waits for the value. `None` means the wait timed out; the producer
    /// may still complete later.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_delivers_value() {
        let done = Completion::new();
        let signal = Arc::clone(&done);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.complete(7);
        });
        assert_eq!(done.wait_timeout(Duration::from_secs(5)), Some(7));
        worker.join().unwrap();
    }

    #[test]
    fn completion_times_out() {
        let done: Arc<Completion<u8>> = Completion::new();
        let started = Instant::now();
        assert_eq!(done.wait_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn completion_before_wait() {
        let done = Completion::new();
        done.complete("ready");
        assert_eq!(done.wait_timeout(Duration::ZERO), Some("ready"));
    }
}
