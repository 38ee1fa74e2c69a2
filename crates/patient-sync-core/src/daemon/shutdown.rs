//! Cooperative shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest a [`ShutdownToken::sleep`] waits before re-checking the flag.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Shared stop flag, checked between records, batches and sleep slices.
///
/// Cloning shares the flag. Nothing is interrupted mid-call.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until shutdown is requested.
    ///
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = ShutdownToken::new();
        let handle = token.clone();
        assert!(!token.is_triggered());
        handle.trigger();
        assert!(token.is_triggered());
    }

    #[test]
    fn test_sleep_returns_early_on_shutdown() {
        let token = ShutdownToken::new();
        let handle = token.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.trigger();
        });

        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn test_short_sleep_completes() {
        assert!(ShutdownToken::new().sleep(Duration::from_millis(10)));
    }
}
