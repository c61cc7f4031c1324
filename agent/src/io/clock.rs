//! Time and cancellation.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

/// Cooperative cancellation flag threaded through every tool call.
///
/// Cloning shares the flag. Cancellation is sticky and wakes any sleeper
/// blocked on it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        let (flag, cond) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn err_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("operation cancelled");
        }
        Ok(())
    }

    /// Blocks for `duration` or until cancelled, whichever comes first.
    /// Returns whether the token was cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + duration;
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            cancelled = guard;
        }
        true
    }
}

/// Time source for budgets and durations.
pub trait Clock {
    fn now(&self) -> Instant;
    /// Sleeps for `duration`, waking early with an error when cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()>;
}

/// Wall-clock [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        if cancel.wait_timeout(duration) {
            bail!("sleep cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies cancellation is sticky and observable through clones.
    #[test]
    fn cancel_is_shared_and_sticky() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.err_if_cancelled().is_err());
        token.cancel();
        assert!(token.is_cancelled());
    }

    /// Verifies a sleep returns early with an error when another thread
    /// cancels it.
    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let started = Instant::now();
        let result = SystemClock.sleep(Duration::from_secs(30), &token);
        handle.join().unwrap();

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Verifies an uncancelled short sleep completes normally.
    #[test]
    fn sleep_completes_without_cancel() {
        let token = CancelToken::new();
        SystemClock.sleep(Duration::from_millis(5), &token).unwrap();
    }
}
