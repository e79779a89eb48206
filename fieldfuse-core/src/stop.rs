//! Process-wide stop signal
//!
//! One [`StopSignal`] is created at startup and a clone is handed to every
//! component through its constructor. It is set once and never reset.
//!
//! Waits are interruptible rather than polled. Async loops await a
//! [`CancellationToken`]; blocking threads park on a condition variable
//! that [`StopSignal::cancel`] wakes alongside the token.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    stopped: Mutex<bool>,
    parked: Condvar,
}

/// Shared cancellation context
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                stopped: Mutex::new(false),
                parked: Condvar::new(),
            }),
        }
    }

    /// Request shutdown; idempotent
    pub fn cancel(&self) {
        self.inner.token.cancel();
        let mut stopped = self.inner.stopped.lock().unwrap_or_else(|e| e.into_inner());
        if !*stopped {
            *stopped = true;
            self.inner.parked.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token for async tasks; cancelled together with this signal
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Block for up to `timeout`; returns `true` if shutdown was requested
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.inner.stopped.lock().unwrap_or_else(|e| e.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = match self.inner.parked.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *stopped
    }

    /// Resolves once shutdown is requested
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Async sleep that ends early on shutdown; returns `true` if cancelled
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_when_not_cancelled() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.wait_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_blocked_waiter() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let cancelled = stop.wait_for(Duration::from_secs(3600));
                (cancelled, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        stop.cancel();
        let (cancelled, waited) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn already_cancelled_returns_immediately() {
        let stop = StopSignal::new();
        stop.cancel();
        stop.cancel();
        assert!(stop.wait_for(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn async_sleep_is_interruptible() {
        let stop = StopSignal::new();
        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop.cancel();
            })
        };

        let start = Instant::now();
        assert!(stop.sleep(Duration::from_secs(3600)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn token_and_blocking_waiters_see_one_cancel() {
        let stop = StopSignal::new();
        let token = stop.token();
        let parked = {
            let stop = stop.clone();
            thread::spawn(move || stop.wait_for(Duration::from_secs(3600)))
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        token.cancelled().await;
        assert!(token.is_cancelled());
        assert!(parked.join().unwrap());
        assert!(stop.is_cancelled());
    }
}
