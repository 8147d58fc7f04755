//! Suspension points of the transfer protocol.
//!
//! Neither peer can block on the other through the OS, so every wait is a
//! loop of "check the flags, sleep, check again". [`Poller`] owns that loop
//! and makes its policy explicit: the sleep interval, an optional backoff,
//! an optional deadline and a cancellation token.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Poll interval when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("gave up waiting for {waiting_for} after {after:?}")]
    Timeout {
        waiting_for: &'static str,
        after: Duration,
    },

    #[error("cancelled while waiting for {waiting_for}")]
    Cancelled { waiting_for: &'static str },
}

/// How the sleep between two polls evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always sleep the base interval.
    Fixed,
    /// Double the sleep after every miss, up to `max`.
    Exponential { max: Duration },
}

impl Backoff {
    fn next(self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed => current,
            Backoff::Exponential { max } => current.saturating_mul(2).min(max),
        }
    }
}

/// Fires a [`CancelToken`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by every wait point; once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token nobody can cancel.
    pub fn never() -> Self {
        let (_, token) = Self::pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Blocking-wait policy shared by both roles.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    backoff: Backoff,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Poller {
    /// Fixed interval, no deadline, not cancellable.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            backoff: Backoff::Fixed,
            timeout: None,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bound every single wait. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Poll `ready` until it returns true. Returns how many times the
    /// condition was found false.
    pub async fn until<F>(&self, waiting_for: &'static str, mut ready: F) -> Result<u64, WaitError>
    where
        F: FnMut() -> bool,
    {
        let started = Instant::now();
        let mut delay = self.interval;
        let mut misses = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(WaitError::Cancelled { waiting_for });
            }
            if ready() {
                if misses > 0 {
                    tracing::debug!(waiting_for, misses, "wait satisfied");
                }
                return Ok(misses);
            }

            let mut nap = delay;
            if let Some(limit) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    tracing::warn!(waiting_for, ?limit, "wait timed out");
                    return Err(WaitError::Timeout {
                        waiting_for,
                        after: limit,
                    });
                }
                nap = nap.min(limit - elapsed);
            }

            misses += 1;
            if misses == 1 {
                tracing::debug!(waiting_for, "blocked, polling");
            } else {
                tracing::trace!(waiting_for, misses, ?nap, "still waiting");
            }

            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = self.cancel.cancelled() => {
                    return Err(WaitError::Cancelled { waiting_for });
                }
            }
            delay = self.backoff.next(delay);
        }
    }
}
