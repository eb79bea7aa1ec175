//! Host model of the hardware watchdog

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, trace};

/// Resets the device unless fed at least once per `timeout`.
///
/// On the host the reset becomes a `WatchdogExpired` error returned from the
/// late feed.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    last_feed: Arc<Mutex<Instant>>,
    feeds: Arc<AtomicU64>,
}

impl Watchdog {
    /// Armed now
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_feed: Arc::new(Mutex::new(Instant::now())),
            feeds: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time since the last feed
    pub fn elapsed(&self) -> Duration {
        self.last_feed.lock().elapsed()
    }

    pub fn feeds(&self) -> u64 {
        self.feeds.load(Ordering::Relaxed)
    }

    /// Reset the timer. Fails if the previous feed is already too old.
    pub fn feed(&self) -> Result<()> {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_feed.lock();
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };
        self.feeds.fetch_add(1, Ordering::Relaxed);

        if elapsed > self.timeout {
            return Err(self.expired(elapsed));
        }
        trace!(elapsed_ms = elapsed.as_millis() as u64, "Watchdog fed");
        Ok(())
    }

    /// Check the deadline without feeding
    pub fn check(&self) -> Result<()> {
        let elapsed = self.elapsed();
        if elapsed > self.timeout {
            return Err(self.expired(elapsed));
        }
        Ok(())
    }

    fn expired(&self, elapsed: Duration) -> Error {
        error!(
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "Watchdog expired"
        );
        Error::WatchdogExpired {
            elapsed_ms: elapsed.as_millis() as u64,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}
