//! Token bucket rate limiter
//!
//! The bucket is a semaphore whose permits are tokens; a consumed permit is
//! forgotten rather than returned. A background ticker tops the bucket back up
//! to capacity once per interval. Refill never exceeds capacity, so an idle
//! period cannot bank an unbounded burst.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{Error, Result};

/// Token bucket shared by every caller of one client.
///
/// Must be created inside a tokio runtime (the refill ticker is spawned on
/// construction).
pub struct RateLimiter {
    bucket: Arc<Semaphore>,
    capacity: usize,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a full bucket of `capacity` tokens refilled every `interval`.
    pub fn new(capacity: usize, interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidLimiter("capacity must be greater than 0".into()));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(Error::InvalidLimiter(format!(
                "capacity must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if interval.is_zero() {
            return Err(Error::InvalidLimiter("interval must be non-zero".into()));
        }

        let bucket = Arc::new(Semaphore::new(capacity));
        let ticker = spawn_refill(bucket.clone(), capacity, interval);
        debug!(capacity, interval_ms = interval.as_millis() as u64, "rate limiter started");

        Ok(Self {
            bucket,
            capacity,
            interval,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Take a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        match self.bucket.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for a token, or until `ctx` is canceled or expires.
    ///
    /// Returns `LimiterClosed` once the limiter has been closed.
    pub async fn wait(&self, ctx: &Context) -> Result<()> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        tokio::select! {
            biased;
            reason = ctx.done() => Err(reason.into()),
            permit = self.bucket.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(Error::LimiterClosed),
            },
        }
    }

    /// Stop the refill ticker and close the bucket. Idempotent.
    pub fn close(&self) {
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("rate limiter closed");
        }
        self.bucket.close();
    }

    pub fn is_closed(&self) -> bool {
        self.bucket.is_closed()
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> usize {
        self.bucket.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_refill(bucket: Arc<Semaphore>, capacity: usize, interval: Duration) -> JoinHandle<()> {
    // First refill one full interval after construction; the bucket starts full.
    let start = tokio::time::Instant::now() + interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Consumers only ever lower the count, so this cannot overshoot.
            let missing = capacity.saturating_sub(bucket.available_permits());
            if missing > 0 {
                bucket.add_permits(missing);
            }
        }
    })
}
