//! Periodic background trigger

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Calls a closure on a fixed period until dropped
pub struct PeriodicSynchronizer {
    period: Duration,
    handle: JoinHandle<()>,
}

impl PeriodicSynchronizer {
    /// First call happens one full period from now
    pub fn start<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Closure says whether to keep going
                if !tick() {
                    break;
                }
            }
        });
        tracing::debug!(period_secs = period.as_secs(), "Periodic synchronize scheduled");
        Self { period, handle }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for PeriodicSynchronizer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
