// src/scheduler.rs - Sampling cadence and self-rescheduling poll tasks
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_SAMPLING_INTERVAL: u32 = 20;
pub const MIN_SAMPLING_INTERVAL: u32 = 5;
pub const MAX_SAMPLING_INTERVAL: u32 = 65535;

/// Clamps a requested interval in milliseconds to the supported range.
pub fn clamp_interval(ms: i64) -> u32 {
    ms.clamp(MIN_SAMPLING_INTERVAL as i64, MAX_SAMPLING_INTERVAL as i64) as u32
}

/// Delay before the next poll: the nominal interval minus the time the last
/// exchange took, never negative and never longer than the interval.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed).min(interval)
}

/// Cadence shared by every poller of one board. Changing it affects the next
/// tick of each poller; sleeps already in progress are not rearmed.
#[derive(Debug, Clone)]
pub struct SamplingScheduler {
    interval_ms: Arc<AtomicU32>,
}

impl Default for SamplingScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLING_INTERVAL as i64)
    }
}

impl SamplingScheduler {
    pub fn new(ms: i64) -> Self {
        Self {
            interval_ms: Arc::new(AtomicU32::new(clamp_interval(ms))),
        }
    }

    /// Sets the cadence and returns the clamped value that took effect.
    pub fn set(&self, ms: i64) -> u32 {
        let clamped = clamp_interval(ms);
        self.interval_ms.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn millis(&self) -> u32 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.millis() as u64)
    }

    pub fn delay_after(&self, elapsed: Duration) -> Duration {
        next_delay(self.interval(), elapsed)
    }

    /// Spawns a poll loop. Each tick upgrades `owner`; the loop ends when the
    /// owner is gone or `tick` returns `Break`.
    pub fn spawn_poller<S, F, Fut>(&self, owner: Weak<S>, mut tick: F) -> JoinHandle<()>
    where
        S: Send + Sync + 'static,
        F: FnMut(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let started = Instant::now();
                let Some(owner) = owner.upgrade() else {
                    break;
                };
                if tick(owner).await.is_break() {
                    break;
                }
                tokio::time::sleep(scheduler.delay_after(started.elapsed())).await;
            }
            tracing::trace!("Poller stopped");
        })
    }
}
