//! Per-tag dispatch fairness limiter.
//!
//! The throttle keeps a process-wide usage counter per tag so no single
//! tag monopolizes dispatch capacity. Consuming a slot increments the
//! tag's usage; a background task decrements every tag once per interval,
//! restoring capacity over time. The counter map and the decay task share
//! one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Interval at which every tag's usage is decremented by one.
pub const DECAY_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide per-tag usage counters.
///
/// Constructed once at startup and shared by handle; the scheduler calls
/// [`TagThrottle::try_consume`] during each dispatch pass.
#[derive(Debug, Default)]
pub struct TagThrottle {
    usage: Mutex<HashMap<String, u32>>,
}

impl TagThrottle {
    /// Creates a throttle with no recorded usage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to consume one dispatch slot for `tag`.
    ///
    /// Returns true and increments usage when `velocity` is unset
    /// (unlimited) or current usage is below the cap; returns false
    /// without mutation otherwise. An absent tag counts as zero usage.
    pub fn try_consume(&self, tag: &str, velocity: Option<f64>) -> bool {
        let mut usage = self.usage.lock().expect("throttle mutex poisoned");
        let count = usage.entry(tag.to_string()).or_insert(0);

        match velocity {
            Some(limit) if (*count as f64) >= limit => false,
            _ => {
                *count += 1;
                true
            }
        }
    }

    /// Returns the current usage for a tag (zero when untracked).
    pub fn usage(&self, tag: &str) -> u32 {
        let usage = self.usage.lock().expect("throttle mutex poisoned");
        usage.get(tag).copied().unwrap_or(0)
    }

    /// Decrements every tag's usage by one, floored at zero.
    ///
    /// Entries that reach zero are dropped so the map does not grow
    /// unboundedly with dead tags.
    pub fn decay(&self) {
        let mut usage = self.usage.lock().expect("throttle mutex poisoned");
        usage.retain(|_, count| {
            *count = count.saturating_sub(1);
            *count > 0
        });
    }

    /// Spawns the periodic decay task.
    ///
    /// The task runs until a shutdown signal arrives on `shutdown_rx`,
    /// decrementing all usage counters once per `interval`.
    pub fn spawn_decay(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let throttle = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh
            // throttle keeps a full window of usage.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        throttle.decay();
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Throttle decay task received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}
