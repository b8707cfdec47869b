//! Selection and claiming of runnable steps.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::store::{now_epoch, StepStore, StoreError};
use crate::throttle::TagThrottle;

/// Errors that can occur during a scheduling pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying storage failure; the whole pass fails and nothing
    /// is claimed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of step ids returned per pass.
    pub limit: usize,
    /// Page size used when scanning dispatch candidates.
    pub chunk_size: usize,
    /// Duration after which a working step is presumed abandoned and
    /// offered again.
    pub staleness: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limit: 50,
            chunk_size: 100,
            staleness: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    /// Sets the per-pass result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the candidate page size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the staleness window for abandoned working steps.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }
}

/// Selects the next batch of runnable steps under priority ordering,
/// staleness requeueing and per-tag velocity throttling.
pub struct Scheduler {
    store: Arc<StepStore>,
    throttle: Arc<TagThrottle>,
    config: SchedulerConfig,
    // Serializes select-then-claim so two concurrent passes cannot hand
    // out the same step.
    pass_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Creates a scheduler over the given store and throttle.
    pub fn new(store: Arc<StepStore>, throttle: Arc<TagThrottle>, config: SchedulerConfig) -> Self {
        Self {
            store,
            throttle,
            config,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns up to `limit` dispatchable step ids for the given scopes
    /// and marks them working.
    ///
    /// Candidates are consumed in priority order; rows whose tag has
    /// exhausted its velocity are skipped without penalty and remain
    /// eligible for the next pass. The claim is one statement over the
    /// final id set, so a storage failure leaves nothing claimed.
    pub async fn get_steps(&self, scopes: &[String]) -> Result<Vec<String>, SchedulerError> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }

        let _pass = self.pass_lock.lock().await;

        let velocities = self.store.tag_velocities().await?;
        let stale_before = now_epoch() - self.config.staleness.as_secs() as i64;

        let mut selected: Vec<String> = Vec::new();
        let mut offset: i64 = 0;

        loop {
            let rows = self
                .store
                .select_dispatchable(scopes, stale_before, self.config.chunk_size as i64, offset)
                .await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                // The tags table is authoritative; absent tags are unlimited.
                let velocity = velocities.get(&row.tag).copied();
                if self.throttle.try_consume(&row.tag, velocity) {
                    selected.push(row.id.clone());
                    if selected.len() >= self.config.limit {
                        break;
                    }
                }
            }

            if selected.len() >= self.config.limit {
                break;
            }
            offset += self.config.chunk_size as i64;
        }

        self.store.claim(&selected).await?;

        debug!(
            scopes = ?scopes,
            selected = selected.len(),
            "Scheduling pass complete"
        );

        Ok(selected)
    }
}
