//! Dependency-graph propagation.
//!
//! Cascades status-altering operations across a step's parent/child
//! edges. Traversal is iterative (explicit worklist plus a visited set)
//! so deep chains and diamond- or cycle-shaped graphs terminate without
//! recursion limits.
//!
//! All callers go through the hub's single-writer execution queue, so at
//! most one cascade mutates the graph at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::blob::{step_data_key, step_key, BlobError, BlobStore};
use crate::store::{Step, StepStatus, StepStore, StoreError};

/// Errors that can occur during graph propagation.
///
/// `StoreError::NotFound` from a referenced id propagates out of the
/// traversal rather than being swallowed.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Blob store operation failed during payload purge.
    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),
}

/// Cascades status changes across the dependency graph and purges
/// external payload data once a connected component is fully terminal.
pub struct GraphPropagator {
    store: Arc<StepStore>,
    blobs: Arc<dyn BlobStore>,
}

impl GraphPropagator {
    /// Creates a propagator over the given store and blob collaborator.
    pub fn new(store: Arc<StepStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Marks `id` successful and promotes newly-unblocked children.
    ///
    /// A direct child moves queued -> pending only when every one of its
    /// parents is now success; children with unfinished parents stay
    /// queued. Promotion does not recurse further: a promoted child is
    /// re-evaluated when it is next considered for dispatch.
    pub async fn mark_done(&self, id: &str) -> Result<(), GraphError> {
        let step = self.store.get_by_id(id).await?;
        self.store
            .set_status(id, StepStatus::Success, None, None)
            .await?;

        for child_id in &step.children {
            let child = self.store.get_by_id(child_id).await?;
            if child.status != StepStatus::Queued {
                continue;
            }

            let mut unblocked = true;
            for parent_id in &child.parents {
                let parent = self.store.get_by_id(parent_id).await?;
                if parent.status != StepStatus::Success {
                    unblocked = false;
                    break;
                }
            }

            if unblocked {
                debug!(step = %child_id, "All parents succeeded, promoting to pending");
                self.store
                    .set_status(child_id, StepStatus::Pending, None, None)
                    .await?;
            }
        }

        self.purge_if_fully_terminal(id).await?;
        Ok(())
    }

    /// Cancels `id` and its entire connected component.
    ///
    /// Every step reachable over parent or child edges is set to cancel,
    /// whatever its current status.
    pub async fn mark_cancel(&self, id: &str) -> Result<(), GraphError> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut worklist = vec![id.to_string()];

        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }

            let step = self.store.get_by_id(&current).await?;
            self.store
                .set_status(&current, StepStatus::Cancel, None, None)
                .await?;

            for next in step.parents.iter().chain(step.children.iter()) {
                if !visited.contains(next) {
                    worklist.push(next.clone());
                }
            }
        }

        info!(start = %id, cancelled = visited.len(), "Cancelled component");
        self.purge_if_fully_terminal(id).await?;
        Ok(())
    }

    /// Revives `id` and its entire connected component.
    ///
    /// Each member's status is recomputed: queued when it has parents,
    /// pending otherwise. Repeating a reset yields the same result.
    pub async fn reset(&self, id: &str) -> Result<(), GraphError> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut worklist = vec![id.to_string()];

        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }

            let step = self.store.get_by_id(&current).await?;
            let status = if step.parents.is_empty() {
                StepStatus::Pending
            } else {
                StepStatus::Queued
            };
            self.store.set_status(&current, status, None, None).await?;

            for next in step.parents.iter().chain(step.children.iter()) {
                if !visited.contains(next) {
                    worklist.push(next.clone());
                }
            }
        }

        info!(start = %id, revived = visited.len(), "Reset component");
        Ok(())
    }

    /// Records an error on `id` with message and traceback. No cascade.
    pub async fn record_error(
        &self,
        id: &str,
        msg: &str,
        trace: &str,
    ) -> Result<(), GraphError> {
        self.store
            .set_status(id, StepStatus::Error, Some(msg), Some(trace))
            .await?;
        Ok(())
    }

    /// Deletes external payload data for the component containing `id`
    /// once every member has reached a terminal status.
    ///
    /// Walks the full connected component exactly once; returns true
    /// when the purge ran.
    pub async fn purge_if_fully_terminal(&self, id: &str) -> Result<bool, GraphError> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut worklist = vec![id.to_string()];
        let mut members: Vec<Step> = Vec::new();

        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }

            let step = self.store.get_by_id(&current).await?;
            if !step.status.is_terminal() {
                return Ok(false);
            }

            for next in step.parents.iter().chain(step.children.iter()) {
                if !visited.contains(next) {
                    worklist.push(next.clone());
                }
            }
            members.push(step);
        }

        for member in &members {
            self.blobs.delete(&step_key(&member.id)).await?;
            self.blobs.delete(&step_data_key(&member.id)).await?;
        }

        info!(start = %id, purged = members.len(), "Purged payload data for terminal component");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> Arc<StepStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        let store = StepStore::from_pool(pool);
        store.run_migrations().await.expect("migrations should run");
        Arc::new(store)
    }

    struct Fixture {
        store: Arc<StepStore>,
        blobs: Arc<FsBlobStore>,
        propagator: GraphPropagator,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = memory_store().await;
        let blobs = Arc::new(FsBlobStore::new(dir.path()));
        let propagator = GraphPropagator::new(Arc::clone(&store), Arc::clone(&blobs) as _);
        Fixture {
            store,
            blobs,
            propagator,
            _dir: dir,
        }
    }

    /// Inserts a chain a -> b -> c (a parent of b, b parent of c).
    async fn insert_chain(store: &StepStore) {
        let a = Step::new("a", "default", "t").with_child("b");
        let b = Step::new("b", "default", "t").with_parent("a").with_child("c");
        let c = Step::new("c", "default", "t").with_parent("b");
        store.insert_or_replace(&a, StepStatus::Pending).await.unwrap();
        store.insert_or_replace(&b, StepStatus::Queued).await.unwrap();
        store.insert_or_replace(&c, StepStatus::Queued).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_done_promotes_single_parent_child() {
        let fx = fixture().await;
        insert_chain(&fx.store).await;

        fx.propagator.mark_done("a").await.unwrap();

        assert_eq!(fx.store.get_by_id("a").await.unwrap().status, StepStatus::Success);
        assert_eq!(fx.store.get_by_id("b").await.unwrap().status, StepStatus::Pending);
        // Promotion does not recurse: c stays queued behind b.
        assert_eq!(fx.store.get_by_id("c").await.unwrap().status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn test_mark_done_waits_for_all_parents() {
        let fx = fixture().await;
        let a = Step::new("a", "default", "t").with_child("j");
        let b = Step::new("b", "default", "t").with_child("j");
        let j = Step::new("j", "default", "t").with_parent("a").with_parent("b");
        fx.store.insert_or_replace(&a, StepStatus::Pending).await.unwrap();
        fx.store.insert_or_replace(&b, StepStatus::Pending).await.unwrap();
        fx.store.insert_or_replace(&j, StepStatus::Queued).await.unwrap();

        fx.propagator.mark_done("a").await.unwrap();
        // One parent still unfinished: the join stays queued.
        assert_eq!(fx.store.get_by_id("j").await.unwrap().status, StepStatus::Queued);

        fx.propagator.mark_done("b").await.unwrap();
        assert_eq!(fx.store.get_by_id("j").await.unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_mark_cancel_cascades_both_directions() {
        let fx = fixture().await;
        insert_chain(&fx.store).await;

        fx.propagator.mark_cancel("b").await.unwrap();

        for id in ["a", "b", "c"] {
            assert_eq!(
                fx.store.get_by_id(id).await.unwrap().status,
                StepStatus::Cancel,
                "step {id}"
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_on_diamond() {
        let fx = fixture().await;
        // a -> {b, c} -> d
        let a = Step::new("a", "default", "t").with_child("b").with_child("c");
        let b = Step::new("b", "default", "t").with_parent("a").with_child("d");
        let c = Step::new("c", "default", "t").with_parent("a").with_child("d");
        let d = Step::new("d", "default", "t").with_parent("b").with_parent("c");
        for (step, status) in [
            (&a, StepStatus::Pending),
            (&b, StepStatus::Queued),
            (&c, StepStatus::Queued),
            (&d, StepStatus::Queued),
        ] {
            fx.store.insert_or_replace(step, status).await.unwrap();
        }

        fx.propagator.mark_cancel("a").await.unwrap();

        for id in ["a", "b", "c", "d"] {
            assert_eq!(fx.store.get_by_id(id).await.unwrap().status, StepStatus::Cancel);
        }
    }

    #[tokio::test]
    async fn test_reset_revives_component_and_is_idempotent() {
        let fx = fixture().await;
        insert_chain(&fx.store).await;
        fx.propagator.mark_cancel("b").await.unwrap();

        fx.propagator.reset("c").await.unwrap();
        let first: Vec<StepStatus> = {
            let mut v = Vec::new();
            for id in ["a", "b", "c"] {
                v.push(fx.store.get_by_id(id).await.unwrap().status);
            }
            v
        };
        assert_eq!(
            first,
            vec![StepStatus::Pending, StepStatus::Queued, StepStatus::Queued]
        );

        // Resetting again yields the same statuses.
        fx.propagator.reset("c").await.unwrap();
        for (id, expected) in [
            ("a", StepStatus::Pending),
            ("b", StepStatus::Queued),
            ("c", StepStatus::Queued),
        ] {
            assert_eq!(fx.store.get_by_id(id).await.unwrap().status, expected);
        }
    }

    #[tokio::test]
    async fn test_record_error_does_not_cascade() {
        let fx = fixture().await;
        insert_chain(&fx.store).await;

        fx.propagator
            .record_error("b", "boom", "trace here")
            .await
            .unwrap();

        let b = fx.store.get_by_id("b").await.unwrap();
        assert_eq!(b.status, StepStatus::Error);
        assert_eq!(b.msg.as_deref(), Some("boom"));
        assert_eq!(b.trace.as_deref(), Some("trace here"));
        assert_eq!(fx.store.get_by_id("a").await.unwrap().status, StepStatus::Pending);
        assert_eq!(fx.store.get_by_id("c").await.unwrap().status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn test_purge_waits_for_full_component() {
        let fx = fixture().await;
        insert_chain(&fx.store).await;
        for id in ["a", "b", "c"] {
            fx.blobs.set(&step_data_key(id), b"payload").await.unwrap();
        }

        fx.propagator.mark_done("a").await.unwrap();
        // b and c are not terminal, so nothing is purged yet.
        assert!(fx.blobs.get(&step_data_key("a")).await.unwrap().is_some());

        // Cancel the rest of the component; now everything is terminal
        // and all payloads go.
        fx.propagator.mark_cancel("b").await.unwrap();
        for id in ["a", "b", "c"] {
            assert!(
                fx.blobs.get(&step_data_key(id)).await.unwrap().is_none(),
                "step {id} payload should be purged"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_id_propagates_not_found() {
        let fx = fixture().await;
        let err = fx.propagator.mark_done("missing").await.unwrap_err();
        assert!(matches!(err, GraphError::Store(StoreError::NotFound(_))));
    }
}
