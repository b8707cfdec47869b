//! Single-writer execution queue for mutating commands.
//!
//! Every state-mutating request is enqueued as a [`Command`] on a bounded
//! channel consumed by exactly one task, so at most one mutation touches
//! the dependency graph at a time and commands apply in FIFO arrival
//! order. Producers await channel capacity when the queue is full
//! (block-producer backpressure). A failing command is logged and the
//! consumer moves on; the queue never halts.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::graph::{GraphError, GraphPropagator};
use crate::store::{Step, StepStatus, StepStore};

/// A queued mutation, applied by the executor task.
#[derive(Debug)]
pub enum Command {
    /// Mark a step successful and promote unblocked children.
    Done { id: String },
    /// Force a step back to pending.
    Pending { id: String },
    /// Cancel a step and its connected component.
    Cancel { id: String },
    /// Revive a step and its connected component.
    Reset { id: String },
    /// Record an error outcome on a step.
    Error {
        id: String,
        msg: String,
        trace: String,
    },
    /// Insert or replace a step with the given initial status.
    UploadStep { step: Step, status: StepStatus },
    /// Bulk-reset error (and optionally working) steps to pending.
    ResetErrors { include_working: bool },
    /// Hard-clear every step row.
    DeleteSteps,
}

impl Command {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Done { .. } => "DONE",
            Command::Pending { .. } => "PENDING",
            Command::Cancel { .. } => "CANCEL",
            Command::Reset { .. } => "RESET",
            Command::Error { .. } => "ERROR",
            Command::UploadStep { .. } => "UPLOAD_STEP",
            Command::ResetErrors { .. } => "RESET_ERRORS",
            Command::DeleteSteps => "DELETE_STEPS",
        }
    }
}

/// The single consumer of the execution queue.
pub struct Executor {
    store: Arc<StepStore>,
    propagator: Arc<GraphPropagator>,
}

impl Executor {
    /// Creates an executor over the given store and propagator.
    pub fn new(store: Arc<StepStore>, propagator: Arc<GraphPropagator>) -> Self {
        Self { store, propagator }
    }

    /// Spawns the consumer task and returns the producer handle.
    ///
    /// The task drains the queue until every sender is dropped.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<Command>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Command>(capacity);

        let handle = tokio::spawn(async move {
            info!(capacity, "Execution queue consumer started");

            while let Some(command) = rx.recv().await {
                let name = command.name();
                debug!(command = name, "Applying command");

                if let Err(e) = self.apply(command).await {
                    // Acks went out when the command was enqueued, so the
                    // only visibility for a failed mutation is the log.
                    error!(command = name, error = %e, "Command failed");
                }
            }

            info!("Execution queue consumer stopped");
        });

        (tx, handle)
    }

    /// Applies one command against the store/propagator.
    async fn apply(&self, command: Command) -> Result<(), GraphError> {
        match command {
            Command::Done { id } => self.propagator.mark_done(&id).await,
            Command::Pending { id } => {
                self.store
                    .set_status(&id, StepStatus::Pending, None, None)
                    .await?;
                Ok(())
            }
            Command::Cancel { id } => self.propagator.mark_cancel(&id).await,
            Command::Reset { id } => self.propagator.reset(&id).await,
            Command::Error { id, msg, trace } => {
                self.propagator.record_error(&id, &msg, &trace).await
            }
            Command::UploadStep { step, status } => {
                self.store.insert_or_replace(&step, status).await?;
                Ok(())
            }
            Command::ResetErrors { include_working } => {
                let changed = self.store.reset_errors(include_working).await?;
                info!(changed, include_working, "Reset errored steps to pending");
                Ok(())
            }
            Command::DeleteSteps => {
                self.store.delete_all().await?;
                info!("Deleted all step rows");
                Ok(())
            }
        }
    }
}
