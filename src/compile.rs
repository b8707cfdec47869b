//! Pipeline compilation seam.
//!
//! The hub does not interpret pipeline source itself; a compiler turns
//! source text into a step graph and hands it over as a
//! [`CompiledPipeline`]. Starters (steps with no unmet prerequisites)
//! enter the store as `pending`, everything else as `queued` until the
//! graph promotes it.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::info;

use crate::store::{Step, StepStatus, StepStore, StoreError};

/// Errors produced while compiling pipeline source.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Source could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The graph references a step id that is never defined.
    #[error("Undefined step '{0}' referenced in graph")]
    UndefinedStep(String),

    /// A starter has parents, or a non-starter has none.
    #[error("Inconsistent starter set: {0}")]
    InconsistentStarters(String),
}

/// A compiled step graph, ready for upload.
#[derive(Debug, Clone, Default)]
pub struct CompiledPipeline {
    /// Every step in the graph, keyed by id.
    pub steps: HashMap<String, Step>,
    /// Ids of steps with no unmet prerequisites.
    pub starters: BTreeSet<String>,
}

impl CompiledPipeline {
    /// Builds a pipeline from a step set, deriving starters from the
    /// parent edges.
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Result<Self, CompileError> {
        let steps: HashMap<String, Step> =
            steps.into_iter().map(|s| (s.id.clone(), s)).collect();

        for step in steps.values() {
            for parent in &step.parents {
                if !steps.contains_key(parent) {
                    return Err(CompileError::UndefinedStep(parent.clone()));
                }
            }
            for child in &step.children {
                if !steps.contains_key(child) {
                    return Err(CompileError::UndefinedStep(child.clone()));
                }
            }
        }

        let starters = steps
            .values()
            .filter(|s| s.is_starter())
            .map(|s| s.id.clone())
            .collect();

        Ok(Self { steps, starters })
    }

    /// Yields each step paired with its upload status: `pending` for
    /// starters, `queued` for everything downstream.
    pub fn upload_order(&self) -> impl Iterator<Item = (&Step, StepStatus)> {
        self.steps.values().map(|step| {
            let status = if self.starters.contains(&step.id) {
                StepStatus::Pending
            } else {
                StepStatus::Queued
            };
            (step, status)
        })
    }
}

/// Compiles pipeline source text into a step graph.
///
/// Implemented outside the hub core; the server only consumes the
/// resulting [`CompiledPipeline`].
pub trait PipelineCompiler {
    fn compile(&self, source: &str) -> Result<CompiledPipeline, CompileError>;
}

/// Inserts a compiled pipeline into the store: starters as `pending`,
/// everything downstream as `queued`.
pub async fn upload_pipeline(
    store: &StepStore,
    pipeline: &CompiledPipeline,
) -> Result<(), StoreError> {
    for (step, status) in pipeline.upload_order() {
        store.insert_or_replace(step, status).await?;
    }

    info!(
        steps = pipeline.steps.len(),
        starters = pipeline.starters.len(),
        "Uploaded compiled pipeline"
    );
    Ok(())
}
