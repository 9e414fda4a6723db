//! Observation pipelines and their per-block evaluation.
//!
//! # Composition rules
//!
//! ```text
//! stage 0 → stage 1 → … → stage n → deliver(merged output)
//!    │          │
//!    │          └── filter false  → Skipped (no delivery)
//!    └── error / panic            → Failed  (error channel)
//! ```
//!
//! Stages run strictly in declaration order and never overlap within one
//! evaluation. Every evaluation gets a fresh [`Store`].

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::debug;

use crate::builder::PipelineBuilder;
use crate::context::BlockContext;
use crate::error::{panic_message, WatchError};
use crate::metrics::EvaluationState;
use crate::stage::{Stage, Step};
use crate::store::Store;
use crate::types::{merge_fields, Fields};

/// An ordered, immutable sequence of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
}

/// Result of evaluating one pipeline against one block.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every stage passed; carries the merged output.
    Delivered(Fields),
    /// The filter at `stage` returned `false`.
    Skipped { stage: usize },
    /// The stage at `stage` failed.
    Failed { stage: usize, error: WatchError },
}

impl Outcome {
    pub fn state(&self) -> EvaluationState {
        match self {
            Self::Delivered(_) => EvaluationState::Delivered,
            Self::Skipped { .. } => EvaluationState::Skipped,
            Self::Failed { .. } => EvaluationState::Failed,
        }
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Start building an unbound pipeline.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Evaluate every stage against `ctx`, left to right.
    pub async fn evaluate(&self, ctx: &BlockContext) -> Outcome {
        let store = Store::new();
        let mut output = Fields::new();
        let block = ctx.block().number;

        for (index, stage) in self.stages.iter().enumerate() {
            let step = match AssertUnwindSafe(stage.execute(ctx, &store)).catch_unwind().await {
                Ok(step) => step,
                Err(panic) => Err(WatchError::Panicked {
                    origin: format!("{}#{index}", stage.kind()),
                    message: panic_message(panic.as_ref()),
                }),
            };
            match step {
                Ok(Step::Pass) => {}
                Ok(Step::Contribute(fields)) => merge_fields(&mut output, fields),
                Ok(Step::Halt) => {
                    debug!(pipeline = %self.name, block, stage = index, "gate not met");
                    return Outcome::Skipped { stage: index };
                }
                Err(error) => {
                    debug!(pipeline = %self.name, block, stage = index, %error, "stage failed");
                    return Outcome::Failed { stage: index, error };
                }
            }
        }
        Outcome::Delivered(output)
    }
}
