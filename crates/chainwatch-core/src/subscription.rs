//! Push-delivery endpoints of pipelines.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::engine::EngineRef;
use crate::error::{panic_message, WatchError};
use crate::types::{BlockRef, Fields};

/// Identifier of a registered pipeline.
pub type PipelineId = u64;

/// A successful evaluation handed to the success channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub pipeline: String,
    pub block: BlockRef,
    /// Merged output of every provider and piped filter.
    pub data: Fields,
    pub delivered_at: DateTime<Utc>,
}

impl Delivery {
    /// Deserialize one output field.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T, WatchError> {
        let value = self.data.get(name).cloned().ok_or_else(|| WatchError::InvalidOutput {
            reason: format!("missing field '{name}'"),
        })?;
        Ok(serde_json::from_value(value)?)
    }
}

/// A failed evaluation handed to the error channel.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("pipeline '{pipeline}' failed at stage {stage} on block {}: {error}", .block.number)]
pub struct EvaluationFailure {
    pub pipeline: String,
    pub block: BlockRef,
    pub stage: usize,
    #[source]
    pub error: WatchError,
}

/// Message sent by a channel-backed [`Observer`].
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Delivered(Delivery),
    Failed(EvaluationFailure),
}

type SuccessFn = Arc<dyn Fn(Delivery) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(EvaluationFailure) + Send + Sync>;

/// The two delivery channels of a pipeline.
#[derive(Clone)]
pub struct Observer {
    on_success: SuccessFn,
    on_error: ErrorFn,
}

impl Observer {
    pub fn new<S, E>(on_success: S, on_error: E) -> Self
    where
        S: Fn(Delivery) + Send + Sync + 'static,
        E: Fn(EvaluationFailure) + Send + Sync + 'static,
    {
        Self {
            on_success: Arc::new(on_success),
            on_error: Arc::new(on_error),
        }
    }

    /// Success callback only; failures are logged.
    pub fn on_success<S>(on_success: S) -> Self
    where
        S: Fn(Delivery) + Send + Sync + 'static,
    {
        Self::new(on_success, |failure| {
            error!(pipeline = %failure.pipeline, block = failure.block.number, error = %failure.error, "unhandled evaluation failure");
        })
    }

    /// Observer that forwards both channels into an unbounded queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let observer = Self::new(
            move |d| {
                let _ = tx.send(Notification::Delivered(d));
            },
            move |f| {
                let _ = err_tx.send(Notification::Failed(f));
            },
        );
        (observer, rx)
    }

    pub(crate) fn success(&self, delivery: Delivery) {
        let pipeline = delivery.pipeline.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.on_success)(delivery))) {
            error!(%pipeline, message = %panic_message(panic.as_ref()), "success callback panicked");
        }
    }

    pub(crate) fn failure(&self, failure: EvaluationFailure) {
        let pipeline = failure.pipeline.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.on_error)(failure))) {
            error!(%pipeline, message = %panic_message(panic.as_ref()), "error callback panicked");
        }
    }
}

// ─── Subscription ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct SubscriptionState {
    active: AtomicBool,
}

impl SubscriptionState {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns `true` if this call flipped the state.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Handle on a registered pipeline.
///
/// Dropping the handle does not cancel the pipeline.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: PipelineId,
    name: String,
    state: Arc<SubscriptionState>,
    engine: Option<EngineRef>,
}

impl Subscription {
    pub(crate) fn new(id: PipelineId, name: String, state: Arc<SubscriptionState>) -> Self {
        Self {
            id,
            name,
            state,
            engine: None,
        }
    }

    pub(crate) fn bound_to(mut self, engine: EngineRef) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Stop all further deliveries and release the pipeline's worker.
    /// Idempotent.
    ///
    /// An evaluation already running finishes its fetches, but its result
    /// is discarded.
    pub fn cancel(&self) {
        if self.state.deactivate() {
            debug!(pipeline = %self.name, id = self.id, "subscription cancelled");
        }
        if let Some(engine) = &self.engine {
            engine.unsubscribe(self.id);
        }
    }
}
