//! Error types for the chainwatch engine.

use std::any::Any;

use thiserror::Error;

/// Errors that can occur while evaluating observation pipelines.
///
/// `Clone` is required: a failed classifier computation is cached in the
/// block's context and handed to every stage that asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The block source failed to answer a fetch (connection, node error, ...).
    #[error("transport error on {api}.{method}: {reason}")]
    Transport {
        api: String,
        method: String,
        reason: String,
    },

    /// A classifier needs an API the block source was not built with.
    #[error("classifier '{classifier}' requires API '{api}' which the block source does not provide")]
    MissingCapability { classifier: String, api: String },

    /// Two classifiers share a key but disagree on the value type.
    #[error("classifier key '{key}' resolved to a value of a different type")]
    TypeMismatch { key: String },

    /// A classifier computation exceeded the configured timeout.
    #[error("classifier '{key}' timed out after {ms}ms")]
    Timeout { key: String, ms: u64 },

    /// A stage function reported an error unrelated to data fetching.
    #[error("stage '{stage}' failed: {reason}")]
    Stage { stage: String, reason: String },

    /// A stage or classifier panicked.
    #[error("'{origin}' panicked: {message}")]
    Panicked { origin: String, message: String },

    /// A provider returned something that cannot be merged into the output object.
    #[error("invalid stage output: {reason}")]
    InvalidOutput { reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The block stream itself failed (subscribe error, dropped connection).
    #[error("block source error: {0}")]
    Source(String),

    /// `subscribe` was called on a pipeline builder not created by an engine.
    #[error("pipeline '{pipeline}' is not bound to an engine")]
    Unbound { pipeline: String },

    /// A pipeline was registered outside a Tokio runtime, so its worker
    /// cannot be spawned.
    #[error("pipeline '{pipeline}' must be registered inside a Tokio runtime")]
    NoRuntime { pipeline: String },

    #[error("{0}")]
    Other(String),
}

impl WatchError {
    /// Convenience constructor for stage-level errors.
    pub fn stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for transport errors.
    pub fn transport(
        api: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Transport {
            api: api.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error came from fetching chain data.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::MissingCapability { .. }
        )
    }

    /// Returns `true` if a fresh attempt (on a later block) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Source(_)
        )
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}
