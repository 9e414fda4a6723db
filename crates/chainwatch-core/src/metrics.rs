//! Engine metrics: a recorder trait plus the built-in snapshot recorder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sync::lock;
use crate::types::ClassifierKey;

/// Final state of one (pipeline, block) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvaluationState {
    /// All stages passed; output delivered to the success channel.
    Delivered,
    /// A filter returned `false`; nothing was delivered.
    Skipped,
    /// A stage or classifier failed; the error channel was notified.
    Failed,
}

impl std::fmt::Display for EvaluationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Hooks the engine calls while it works. All methods default to no-ops.
pub trait MetricsRecorder: Send + Sync {
    fn block_dispatched(&self, _block: u64) {}

    fn block_skipped(&self, _block: u64) {}

    fn evaluation_finished(&self, _pipeline: &str, _state: EvaluationState, _elapsed: Duration) {}

    /// `computed` is `false` when the value came from the block's cache.
    fn classifier_resolved(&self, _key: &ClassifierKey, _computed: bool) {}

    /// A result was produced after the subscription was cancelled.
    fn delivery_suppressed(&self, _pipeline: &str) {}
}

/// Metrics snapshot for an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub blocks_dispatched: u64,
    pub blocks_skipped: u64,
    pub evaluations_delivered: u64,
    pub evaluations_skipped: u64,
    pub evaluations_failed: u64,
    pub classifier_computes: u64,
    pub classifier_cache_hits: u64,
    pub deliveries_suppressed: u64,
}

/// Recorder that accumulates an [`EngineMetrics`] snapshot.
#[derive(Debug, Default)]
pub struct SnapshotRecorder {
    inner: Mutex<EngineMetrics>,
}

impl SnapshotRecorder {
    pub fn snapshot(&self) -> EngineMetrics {
        lock(&self.inner).clone()
    }
}

impl MetricsRecorder for SnapshotRecorder {
    fn block_dispatched(&self, _block: u64) {
        lock(&self.inner).blocks_dispatched += 1;
    }

    fn block_skipped(&self, _block: u64) {
        lock(&self.inner).blocks_skipped += 1;
    }

    fn evaluation_finished(&self, _pipeline: &str, state: EvaluationState, _elapsed: Duration) {
        let mut m = lock(&self.inner);
        match state {
            EvaluationState::Delivered => m.evaluations_delivered += 1,
            EvaluationState::Skipped => m.evaluations_skipped += 1,
            EvaluationState::Failed => m.evaluations_failed += 1,
        }
    }

    fn classifier_resolved(&self, _key: &ClassifierKey, computed: bool) {
        let mut m = lock(&self.inner);
        if computed {
            m.classifier_computes += 1;
        } else {
            m.classifier_cache_hits += 1;
        }
    }

    fn delivery_suppressed(&self, _pipeline: &str) {
        lock(&self.inner).deliveries_suppressed += 1;
    }
}

/// Forwards every hook to a list of recorders.
#[derive(Default, Clone)]
pub(crate) struct Fanout {
    recorders: Vec<Arc<dyn MetricsRecorder>>,
}

impl Fanout {
    pub(crate) fn push(&mut self, recorder: Arc<dyn MetricsRecorder>) {
        self.recorders.push(recorder);
    }
}

impl MetricsRecorder for Fanout {
    fn block_dispatched(&self, block: u64) {
        self.recorders.iter().for_each(|r| r.block_dispatched(block));
    }

    fn block_skipped(&self, block: u64) {
        self.recorders.iter().for_each(|r| r.block_skipped(block));
    }

    fn evaluation_finished(&self, pipeline: &str, state: EvaluationState, elapsed: Duration) {
        self.recorders
            .iter()
            .for_each(|r| r.evaluation_finished(pipeline, state, elapsed));
    }

    fn classifier_resolved(&self, key: &ClassifierKey, computed: bool) {
        self.recorders.iter().for_each(|r| r.classifier_resolved(key, computed));
    }

    fn delivery_suppressed(&self, pipeline: &str) {
        self.recorders.iter().for_each(|r| r.delivery_suppressed(pipeline));
    }
}

/// Recorder that ignores everything.
pub(crate) struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}
