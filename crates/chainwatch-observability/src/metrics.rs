//! ChainWatch metrics definitions.
//!
//! All metrics use OpenTelemetry conventions.
//! They can be exported via OTLP to Prometheus, Grafana, Datadog, etc.

use std::time::Duration;

use chainwatch_core::{ClassifierKey, EvaluationState, MetricsRecorder};
use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

/// Central metrics handle for ChainWatch.
///
/// Register it with `EngineBuilder::recorder` to feed the engine's events
/// into OpenTelemetry.
#[derive(Clone)]
pub struct WatchMetrics {
    pub blocks_dispatched: Counter<u64>,
    pub blocks_skipped: Counter<u64>,
    pub evaluations: Counter<u64>,
    pub evaluation_latency_ms: Histogram<f64>,
    pub classifier_computes: Counter<u64>,
    pub classifier_cache_hits: Counter<u64>,
    pub deliveries_suppressed: Counter<u64>,
}

impl WatchMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            blocks_dispatched: meter
                .u64_counter("chainwatch.blocks_dispatched")
                .with_description("Blocks handed to the registered pipelines")
                .init(),
            blocks_skipped: meter
                .u64_counter("chainwatch.blocks_skipped")
                .with_description("Stale or duplicate blocks ignored by the engine")
                .init(),
            evaluations: meter
                .u64_counter("chainwatch.evaluations")
                .with_description("Pipeline evaluations, tagged with pipeline + outcome")
                .init(),
            evaluation_latency_ms: meter
                .f64_histogram("chainwatch.evaluation_latency_ms")
                .with_description("Time to evaluate one pipeline against one block in milliseconds")
                .init(),
            classifier_computes: meter
                .u64_counter("chainwatch.classifier_computes")
                .with_description("Classifier values computed (cache misses)")
                .init(),
            classifier_cache_hits: meter
                .u64_counter("chainwatch.classifier_cache_hits")
                .with_description("Classifier values served from the per-block cache")
                .init(),
            deliveries_suppressed: meter
                .u64_counter("chainwatch.deliveries_suppressed")
                .with_description("Results dropped because the subscription was cancelled")
                .init(),
        }
    }
}

impl MetricsRecorder for WatchMetrics {
    fn block_dispatched(&self, _block: u64) {
        self.blocks_dispatched.add(1, &[]);
    }

    fn block_skipped(&self, _block: u64) {
        self.blocks_skipped.add(1, &[]);
    }

    fn evaluation_finished(&self, pipeline: &str, state: EvaluationState, elapsed: Duration) {
        let pipeline = KeyValue::new("pipeline", pipeline.to_string());
        self.evaluations.add(
            1,
            &[pipeline.clone(), KeyValue::new("outcome", state.to_string())],
        );
        self.evaluation_latency_ms
            .record(elapsed.as_secs_f64() * 1_000.0, &[pipeline]);
    }

    fn classifier_resolved(&self, key: &ClassifierKey, computed: bool) {
        let attrs = [KeyValue::new("classifier", key.to_string())];
        if computed {
            self.classifier_computes.add(1, &attrs);
        } else {
            self.classifier_cache_hits.add(1, &attrs);
        }
    }

    fn delivery_suppressed(&self, pipeline: &str) {
        self.deliveries_suppressed
            .add(1, &[KeyValue::new("pipeline", pipeline.to_string())]);
    }
}
