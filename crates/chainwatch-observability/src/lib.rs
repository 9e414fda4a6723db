//! # chainwatch-observability
//!
//! OpenTelemetry-based observability for ChainWatch.
//!
//! ## Built-in metrics
//! - `chainwatch.blocks_dispatched`      : counter
//! - `chainwatch.blocks_skipped`         : counter (stale / duplicate heights)
//! - `chainwatch.evaluations`            : counter, tagged with pipeline + outcome
//! - `chainwatch.evaluation_latency_ms`  : histogram, tagged with pipeline
//! - `chainwatch.classifier_computes`    : counter, tagged with classifier
//! - `chainwatch.classifier_cache_hits`  : counter, tagged with classifier
//! - `chainwatch.deliveries_suppressed`  : counter, tagged with pipeline
//!
//! ## Structured logging
//! JSON-structured logs compatible with ELK, Loki, CloudWatch.
//! Log levels configurable per component.

pub mod metrics;
pub mod tracing_setup;

pub use metrics::WatchMetrics;
pub use tracing_setup::{init_tracing, LogConfig};
