//! Engine configuration and builder.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::metrics::MetricsRecorder;
use crate::source::BlockSource;

/// Runtime settings of an [`Engine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Label used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Skip blocks at or below the last dispatched height.
    #[serde(default = "bool_true")]
    pub skip_stale_blocks: bool,
    /// Upper bound on a single classifier computation (None = unbounded)
    #[serde(default)]
    pub classifier_timeout_ms: Option<u64>,
    /// Consecutive reconnect attempts before `run()` gives up
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Initial reconnect backoff in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Queued blocks per pipeline above which a warning is logged
    #[serde(default = "default_backlog_warn_threshold")]
    pub backlog_warn_threshold: usize,
}

fn default_name() -> String { "chainwatch".into() }
fn bool_true() -> bool { true }
fn default_max_reconnects() -> u32 { 5 }
fn default_reconnect_backoff_ms() -> u64 { 500 }
fn default_backlog_warn_threshold() -> usize { 64 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            skip_stale_blocks: true,
            classifier_timeout_ms: None,
            max_reconnects: default_max_reconnects(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            backlog_warn_threshold: default_backlog_warn_threshold(),
        }
    }
}

impl EngineConfig {
    pub fn classifier_timeout(&self) -> Option<Duration> {
        self.classifier_timeout_ms.map(Duration::from_millis)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms.saturating_mul(2u64.pow(attempt.min(6))))
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Fluent builder for an [`Engine`].
pub struct EngineBuilder {
    source: Arc<dyn BlockSource>,
    config: EngineConfig,
    recorders: Vec<Arc<dyn MetricsRecorder>>,
}

impl EngineBuilder {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self {
            source,
            config: EngineConfig::default(),
            recorders: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn classifier_timeout(mut self, timeout: Duration) -> Self {
        self.config.classifier_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn skip_stale_blocks(mut self, skip: bool) -> Self {
        self.config.skip_stale_blocks = skip;
        self
    }

    /// Reconnect policy for `run()`.
    pub fn reconnect(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.config.max_reconnects = max_attempts;
        self.config.reconnect_backoff_ms = millis(backoff);
        self
    }

    pub fn backlog_warn_threshold(mut self, threshold: usize) -> Self {
        self.config.backlog_warn_threshold = threshold;
        self
    }

    /// Add a metrics sink. The built-in snapshot recorder is always present.
    pub fn recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn build(self) -> Engine {
        Engine::from_parts(self.source, self.config, self.recorders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockSource;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{ "name": "hive" }"#).unwrap();
        assert_eq!(config.name, "hive");
        assert!(config.skip_stale_blocks);
        assert_eq!(config.max_reconnects, 5);
        assert_eq!(config.classifier_timeout(), None);
        assert_eq!(EngineConfig::default().backlog_warn_threshold, 64);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(1_000));
        assert_eq!(config.backoff(3), Duration::from_millis(4_000));
        assert_eq!(config.backoff(6), config.backoff(20));
    }

    #[test]
    fn builder_sets_fields() {
        let engine = EngineBuilder::new(Arc::new(MemoryBlockSource::new()))
            .name("test")
            .classifier_timeout(Duration::from_millis(250))
            .skip_stale_blocks(false)
            .reconnect(2, Duration::from_millis(10))
            .build();
        let config = engine.config();
        assert_eq!(config.name, "test");
        assert_eq!(config.classifier_timeout_ms, Some(250));
        assert!(!config.skip_stale_blocks);
        assert_eq!(config.max_reconnects, 2);
        assert_eq!(config.reconnect_backoff_ms, 10);
    }

    #[test]
    fn huge_durations_saturate() {
        let engine = EngineBuilder::new(Arc::new(MemoryBlockSource::new()))
            .classifier_timeout(Duration::MAX)
            .reconnect(1, Duration::MAX)
            .build();
        let config = engine.config();
        assert_eq!(config.classifier_timeout_ms, Some(u64::MAX));
        assert_eq!(config.reconnect_backoff_ms, u64::MAX);
        assert_eq!(config.backoff(3), Duration::from_millis(u64::MAX));
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
    }
}
