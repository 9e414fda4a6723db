//! `Engine`: dispatches blocks from a [`BlockSource`] to registered pipelines.
//!
//! ```text
//! BlockSource ──► run() ──► dispatch(block) ──► BlockContext (one per block)
//!                                  │
//!                    ┌─────────────┼─────────────┐
//!                    ▼             ▼             ▼
//!                worker A      worker B      worker C     (one task per pipeline,
//!                    │             │             │          blocks in arrival order)
//!                    ▼             ▼             ▼
//!                Observer      Observer      Observer
//! ```
//!
//! Workers evaluating the same block share its context, so a classifier used
//! by several pipelines is computed once per block.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::builder::PipelineBuilder;
use crate::config::{millis, EngineBuilder, EngineConfig};
use crate::context::BlockContext;
use crate::error::WatchError;
use crate::metrics::{EngineMetrics, Fanout, MetricsRecorder, SnapshotRecorder};
use crate::pipeline::{Outcome, Pipeline};
use crate::source::BlockSource;
use crate::subscription::{Delivery, EvaluationFailure, Observer, PipelineId, Subscription, SubscriptionState};
use crate::sync::lock;
use crate::types::BlockRef;

enum Job {
    Evaluate(BlockContext),
    Flush(oneshot::Sender<()>),
}

struct WorkerHandle {
    id: PipelineId,
    name: String,
    state: Arc<SubscriptionState>,
    tx: mpsc::UnboundedSender<Job>,
    queued: Arc<AtomicUsize>,
}

struct EngineInner {
    config: EngineConfig,
    source: Arc<dyn BlockSource>,
    recorder: Arc<dyn MetricsRecorder>,
    snapshot: Arc<SnapshotRecorder>,
    workers: Mutex<Vec<WorkerHandle>>,
    last_dispatched: Mutex<Option<u64>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// The observation engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning engine handle held by a [`Subscription`].
#[derive(Debug, Clone)]
pub(crate) struct EngineRef(Weak<EngineInner>);

impl EngineRef {
    /// Remove pipeline `id` if the engine is still alive.
    pub(crate) fn unsubscribe(&self, id: PipelineId) -> bool {
        self.0
            .upgrade()
            .map(|inner| Engine { inner }.unsubscribe(id))
            .unwrap_or(false)
    }
}

impl Engine {
    pub fn builder(source: Arc<dyn BlockSource>) -> EngineBuilder {
        EngineBuilder::new(source)
    }

    pub(crate) fn from_parts(
        source: Arc<dyn BlockSource>,
        config: EngineConfig,
        recorders: Vec<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        let snapshot = Arc::new(SnapshotRecorder::default());
        let mut fanout = Fanout::default();
        fanout.push(snapshot.clone());
        recorders.into_iter().for_each(|r| fanout.push(r));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(EngineInner {
                config,
                source,
                recorder: Arc::new(fanout),
                snapshot,
                workers: Mutex::new(Vec::new()),
                last_dispatched: Mutex::new(None),
                next_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.inner.source
    }

    /// Start a pipeline bound to this engine; finish it with
    /// [`PipelineBuilder::subscribe`].
    pub fn observe(&self, name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::bound(name, self.clone())
    }

    /// Register a pipeline and spawn its worker.
    ///
    /// Fails with [`WatchError::NoRuntime`] outside a Tokio runtime. The
    /// pipeline only sees blocks dispatched after this call.
    pub fn register(&self, pipeline: Pipeline, observer: Observer) -> Result<Subscription, WatchError> {
        let runtime = Handle::try_current().map_err(|_| WatchError::NoRuntime {
            pipeline: pipeline.name().to_string(),
        })?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = pipeline.name().to_string();
        let state = Arc::new(SubscriptionState::new());
        let queued = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        info!(engine = %self.inner.config.name, pipeline = %name, id, stages = pipeline.stages().len(), "pipeline registered");

        let worker = Worker {
            pipeline,
            observer,
            state: Arc::clone(&state),
            queued: Arc::clone(&queued),
            recorder: Arc::clone(&self.inner.recorder),
        };
        runtime.spawn(worker.run(rx));

        lock(&self.inner.workers).push(WorkerHandle {
            id,
            name: name.clone(),
            state: Arc::clone(&state),
            tx,
            queued,
        });
        Ok(Subscription::new(id, name, state).bound_to(EngineRef(Arc::downgrade(&self.inner))))
    }

    /// Cancel a pipeline by id. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: PipelineId) -> bool {
        let mut workers = lock(&self.inner.workers);
        match workers.iter().position(|w| w.id == id) {
            Some(index) => {
                let worker = workers.remove(index);
                worker.state.deactivate();
                debug!(pipeline = %worker.name, id, "pipeline unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Number of active pipelines.
    pub fn pipeline_count(&self) -> usize {
        lock(&self.inner.workers)
            .iter()
            .filter(|w| w.state.is_active())
            .count()
    }

    /// Hand one block to every active pipeline.
    ///
    /// Returns `false` when the block was skipped as stale.
    pub fn dispatch(&self, block: BlockRef) -> bool {
        let number = block.number;
        let mut last = lock(&self.inner.last_dispatched);
        if self.inner.config.skip_stale_blocks {
            if let Some(prev) = *last {
                if number <= prev {
                    warn!(engine = %self.inner.config.name, block = number, last = prev, "skipping stale block");
                    self.inner.recorder.block_skipped(number);
                    return false;
                }
            }
        }
        *last = Some(number);

        let ctx = BlockContext::with_options(
            block,
            Arc::clone(&self.inner.source),
            Arc::clone(&self.inner.recorder),
            self.inner.config.classifier_timeout(),
        );

        let mut workers = lock(&self.inner.workers);
        workers.retain(|w| w.state.is_active());
        for worker in workers.iter() {
            let queued = worker.queued.fetch_add(1, Ordering::AcqRel) + 1;
            if queued > self.inner.config.backlog_warn_threshold {
                warn!(pipeline = %worker.name, queued, block = number, "pipeline falling behind");
            }
            if worker.tx.send(Job::Evaluate(ctx.clone())).is_err() {
                worker.queued.fetch_sub(1, Ordering::AcqRel);
            }
        }
        drop(workers);
        drop(last);

        self.inner.recorder.block_dispatched(number);
        debug!(engine = %self.inner.config.name, block = number, "block dispatched");
        true
    }

    /// Wait until every pipeline has finished the blocks dispatched so far.
    pub async fn flush(&self) {
        let pending: Vec<oneshot::Receiver<()>> = lock(&self.inner.workers)
            .iter()
            .filter_map(|w| {
                let (tx, rx) = oneshot::channel();
                w.tx.send(Job::Flush(tx)).ok().map(|_| rx)
            })
            .collect();
        for done in pending {
            let _ = done.await;
        }
    }

    /// Consume the source's block stream until it ends, `shutdown()` is
    /// called, or reconnects are exhausted.
    pub async fn run(&self) -> Result<(), WatchError> {
        let config = &self.inner.config;
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        info!(engine = %config.name, source = self.inner.source.name(), pipelines = self.pipeline_count(), "engine starting");

        let mut attempt = 0u32;
        loop {
            let failure = match self.inner.source.subscribe().await {
                Err(e) => {
                    error!(engine = %config.name, error = %e, "block source subscribe failed");
                    e
                }
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!(engine = %config.name, "engine shut down");
                            return Ok(());
                        }
                        item = stream.next() => match item {
                            Some(Ok(block)) => {
                                attempt = 0;
                                self.dispatch(block);
                            }
                            Some(Err(e)) => {
                                warn!(engine = %config.name, error = %e, "block stream error");
                                break e;
                            }
                            None => {
                                info!(engine = %config.name, "block stream ended");
                                return Ok(());
                            }
                        }
                    }
                },
            };

            attempt += 1;
            if attempt > config.max_reconnects {
                error!(engine = %config.name, attempts = attempt - 1, "giving up on block source");
                return Err(failure);
            }
            let delay = config.backoff(attempt);
            warn!(engine = %config.name, attempt, delay_ms = millis(delay), "reconnecting to block source");
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Stop `run()`. Registered pipelines finish the blocks already queued.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Snapshot of the built-in counters.
    pub fn metrics(&self) -> EngineMetrics {
        self.inner.snapshot.snapshot()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.config.name)
            .field("source", &self.inner.source.name())
            .field("pipelines", &self.pipeline_count())
            .finish()
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

struct Worker {
    pipeline: Pipeline,
    observer: Observer,
    state: Arc<SubscriptionState>,
    queued: Arc<AtomicUsize>,
    recorder: Arc<dyn MetricsRecorder>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Flush(done) => {
                    let _ = done.send(());
                }
                Job::Evaluate(ctx) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    if self.state.is_active() {
                        self.evaluate(ctx).await;
                    }
                }
            }
        }
        debug!(pipeline = %self.pipeline.name(), "worker stopped");
    }

    async fn evaluate(&self, ctx: BlockContext) {
        let name = self.pipeline.name();
        let started = Instant::now();
        let outcome = self.pipeline.evaluate(&ctx).await;
        self.recorder.evaluation_finished(name, outcome.state(), started.elapsed());

        if !self.state.is_active() {
            debug!(pipeline = %name, block = ctx.block().number, "cancelled during evaluation, result dropped");
            self.recorder.delivery_suppressed(name);
            return;
        }

        match outcome {
            Outcome::Delivered(data) => self.observer.success(Delivery {
                pipeline: name.to_string(),
                block: ctx.block().clone(),
                data,
                delivered_at: Utc::now(),
            }),
            Outcome::Skipped { .. } => {}
            Outcome::Failed { stage, error } => self.observer.failure(EvaluationFailure {
                pipeline: name.to_string(),
                block: ctx.block().clone(),
                stage,
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockSource;
    use crate::subscription::Notification;
    use std::time::Duration;

    fn block(n: u64) -> BlockRef {
        BlockRef::new(n, format!("0x{n:x}"), format!("0x{:x}", n.saturating_sub(1)))
    }

    fn engine() -> (Engine, Arc<MemoryBlockSource>) {
        let source = Arc::new(MemoryBlockSource::new());
        (Engine::builder(source.clone()).name("test").build(), source)
    }

    #[tokio::test]
    async fn stale_blocks_are_skipped() {
        let (engine, _) = engine();
        let (observer, mut rx) = Observer::channel();
        engine.observe("all").on_block().subscribe(observer).unwrap();

        assert!(engine.dispatch(block(10)));
        assert!(!engine.dispatch(block(10)));
        assert!(!engine.dispatch(block(9)));
        assert!(engine.dispatch(block(11)));
        engine.flush().await;

        let mut seen = Vec::new();
        while let Ok(Notification::Delivered(d)) = rx.try_recv() {
            seen.push(d.block.number);
        }
        assert_eq!(seen, vec![10, 11]);
        let m = engine.metrics();
        assert_eq!((m.blocks_dispatched, m.blocks_skipped), (2, 2));
    }

    #[tokio::test]
    async fn stale_guard_can_be_disabled() {
        let source = Arc::new(MemoryBlockSource::new());
        let engine = Engine::builder(source).skip_stale_blocks(false).build();
        assert!(engine.dispatch(block(3)));
        assert!(engine.dispatch(block(3)));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (engine, _) = engine();
        let (observer, mut rx) = Observer::channel();
        let sub = engine.observe("p").on_block().subscribe(observer).unwrap();
        assert_eq!(engine.pipeline_count(), 1);

        assert!(engine.unsubscribe(sub.id()));
        assert!(!engine.unsubscribe(sub.id()));
        assert!(!sub.is_active());
        assert_eq!(engine.pipeline_count(), 0);

        engine.dispatch(block(1));
        engine.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_releases_the_worker_immediately() {
        let (engine, _) = engine();
        let (observer, mut rx) = Observer::channel();
        let sub = engine.observe("p").on_block().subscribe(observer).unwrap();
        let other = engine.observe("q").on_block().subscribe(Observer::on_success(|_| {})).unwrap();

        sub.cancel();
        assert_eq!(lock(&engine.inner.workers).len(), 1);
        assert!(!engine.unsubscribe(sub.id()));
        assert!(other.is_active());

        // the worker held the only sender: its exit closes the channel
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test]
    async fn cancel_after_engine_dropped_is_harmless() {
        let (engine, _) = engine();
        let sub = engine.observe("p").on_block().subscribe(Observer::on_success(|_| {})).unwrap();
        drop(engine);
        sub.cancel();
        assert!(!sub.is_active());
    }

    #[test]
    fn register_outside_runtime_fails() {
        let (engine, _) = engine();
        let err = engine.observe("p").on_block().subscribe(Observer::on_success(|_| {})).unwrap_err();
        assert_eq!(err, WatchError::NoRuntime { pipeline: "p".into() });
        assert_eq!(engine.pipeline_count(), 0);
    }

    #[tokio::test]
    async fn flush_waits_for_slow_pipelines() {
        let (engine, _) = engine();
        let (observer, mut rx) = Observer::channel();
        engine
            .observe("slow")
            .filter(|_c, _s| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(true)
            })
            .subscribe(observer)
            .unwrap();

        for n in 1..=3 {
            engine.dispatch(block(n));
        }
        engine.flush().await;

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(engine.metrics().evaluations_delivered, 3);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (engine, source) = engine();
        source.push_block(block(1));
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), runner).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert_eq!(engine.metrics().blocks_dispatched, 1);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_reconnects() {
        let source = Arc::new(MemoryBlockSource::new());
        let engine = Engine::builder(source.clone())
            .reconnect(2, Duration::from_millis(1))
            .build();
        source.push_block(block(1));
        source.push_error(WatchError::Source("connection reset".into()));

        // the memory source refuses a second subscription, so every reconnect fails
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, WatchError::Source(ref m) if m.contains("already subscribed")));
        assert_eq!(engine.metrics().blocks_dispatched, 1);
    }
}
