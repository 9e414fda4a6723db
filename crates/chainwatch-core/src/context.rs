//! Per-block evaluation context: the classifier cache.
//!
//! One `BlockContext` exists per dispatched block and is shared by every
//! pipeline evaluating that block. Each classifier key maps to a single
//! `OnceCell`: the first `get` runs `compute`, concurrent callers wait on the
//! same cell, and the result (value or failure) stays cached until the
//! context is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use serde_json::Value;

use crate::classifier::{Classifier, FetchClassifier};
use crate::config::millis;
use crate::error::{panic_message, WatchError};
use crate::metrics::{MetricsRecorder, NoopRecorder};
use crate::source::{BlockSource, FetchRequest};
use crate::sync::lock;
use crate::types::{BlockRef, ClassifierKey};

type Resolved = Result<Arc<dyn Any + Send + Sync>, WatchError>;

/// Cheap-to-clone handle on one block's classifier cache.
#[derive(Clone)]
pub struct BlockContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    block: BlockRef,
    source: Arc<dyn BlockSource>,
    entries: Mutex<HashMap<ClassifierKey, Arc<OnceCell<Resolved>>>>,
    recorder: Arc<dyn MetricsRecorder>,
    timeout: Option<Duration>,
}

impl BlockContext {
    /// Create a context without metrics or timeout.
    pub fn new(block: BlockRef, source: Arc<dyn BlockSource>) -> Self {
        Self::with_options(block, source, Arc::new(NoopRecorder), None)
    }

    pub(crate) fn with_options(
        block: BlockRef,
        source: Arc<dyn BlockSource>,
        recorder: Arc<dyn MetricsRecorder>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                block,
                source,
                entries: Mutex::new(HashMap::new()),
                recorder,
                timeout,
            }),
        }
    }

    /// The block this context belongs to.
    pub fn block(&self) -> &BlockRef {
        &self.inner.block
    }

    /// The block source classifiers fetch from.
    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.inner.source
    }

    /// Returns `true` if `key` has finished resolving (successfully or not).
    pub fn is_resolved(&self, key: &ClassifierKey) -> bool {
        lock(&self.inner.entries)
            .get(key)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Number of classifier keys requested so far.
    pub fn requested_count(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// Resolve `classifier` for this block.
    ///
    /// At most one `compute` runs per key; every caller observes the same
    /// value or the same failure. A failure is never recomputed within this
    /// context.
    pub async fn get<C: Classifier>(&self, classifier: &C) -> Result<Arc<C::Output>, WatchError> {
        let key = classifier.key();
        let cell = lock(&self.inner.entries)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let computed = AtomicBool::new(false);
        let resolved = cell
            .get_or_init(|| async {
                computed.store(true, Ordering::Relaxed);
                self.resolve(classifier, &key).await
            })
            .await;
        self.inner
            .recorder
            .classifier_resolved(&key, computed.load(Ordering::Relaxed));

        match resolved {
            Ok(value) => Arc::clone(value)
                .downcast::<C::Output>()
                .map_err(|_| WatchError::TypeMismatch { key: key.to_string() }),
            Err(e) => Err(e.clone()),
        }
    }

    /// Raw response to `request` for this block, fetched at most once and
    /// shared by every typed [`FetchClassifier`] view of the same request.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Arc<Value>, WatchError> {
        self.get(&FetchClassifier::<Value>::new(request.clone())).await
    }

    async fn resolve<C: Classifier>(&self, classifier: &C, key: &ClassifierKey) -> Resolved {
        let source = self.inner.source.as_ref();
        if let Some(api) = classifier.requires().into_iter().find(|api| !source.supports(api)) {
            return Err(WatchError::MissingCapability {
                classifier: key.to_string(),
                api: api.to_string(),
            });
        }

        let block = self.inner.block.number;
        debug!(block, key = %key, "computing classifier");
        let compute = AssertUnwindSafe(classifier.compute_in(self)).catch_unwind();
        let outcome = match self.inner.timeout {
            Some(limit) => match tokio::time::timeout(limit, compute).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(block, key = %key, "classifier timed out");
                    return Err(WatchError::Timeout {
                        key: key.to_string(),
                        ms: millis(limit),
                    });
                }
            },
            None => compute.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>),
            Ok(Err(e)) => {
                warn!(block, key = %key, error = %e, "classifier failed");
                Err(e)
            }
            Err(panic) => Err(WatchError::Panicked {
                origin: format!("classifier {key}"),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

impl std::fmt::Debug for BlockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockContext")
            .field("block", &self.inner.block.number)
            .field("source", &self.inner.source.name())
            .field("requested", &self.requested_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockSource;
    use crate::metrics::SnapshotRecorder;
    use crate::source::{FetchRequest, CORE_API};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Classifier for Counting {
        type Output = u64;

        fn key(&self) -> ClassifierKey {
            ClassifierKey::new("counting")
        }

        async fn compute(&self, block: &BlockRef, _s: &dyn BlockSource) -> Result<u64, WatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                Err(WatchError::transport(CORE_API, "counting", "boom"))
            } else {
                Ok(block.number * 10)
            }
        }
    }

    fn ctx(source: Arc<dyn BlockSource>) -> BlockContext {
        BlockContext::new(BlockRef::new(3, "0x3", "0x2"), source)
    }

    #[tokio::test]
    async fn concurrent_gets_compute_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Counting { calls: calls.clone(), fail: false };
        let ctx = ctx(Arc::new(MemoryBlockSource::new()));

        let (a, b, d) = tokio::join!(ctx.get(&c), ctx.get(&c), ctx.get(&c));
        assert_eq!(*a.unwrap(), 30);
        assert_eq!(*b.unwrap(), 30);
        assert_eq!(*d.unwrap(), 30);
        assert_eq!(*ctx.get(&c).await.unwrap(), 30);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.is_resolved(&c.key()));
    }

    #[tokio::test]
    async fn failure_is_cached_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Counting { calls: calls.clone(), fail: true };
        let ctx = ctx(Arc::new(MemoryBlockSource::new()));

        let first = ctx.get(&c).await.unwrap_err();
        let second = ctx.get(&c).await.unwrap_err();
        assert_eq!(first, second);
        assert!(first.is_fetch_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn type_mismatch_on_shared_key() {
        let source = Arc::new(MemoryBlockSource::new());
        source.respond(CORE_API, "get_dgpo", json!({ "head": 1 }));
        let ctx = ctx(source);

        let as_value: FetchClassifier<Value> =
            FetchClassifier::new(FetchRequest::core("get_dgpo", vec![])).with_key("dgpo".into());
        let as_map: FetchClassifier<serde_json::Map<String, Value>> =
            FetchClassifier::new(FetchRequest::core("get_dgpo", vec![])).with_key("dgpo".into());

        assert!(ctx.get(&as_value).await.is_ok());
        let err = ctx.get(&as_map).await.unwrap_err();
        assert!(matches!(err, WatchError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_capability_fails_without_fetch() {
        let source = Arc::new(MemoryBlockSource::new());
        let ctx = ctx(source.clone());
        let c: FetchClassifier<Value> =
            FetchClassifier::new(FetchRequest::new("balance", "top_holders", vec![]));

        let err = ctx.get(&c).await.unwrap_err();
        assert!(matches!(err, WatchError::MissingCapability { .. }));
        assert_eq!(source.total_fetches(), 0);
    }

    #[tokio::test]
    async fn timeout_is_cached_as_failure() {
        let source = Arc::new(MemoryBlockSource::new().with_latency(Duration::from_millis(200)));
        source.respond(CORE_API, "get_dgpo", json!({}));
        let ctx = BlockContext::with_options(
            BlockRef::new(1, "0x1", "0x0"),
            source,
            Arc::new(NoopRecorder),
            Some(Duration::from_millis(20)),
        );
        let c: FetchClassifier<Value> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));

        let err = ctx.get(&c).await.unwrap_err();
        assert!(matches!(err, WatchError::Timeout { ms: 20, .. }));
        assert_eq!(ctx.get(&c).await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn panicking_classifier_is_contained() {
        struct Panics;

        #[async_trait]
        impl Classifier for Panics {
            type Output = ();

            fn key(&self) -> ClassifierKey {
                ClassifierKey::new("panics")
            }

            async fn compute(&self, _b: &BlockRef, _s: &dyn BlockSource) -> Result<(), WatchError> {
                panic!("bad classifier");
            }
        }

        let ctx = ctx(Arc::new(MemoryBlockSource::new()));
        let err = ctx.get(&Panics).await.unwrap_err();
        assert!(matches!(err, WatchError::Panicked { ref message, .. } if message == "bad classifier"));
    }

    #[tokio::test]
    async fn recorder_sees_computes_and_hits() {
        let rec = Arc::new(SnapshotRecorder::default());
        let source = Arc::new(MemoryBlockSource::new());
        source.respond(CORE_API, "get_dgpo", json!({}));
        let ctx = BlockContext::with_options(BlockRef::new(1, "0x1", "0x0"), source, rec.clone(), None);
        let c: FetchClassifier<Value> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));

        ctx.get(&c).await.unwrap();
        ctx.get(&c).await.unwrap();
        let m = rec.snapshot();
        assert_eq!(m.classifier_computes, 1);
        assert_eq!(m.classifier_cache_hits, 1);
    }

    #[tokio::test]
    async fn typed_views_share_one_fetch() {
        #[derive(serde::Deserialize)]
        struct Head {
            head: u64,
        }

        let source = Arc::new(MemoryBlockSource::new());
        source.respond(CORE_API, "get_dgpo", json!({ "head": 7 }));
        let ctx = ctx(source.clone());
        let raw: FetchClassifier<Value> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));
        let typed: FetchClassifier<Head> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));

        let (a, b) = tokio::join!(ctx.get(&typed), ctx.get(&raw));
        assert_eq!(a.unwrap().head, 7);
        assert_eq!(b.unwrap()["head"], json!(7));
        assert_eq!(ctx.get(&typed).await.unwrap().head, 7);
        assert_eq!(source.fetch_count(CORE_API, "get_dgpo"), 1);
    }

    #[tokio::test]
    async fn typed_view_reports_shape_errors_without_poisoning_raw() {
        #[derive(Debug, serde::Deserialize)]
        struct Head {
            #[allow(dead_code)]
            head: u64,
        }

        let source = Arc::new(MemoryBlockSource::new());
        source.respond(CORE_API, "get_dgpo", json!({ "witness": "gtg" }));
        let ctx = ctx(source.clone());
        let typed: FetchClassifier<Head> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));

        let err = ctx.get(&typed).await.unwrap_err();
        assert!(matches!(err, WatchError::Serialization(_)));
        let raw = ctx.fetch(&FetchRequest::core("get_dgpo", vec![])).await.unwrap();
        assert_eq!(raw["witness"], json!("gtg"));
        assert_eq!(source.fetch_count(CORE_API, "get_dgpo"), 1);
    }

    #[tokio::test]
    async fn lookalike_params_resolve_separately() {
        let source = Arc::new(MemoryBlockSource::new());
        source.on_fetch(CORE_API, "get_accounts", |req, _| Ok(json!(req.params.len())));
        let ctx = ctx(source.clone());
        let joined: FetchClassifier<Value> =
            FetchClassifier::new(FetchRequest::core("get_accounts", vec![json!("alice,bob")]));
        let split: FetchClassifier<Value> =
            FetchClassifier::new(FetchRequest::core("get_accounts", vec![json!("alice"), json!("bob")]));

        assert_eq!(*ctx.get(&joined).await.unwrap(), json!(1));
        assert_eq!(*ctx.get(&split).await.unwrap(), json!(2));
        assert_eq!(source.fetch_count(CORE_API, "get_accounts"), 2);
        assert_eq!(ctx.requested_count(), 2);
    }
}
