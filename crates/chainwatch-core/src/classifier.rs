//! Classifiers: immutable descriptors of a derived or fetched fact.
//!
//! A classifier has no cache of its own; [`BlockContext`](crate::BlockContext)
//! memoizes its result for one block under [`Classifier::key`].

use std::any::type_name;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::BlockContext;
use crate::error::WatchError;
use crate::source::{BlockSource, FetchRequest};
use crate::types::{BlockRef, ClassifierKey};

/// A typed, cacheable unit of per-block data.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    /// The value this classifier resolves to.
    type Output: Send + Sync + 'static;

    /// Stable identity. Same key ⇒ same meaning within one block.
    fn key(&self) -> ClassifierKey;

    /// Source APIs this classifier needs beyond the core API.
    fn requires(&self) -> Vec<&str> {
        Vec::new()
    }

    /// Compute or fetch the value for `block`.
    async fn compute(&self, block: &BlockRef, source: &dyn BlockSource) -> Result<Self::Output, WatchError>;

    /// Resolve inside a block's cache. Defaults to [`Classifier::compute`];
    /// override to build on other classifiers cached in `ctx`.
    async fn compute_in(&self, ctx: &BlockContext) -> Result<Self::Output, WatchError> {
        self.compute(ctx.block(), ctx.source().as_ref()).await
    }
}

// ─── BlockHeaderClassifier ────────────────────────────────────────────────────

/// Raw block header as returned by `core.get_block_header(number)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockHeaderClassifier;

#[async_trait]
impl Classifier for BlockHeaderClassifier {
    type Output = Value;

    fn key(&self) -> ClassifierKey {
        ClassifierKey::new("block_header")
    }

    async fn compute(&self, block: &BlockRef, source: &dyn BlockSource) -> Result<Value, WatchError> {
        let request = FetchRequest::core("get_block_header", vec![Value::from(block.number)]);
        source.fetch(&request, block).await
    }
}

// ─── FetchClassifier ──────────────────────────────────────────────────────────

/// A classifier backed by a single fetch, deserialized into `T`.
///
/// The key is derived from the request as `api.method(params)`, with every
/// param in its JSON form, so `"3"` and `3` never share an entry. Typed views
/// (any `T` other than `serde_json::Value`) add ` as <type>` to the key and
/// deserialize from the raw response cached under the bare request key: one
/// fetch per block serves every view of the same request.
pub struct FetchClassifier<T> {
    key: ClassifierKey,
    request: FetchRequest,
    _output: PhantomData<fn() -> T>,
}

impl<T> FetchClassifier<T> {
    pub fn new(request: FetchRequest) -> Self {
        let mut key = request_key(&request);
        if type_name::<T>() != type_name::<Value>() {
            key = ClassifierKey::new(format!("{key} as {}", type_name::<T>()));
        }
        Self {
            key,
            request,
            _output: PhantomData,
        }
    }

    /// Override the derived cache key.
    pub fn with_key(mut self, key: ClassifierKey) -> Self {
        self.key = key;
        self
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }
}

/// Cache key of the raw response to `request`.
pub(crate) fn request_key(request: &FetchRequest) -> ClassifierKey {
    if request.params.is_empty() {
        return ClassifierKey::new(request.to_string());
    }
    let params: Vec<String> = request.params.iter().map(Value::to_string).collect();
    ClassifierKey::new(format!("{request}({})", params.join(",")))
}

impl<T> Clone for FetchClassifier<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            request: self.request.clone(),
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Classifier for FetchClassifier<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Output = T;

    fn key(&self) -> ClassifierKey {
        self.key.clone()
    }

    fn requires(&self) -> Vec<&str> {
        vec![self.request.api.as_str()]
    }

    async fn compute(&self, block: &BlockRef, source: &dyn BlockSource) -> Result<T, WatchError> {
        let raw = source.fetch(&self.request, block).await?;
        self.decode(raw)
    }

    async fn compute_in(&self, ctx: &BlockContext) -> Result<T, WatchError> {
        // the raw entry itself, or a view keyed onto it: fetch directly
        if self.key == request_key(&self.request) {
            return self.compute(ctx.block(), ctx.source().as_ref()).await;
        }
        let raw = ctx.fetch(&self.request).await?;
        self.decode(Value::clone(&raw))
    }
}

impl<T: DeserializeOwned> FetchClassifier<T> {
    fn decode(&self, raw: Value) -> Result<T, WatchError> {
        serde_json::from_value(raw).map_err(|e| WatchError::Serialization(format!("{}: {e}", self.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockSource;
    use crate::source::CORE_API;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Dgpo {
        current_witness: String,
    }

    #[test]
    fn fetch_classifier_key_includes_params() {
        let c: FetchClassifier<Value> = FetchClassifier::new(FetchRequest::core(
            "get_accounts",
            vec![json!("alice"), json!(3)],
        ));
        assert_eq!(c.key().as_str(), r#"core.get_accounts("alice",3)"#);
        assert_eq!(c.requires(), vec!["core"]);

        let bare: FetchClassifier<Value> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));
        assert_eq!(bare.key().as_str(), "core.get_dgpo");
    }

    #[test]
    fn param_boundaries_and_types_stay_distinct() {
        let key = |params: Vec<Value>| {
            FetchClassifier::<Value>::new(FetchRequest::core("get_accounts", params)).key()
        };
        assert_ne!(key(vec![json!("alice,bob")]), key(vec![json!("alice"), json!("bob")]));
        assert_ne!(key(vec![json!("3")]), key(vec![json!(3)]));
        assert_ne!(key(vec![json!("a)")]), key(vec![json!("a"), json!(")")]));
    }

    #[test]
    fn typed_views_get_their_own_key() {
        let raw: FetchClassifier<Value> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));
        let typed: FetchClassifier<Dgpo> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));
        assert_ne!(raw.key(), typed.key());
        assert!(typed.key().as_str().starts_with("core.get_dgpo as "));
        assert!(typed.key().as_str().ends_with("Dgpo"));
    }

    #[tokio::test]
    async fn fetch_classifier_deserializes() {
        let source = MemoryBlockSource::new();
        source.respond(CORE_API, "get_dgpo", json!({ "current_witness": "gtg" }));
        let c: FetchClassifier<Dgpo> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));

        let block = BlockRef::new(1, "0x1", "0x0");
        let dgpo = c.compute(&block, &source).await.unwrap();
        assert_eq!(dgpo.current_witness, "gtg");
    }

    #[tokio::test]
    async fn fetch_classifier_reports_shape_errors() {
        let source = MemoryBlockSource::new();
        source.respond(CORE_API, "get_dgpo", json!([1, 2, 3]));
        let c: FetchClassifier<Dgpo> = FetchClassifier::new(FetchRequest::core("get_dgpo", vec![]));

        let err = c.compute(&BlockRef::new(1, "0x1", "0x0"), &source).await.unwrap_err();
        assert!(matches!(err, WatchError::Serialization(_)));
    }

    #[tokio::test]
    async fn block_header_fetches_by_number() {
        let source = MemoryBlockSource::new();
        source.on_fetch(CORE_API, "get_block_header", |req, _| Ok(json!({ "number": req.params[0] })));
        let header = BlockHeaderClassifier
            .compute(&BlockRef::new(42, "0x2a", "0x29"), &source)
            .await
            .unwrap();
        assert_eq!(header["number"], json!(42));
    }
}
