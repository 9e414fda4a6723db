//! Block-source contract consumed by the engine.
//!
//! A source pushes new block references in height order and answers
//! point-in-time fetches for classifiers. Extra APIs are attached by
//! wrapping a base source in an [`ExtendedSource`] once, at construction.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WatchError;
use crate::types::BlockRef;

/// Name of the API every block source provides.
pub const CORE_API: &str = "core";

/// A stream of new blocks from a source.
pub type BlockStream = Pin<Box<dyn Stream<Item = Result<BlockRef, WatchError>> + Send>>;

/// A request for raw chain data, addressed as `api.method(params)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub api: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl FetchRequest {
    pub fn new(api: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            api: api.into(),
            method: method.into(),
            params,
        }
    }

    /// Request against the core API.
    pub fn core(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(CORE_API, method, params)
    }
}

impl std::fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.api, self.method)
    }
}

/// Abstraction over whatever transport produces blocks and chain data.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn BlockSource>`.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// Human-readable source name (endpoint, chain id, ...).
    fn name(&self) -> &str;

    /// Start streaming new blocks, at most once per block, in height order.
    async fn subscribe(&self) -> Result<BlockStream, WatchError>;

    /// Fetch raw data for `block`.
    async fn fetch(&self, request: &FetchRequest, block: &BlockRef) -> Result<Value, WatchError>;

    /// Returns `true` if requests against `api` can be served.
    fn supports(&self, api: &str) -> bool {
        api == CORE_API
    }
}

// ─── Extensions ───────────────────────────────────────────────────────────────

/// An additional API attached to a block source (e.g. a balance tracker).
#[async_trait]
pub trait ApiExtension: Send + Sync + 'static {
    /// The API name requests are addressed to.
    fn api(&self) -> &str;

    async fn call(&self, method: &str, params: &[Value], block: &BlockRef) -> Result<Value, WatchError>;
}

/// A base source composed with extra APIs.
///
/// Requests for an extension API go to that extension; everything else,
/// including the block stream, is served by the base source.
pub struct ExtendedSource {
    base: Arc<dyn BlockSource>,
    extensions: HashMap<String, Arc<dyn ApiExtension>>,
    name: String,
}

impl ExtendedSource {
    pub fn new(base: Arc<dyn BlockSource>) -> Self {
        let name = base.name().to_string();
        Self {
            base,
            extensions: HashMap::new(),
            name,
        }
    }

    /// Attach an extension. A later extension with the same API name replaces
    /// the earlier one.
    pub fn with_extension(mut self, extension: Arc<dyn ApiExtension>) -> Self {
        let api = extension.api().to_string();
        self.name = format!("{}+{}", self.name, api);
        self.extensions.insert(api, extension);
        self
    }
}

#[async_trait]
impl BlockSource for ExtendedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<BlockStream, WatchError> {
        self.base.subscribe().await
    }

    async fn fetch(&self, request: &FetchRequest, block: &BlockRef) -> Result<Value, WatchError> {
        match self.extensions.get(&request.api) {
            Some(ext) => ext.call(&request.method, &request.params, block).await,
            None => self.base.fetch(request, block).await,
        }
    }

    fn supports(&self, api: &str) -> bool {
        self.extensions.contains_key(api) || self.base.supports(api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockSource;
    use serde_json::json;

    struct TopHolders;

    #[async_trait]
    impl ApiExtension for TopHolders {
        fn api(&self) -> &str {
            "balance"
        }

        async fn call(&self, method: &str, _params: &[Value], block: &BlockRef) -> Result<Value, WatchError> {
            match method {
                "top_holders" => Ok(json!({ "at": block.number, "holders": ["alice", "bob"] })),
                other => Err(WatchError::transport("balance", other, "unknown method")),
            }
        }
    }

    #[tokio::test]
    async fn extension_routes_by_api() {
        let base = Arc::new(MemoryBlockSource::new());
        base.respond(CORE_API, "get_dgpo", json!({ "current_witness": "gtg" }));

        let source = ExtendedSource::new(base).with_extension(Arc::new(TopHolders));
        assert!(source.supports("balance"));
        assert!(source.supports(CORE_API));
        assert!(!source.supports("market"));
        assert_eq!(source.name(), "memory+balance");

        let block = BlockRef::new(7, "0x7", "0x6");
        let holders = source
            .fetch(&FetchRequest::new("balance", "top_holders", vec![]), &block)
            .await
            .unwrap();
        assert_eq!(holders["at"], json!(7));

        let dgpo = source.fetch(&FetchRequest::core("get_dgpo", vec![]), &block).await.unwrap();
        assert_eq!(dgpo["current_witness"], json!("gtg"));
    }

    #[test]
    fn fetch_request_display() {
        let req = FetchRequest::new("balance", "top_holders", vec![json!("HIVE")]);
        assert_eq!(req.to_string(), "balance.top_holders");
    }
}
