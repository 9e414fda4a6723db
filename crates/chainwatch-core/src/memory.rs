//! In-memory block source for tests, fixtures and replays.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::source::{BlockSource, BlockStream, FetchRequest, CORE_API};
use crate::sync::{lock, read, write};
use crate::types::BlockRef;

type BlockItem = Result<BlockRef, WatchError>;

/// Custom response function for one `api.method`.
pub type FetchHandler =
    Arc<dyn Fn(&FetchRequest, &BlockRef) -> Result<Value, WatchError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResponseKey {
    api: String,
    method: String,
    block: Option<u64>,
}

/// Scripted block source.
///
/// Blocks are pushed by the test (or fixture loader); fetches are answered
/// from scripted responses, looked up in this order:
/// 1. a response pinned to the requested block,
/// 2. a handler registered with [`MemoryBlockSource::on_fetch`],
/// 3. a response valid for every block.
pub struct MemoryBlockSource {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<BlockItem>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<BlockItem>>>,
    responses: RwLock<HashMap<ResponseKey, Result<Value, WatchError>>>,
    handlers: RwLock<HashMap<(String, String), FetchHandler>>,
    apis: RwLock<HashSet<String>>,
    latency: Option<Duration>,
    fetches: Mutex<HashMap<(String, String), u64>>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut apis = HashSet::new();
        apis.insert(CORE_API.to_string());
        Self {
            name: name.into(),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            responses: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            apis: RwLock::new(apis),
            latency: None,
            fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Delay every fetch by `latency` (lets concurrent requests overlap).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Advertise an additional API without scripting any response yet.
    pub fn with_api(self, api: impl Into<String>) -> Self {
        write(&self.apis).insert(api.into());
        self
    }

    /// Publish a new block to the subscriber.
    ///
    /// Returns `false` once the source is closed.
    pub fn push_block(&self, block: BlockRef) -> bool {
        self.push(Ok(block))
    }

    /// Publish a stream-level error (e.g. a dropped connection).
    pub fn push_error(&self, error: WatchError) -> bool {
        self.push(Err(error))
    }

    /// End the block stream after the already pushed items.
    pub fn close(&self) {
        lock(&self.sender).take();
    }

    fn push(&self, item: BlockItem) -> bool {
        match lock(&self.sender).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Answer `api.method` with `value` for every block.
    pub fn respond(&self, api: &str, method: &str, value: Value) {
        self.script(api, method, None, Ok(value));
    }

    /// Answer `api.method` with `value` for one block only.
    pub fn respond_at(&self, api: &str, method: &str, block: u64, value: Value) {
        self.script(api, method, Some(block), Ok(value));
    }

    /// Fail `api.method` with a transport error for every block.
    pub fn fail(&self, api: &str, method: &str, reason: &str) {
        let err = WatchError::transport(api, method, reason);
        self.script(api, method, None, Err(err));
    }

    /// Fail `api.method` with a transport error for one block only.
    pub fn fail_at(&self, api: &str, method: &str, block: u64, reason: &str) {
        let err = WatchError::transport(api, method, reason);
        self.script(api, method, Some(block), Err(err));
    }

    /// Compute responses for `api.method` with a custom function.
    pub fn on_fetch<F>(&self, api: &str, method: &str, handler: F)
    where
        F: Fn(&FetchRequest, &BlockRef) -> Result<Value, WatchError> + Send + Sync + 'static,
    {
        write(&self.apis).insert(api.to_string());
        write(&self.handlers).insert((api.to_string(), method.to_string()), Arc::new(handler));
    }

    fn script(&self, api: &str, method: &str, block: Option<u64>, response: Result<Value, WatchError>) {
        write(&self.apis).insert(api.to_string());
        let key = ResponseKey {
            api: api.to_string(),
            method: method.to_string(),
            block,
        };
        write(&self.responses).insert(key, response);
    }

    /// How many times `api.method` was fetched.
    pub fn fetch_count(&self, api: &str, method: &str) -> u64 {
        lock(&self.fetches)
            .get(&(api.to_string(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of fetches across all methods.
    pub fn total_fetches(&self) -> u64 {
        lock(&self.fetches).values().sum()
    }

    fn lookup(&self, request: &FetchRequest, block: &BlockRef) -> Result<Value, WatchError> {
        let mut key = ResponseKey {
            api: request.api.clone(),
            method: request.method.clone(),
            block: Some(block.number),
        };
        if let Some(pinned) = read(&self.responses).get(&key) {
            return pinned.clone();
        }
        let handler = read(&self.handlers)
            .get(&(request.api.clone(), request.method.clone()))
            .cloned();
        if let Some(handler) = handler {
            return handler(request, block);
        }
        key.block = None;
        match read(&self.responses).get(&key) {
            Some(any) => any.clone(),
            None => Err(WatchError::transport(
                &request.api,
                &request.method,
                format!("no response scripted for block {}", block.number),
            )),
        }
    }
}

impl Default for MemoryBlockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<BlockStream, WatchError> {
        let rx = lock(&self.receiver)
            .take()
            .ok_or_else(|| WatchError::Source(format!("{} is already subscribed", self.name)))?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn fetch(&self, request: &FetchRequest, block: &BlockRef) -> Result<Value, WatchError> {
        *lock(&self.fetches)
            .entry((request.api.clone(), request.method.clone()))
            .or_default() += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.supports(&request.api) {
            return Err(WatchError::transport(&request.api, &request.method, "unsupported api"));
        }
        self.lookup(request, block)
    }

    fn supports(&self, api: &str) -> bool {
        read(&self.apis).contains(api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn block(n: u64) -> BlockRef {
        BlockRef::new(n, format!("0x{n}"), format!("0x{}", n - 1))
    }

    #[tokio::test]
    async fn stream_yields_pushed_blocks_then_ends() {
        let source = MemoryBlockSource::new();
        source.push_block(block(1));
        source.push_block(block(2));
        source.close();
        assert!(!source.push_block(block(3)));

        let numbers: Vec<u64> = source
            .subscribe()
            .await
            .unwrap()
            .map(|b| b.unwrap().number)
            .collect()
            .await;
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn second_subscribe_fails() {
        let source = MemoryBlockSource::new();
        let _stream = source.subscribe().await.unwrap();
        assert!(matches!(source.subscribe().await, Err(WatchError::Source(_))));
    }

    #[tokio::test]
    async fn pinned_response_wins_over_default() {
        let source = MemoryBlockSource::new();
        source.respond(CORE_API, "get_dgpo", json!({ "witness": "default" }));
        source.respond_at(CORE_API, "get_dgpo", 5, json!({ "witness": "pinned" }));
        let req = FetchRequest::core("get_dgpo", vec![]);

        let at_5 = source.fetch(&req, &block(5)).await.unwrap();
        let at_6 = source.fetch(&req, &block(6)).await.unwrap();
        assert_eq!(at_5["witness"], json!("pinned"));
        assert_eq!(at_6["witness"], json!("default"));
        assert_eq!(source.fetch_count(CORE_API, "get_dgpo"), 2);
    }

    #[tokio::test]
    async fn scripted_failure_and_missing_response() {
        let source = MemoryBlockSource::new();
        source.fail_at(CORE_API, "get_dgpo", 4, "connection reset");
        let req = FetchRequest::core("get_dgpo", vec![]);

        let err = source.fetch(&req, &block(4)).await.unwrap_err();
        assert!(err.is_fetch_failure());
        let missing = source.fetch(&req, &block(5)).await.unwrap_err();
        assert!(matches!(missing, WatchError::Transport { .. }));
    }

    #[tokio::test]
    async fn handler_sees_params() {
        let source = MemoryBlockSource::new();
        source.on_fetch(CORE_API, "get_accounts", |req, _| Ok(json!({ "names": req.params })));
        let req = FetchRequest::core("get_accounts", vec![json!("alice")]);
        let v = source.fetch(&req, &block(1)).await.unwrap();
        assert_eq!(v["names"], json!(["alice"]));
    }
}
