//! Fluent pipeline construction.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainwatch_core::{Engine, MemoryBlockSource, Observer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), chainwatch_core::WatchError> {
//! let engine = Engine::builder(Arc::new(MemoryBlockSource::new())).build();
//!
//! let subscription = engine
//!     .observe("headers")
//!     .on_block()
//!     .provide_block_header()
//!     .subscribe(Observer::on_success(|delivery| {
//!         println!("block #{}", delivery.block.number);
//!     }))?;
//! # subscription.cancel();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::classifier::{BlockHeaderClassifier, Classifier};
use crate::context::BlockContext;
use crate::engine::Engine;
use crate::error::WatchError;
use crate::pipeline::Pipeline;
use crate::stage::{Filter, FnFilter, FnPipedFilter, FnProvider, PipedFilter, Provider, Stage};
use crate::store::Store;
use crate::subscription::{Observer, Subscription};
use crate::types::Fields;

/// Builder for a [`Pipeline`]; stage order is the call order.
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
    engine: Option<Engine>,
}

impl PipelineBuilder {
    /// Start an unbound builder (use [`PipelineBuilder::build`] + [`Engine::register`]).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            engine: None,
        }
    }

    pub(crate) fn bound(name: impl Into<String>, engine: Engine) -> Self {
        Self {
            engine: Some(engine),
            ..Self::new(name)
        }
    }

    /// Append a prebuilt stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append a filter given as an async closure.
    pub fn filter<F, Fut>(self, f: F) -> Self
    where
        F: Fn(BlockContext, Store) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, WatchError>> + Send + 'static,
    {
        self.stage(Stage::filter(FnFilter::new(f)))
    }

    pub fn filter_with(self, filter: impl Filter) -> Self {
        self.stage(Stage::filter(filter))
    }

    /// Append a provider given as an async closure returning an object.
    pub fn provide<F, Fut, T>(self, f: F) -> Self
    where
        F: Fn(BlockContext, Store) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WatchError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.stage(Stage::provider(FnProvider::new(f)))
    }

    pub fn provide_with(self, provider: impl Provider) -> Self {
        self.stage(Stage::provider(provider))
    }

    /// Append a piped filter: `provide` runs first, then `matches` sees its data.
    pub fn filter_piped<P, PF, PFut, MF, MFut>(self, provide: PF, matches: MF) -> Self
    where
        P: Serialize + Send + Sync + 'static,
        PF: Fn(BlockContext) -> PFut + Send + Sync + 'static,
        PFut: Future<Output = Result<P, WatchError>> + Send + 'static,
        MF: Fn(Arc<P>, BlockContext, Store) -> MFut + Send + Sync + 'static,
        MFut: Future<Output = Result<bool, WatchError>> + Send + 'static,
    {
        self.stage(Stage::piped(FnPipedFilter::new(provide, matches)))
    }

    pub fn filter_piped_with(self, filter: impl PipedFilter) -> Self {
        self.stage(Stage::piped(filter))
    }

    // ─── Built-ins ────────────────────────────────────────────────────────────

    /// Pass on every block.
    pub fn on_block(self) -> Self {
        self.filter(|_ctx, _store| async move { Ok(true) })
    }

    /// Pass only on the block with height `number`.
    pub fn on_block_number(self, number: u64) -> Self {
        self.filter(move |ctx, _store| async move { Ok(ctx.block().number == number) })
    }

    /// Provide the raw block header under the `block` field.
    pub fn provide_block_header(self) -> Self {
        self.provide_classifier("block", BlockHeaderClassifier)
    }

    /// Gate on a classifier value.
    pub fn filter_on<C, P>(self, classifier: C, predicate: P) -> Self
    where
        C: Classifier,
        P: Fn(&C::Output) -> bool + Send + Sync + 'static,
    {
        let classifier = Arc::new(classifier);
        let predicate = Arc::new(predicate);
        self.filter(move |ctx, _store| {
            let classifier = Arc::clone(&classifier);
            let predicate = Arc::clone(&predicate);
            async move {
                let value = ctx.get(classifier.as_ref()).await?;
                Ok((*predicate)(value.as_ref()))
            }
        })
    }

    /// Provide a classifier value under `field`.
    pub fn provide_classifier<C>(self, field: impl Into<String>, classifier: C) -> Self
    where
        C: Classifier,
        C::Output: Serialize,
    {
        let field: Arc<str> = Arc::from(field.into());
        let classifier = Arc::new(classifier);
        self.provide(move |ctx, _store| {
            let field = Arc::clone(&field);
            let classifier = Arc::clone(&classifier);
            async move {
                let value = ctx.get(classifier.as_ref()).await?;
                let mut fields = Fields::new();
                fields.insert(field.to_string(), serde_json::to_value(value.as_ref())?);
                Ok(fields)
            }
        })
    }

    // ─── Terminals ────────────────────────────────────────────────────────────

    pub fn build(self) -> Pipeline {
        Pipeline::new(self.name, self.stages)
    }

    /// Finalize the pipeline and register it with the engine that created
    /// this builder.
    pub fn subscribe(mut self, observer: Observer) -> Result<Subscription, WatchError> {
        let engine = self.engine.take().ok_or_else(|| WatchError::Unbound {
            pipeline: self.name.clone(),
        })?;
        engine.register(self.build(), observer)
    }
}
