//! Pipeline stages: filters, piped filters and providers.
//!
//! Stages are stateless; anything they need to remember lives in the
//! block's [`BlockContext`] or the evaluation's [`Store`].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::BlockContext;
use crate::error::WatchError;
use crate::store::Store;
use crate::types::{to_fields, Fields};

/// Boolean gate. `false` ends the evaluation for this block without delivery.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    async fn matches(&self, ctx: &BlockContext, store: &Store) -> Result<bool, WatchError>;
}

/// Data enrichment. Never gates; its fields are merged into the output.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    async fn provide(&self, ctx: &BlockContext, store: &Store) -> Result<Fields, WatchError>;
}

/// A provide step coupled to a gate that sees the provided data.
///
/// `provide` has no store access and never gates; `matches` decides using
/// the piped data plus the live context and store. The piped data is merged
/// into the output when the gate passes and is not kept anywhere else.
#[async_trait]
pub trait PipedFilter: Send + Sync + 'static {
    type Piped: Serialize + Send + Sync + 'static;

    async fn provide(&self, ctx: &BlockContext) -> Result<Self::Piped, WatchError>;

    async fn matches(
        &self,
        piped: Arc<Self::Piped>,
        ctx: &BlockContext,
        store: &Store,
    ) -> Result<bool, WatchError>;
}

/// Type-erased piped filter, so `Stage` can hold any `Piped` type.
#[async_trait]
pub trait DynPipedFilter: Send + Sync + 'static {
    async fn run(&self, ctx: &BlockContext, store: &Store) -> Result<Option<Fields>, WatchError>;
}

struct Piped<T>(T);

#[async_trait]
impl<T: PipedFilter> DynPipedFilter for Piped<T> {
    async fn run(&self, ctx: &BlockContext, store: &Store) -> Result<Option<Fields>, WatchError> {
        let piped = Arc::new(self.0.provide(ctx).await?);
        if self.0.matches(Arc::clone(&piped), ctx, store).await? {
            Ok(Some(to_fields(piped.as_ref())?))
        } else {
            Ok(None)
        }
    }
}

// ─── Stage ────────────────────────────────────────────────────────────────────

/// One step of an observation pipeline.
#[derive(Clone)]
pub enum Stage {
    Filter(Arc<dyn Filter>),
    PipedFilter(Arc<dyn DynPipedFilter>),
    Provider(Arc<dyn Provider>),
}

/// What a stage did for one block.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Gate passed, nothing to merge.
    Pass,
    /// Fields to merge into the output.
    Contribute(Fields),
    /// Gate failed; stop this evaluation.
    Halt,
}

impl Stage {
    pub fn filter(filter: impl Filter) -> Self {
        Self::Filter(Arc::new(filter))
    }

    pub fn provider(provider: impl Provider) -> Self {
        Self::Provider(Arc::new(provider))
    }

    pub fn piped(filter: impl PipedFilter) -> Self {
        Self::PipedFilter(Arc::new(Piped(filter)))
    }

    /// Short label used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filter(_) => "filter",
            Self::PipedFilter(_) => "piped-filter",
            Self::Provider(_) => "provider",
        }
    }

    /// Run the stage once.
    pub async fn execute(&self, ctx: &BlockContext, store: &Store) -> Result<Step, WatchError> {
        match self {
            Self::Filter(f) => Ok(if f.matches(ctx, store).await? {
                Step::Pass
            } else {
                Step::Halt
            }),
            Self::PipedFilter(p) => Ok(match p.run(ctx, store).await? {
                Some(fields) => Step::Contribute(fields),
                None => Step::Halt,
            }),
            Self::Provider(p) => Ok(Step::Contribute(p.provide(ctx, store).await?)),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

// ─── Closure adapters ─────────────────────────────────────────────────────────

/// Filter built from an async closure.
pub struct FnFilter<F> {
    f: F,
}

impl<F, Fut> FnFilter<F>
where
    F: Fn(BlockContext, Store) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, WatchError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Filter for FnFilter<F>
where
    F: Fn(BlockContext, Store) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, WatchError>> + Send + 'static,
{
    async fn matches(&self, ctx: &BlockContext, store: &Store) -> Result<bool, WatchError> {
        (self.f)(ctx.clone(), store.clone()).await
    }
}

/// Provider built from an async closure returning any serializable object.
pub struct FnProvider<F, T> {
    f: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, Fut, T> FnProvider<F, T>
where
    F: Fn(BlockContext, Store) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, WatchError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T> Provider for FnProvider<F, T>
where
    F: Fn(BlockContext, Store) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, WatchError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    async fn provide(&self, ctx: &BlockContext, store: &Store) -> Result<Fields, WatchError> {
        let value = (self.f)(ctx.clone(), store.clone()).await?;
        to_fields(&value)
    }
}

/// Piped filter built from two async closures.
pub struct FnPipedFilter<P, PF, MF> {
    provide: PF,
    matches: MF,
    _piped: PhantomData<fn() -> P>,
}

impl<P, PF, PFut, MF, MFut> FnPipedFilter<P, PF, MF>
where
    P: Serialize + Send + Sync + 'static,
    PF: Fn(BlockContext) -> PFut + Send + Sync + 'static,
    PFut: Future<Output = Result<P, WatchError>> + Send + 'static,
    MF: Fn(Arc<P>, BlockContext, Store) -> MFut + Send + Sync + 'static,
    MFut: Future<Output = Result<bool, WatchError>> + Send + 'static,
{
    pub fn new(provide: PF, matches: MF) -> Self {
        Self {
            provide,
            matches,
            _piped: PhantomData,
        }
    }
}

#[async_trait]
impl<P, PF, PFut, MF, MFut> PipedFilter for FnPipedFilter<P, PF, MF>
where
    P: Serialize + Send + Sync + 'static,
    PF: Fn(BlockContext) -> PFut + Send + Sync + 'static,
    PFut: Future<Output = Result<P, WatchError>> + Send + 'static,
    MF: Fn(Arc<P>, BlockContext, Store) -> MFut + Send + Sync + 'static,
    MFut: Future<Output = Result<bool, WatchError>> + Send + 'static,
{
    type Piped = P;

    async fn provide(&self, ctx: &BlockContext) -> Result<P, WatchError> {
        (self.provide)(ctx.clone()).await
    }

    async fn matches(&self, piped: Arc<P>, ctx: &BlockContext, store: &Store) -> Result<bool, WatchError> {
        (self.matches)(piped, ctx.clone(), store.clone()).await
    }
}
