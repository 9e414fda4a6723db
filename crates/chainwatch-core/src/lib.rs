//! chainwatch-core: per-block classifier cache and observation pipelines.
//!
//! # Architecture
//!
//! ```text
//! EngineBuilder → Engine
//!                   ├── BlockSource      (block stream + historical fetches)
//!                   ├── BlockContext     (one per block, single-flight classifier cache)
//!                   ├── Pipeline         (filter / piped filter / provider stages)
//!                   │     └── Store      (one per pipeline evaluation)
//!                   └── Subscription     (success + error channels)
//! ```

pub mod builder;
pub mod classifier;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod source;
pub mod stage;
pub mod store;
pub mod subscription;
pub mod types;

mod sync;

pub use builder::PipelineBuilder;
pub use classifier::{BlockHeaderClassifier, Classifier, FetchClassifier};
pub use config::{EngineBuilder, EngineConfig};
pub use context::BlockContext;
pub use engine::Engine;
pub use error::WatchError;
pub use memory::MemoryBlockSource;
pub use metrics::{EngineMetrics, EvaluationState, MetricsRecorder, SnapshotRecorder};
pub use pipeline::{Outcome, Pipeline};
pub use source::{ApiExtension, BlockSource, BlockStream, ExtendedSource, FetchRequest, CORE_API};
pub use stage::{Filter, PipedFilter, Provider, Stage, Step};
pub use store::{Store, StoreSlot};
pub use subscription::{Delivery, EvaluationFailure, Notification, Observer, PipelineId, Subscription};
pub use types::{to_fields, BlockRef, ClassifierKey, Fields};
