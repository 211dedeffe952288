//! Map/reduce pipeline over chunked record batches.

mod engine;
mod metrics;
mod pool;
mod queue;
mod stage;


pub use engine::{
    default_workers, EngineConfig, Pipeline, PipelineState, PipelineStats, RunningPipeline,
    DEFAULT_RESERVE_CORES,
};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use pool::{parallel_map, ErrorPolicy, PoolOptions};
pub use queue::{ErrorQueue, Message, Queue};
pub use stage::{Stage, StageChain, StageInstance, StageKind, Step};
