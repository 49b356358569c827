//! Analysis scheduling and resource-control core.
//!
//! Decides when and how many expensive, externally-defined analysis
//! operations may run concurrently, memoizes their results with a TTL,
//! executes bulk work in resilient batches, and throttles throughput under
//! memory pressure. The analyses themselves are opaque caller-supplied
//! futures; this crate only coordinates them.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod scheduler;
pub mod stream;

pub use batch::{BatchError, BatchExecutor, BatchOptions, BatchResult};
pub use cache::{AnalysisCache, CacheEntry, CacheStats};
pub use config::OptimizerConfig;
pub use error::AnalysisError;
pub use memory::{
    HeapReporter, HeapStats, MemoryMonitor, MemoryPressure, MemorySample, TrackedReporter,
};
pub use metrics::{MetricsAggregator, PerformanceSnapshot};
pub use scheduler::{AnalysisPriority, AnalysisScheduler};
pub use stream::{StreamOptions, StreamProcessor};
