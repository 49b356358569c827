use crate::cache::{AnalysisCache, CacheStats};
use crate::config::OptimizerConfig;
use crate::error::AnalysisError;
use crate::memory::{MemoryMonitor, TrackedReporter};
use crate::metrics::{MetricsAggregator, PerformanceSnapshot};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Default accounting budget for the built-in heap reporter.
const DEFAULT_MEMORY_BUDGET: usize = 512 * 1024 * 1024;

/// Period of the background memory sampler.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Priority tier of an analysis submission. Queued work drains High before
/// Medium before Low; within a tier, strict FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisPriority {
    High,
    Medium,
    Low,
}

impl AnalysisPriority {
    fn queue_index(self) -> usize {
        match self {
            AnalysisPriority::High => 0,
            AnalysisPriority::Medium => 1,
            AnalysisPriority::Low => 2,
        }
    }
}

type BoxedAnalysis = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send>;

/// An admission-denied submission waiting in one of the priority queues.
/// Owned by exactly one queue until dequeued; its reply channel resolves the
/// original caller only when the operation actually settles.
struct QueuedTask {
    key: String,
    operation: BoxedAnalysis,
    enqueued_at: Instant,
    reply: oneshot::Sender<anyhow::Result<Vec<u8>>>,
}

/// Occupancy tracking that counts executions, not keys, so two in-flight
/// runs under the same key each hold a slot.
#[derive(Default)]
struct ActiveSet {
    counts: HashMap<String, usize>,
    total: usize,
}

impl ActiveSet {
    fn admit(&mut self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    fn release(&mut self, key: &str) {
        if let Some(count) = self.counts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(key);
            }
            self.total -= 1;
        }
    }

    fn len(&self) -> usize {
        self.total
    }
}

#[derive(Default)]
struct SchedulerState {
    active: ActiveSet,
    queues: [VecDeque<QueuedTask>; 3],
}

impl SchedulerState {
    fn queued_total(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    fn pop_next(&mut self) -> Option<QueuedTask> {
        self.queues.iter_mut().find_map(|q| q.pop_front())
    }
}

struct Inner {
    config: OptimizerConfig,
    cache: AnalysisCache,
    monitor: MemoryMonitor,
    metrics: MetricsAggregator,
    state: Mutex<SchedulerState>,
}

/// Admission-controlled scheduler for expensive, externally-defined analyses.
///
/// A keyed operation either returns a memoized result, runs immediately when
/// a concurrency slot is free and memory is below threshold, or queues at its
/// priority tier until some completion frees capacity. The caller's future
/// settles only when the operation itself settles, queued or not.
#[derive(Clone)]
pub struct AnalysisScheduler {
    inner: Arc<Inner>,
}

impl AnalysisScheduler {
    pub fn new(config: OptimizerConfig) -> Self {
        let reporter = Arc::new(TrackedReporter::new(DEFAULT_MEMORY_BUDGET));
        let monitor = MemoryMonitor::new(reporter, config.memory_threshold);
        Self::with_monitor(config, monitor)
    }

    /// Construct with an externally supplied memory monitor, so the batch
    /// executor and streaming processor can share the same view of pressure.
    pub fn with_monitor(config: OptimizerConfig, monitor: MemoryMonitor) -> Self {
        let cache = AnalysisCache::new(config.enable_compression);

        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                monitor,
                metrics: MetricsAggregator::new(),
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Run `operation` under `key` at the given priority.
    ///
    /// A live cache entry short-circuits without invoking the operation at
    /// all, regardless of current occupancy. Failures propagate verbatim to
    /// the caller and are never cached; the concurrency slot is released
    /// either way so queued work can proceed.
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        priority: AnalysisPriority,
        operation: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + for<'de> Deserialize<'de> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = &self.inner;

        if inner.config.enable_caching {
            if let Some(value) = inner.cache.get::<T>(key).await {
                debug!(key, "analysis served from cache");
                inner.metrics.record_cache_hit().await;
                return Ok(value);
            }
        }

        let sample = inner.monitor.sample();
        inner.metrics.record_memory_sample(sample).await;

        let admitted = {
            let mut state = inner.state.lock().await;
            if state.active.len() < inner.config.max_concurrent_analyses
                && sample.percentage < inner.config.memory_threshold
            {
                state.active.admit(key);
                true
            } else {
                false
            }
        };

        if admitted {
            debug!(key, "analysis admitted immediately");
            return self.execute_direct(key, operation).await;
        }

        // Denied: box the operation so it can wait in a homogeneous queue,
        // settling the caller through a oneshot once it eventually runs.
        let (tx, rx) = oneshot::channel();
        let key_owned = key.to_string();
        let boxed: BoxedAnalysis = Box::new(move || {
            Box::pin(async move {
                let value = operation().await?;
                encode_payload(&key_owned, &value)
            })
        });

        let queue_index = if inner.config.priority_queue {
            priority.queue_index()
        } else {
            0
        };

        {
            let mut state = inner.state.lock().await;
            state.queues[queue_index].push_back(QueuedTask {
                key: key.to_string(),
                operation: boxed,
                enqueued_at: Instant::now(),
                reply: tx,
            });
            info!(
                key,
                ?priority,
                queued = state.queued_total(),
                active = state.active.len(),
                "analysis queued, concurrency or memory limit reached"
            );
        }

        // Capacity may have changed between the admission check and the
        // enqueue; a drain attempt here avoids a stranded task.
        drain(inner).await;

        let bytes = rx
            .await
            .map_err(|_| AnalysisError::ChannelClosed { key: key.to_string() })??;
        decode_payload(key, &bytes)
    }

    async fn execute_direct<T, F, Fut>(&self, key: &str, operation: F) -> anyhow::Result<T>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let inner = &self.inner;
        let started = Instant::now();
        let result = operation().await;

        {
            let mut state = inner.state.lock().await;
            state.active.release(key);
        }

        match &result {
            Ok(value) => {
                if inner.config.enable_caching {
                    if let Err(e) = inner
                        .cache
                        .set(key, value, inner.config.cache_ttl)
                        .await
                    {
                        warn!(key, error = %e, "failed to cache analysis result");
                    }
                }
            }
            Err(e) => {
                warn!(key, error = %e, "analysis failed");
            }
        }

        inner
            .metrics
            .record_completion(started.elapsed(), result.is_err())
            .await;

        drain(inner).await;
        result
    }

    /// Latest aggregate counters, with a fresh memory sample folded in.
    pub async fn performance_metrics(&self) -> PerformanceSnapshot {
        let sample = self.inner.monitor.sample();
        self.inner.metrics.record_memory_sample(sample).await;
        self.inner.metrics.snapshot().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    /// Queue depths as (high, medium, low).
    pub async fn queue_depths(&self) -> (usize, usize, usize) {
        let state = self.inner.state.lock().await;
        (
            state.queues[0].len(),
            state.queues[1].len(),
            state.queues[2].len(),
        )
    }

    pub fn memory_monitor(&self) -> MemoryMonitor {
        self.inner.monitor.clone()
    }

    /// Start the periodic memory sampler. Separate from construction so the
    /// scheduler can be built before a runtime is running; abort the returned
    /// handle on shutdown.
    ///
    /// Above the threshold each tick logs a warning and fires the cleanup
    /// hint. Below it, the tick drains the queues, so a task denied for
    /// memory pressure is admitted once pressure clears even when no other
    /// submission or completion comes along to trigger a drain.
    pub fn start_memory_sampler(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);

            loop {
                interval.tick().await;

                let sample = inner.monitor.sample();
                inner.metrics.record_memory_sample(sample).await;

                if sample.percentage >= inner.config.memory_threshold {
                    warn!(
                        used = sample.used,
                        total = sample.total,
                        percentage = format!("{:.1}%", sample.percentage * 100.0).as_str(),
                        "memory usage above threshold"
                    );
                    inner.monitor.request_cleanup();
                } else {
                    drain(&inner).await;
                }
            }
        })
    }

    /// Batch entry point sharing this scheduler's memory monitor. Batch work
    /// bypasses the admission queue entirely.
    pub fn batch_executor(&self) -> crate::batch::BatchExecutor {
        crate::batch::BatchExecutor::new(self.inner.monitor.clone())
    }

    /// Batch tuning seeded from the configured chunk size.
    pub fn batch_options<R>(&self) -> crate::batch::BatchOptions<R> {
        crate::batch::BatchOptions {
            batch_size: self.inner.config.batch_size,
            ..Default::default()
        }
    }

    /// Streaming tuning with the buffer sized like the configured chunk size.
    pub fn stream_options(&self) -> crate::stream::StreamOptions {
        crate::stream::StreamOptions {
            buffer_size: self.inner.config.batch_size,
            ..Default::default()
        }
    }

    /// Streaming entry point sharing this scheduler's memory monitor, or
    /// `None` when streaming is disabled by configuration.
    pub fn stream_processor(&self) -> Option<crate::stream::StreamProcessor> {
        if self.inner.config.enable_streaming {
            Some(crate::stream::StreamProcessor::new(self.inner.monitor.clone()))
        } else {
            None
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.inner.config
    }
}

fn encode_payload<T: Serialize>(key: &str, value: &T) -> anyhow::Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| AnalysisError::serialization(key, e.to_string()).into())
}

fn decode_payload<T: for<'de> Deserialize<'de>>(key: &str, bytes: &[u8]) -> anyhow::Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| AnalysisError::serialization(key, e.to_string()).into())
}

/// Admit as many queued tasks as freed capacity and memory allow, highest
/// non-empty tier first, FIFO within a tier.
async fn drain(inner: &Arc<Inner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().await;
            if state.active.len() >= inner.config.max_concurrent_analyses {
                return;
            }
            if inner.monitor.sample().percentage >= inner.config.memory_threshold {
                return;
            }
            let Some(task) = state.pop_next() else {
                return;
            };
            state.active.admit(&task.key);
            task
        };

        debug!(
            key = task.key.as_str(),
            waited_ms = task.enqueued_at.elapsed().as_millis() as u64,
            "draining queued analysis"
        );
        tokio::spawn(execute_queued(inner.clone(), task));
    }
}

/// Settlement path for dequeued work: release the slot, cache success, feed
/// the metrics, answer the waiting caller, then keep draining.
fn execute_queued(inner: Arc<Inner>, task: QueuedTask) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let started = Instant::now();
        let result = (task.operation)().await;

        {
            let mut state = inner.state.lock().await;
            state.active.release(&task.key);
        }

        match &result {
            Ok(bytes) => {
                if inner.config.enable_caching {
                    if let Err(e) = inner
                        .cache
                        .set_serialized(&task.key, bytes.clone(), inner.config.cache_ttl)
                        .await
                    {
                        warn!(key = task.key.as_str(), error = %e, "failed to cache analysis result");
                    }
                }
            }
            Err(e) => {
                warn!(key = task.key.as_str(), error = %e, "queued analysis failed");
            }
        }

        inner
            .metrics
            .record_completion(started.elapsed(), result.is_err())
            .await;

        // A dropped receiver means the caller went away; the slot is already
        // released, so scheduling is unaffected.
        let _ = task.reply.send(result);

        drain(&inner).await;
    })
}
