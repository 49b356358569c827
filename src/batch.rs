use crate::memory::MemoryMonitor;
use futures_util::future::join_all;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum wall-clock spacing between consecutive chunks. Caps the worst-case
/// request rate against whatever rate-limited collaborator the processor
/// calls into.
const DEFAULT_THROTTLE_FLOOR: Duration = Duration::from_millis(1000);

type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Per-call tuning for `run_batches`.
pub struct BatchOptions<R> {
    pub batch_size: usize,
    pub throttle_floor: Duration,
    /// Called after each chunk with (completed items, total items).
    pub on_progress: Option<ProgressFn>,
    /// Called after each chunk with that chunk's successful outputs and its index.
    pub on_batch_complete: Option<Box<dyn Fn(&[R], usize) + Send + Sync>>,
}

impl<R> Default for BatchOptions<R> {
    fn default() -> Self {
        Self {
            batch_size: 10,
            throttle_floor: DEFAULT_THROTTLE_FLOOR,
            on_progress: None,
            on_batch_complete: None,
        }
    }
}

/// One item's failure, isolated from the rest of its chunk.
#[derive(Debug)]
pub struct BatchError<T> {
    pub item: T,
    pub error: anyhow::Error,
    pub index: usize,
}

/// Aggregate outcome of a batch run. Immutable once returned.
#[derive(Debug)]
pub struct BatchResult<T, R> {
    pub results: Vec<R>,
    pub errors: Vec<BatchError<T>>,
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub total_time: Duration,
    pub average_time_per_item: Duration,
    pub batches: usize,
}

/// Runs large item collections through a processor in fixed-size chunks with
/// per-item failure isolation and inter-chunk throttling.
///
/// Independent of the scheduler's admission queue; only the memory monitor is
/// shared.
pub struct BatchExecutor {
    monitor: MemoryMonitor,
}

impl BatchExecutor {
    pub fn new(monitor: MemoryMonitor) -> Self {
        Self { monitor }
    }

    /// Process `items` in contiguous chunks of `options.batch_size`, chunks
    /// strictly in input order, items within a chunk fanned out concurrently.
    ///
    /// A failing item is recorded in `errors` and never aborts its chunk or
    /// subsequent chunks; a panicking item is recorded the same way. Output
    /// order in `results` follows original item order, not completion order.
    pub async fn run_batches<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        options: BatchOptions<R>,
    ) -> BatchResult<T, R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let total_items = items.len();
        let batch_size = options.batch_size.max(1);
        let batches = (total_items + batch_size - 1) / batch_size;
        let started = Instant::now();

        info!(total_items, batch_size, batches, "starting batch run");

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut completed = 0usize;

        let chunks: Vec<Vec<T>> = items
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        for (batch_index, chunk) in chunks.into_iter().enumerate() {
            let chunk_started = Instant::now();
            let chunk_len = chunk.len();
            let base_index = batch_index * batch_size;

            // Fan out: one spawned task per item so a panic is contained to
            // that item and surfaces as a JoinError.
            let handles: Vec<_> = chunk
                .iter()
                .cloned()
                .map(|item| {
                    let processor = processor.clone();
                    tokio::spawn(async move { processor(item).await })
                })
                .collect();

            let settled = join_all(handles).await;

            let mut chunk_results = Vec::new();
            for (offset, (outcome, item)) in settled.into_iter().zip(chunk).enumerate() {
                let index = base_index + offset;
                match outcome {
                    Ok(Ok(output)) => chunk_results.push(output),
                    Ok(Err(error)) => {
                        debug!(index, error = %error, "batch item failed");
                        errors.push(BatchError { item, error, index });
                    }
                    Err(join_error) => {
                        warn!(index, error = %join_error, "batch item panicked");
                        errors.push(BatchError {
                            item,
                            error: anyhow::anyhow!("batch item panicked: {}", join_error),
                            index,
                        });
                    }
                }
            }

            completed += chunk_len;

            if let Some(ref on_batch_complete) = options.on_batch_complete {
                on_batch_complete(&chunk_results, batch_index);
            }
            if let Some(ref on_progress) = options.on_progress {
                on_progress(completed, total_items);
            }

            results.extend(chunk_results);

            if self.monitor.should_trigger_gc() {
                self.monitor.request_cleanup();
            }

            // Spacing floor between chunks; skipped after the final one.
            let elapsed = chunk_started.elapsed();
            let more_remaining = completed < total_items;
            if more_remaining && elapsed < options.throttle_floor {
                tokio::time::sleep(options.throttle_floor - elapsed).await;
            }
        }

        let total_time = started.elapsed();
        let average_time_per_item = if total_items == 0 {
            Duration::ZERO
        } else {
            total_time / total_items as u32
        };

        info!(
            successful = results.len(),
            failed = errors.len(),
            elapsed_ms = total_time.as_millis() as u64,
            "batch run finished"
        );

        BatchResult {
            successful_items: results.len(),
            failed_items: errors.len(),
            results,
            errors,
            total_items,
            total_time,
            average_time_per_item,
            batches,
        }
    }
}
