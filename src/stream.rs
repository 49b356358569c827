use crate::memory::MemoryMonitor;
use futures_util::future::join_all;
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Per-call tuning for `process`.
#[derive(Clone)]
pub struct StreamOptions {
    pub buffer_size: usize,
    /// Called after every emitted output with (emitted so far, inputs seen so far).
    pub on_progress: Option<ProgressFn>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            on_progress: None,
        }
    }
}

/// Incremental processor for large or unbounded input sequences.
///
/// Inputs are buffered to `buffer_size`, flushed through the processor with
/// chunk-internal fan-out, and the outputs are emitted one at a time so the
/// consumer applies backpressure simply by not polling. Not resumable
/// mid-stream; restart by calling `process` with a fresh input.
pub struct StreamProcessor {
    monitor: MemoryMonitor,
}

struct StreamState<S, T, R, F> {
    input: Pin<Box<S>>,
    buffer: Vec<T>,
    pending: VecDeque<R>,
    processor: F,
    monitor: MemoryMonitor,
    options: StreamOptions,
    exhausted: bool,
    failed: bool,
    emitted: usize,
    seen: usize,
}

impl StreamProcessor {
    pub fn new(monitor: MemoryMonitor) -> Self {
        Self { monitor }
    }

    /// Derive a lazy output sequence from a lazy input sequence.
    ///
    /// A flush error is yielded once and terminates the stream; outputs
    /// emitted before the error stand.
    pub fn process<S, T, R, F, Fut>(
        &self,
        input: S,
        processor: F,
        options: StreamOptions,
    ) -> impl Stream<Item = anyhow::Result<R>>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send,
    {
        let state = StreamState {
            input: Box::pin(input),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            processor,
            monitor: self.monitor.clone(),
            options,
            exhausted: false,
            failed: false,
            emitted: 0,
            seen: 0,
        };

        stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }

            loop {
                if let Some(output) = state.pending.pop_front() {
                    state.emitted += 1;
                    if let Some(ref on_progress) = state.options.on_progress {
                        on_progress(state.emitted, state.seen);
                    }
                    return Some((Ok(output), state));
                }

                // Refill the buffer up to the flush point or end of input.
                let buffer_size = state.options.buffer_size.max(1);
                while !state.exhausted && state.buffer.len() < buffer_size {
                    match state.input.next().await {
                        Some(item) => {
                            state.seen += 1;
                            state.buffer.push(item);
                        }
                        None => state.exhausted = true,
                    }
                }

                if state.buffer.is_empty() {
                    // Input exhausted and everything emitted.
                    return None;
                }

                // Flush: fan the buffered items out concurrently, keeping
                // item order in the pending outputs.
                let items = std::mem::take(&mut state.buffer);
                debug!(flushed = items.len(), seen = state.seen, "flushing stream buffer");
                let settled = join_all(items.into_iter().map(|item| (state.processor)(item))).await;

                for outcome in settled {
                    match outcome {
                        Ok(output) => state.pending.push_back(output),
                        Err(error) => {
                            state.failed = true;
                            return Some((Err(error), state));
                        }
                    }
                }

                if state.monitor.should_trigger_gc() {
                    state.monitor.request_cleanup();
                }
            }
        })
    }
}
