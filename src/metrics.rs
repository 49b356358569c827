use crate::memory::MemorySample;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Nominal window used for the throughput figure. The rate reported is an
/// average since process start against this fixed denominator, not a true
/// sliding window.
const THROUGHPUT_WINDOW_SECS: f64 = 300.0;

/// Read-only view of the aggregated counters.
#[derive(Debug, Clone, Default)]
pub struct PerformanceSnapshot {
    pub total_analyses: u64,
    pub average_analysis_time: Duration,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub throughput_per_second: f64,
    pub memory_usage: Option<MemorySampleSnapshot>,
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySampleSnapshot {
    pub used: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Default)]
struct MetricsState {
    total_analyses: u64,
    average_analysis_time: Duration,
    timed_samples: u64,
    cache_hit_rate: f64,
    hit_samples: u64,
    error_rate: f64,
    error_samples: u64,
    memory_usage: Option<MemorySampleSnapshot>,
}

/// Running-mean accumulator fed by the scheduler on every completion and
/// cache lookup. Means converge to the simple arithmetic mean over all
/// recorded samples.
#[derive(Clone, Default)]
pub struct MetricsAggregator {
    state: Arc<Mutex<MetricsState>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed operation: one analysis, its latency, and a 0/1
    /// error indicator. Also folds a miss into the hit-rate mean, since a
    /// completed run implies the cache did not serve it.
    pub async fn record_completion(&self, elapsed: Duration, failed: bool) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        state.total_analyses += 1;

        state.timed_samples += 1;
        let n = state.timed_samples as u32;
        state.average_analysis_time =
            (state.average_analysis_time * (n - 1) + elapsed) / n;

        fold_indicator(&mut state.cache_hit_rate, &mut state.hit_samples, false);
        fold_indicator(&mut state.error_rate, &mut state.error_samples, failed);
    }

    /// Record a cache hit: one analysis served without executing anything.
    pub async fn record_cache_hit(&self) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        state.total_analyses += 1;
        fold_indicator(&mut state.cache_hit_rate, &mut state.hit_samples, true);
    }

    pub async fn record_memory_sample(&self, sample: MemorySample) {
        let mut state = self.state.lock().await;
        state.memory_usage = Some(MemorySampleSnapshot {
            used: sample.used,
            total: sample.total,
            percentage: sample.percentage,
        });
    }

    pub async fn snapshot(&self) -> PerformanceSnapshot {
        let state = self.state.lock().await;
        PerformanceSnapshot {
            total_analyses: state.total_analyses,
            average_analysis_time: state.average_analysis_time,
            cache_hit_rate: state.cache_hit_rate,
            error_rate: state.error_rate,
            throughput_per_second: state.total_analyses as f64 / THROUGHPUT_WINDOW_SECS,
            memory_usage: state.memory_usage,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = MetricsState::default();
    }
}

fn fold_indicator(mean: &mut f64, samples: &mut u64, observed: bool) {
    *samples += 1;
    let n = *samples as f64;
    let sample = if observed { 1.0 } else { 0.0 };
    *mean = (*mean * (n - 1.0) + sample) / n;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_total_increments_per_completion_and_hit() {
        let metrics = MetricsAggregator::new();

        metrics
            .record_completion(Duration::from_millis(10), false)
            .await;
        metrics.record_cache_hit().await;
        metrics
            .record_completion(Duration::from_millis(30), true)
            .await;

        let snap = metrics.snapshot().await;
        assert_eq!(snap.total_analyses, 3);
    }

    #[tokio::test]
    async fn test_average_latency_converges_to_mean() {
        let metrics = MetricsAggregator::new();

        metrics
            .record_completion(Duration::from_millis(10), false)
            .await;
        metrics
            .record_completion(Duration::from_millis(30), false)
            .await;

        let snap = metrics.snapshot().await;
        assert_eq!(snap.average_analysis_time, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_hit_rate_stays_in_unit_interval() {
        let metrics = MetricsAggregator::new();

        for i in 0..10 {
            if i % 3 == 0 {
                metrics.record_cache_hit().await;
            } else {
                metrics
                    .record_completion(Duration::from_millis(5), false)
                    .await;
            }
            let snap = metrics.snapshot().await;
            assert!(snap.cache_hit_rate >= 0.0 && snap.cache_hit_rate <= 1.0);
        }

        // 4 hits out of 10 lookups.
        let snap = metrics.snapshot().await;
        assert!((snap.cache_hit_rate - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_error_rate() {
        let metrics = MetricsAggregator::new();

        metrics
            .record_completion(Duration::from_millis(1), true)
            .await;
        metrics
            .record_completion(Duration::from_millis(1), false)
            .await;

        let snap = metrics.snapshot().await;
        assert!((snap.error_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_throughput_uses_fixed_window() {
        let metrics = MetricsAggregator::new();

        for _ in 0..300 {
            metrics
                .record_completion(Duration::from_millis(1), false)
                .await;
        }

        let snap = metrics.snapshot().await;
        assert!((snap.throughput_per_second - 1.0).abs() < 1e-9);
    }
}
