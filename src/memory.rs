use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// High-water mark above which the streaming and batch paths ask for a
/// cleanup pass regardless of the configured admission threshold.
const GC_WATERMARK: f64 = 0.9;

/// Heap usage as reported by the host runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub used: usize,
    pub total: usize,
}

/// Point-in-time memory sample used for admission decisions and logging.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used: usize,
    pub total: usize,
    pub percentage: f64,
}

/// Source of heap statistics. The host runtime's reporter is injected; the
/// core never assumes a particular allocator or runtime.
pub trait HeapReporter: Send + Sync {
    fn heap_stats(&self) -> HeapStats;
}

/// Default reporter backed by explicit accounting. Embedders register and
/// release bytes as their analyses allocate working sets; tests drive it
/// directly to simulate pressure.
#[derive(Debug)]
pub struct TrackedReporter {
    used: AtomicUsize,
    total: usize,
}

impl TrackedReporter {
    pub fn new(total: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            total,
        }
    }

    pub fn register(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: usize) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set_used(&self, bytes: usize) {
        self.used.store(bytes, Ordering::Relaxed);
    }
}

impl HeapReporter for TrackedReporter {
    fn heap_stats(&self) -> HeapStats {
        HeapStats {
            used: self.used.load(Ordering::Relaxed),
            total: self.total,
        }
    }
}

/// Memory pressure levels derived from the latest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

type CleanupHint = Arc<dyn Fn() + Send + Sync>;

/// On-demand memory sampler shared by the scheduler, batch executor and
/// streaming processor.
///
/// The cleanup hint is best-effort only: a GC trigger where the host runtime
/// exposes one, a no-op otherwise. It is never a correctness requirement.
#[derive(Clone)]
pub struct MemoryMonitor {
    reporter: Arc<dyn HeapReporter>,
    threshold: f64,
    cleanup_hint: CleanupHint,
}

impl MemoryMonitor {
    pub fn new(reporter: Arc<dyn HeapReporter>, threshold: f64) -> Self {
        Self {
            reporter,
            threshold,
            cleanup_hint: Arc::new(|| {}),
        }
    }

    /// Replace the no-op cleanup hint with a host-provided one.
    pub fn with_cleanup_hint(mut self, hint: impl Fn() + Send + Sync + 'static) -> Self {
        self.cleanup_hint = Arc::new(hint);
        self
    }

    /// Recompute a fresh sample from the host reporter.
    pub fn sample(&self) -> MemorySample {
        let stats = self.reporter.heap_stats();
        let percentage = if stats.total == 0 {
            0.0
        } else {
            stats.used as f64 / stats.total as f64
        };

        MemorySample {
            used: stats.used,
            total: stats.total,
            percentage,
        }
    }

    /// True when usage is above the configured admission threshold.
    pub fn over_threshold(&self) -> bool {
        self.sample().percentage >= self.threshold
    }

    /// True above the 90% high-water mark, where bulk consumers should pause
    /// for a cleanup pass.
    pub fn should_trigger_gc(&self) -> bool {
        self.sample().percentage >= GC_WATERMARK
    }

    pub fn request_cleanup(&self) {
        debug!("requesting memory cleanup hint");
        (self.cleanup_hint)();
    }

    pub fn pressure(&self) -> MemoryPressure {
        let pct = self.sample().percentage;
        if pct >= GC_WATERMARK {
            MemoryPressure::Critical
        } else if pct >= self.threshold {
            MemoryPressure::High
        } else if pct >= 0.6 {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_sample_percentage() {
        let reporter = Arc::new(TrackedReporter::new(1000));
        reporter.register(250);

        let monitor = MemoryMonitor::new(reporter, 0.8);
        let sample = monitor.sample();
        assert_eq!(sample.used, 250);
        assert_eq!(sample.total, 1000);
        assert!((sample.percentage - 0.25).abs() < f64::EPSILON);
        assert!(!monitor.over_threshold());
    }

    #[test]
    fn test_threshold_and_watermark() {
        let reporter = Arc::new(TrackedReporter::new(1000));
        let monitor = MemoryMonitor::new(reporter.clone(), 0.8);

        reporter.set_used(850);
        assert!(monitor.over_threshold());
        assert!(!monitor.should_trigger_gc());
        assert_eq!(monitor.pressure(), MemoryPressure::High);

        reporter.set_used(950);
        assert!(monitor.should_trigger_gc());
        assert_eq!(monitor.pressure(), MemoryPressure::Critical);
    }

    #[test]
    fn test_cleanup_hint_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let reporter = Arc::new(TrackedReporter::new(100));
        let monitor = MemoryMonitor::new(reporter, 0.8)
            .with_cleanup_hint(move || fired_clone.store(true, Ordering::SeqCst));

        monitor.request_cleanup();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_release_saturates() {
        let reporter = TrackedReporter::new(100);
        reporter.register(10);
        reporter.release(50);
        assert_eq!(reporter.heap_stats().used, 0);
    }

    #[test]
    fn test_zero_total_is_not_pressure() {
        let reporter = Arc::new(TrackedReporter::new(0));
        let monitor = MemoryMonitor::new(reporter, 0.8);
        assert_eq!(monitor.sample().percentage, 0.0);
        assert!(!monitor.over_threshold());
    }
}
