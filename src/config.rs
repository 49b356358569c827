use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the analysis core.
///
/// Every field has a sensible default; construct with `..Default::default()`
/// and override what the deployment needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Memoize successful analysis results keyed by analysis key
    pub enable_caching: bool,
    /// Time-to-live for cached analysis results
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Upper bound on simultaneously executing analyses
    pub max_concurrent_analyses: usize,
    /// Memory usage fraction (0.0..1.0) above which admission is denied
    pub memory_threshold: f64,
    /// Default chunk size for the batch executor
    pub batch_size: usize,
    /// Enable the streaming processor entry point
    pub enable_streaming: bool,
    /// Compress cache payloads above the compression threshold
    pub enable_compression: bool,
    /// Strict-priority queue ordering; a single FIFO when disabled
    pub priority_queue: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_caching: true,
            cache_ttl: Duration::from_secs(30 * 60),
            max_concurrent_analyses: num_cpus::get().min(3).max(1),
            memory_threshold: 0.8,
            batch_size: 10,
            enable_streaming: true,
            enable_compression: false,
            priority_queue: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OptimizerConfig::default();
        assert!(config.enable_caching);
        assert!(config.priority_queue);
        assert!(config.max_concurrent_analyses >= 1);
        assert!(config.memory_threshold > 0.0 && config.memory_threshold < 1.0);
        assert_eq!(config.cache_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = OptimizerConfig {
            batch_size: 25,
            enable_compression: true,
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let restored: OptimizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.batch_size, 25);
        assert!(restored.enable_compression);
        assert_eq!(restored.cache_ttl, config.cache_ttl);
    }
}
