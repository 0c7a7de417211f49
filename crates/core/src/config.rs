use serde::Deserialize;

/// Root engine configuration. Loaded from environment variables with the
/// prefix `DONORPULSE__` and optional config files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub clustering: ClusteringDefaults,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

/// Cadence and concurrency of background segment reconciliation.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often the dirty-segment queue is drained.
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    /// How often every auto-updating segment is marked dirty as a safety net.
    #[serde(default = "default_full_refresh_interval_secs")]
    pub full_refresh_interval_secs: u64,
    /// Upper bound on concurrently reconciling segments.
    #[serde(default = "default_max_concurrent_reconciliations")]
    pub max_concurrent_reconciliations: usize,
}

/// Fallbacks applied when a clustering request leaves fields unset.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusteringDefaults {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

/// Time windows and gates for behavioral pattern analysis.
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_short_window_days")]
    pub short_window_days: i64,
    #[serde(default = "default_medium_window_days")]
    pub medium_window_days: i64,
    #[serde(default = "default_long_window_days")]
    pub long_window_days: i64,
    /// Minimum qualifying events before a pattern is reported at all.
    #[serde(default = "default_minimum_activity")]
    pub minimum_activity: usize,
    /// Per-30-day decay applied to a pattern's weight as its signal ages.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

// Default functions
fn default_drain_interval_secs() -> u64 {
    60
}
fn default_full_refresh_interval_secs() -> u64 {
    3600
}
fn default_max_concurrent_reconciliations() -> usize {
    4
}
fn default_max_iterations() -> u32 {
    100
}
fn default_tolerance() -> f64 {
    0.001
}
fn default_short_window_days() -> i64 {
    30
}
fn default_medium_window_days() -> i64 {
    90
}
fn default_long_window_days() -> i64 {
    365
}
fn default_minimum_activity() -> usize {
    3
}
fn default_weight_decay() -> f64 {
    0.9
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval_secs(),
            full_refresh_interval_secs: default_full_refresh_interval_secs(),
            max_concurrent_reconciliations: default_max_concurrent_reconciliations(),
        }
    }
}

impl Default for ClusteringDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            short_window_days: default_short_window_days(),
            medium_window_days: default_medium_window_days(),
            long_window_days: default_long_window_days(),
            minimum_activity: default_minimum_activity(),
            weight_decay: default_weight_decay(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DONORPULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.drain_interval_secs, 60);
        assert_eq!(config.scheduler.full_refresh_interval_secs, 3600);
        assert_eq!(config.clustering.max_iterations, 100);
        assert!((config.clustering.tolerance - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.behavior.minimum_activity, 3);
    }
}
