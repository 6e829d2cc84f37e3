//! spotwarden.toml configuration parser.
//!
//! Every section and field is optional; missing values take the defaults
//! below. Call [`SpotwardenConfig::validate`] before handing the config to
//! the engine or the failover coordinator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpotwardenConfig {
    pub engine: EngineConfig,
    pub replica: ReplicaConfig,
    pub safety: SafetyConfig,
    pub daemon: DaemonConfig,
}

/// Named thresholds for the decision engine. Passed by value into each
/// evaluation; never read from globals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub baseline_discount: f64,
    pub baseline_volatility: f64,
    pub discount_margin: f64,
    pub volatility_factor_max: f64,
    pub min_future_discount_gain: f64,
    pub min_future_risk_improvement: f64,
    pub cooldown_minutes: u64,
    /// CPU p95 (%) below which an instance may be over-provisioned.
    pub over_provisioned_cpu: f64,
    /// Memory p95 (%) below which an instance may be over-provisioned.
    pub over_provisioned_memory: f64,
    pub under_provisioned_cpu: f64,
    pub under_provisioned_memory: f64,
    pub fallback_to_ondemand_enabled: bool,
    pub allow_rightsize_up: bool,
    pub allow_rightsize_down: bool,
    pub dry_run_mode: bool,
    /// Candidate price ceiling as a multiple of the current pool price.
    pub current_price_tolerance: f64,
    /// Pools whose latest sample is older than this are dropped.
    pub price_staleness_secs: u64,
    /// Multiplier applied to `discount_margin` when forecasting fell back.
    pub forecast_fallback_margin_factor: f64,
    /// Relative memory difference still counted as a similar shape.
    pub similar_shape_tolerance: f64,
    /// Usage metrics window.
    pub usage_window_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baseline_discount: 0.60,
            baseline_volatility: 0.05,
            discount_margin: 0.05,
            volatility_factor_max: 1.5,
            min_future_discount_gain: 0.02,
            min_future_risk_improvement: 0.005,
            cooldown_minutes: 30,
            over_provisioned_cpu: 30.0,
            over_provisioned_memory: 40.0,
            under_provisioned_cpu: 80.0,
            under_provisioned_memory: 80.0,
            fallback_to_ondemand_enabled: true,
            allow_rightsize_up: true,
            allow_rightsize_down: true,
            dry_run_mode: false,
            current_price_tolerance: 1.1,
            price_staleness_secs: 900,
            forecast_fallback_margin_factor: 1.5,
            similar_shape_tolerance: 0.25,
            usage_window_secs: 3600,
        }
    }
}

impl EngineConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    pub fn usage_window(&self) -> Duration {
        Duration::from_secs(self.usage_window_secs)
    }
}

/// Weights for the rebalance-recommendation interruption heuristic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeuristicConfig {
    pub weight_pool_rate: f64,
    pub weight_age: f64,
    pub weight_time_of_day: f64,
    /// Age at which the age factor saturates at 1.0.
    pub age_saturation_hours: f64,
    /// UTC hour the peak window starts (inclusive).
    pub peak_start_hour: u8,
    /// UTC hour the peak window ends (exclusive).
    pub peak_end_hour: u8,
    /// Time-of-day factor outside the peak window.
    pub peak_off_factor: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            weight_pool_rate: 0.5,
            weight_age: 0.2,
            weight_time_of_day: 0.3,
            age_saturation_hours: 24.0,
            peak_start_hour: 13,
            peak_end_hour: 22,
            peak_off_factor: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Operators may request standby replicas by hand.
    pub manual_replicas_enabled: bool,
    /// React to interruption signals automatically.
    pub auto_defense_enabled: bool,
    pub emergency_probability_threshold: f64,
    pub heuristic: HeuristicConfig,
    /// Hard deadline assumed when a termination notice carries none.
    pub termination_deadline_secs: u64,
    /// Bound on waiting for a promoted replica to report running.
    pub promotion_timeout_secs: u64,
    /// Time reserved after promotion to drain and terminate the old primary.
    pub drain_margin_secs: u64,
    /// Terminate the parent on promotion instead of keeping it as a zombie.
    pub terminate_parent_on_promotion: bool,
    pub replica_launch_timeout_secs: u64,
    pub degraded_launch_timeout_secs: u64,
    /// Time to restore the emergency snapshot onto a fresh instance.
    pub degraded_restore_secs: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            manual_replicas_enabled: true,
            auto_defense_enabled: true,
            emergency_probability_threshold: 0.35,
            heuristic: HeuristicConfig::default(),
            termination_deadline_secs: 120,
            promotion_timeout_secs: 90,
            drain_margin_secs: 15,
            terminate_parent_on_promotion: false,
            replica_launch_timeout_secs: 600,
            degraded_launch_timeout_secs: 300,
            degraded_restore_secs: 60,
        }
    }
}

impl ReplicaConfig {
    pub fn promotion_timeout(&self) -> Duration {
        Duration::from_secs(self.promotion_timeout_secs)
    }

    pub fn drain_margin(&self) -> Duration {
        Duration::from_secs(self.drain_margin_secs)
    }

    pub fn degraded_launch_timeout(&self) -> Duration {
        Duration::from_secs(self.degraded_launch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Consecutive failed switches that open the breaker.
    pub breaker_failure_threshold: u32,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 3,
            retry_max_attempts: 3,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub cycle_interval_secs: u64,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub region: String,
    /// Workloads protected by this daemon.
    pub workloads: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 300,
            api_port: 8470,
            data_dir: PathBuf::from("/var/lib/spotwarden"),
            region: "us-east-1".to_string(),
            workloads: Vec::new(),
        }
    }
}

impl SpotwardenConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SpotwardenConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine or failover inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.engine;
        for (name, value) in [
            ("baseline_discount", e.baseline_discount),
            ("baseline_volatility", e.baseline_volatility),
            ("discount_margin", e.discount_margin),
            ("volatility_factor_max", e.volatility_factor_max),
            ("min_future_discount_gain", e.min_future_discount_gain),
            ("min_future_risk_improvement", e.min_future_risk_improvement),
            ("current_price_tolerance", e.current_price_tolerance),
            ("similar_shape_tolerance", e.similar_shape_tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "engine.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if e.forecast_fallback_margin_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "engine.forecast_fallback_margin_factor must be >= 1.0".to_string(),
            ));
        }
        for (name, value) in [
            ("over_provisioned_cpu", e.over_provisioned_cpu),
            ("over_provisioned_memory", e.over_provisioned_memory),
            ("under_provisioned_cpu", e.under_provisioned_cpu),
            ("under_provisioned_memory", e.under_provisioned_memory),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "engine.{name} must be within 0-100, got {value}"
                )));
            }
        }
        if e.over_provisioned_cpu >= e.under_provisioned_cpu
            || e.over_provisioned_memory >= e.under_provisioned_memory
        {
            return Err(ConfigError::Invalid(
                "over-provisioned thresholds must sit below under-provisioned thresholds"
                    .to_string(),
            ));
        }

        let r = &self.replica;
        if r.promotion_timeout_secs + r.drain_margin_secs >= r.termination_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "replica.promotion_timeout_secs ({}) + drain_margin_secs ({}) must be below \
                 termination_deadline_secs ({})",
                r.promotion_timeout_secs, r.drain_margin_secs, r.termination_deadline_secs
            )));
        }
        if r.degraded_restore_secs == 0 {
            return Err(ConfigError::Invalid(
                "replica.degraded_restore_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&r.emergency_probability_threshold) {
            return Err(ConfigError::Invalid(
                "replica.emergency_probability_threshold must be within 0-1".to_string(),
            ));
        }
        let h = &r.heuristic;
        if h.peak_start_hour > 23 || h.peak_end_hour > 24 || h.age_saturation_hours <= 0.0 {
            return Err(ConfigError::Invalid(
                "replica.heuristic peak hours must be within 0-24 and age saturation positive"
                    .to_string(),
            ));
        }

        if self.safety.breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "safety.breaker_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.safety.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "safety.retry_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SpotwardenConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_minimal() {
        let config = SpotwardenConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.cooldown_minutes, 30);
        assert_eq!(config.safety.breaker_failure_threshold, 3);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[engine]
baseline_discount = 0.5
dry_run_mode = true

[daemon]
workloads = ["web", "batch"]
"#;
        let config = SpotwardenConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.engine.baseline_discount, 0.5);
        assert!(config.engine.dry_run_mode);
        // Untouched fields keep defaults.
        assert_eq!(config.engine.discount_margin, 0.05);
        assert_eq!(config.daemon.workloads, vec!["web", "batch"]);
    }

    #[test]
    fn rejects_promotion_timeout_past_deadline() {
        let toml_str = r#"
[replica]
promotion_timeout_secs = 110
drain_margin_secs = 15
"#;
        let err = SpotwardenConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("promotion_timeout_secs"));
    }

    #[test]
    fn rejects_inverted_usage_thresholds() {
        let mut config = SpotwardenConfig::default();
        config.engine.over_provisioned_cpu = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_breaker_threshold() {
        let mut config = SpotwardenConfig::default();
        config.safety.breaker_failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = SpotwardenConfig::default();
        config.engine.cooldown_minutes = 12;
        let s = config.to_toml_string().unwrap();
        let back = SpotwardenConfig::from_toml_str(&s).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn duration_helpers() {
        let config = SpotwardenConfig::default();
        assert_eq!(config.engine.cooldown(), Duration::from_secs(1800));
        assert_eq!(config.replica.promotion_timeout(), Duration::from_secs(90));
    }
}
