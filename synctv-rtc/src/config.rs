//! Session configuration
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable configuration. Values are read in the following order, later
//! sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. Config file (if provided)
//! 3. `SYNCTV_RTC_*` environment variables, `__` separating nested keys
//!    (e.g. `SYNCTV_RTC_RETRY__MAX_ATTEMPTS=5`)

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::quality::ProfileLadder;

/// Configuration of one room session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub sampler: SamplerConfig,
    pub adaptation: AdaptationConfig,
    pub thresholds: QualityThresholds,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Round-trip time above which the stream is not stepped up
    pub target_latency_ms: u64,
    /// Wall-clock bound on negotiation without progress
    pub connect_timeout_ms: u64,
    /// Candidates held per peer before a remote description exists
    pub max_buffered_candidates: usize,
    /// Capacity of the event bus channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: 150,
            connect_timeout_ms: 15_000,
            max_buffered_candidates: 64,
            event_capacity: 1024,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }
}

/// Longest backoff delay a configuration may ask for
pub const MAX_RETRY_DELAY_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter, as a fraction of the delay
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_ms: u64,
    /// Samples retained per connection
    pub history_capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            history_capacity: 60,
        }
    }
}

impl SamplerConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Samples considered per decision
    pub window_size: usize,
    /// Fraction of measured bandwidth the ladder may use
    pub bandwidth_safety_margin: f64,
    /// Headroom over the current tier's ceiling required to step up
    pub upgrade_margin: f64,
    /// Consecutive excellent samples required to step up
    pub upgrade_stable_samples: usize,
    pub min_dwell_ms: u64,
    pub flap_window_ms: u64,
    pub max_decisions_per_window: usize,
    pub history_capacity: usize,
    /// Keep manual overrides in force until explicitly cleared
    pub sticky_override: bool,
    pub initial_tier: String,
    pub min_tier: String,
    pub max_tier: String,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            bandwidth_safety_margin: 0.85,
            upgrade_margin: 1.5,
            upgrade_stable_samples: 3,
            min_dwell_ms: 5_000,
            flap_window_ms: 30_000,
            max_decisions_per_window: 3,
            history_capacity: 50,
            sticky_override: false,
            initial_tier: "hd".to_string(),
            min_tier: "minimal".to_string(),
            max_tier: "ultra".to_string(),
        }
    }
}

impl AdaptationConfig {
    #[must_use]
    pub const fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.min_dwell_ms)
    }

    #[must_use]
    pub const fn flap_window(&self) -> Duration {
        Duration::from_millis(self.flap_window_ms)
    }
}

/// RTT (milliseconds) and loss (fraction) ceilings for each quality label
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent_rtt_ms: f64,
    pub excellent_loss: f64,
    pub good_rtt_ms: f64,
    pub good_loss: f64,
    pub critical_rtt_ms: f64,
    pub critical_loss: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_rtt_ms: 100.0,
            excellent_loss: 0.01,
            good_rtt_ms: 200.0,
            good_loss: 0.03,
            critical_rtt_ms: 300.0,
            critical_loss: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl RtcConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_RTC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Reject values the session cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_for(&ProfileLadder::standard())
    }

    /// Same as [`Self::validate`], resolving tier names against `ladder`
    pub fn validate_for(&self, ladder: &ProfileLadder) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.session.connect_timeout_ms == 0 || self.session.target_latency_ms == 0 {
            return invalid("session.connect_timeout_ms and session.target_latency_ms must be positive");
        }

        if self.retry.base_delay_ms == 0 || self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must be in 1..=retry.max_delay_ms");
        }
        if self.retry.max_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(ConfigError::Message(format!(
                "retry.max_delay_ms must not exceed {MAX_RETRY_DELAY_MS}"
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return invalid("retry.jitter_fraction must be within 0..=1");
        }
        if self.sampler.interval_ms == 0 || self.sampler.history_capacity == 0 {
            return invalid("sampler.interval_ms and sampler.history_capacity must be positive");
        }
        if self.adaptation.window_size == 0 || self.adaptation.history_capacity == 0 {
            return invalid("adaptation.window_size and adaptation.history_capacity must be positive");
        }
        if !(self.adaptation.bandwidth_safety_margin > 0.0
            && self.adaptation.bandwidth_safety_margin < 1.0)
        {
            return invalid("adaptation.bandwidth_safety_margin must be within (0, 1)");
        }
        if self.adaptation.upgrade_margin < 1.0 {
            return invalid("adaptation.upgrade_margin must be at least 1.0");
        }
        if self.adaptation.max_decisions_per_window == 0 {
            return invalid("adaptation.max_decisions_per_window must be positive");
        }

        let t = &self.thresholds;
        if !(t.excellent_rtt_ms <= t.good_rtt_ms && t.good_rtt_ms <= t.critical_rtt_ms) {
            return invalid("thresholds: RTT ceilings must be ordered excellent <= good <= critical");
        }
        if !(t.excellent_loss <= t.good_loss && t.good_loss <= t.critical_loss) {
            return invalid("thresholds: loss ceilings must be ordered excellent <= good <= critical");
        }

        let tier = |name: &str| {
            ladder
                .index_of(name)
                .ok_or_else(|| ConfigError::Message(format!("unknown stream tier: {name}")))
        };
        let min = tier(&self.adaptation.min_tier)?;
        let max = tier(&self.adaptation.max_tier)?;
        let initial = tier(&self.adaptation.initial_tier)?;
        if min > max {
            return invalid("adaptation.min_tier must not be above adaptation.max_tier");
        }
        if initial < min || initial > max {
            return invalid("adaptation.initial_tier must lie within min_tier..=max_tier");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::StreamProfile;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = RtcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.adaptation.window_size, 10);
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[retry]\nmax_attempts = 5\n\n[adaptation]\nmin_dwell_ms = 8000\nmax_tier = \"full_hd\""
        )
        .unwrap();

        let config = RtcConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.adaptation.min_dwell(), Duration::from_secs(8));
        assert_eq!(config.adaptation.max_tier, "full_hd");
        // Untouched values keep their defaults
        assert_eq!(config.sampler.interval_ms, 2_000);
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let mut config = RtcConfig::default();
        config.adaptation.max_tier = "8k".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = RtcConfig::default();
        config.adaptation.min_tier = "full_hd".to_string();
        config.adaptation.max_tier = "sd".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = RtcConfig::default();
        config.thresholds.critical_loss = 0.02;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let mut config = RtcConfig::default();
        config.retry.max_delay_ms = MAX_RETRY_DELAY_MS;
        assert!(config.validate().is_ok());

        config.retry.max_delay_ms = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_target_latency_rejected() {
        let mut config = RtcConfig::default();
        config.session.target_latency_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_safety_margin_must_leave_headroom() {
        let mut config = RtcConfig::default();
        config.adaptation.bandwidth_safety_margin = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiers_resolved_against_custom_ladder() {
        let ladder = ProfileLadder::new(vec![
            StreamProfile {
                name: "audio_only".to_string(),
                width: 0,
                height: 0,
                framerate: 0,
                min_bitrate_kbps: 32,
                max_bitrate_kbps: 64,
            },
            StreamProfile {
                name: "video".to_string(),
                width: 1280,
                height: 720,
                framerate: 30,
                min_bitrate_kbps: 64,
                max_bitrate_kbps: 2_500,
            },
        ]);

        let mut config = RtcConfig::default();
        assert!(config.validate_for(&ladder).is_err());

        config.adaptation.min_tier = "audio_only".to_string();
        config.adaptation.initial_tier = "video".to_string();
        config.adaptation.max_tier = "video".to_string();
        assert!(config.validate_for(&ladder).is_ok());
        assert!(config.validate().is_err());
    }
}
