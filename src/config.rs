// Tap and supervisor configuration
//
// Every tunable of the tap pipeline lives here with the defaults the engine
// was designed around. Durations are kept in milliseconds so the config file
// stays plain JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
const CONFIG_DIR_NAME: &str = "app-volume";
const CONFIG_FILE_NAME: &str = "config.json";

/// Per-tap settings: activation bounds and signal-path constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Time constant of the one-pole gain ramp
    pub ramp_time_constant_ms: f32,

    /// How long to wait for the aggregate device to report an active stream
    pub readiness_timeout_ms: u64,

    /// Delay between readiness polls
    pub readiness_poll_interval_ms: u64,

    /// Used when the aggregate device does not report a nominal rate
    pub fallback_sample_rate: f64,

    /// Exponential smoothing factor applied to the peak meter per buffer
    pub peak_smoothing: f32,

    /// Soft-knee limiter threshold (linear amplitude)
    pub limiter_threshold: f32,

    /// Prefix of the UID given to every synthesized aggregate device
    pub aggregate_uid_prefix: String,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            ramp_time_constant_ms: 30.0,
            readiness_timeout_ms: 2000,
            readiness_poll_interval_ms: 10,
            fallback_sample_rate: DEFAULT_SAMPLE_RATE,
            peak_smoothing: 0.3,
            limiter_threshold: 0.8,
            aggregate_uid_prefix: "com.appvolume.tap".to_string(),
        }
    }
}

impl TapConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms.max(1))
    }

    /// One-pole coefficient reaching ~63% of a step after one time constant
    pub fn ramp_coefficient(&self, sample_rate: f64) -> f32 {
        let rate = if sample_rate.is_finite() && sample_rate > 0.0 {
            sample_rate
        } else {
            self.fallback_sample_rate
        };
        let time_constant_s = f64::from(self.ramp_time_constant_ms) / 1000.0;
        (1.0 - (-1.0 / (rate * time_constant_s)).exp()) as f32
    }
}

/// Supervisor settings: device-change recovery bounds and housekeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tap: TapConfig,

    /// Wait after a default-output change before recreating taps
    pub settle_delay_ms: u64,

    /// Recreation attempts per process before it is dropped
    pub max_recreate_attempts: u32,

    /// Backoff between attempts grows linearly by this step
    pub recreate_backoff_ms: u64,

    /// How often taps of exited processes are pruned (0 disables)
    pub prune_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tap: TapConfig::default(),
            settle_delay_ms: 100,
            max_recreate_attempts: 3,
            recreate_backoff_ms: 100,
            prune_interval_ms: 30_000,
        }
    }
}

impl SupervisorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Backoff before the retry that follows failed attempt `attempt` (1-based)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.recreate_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn prune_interval(&self) -> Option<Duration> {
        (self.prune_interval_ms > 0).then(|| Duration::from_millis(self.prune_interval_ms))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse supervisor config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded supervisor config from {}", path.display());
        Ok(config)
    }

    /// Default location: `<config dir>/app-volume/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the user's config file if one exists, otherwise the defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No supervisor config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_recreate_attempts == 0 {
            anyhow::bail!("max_recreate_attempts must be at least 1");
        }
        if !(self.tap.ramp_time_constant_ms > 0.0) {
            anyhow::bail!(
                "ramp_time_constant_ms must be positive (got {})",
                self.tap.ramp_time_constant_ms
            );
        }
        if !(0.0..=1.0).contains(&self.tap.peak_smoothing) {
            anyhow::bail!(
                "peak_smoothing must be within 0.0..=1.0 (got {})",
                self.tap.peak_smoothing
            );
        }
        if !(self.tap.limiter_threshold > 0.0 && self.tap.limiter_threshold < 1.0) {
            anyhow::bail!(
                "limiter_threshold must be within 0.0..1.0 (got {})",
                self.tap.limiter_threshold
            );
        }
        if !(self.tap.fallback_sample_rate > 0.0) {
            anyhow::bail!("fallback_sample_rate must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tap.readiness_timeout(), Duration::from_secs(2));
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.max_recreate_attempts, 3);
    }

    #[test]
    fn test_ramp_coefficient_at_48k() {
        let config = TapConfig::default();
        let expected = 1.0 - (-1.0f64 / (48_000.0 * 0.030)).exp();
        let coefficient = config.ramp_coefficient(48_000.0);
        assert!((coefficient as f64 - expected).abs() < 1e-9);
        assert!(coefficient > 0.0 && coefficient < 0.001);
    }

    #[test]
    fn test_ramp_coefficient_falls_back_on_bad_rate() {
        let config = TapConfig::default();
        assert_eq!(
            config.ramp_coefficient(0.0),
            config.ramp_coefficient(DEFAULT_SAMPLE_RATE)
        );
        assert_eq!(
            config.ramp_coefficient(f64::NAN),
            config.ramp_coefficient(DEFAULT_SAMPLE_RATE)
        );
    }

    #[test]
    fn test_linear_backoff() {
        let config = SupervisorConfig::default();
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SupervisorConfig::from_json_str(r#"{ "settle_delay_ms": 250, "tap": { "peak_smoothing": 0.5 } }"#)
                .unwrap();
        assert_eq!(config.settle_delay_ms, 250);
        assert_eq!(config.tap.peak_smoothing, 0.5);
        assert_eq!(config.tap.readiness_timeout_ms, 2000);
        assert_eq!(config.max_recreate_attempts, 3);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = SupervisorConfig::from_json_str(r#"{ "max_recreate_attempts": 0 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_prune_interval_disabled() {
        let config = SupervisorConfig {
            prune_interval_ms: 0,
            ..SupervisorConfig::default()
        };
        assert!(config.prune_interval().is_none());
    }
}
