//! Engine configuration.
//!
//! Loaded from TOML, optionally layered with `CERTIFY__`-prefixed environment
//! variables (`CERTIFY__TIMEOUTS__MIN_TIMEOUT_MS=500`), and validated before
//! use.

use crate::{CertifyError, CertifyResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "CERTIFY";

/// Adaptive view timeout policy.
///
/// The timeout stays at `min_timeout_ms` while the number of consecutive
/// failed rounds is at most `happy_path_max_round_failures`; every failure
/// beyond that multiplies it by `increase_factor`, capped at `max_timeout_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub increase_factor: f64,
    pub happy_path_max_round_failures: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: 1_000,
            max_timeout_ms: 30_000,
            increase_factor: 2.0,
            happy_path_max_round_failures: 6,
        }
    }
}

impl TimeoutConfig {
    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

/// Per-collector resource bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectorConfig {
    /// Votes buffered per view before their block is known
    pub max_pending_votes_per_view: usize,
    /// Messages more than this many views past the current view are dropped
    /// before a collector is created for them
    pub max_view_lookahead: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_pending_votes_per_view: 1024,
            max_view_lookahead: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    pub collectors: CollectorConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout bounds in milliseconds
    pub fn with_timeout_bounds(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.timeouts.min_timeout_ms = min_ms;
        self.timeouts.max_timeout_ms = max_ms;
        self
    }

    pub fn with_increase_factor(mut self, factor: f64) -> Self {
        self.timeouts.increase_factor = factor;
        self
    }

    pub fn with_happy_path_max_round_failures(mut self, failures: u32) -> Self {
        self.timeouts.happy_path_max_round_failures = failures;
        self
    }

    pub fn with_max_pending_votes(mut self, limit: usize) -> Self {
        self.collectors.max_pending_votes_per_view = limit;
        self
    }

    pub fn with_max_view_lookahead(mut self, views: u64) -> Self {
        self.collectors.max_view_lookahead = views;
        self
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> CertifyResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply `CERTIFY__` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> CertifyResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> CertifyResult<()> {
        let t = &self.timeouts;
        if t.min_timeout_ms == 0 {
            return Err(CertifyError::InvalidConfig(
                "min_timeout_ms must be positive".to_string(),
            ));
        }
        if t.max_timeout_ms < t.min_timeout_ms {
            return Err(CertifyError::InvalidConfig(format!(
                "max_timeout_ms ({}) is below min_timeout_ms ({})",
                t.max_timeout_ms, t.min_timeout_ms
            )));
        }
        if !(t.increase_factor > 1.0) || !t.increase_factor.is_finite() {
            return Err(CertifyError::InvalidConfig(format!(
                "increase_factor must be a finite number above 1.0, got {}",
                t.increase_factor
            )));
        }
        if self.collectors.max_pending_votes_per_view == 0 {
            return Err(CertifyError::InvalidConfig(
                "max_pending_votes_per_view must be positive".to_string(),
            ));
        }
        if self.collectors.max_view_lookahead == 0 {
            return Err(CertifyError::InvalidConfig(
                "max_view_lookahead must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
