//! # Configuration
//!
//! Thresholds and timings for every stage of the pipeline, layered from
//! built-in defaults, an optional file and `RENDERER_RESILIENCE__*`
//! environment variables.
//!
//! Durations are expressed in milliseconds so that they read naturally in
//! TOML/YAML files and environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::logging::LoggingConfig;
use crate::types::{Error, Result};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "RENDERER_RESILIENCE";

/// Circuit breaker thresholds and cooldowns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Identical occurrences in-window that open the breaker
    pub open_identical_threshold: u32,
    /// Consecutive errors that open the breaker
    pub open_consecutive_threshold: u32,
    /// Identical occurrences in-window that make the breaker permanent
    pub permanent_identical_threshold: u32,
    /// Similar occurrences in-window that make the breaker permanent
    pub permanent_similar_threshold: u32,
    /// Base cooldown for Closed → Open
    pub base_cooldown_ms: u64,
    /// Upper bound for Closed → Open cooldowns
    pub max_cooldown_ms: u64,
    /// Base cooldown when a probe fails
    pub escalation_base_ms: u64,
    /// Upper bound for escalated cooldowns
    pub max_escalated_cooldown_ms: u64,
    /// Base of the minimum interval between recovery attempts
    pub min_recovery_interval_ms: u64,
    /// Upper bound of the minimum interval between recovery attempts
    pub max_recovery_interval_ms: u64,
    /// Failed recoveries that make the breaker permanent
    pub failed_recovery_limit: u32,
    /// How long a breaker that closed after a recovery stays on probation
    pub probation_ms: u64,
    /// Transitions kept per breaker for diagnostics
    pub transition_log_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_identical_threshold: 3,
            open_consecutive_threshold: 3,
            permanent_identical_threshold: 4,
            permanent_similar_threshold: 7,
            base_cooldown_ms: 2_000,
            max_cooldown_ms: 30_000,
            escalation_base_ms: 5_000,
            max_escalated_cooldown_ms: 120_000,
            min_recovery_interval_ms: 5_000,
            max_recovery_interval_ms: 30_000,
            failed_recovery_limit: 3,
            probation_ms: 60_000,
            transition_log_size: 32,
        }
    }
}

impl BreakerConfig {
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.base_cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    pub fn escalation_base(&self) -> Duration {
        Duration::from_millis(self.escalation_base_ms)
    }

    pub fn max_escalated_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_escalated_cooldown_ms)
    }

    pub fn probation(&self) -> Duration {
        Duration::from_millis(self.probation_ms)
    }

    /// Minimum interval required after `recovery_count` recovery attempts
    pub fn recovery_interval(&self, recovery_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(recovery_count);
        let interval = self.min_recovery_interval_ms.saturating_mul(factor);
        Duration::from_millis(interval.min(self.max_recovery_interval_ms))
    }
}

/// Signature tracking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Only signatures this recent are compared
    pub window_ms: u64,
    /// Maximum signatures retained per subject
    pub history_cap: usize,
    /// Characters of the stack kept in a signature
    pub stack_prefix_len: usize,
    /// Characters of the message compared for similarity
    pub similar_prefix_len: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            history_cap: 12,
            stack_prefix_len: 250,
            similar_prefix_len: 50,
        }
    }
}

impl SignatureConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Mount cycle detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountGuardConfig {
    /// Mounts closer together than this count as rapid
    pub rapid_interval_ms: u64,
    /// Rapid mounts of one subject that constitute a cycle
    pub rapid_mount_limit: u32,
    /// Rolling window for the process-wide mount count
    pub global_window_ms: u64,
    /// Mounts across all subjects tolerated within the window
    pub global_mount_limit: usize,
}

impl Default for MountGuardConfig {
    fn default() -> Self {
        Self {
            rapid_interval_ms: 2_000,
            rapid_mount_limit: 3,
            global_window_ms: 2_000,
            global_mount_limit: 5,
        }
    }
}

impl MountGuardConfig {
    pub fn rapid_interval(&self) -> Duration {
        Duration::from_millis(self.rapid_interval_ms)
    }

    pub fn global_window(&self) -> Duration {
        Duration::from_millis(self.global_window_ms)
    }
}

/// Recovery strategy timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Per-attempt wait added by retry-with-backoff
    pub backoff_step_ms: u64,
    /// Upper bound of the retry-with-backoff wait
    pub max_backoff_ms: u64,
    /// Wait used by retry-immediate and retry-once
    pub minimal_wait_ms: u64,
    /// Settle time after releasing cached resources
    pub cleanup_settle_ms: u64,
    /// Random extra wait as a fraction of the backoff wait
    pub jitter_factor: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_step_ms: 500,
            max_backoff_ms: 8_000,
            minimal_wait_ms: 50,
            cleanup_settle_ms: 250,
            jitter_factor: 0.1,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub signatures: SignatureConfig,
    pub mount_guard: MountGuardConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

impl ResilienceConfig {
    /// Rejects threshold combinations that would make the state machine incoherent
    pub fn validate(&self) -> Result<()> {
        let b = &self.breaker;
        if b.open_identical_threshold == 0 || b.open_consecutive_threshold == 0 {
            return Err(Error::Configuration("open thresholds must be at least 1".into()));
        }
        if b.permanent_identical_threshold <= b.open_identical_threshold {
            return Err(Error::Configuration(format!(
                "permanent_identical_threshold ({}) must exceed open_identical_threshold ({})",
                b.permanent_identical_threshold, b.open_identical_threshold
            )));
        }
        if b.permanent_similar_threshold < b.permanent_identical_threshold {
            return Err(Error::Configuration(
                "permanent_similar_threshold must not be below permanent_identical_threshold".into(),
            ));
        }
        if b.max_cooldown_ms < b.base_cooldown_ms || b.max_escalated_cooldown_ms < b.escalation_base_ms {
            return Err(Error::Configuration("cooldown caps must not be below their bases".into()));
        }
        if b.failed_recovery_limit == 0 {
            return Err(Error::Configuration("failed_recovery_limit must be at least 1".into()));
        }
        if self.signatures.history_cap == 0 {
            return Err(Error::Configuration("signature history_cap must be at least 1".into()));
        }
        if (self.signatures.history_cap as u32) < b.permanent_similar_threshold {
            return Err(Error::Configuration(format!(
                "signature history_cap ({}) cannot hold permanent_similar_threshold ({}) occurrences",
                self.signatures.history_cap, b.permanent_similar_threshold
            )));
        }
        if self.mount_guard.rapid_mount_limit < 2 {
            return Err(Error::Configuration("rapid_mount_limit must be at least 2".into()));
        }
        if !(0.0..=1.0).contains(&self.recovery.jitter_factor) {
            return Err(Error::Configuration("jitter_factor must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

impl TryFrom<::config::Config> for ResilienceConfig {
    type Error = ::config::ConfigError;

    fn try_from(cfg: ::config::Config) -> std::result::Result<Self, Self::Error> {
        cfg.try_deserialize()
    }
}

/// Loads configuration from defaults, an optional file and the environment
pub fn load_config(path: Option<&str>) -> Result<ResilienceConfig> {
    // A missing .env file is normal outside development
    if dotenv::dotenv().is_ok() {
        debug!("Loaded environment from .env");
    }

    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::with_name(path).required(false));
    }
    builder = builder.add_source(
        ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = ResilienceConfig::try_from(builder.build()?)?;
    config.validate()?;

    info!(
        file = ?path,
        open_identical = config.breaker.open_identical_threshold,
        permanent_identical = config.breaker.permanent_identical_threshold,
        permanent_similar = config.breaker.permanent_similar_threshold,
        "Resilience configuration loaded"
    );

    Ok(config)
}
