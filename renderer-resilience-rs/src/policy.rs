//! # Recovery Policies
//!
//! One fixed policy row per [`ErrorKind`]: whether the failure can be
//! recovered in place, how long to wait first, how many attempts the
//! backend gets, and which strategy performs the recovery.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ErrorKind;

/// Named recovery strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Wait, scaling the wait with the attempt number, then retry
    RetryWithBackoff,
    /// Retry after a minimal wait
    RetryImmediate,
    /// Release cached resources, wait, then retry
    CleanupAndRetry,
    /// Disable the failing feature, then retry
    DisableFeature,
    /// Swap materials for simpler ones, then retry
    FallbackMaterials,
    /// Retry a single time after a minimal wait
    RetryOnce,
    /// Abandon the backend and move down the fallback chain
    FallbackBackend,
}

impl RecoveryStrategy {
    /// Strategy name as used in telemetry
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::RetryWithBackoff => "retry-with-backoff",
            RecoveryStrategy::RetryImmediate => "retry-immediate",
            RecoveryStrategy::CleanupAndRetry => "cleanup-and-retry",
            RecoveryStrategy::DisableFeature => "disable-feature",
            RecoveryStrategy::FallbackMaterials => "fallback-materials",
            RecoveryStrategy::RetryOnce => "retry-once",
            RecoveryStrategy::FallbackBackend => "fallback-backend",
        }
    }

    /// Whether the strategy recovers on the current backend
    pub fn recovers_in_place(&self) -> bool {
        !matches!(self, RecoveryStrategy::FallbackBackend)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recovery policy for one failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Whether the failure can be recovered without leaving the backend
    pub can_recover: bool,
    /// Delay before the strategy runs
    pub recovery_delay: Duration,
    /// Attempts allowed per backend stint
    pub max_retries: u32,
    /// Strategy that performs the recovery
    pub strategy: RecoveryStrategy,
}

impl RecoveryPolicy {
    const fn recoverable(delay_ms: u64, max_retries: u32, strategy: RecoveryStrategy) -> Self {
        Self {
            can_recover: true,
            recovery_delay: Duration::from_millis(delay_ms),
            max_retries,
            strategy,
        }
    }

    const fn fallback() -> Self {
        Self {
            can_recover: false,
            recovery_delay: Duration::ZERO,
            max_retries: 0,
            strategy: RecoveryStrategy::FallbackBackend,
        }
    }

    /// Whether another attempt fits in the budget after `attempts_made`
    pub fn has_budget(&self, attempts_made: u32) -> bool {
        self.can_recover && attempts_made < self.max_retries
    }
}

/// Looks up the policy for a failure kind
pub fn policy_for(kind: ErrorKind) -> RecoveryPolicy {
    match kind {
        ErrorKind::Network => RecoveryPolicy::recoverable(2000, 3, RecoveryStrategy::RetryWithBackoff),
        ErrorKind::Loading => RecoveryPolicy::recoverable(1000, 2, RecoveryStrategy::RetryImmediate),
        ErrorKind::Memory => RecoveryPolicy::recoverable(5000, 1, RecoveryStrategy::CleanupAndRetry),
        ErrorKind::Parsing | ErrorKind::Validation | ErrorKind::Geometry => RecoveryPolicy::fallback(),
        ErrorKind::Animation => RecoveryPolicy::recoverable(500, 1, RecoveryStrategy::DisableFeature),
        ErrorKind::Material | ErrorKind::Texture => {
            RecoveryPolicy::recoverable(1000, 2, RecoveryStrategy::FallbackMaterials)
        }
        ErrorKind::Generic => RecoveryPolicy::recoverable(1000, 1, RecoveryStrategy::RetryOnce),
    }
}
