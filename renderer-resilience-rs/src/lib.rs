//! # Renderer Resilience
//!
//! Supervision for a visual component that can be drawn by several
//! interchangeable rendering backends of decreasing fidelity. The crate
//! decides, failure by failure, whether to recover in place or fall back to
//! a simpler backend, and never retries a broken backend forever.
//!
//! ## Features
//!
//! - Ordered, data-driven classification of raw backend failures
//! - Fixed recovery policy per failure kind
//! - Identical/similar failure fingerprinting over a rolling window
//! - Circuit breaker per subject and backend, shared process-wide
//! - Mount cycle detection independent of failure content
//! - Fallback chain that always ends in an always-available backend
//! - Cancellable recovery scheduling, at most one per subject
//! - Event stream, metrics and debug snapshots for diagnostics
//!

pub mod types;
pub mod classifier;
pub mod policy;
pub mod signature;
pub mod circuit_breaker;
pub mod mount_guard;
pub mod registry;
pub mod fallback;
pub mod recovery;
pub mod orchestrator;
pub mod monitoring;
pub mod config;
pub mod logging;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use types::{Error, Result, ErrorKind, FailureReport, Severity};
pub use classifier::{classify, classify_report};
pub use policy::{policy_for, RecoveryPolicy, RecoveryStrategy};
pub use signature::{ErrorSignature, ErrorSignatureTracker, SignatureMatches};
pub use circuit_breaker::{BreakerDecision, BreakerLevel, BreakerStatus, CircuitBreakerState, RecoveryGate};
pub use mount_guard::{MountCycle, MountCycleGuard};
pub use registry::{breaker_key, key_subject, BreakerSnapshot, GlobalCircuitBreakerRegistry};
pub use fallback::{
    BackendDescriptor, CapabilityProbe, DegradedFeature, DegradedFeatures, DeviceCapabilities, FallbackChain,
    FallbackChainResolver,
};
pub use recovery::{NoopHooks, RecoveryHooks, RecoveryScheduler};
pub use orchestrator::{DebugSnapshot, FailureDecision, RendererOrchestrator, SubjectStatus};
pub use monitoring::{EventKind, RendererEvent};
pub use config::{load_config, ResilienceConfig};
pub use logging::{init_logging, LoggingConfig};

/// Initializes logging with default settings
pub fn init() -> Result<()> {
    init_logging(None)
}

/// Loads configuration and initializes logging from it
pub fn init_with_config(path: Option<&str>) -> Result<ResilienceConfig> {
    let config = load_config(path)?;
    init_logging(Some(config.logging.clone()))?;
    Ok(config)
}
