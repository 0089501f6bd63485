//! # Global Circuit Breaker Registry
//!
//! Process-wide map of breaker states, shared by every orchestrator that
//! supervises the same subjects. Short-lived instances of one subject all
//! land on the same entry, so a burst of re-created instances cannot each
//! retry independently.
//!
//! Entries are keyed `"<subject>@<backend>"` (see [`breaker_key`]): each
//! backend keeps its own history per subject, and returning to a backend
//! later remembers its earlier failures. Entries are created lazily on the
//! first mount or failure and live until an explicit reset.
//!
//! Every read-modify-write goes through the map's entry API, which holds the
//! shard lock for the duration of the update.

use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerLevel, BreakerStatus, CircuitBreakerState, ErrorOutcome, RecoveryGate, Transition};
use crate::config::{BreakerConfig, ResilienceConfig};
use crate::mount_guard::{MountCycle, MountCycleGuard};
use crate::signature::ErrorSignatureTracker;
use crate::types::{ErrorKind, FailureReport};

/// Registry key for a subject running on a backend
pub fn breaker_key(subject: &str, backend: &str) -> String {
    format!("{}@{}", subject, backend)
}

/// Subject part of a breaker key
///
/// Backend ids never contain `@`, so the subject is everything before the
/// last one; subject ids may contain `@` freely.
pub fn key_subject(key: &str) -> &str {
    key.rsplit_once('@').map_or(key, |(subject, _)| subject)
}

/// Result of recording a mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOutcome {
    pub attempts: u32,
    pub cycle: Option<MountCycle>,
    /// Set when this mount forced the breaker to Permanent
    pub transition: Option<Transition>,
}

/// Diagnostic view of one breaker entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub key: String,
    pub level: BreakerLevel,
    pub error_count: u32,
    pub consecutive_errors: u32,
    pub mount_attempts: u32,
    pub recovery_count: u32,
    pub cooldown_remaining_ms: u64,
    pub permanent_reason: Option<String>,
    pub transitions: Vec<Transition>,
}

/// Shared store of breaker states
#[derive(Debug)]
pub struct GlobalCircuitBreakerRegistry {
    config: BreakerConfig,
    tracker: ErrorSignatureTracker,
    mount_guard: MountCycleGuard,
    breakers: DashMap<String, CircuitBreakerState>,
}

impl GlobalCircuitBreakerRegistry {
    /// Creates an empty registry
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            config: config.breaker.clone(),
            tracker: ErrorSignatureTracker::new(config.signatures.clone()),
            mount_guard: MountCycleGuard::new(config.mount_guard.clone()),
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn new_state(&self, key: &str) -> CircuitBreakerState {
        debug!(subject = %key, "Creating breaker entry");
        CircuitBreakerState::new(key, &self.config, self.tracker.config().history_cap)
    }

    /// Records a classified failure for `key` and returns the breaker's decision
    pub fn record_error(&self, key: &str, report: &FailureReport, kind: ErrorKind) -> ErrorOutcome {
        let now = Instant::now();
        let signature = self.tracker.fingerprint(report, kind, now);

        let outcome = {
            let mut state = self
                .breakers
                .entry(key.to_string())
                .or_insert_with(|| self.new_state(key));
            state.record_error(signature, &self.tracker, &self.config, now)
        };

        counter!("renderer_failures_total", 1, "kind" => kind.as_str());
        if matches!(outcome.transition.as_ref().map(|t| t.to), Some(BreakerLevel::Permanent)) {
            self.record_permanent_gauge();
        }

        outcome
    }

    /// Records a mount and forces Permanent if it completes a mount cycle
    ///
    /// A `terminal` backend is never forced Permanent: the cycle is still
    /// reported, and the entry's mount streak starts over.
    pub fn record_mount(&self, key: &str, terminal: bool) -> MountOutcome {
        let now = Instant::now();
        let outcome = {
            let mut state = self
                .breakers
                .entry(key.to_string())
                .or_insert_with(|| self.new_state(key));
            let cycle = self.mount_guard.observe(key, &mut state.mounts, now);
            let transition = match &cycle {
                Some(cycle) if terminal => {
                    warn!(subject = %key, cycle = %cycle.describe(), "Mount cycle on terminal backend, kept available");
                    state.mounts.clear_cycle();
                    None
                }
                Some(cycle) => state.record_mount_cycle(cycle),
                None => None,
            };
            MountOutcome {
                attempts: state.mounts.attempts,
                cycle,
                transition,
            }
        };

        if outcome.transition.is_some() {
            counter!("renderer_mount_cycles_total", 1);
            self.record_permanent_gauge();
        }

        outcome
    }

    pub fn record_successful_recovery(&self, key: &str) -> Option<Transition> {
        let now = Instant::now();
        self.breakers
            .get_mut(key)
            .and_then(|mut state| state.record_successful_recovery(&self.config, now))
    }

    pub fn record_failed_recovery(&self, key: &str) -> Option<Transition> {
        let transition = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| self.new_state(key))
            .record_failed_recovery(&self.config);
        if transition.is_some() {
            self.record_permanent_gauge();
        }
        transition
    }

    pub fn mark_recovery_attempt(&self, key: &str) {
        let now = Instant::now();
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| self.new_state(key))
            .mark_recovery_attempt(now);
    }

    /// Whether a recovery may start now; unknown keys are always ready
    pub fn recovery_gate(&self, key: &str) -> RecoveryGate {
        let now = Instant::now();
        self.breakers
            .get(key)
            .map(|state| state.recovery_gate(&self.config, now))
            .unwrap_or(RecoveryGate::Ready)
    }

    /// Current status; unknown keys report a fresh Closed breaker
    pub fn status(&self, key: &str) -> BreakerStatus {
        let now = Instant::now();
        self.breakers
            .get(key)
            .map(|state| state.status(&self.config, now))
            .unwrap_or_else(BreakerStatus::fresh)
    }

    /// Effective level, or `None` for a key with no history
    pub fn level(&self, key: &str) -> Option<BreakerLevel> {
        let now = Instant::now();
        self.breakers.get(key).map(|state| state.effective_level(now))
    }

    /// Whether the key has been marked Permanent
    pub fn is_permanent(&self, key: &str) -> bool {
        self.level(key) == Some(BreakerLevel::Permanent)
    }

    pub fn force_permanent(&self, key: &str, reason: &str) -> Option<Transition> {
        let transition = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| self.new_state(key))
            .force_permanent(reason);
        if transition.is_some() {
            self.record_permanent_gauge();
        }
        transition
    }

    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        let now = Instant::now();
        self.breakers.get(key).map(|state| snapshot_of(key, &state, now))
    }

    /// Snapshots of every entry, sorted by key
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| snapshot_of(entry.key(), entry.value(), now))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Keys of the entries belonging to `subject`
    pub fn keys_for(&self, subject: &str) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|entry| key_subject(entry.key()) == subject)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Removes one entry
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.breakers.remove(key).is_some();
        if removed {
            info!(subject = %key, "Breaker reset");
            self.record_permanent_gauge();
        }
        removed
    }

    /// Removes every entry of `subject`, whatever the backend
    pub fn reset_subject(&self, subject: &str) -> usize {
        let before = self.breakers.len();
        self.breakers.retain(|key, _| key_subject(key) != subject);
        let removed = before.saturating_sub(self.breakers.len());
        info!(subject = %subject, removed, "Subject breakers reset");
        self.record_permanent_gauge();
        removed
    }

    /// Clears every entry and the process-wide mount history
    pub fn reset_all(&self) {
        let count = self.breakers.len();
        self.breakers.clear();
        self.mount_guard.reset();
        info!(count, "All breakers reset");
        self.record_permanent_gauge();
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn record_permanent_gauge(&self) {
        let permanent = self
            .breakers
            .iter()
            .filter(|entry| entry.value().level == BreakerLevel::Permanent)
            .count();
        gauge!("renderer_permanent_breakers", permanent as f64);
    }
}

fn snapshot_of(key: &str, state: &CircuitBreakerState, now: Instant) -> BreakerSnapshot {
    BreakerSnapshot {
        key: key.to_string(),
        level: state.effective_level(now),
        error_count: state.error_count,
        consecutive_errors: state.consecutive_errors,
        mount_attempts: state.mounts.attempts,
        recovery_count: state.recovery_count,
        cooldown_remaining_ms: duration_ms(state.cooldown_remaining(now)),
        permanent_reason: state.permanent_reason.clone(),
        transitions: state.transitions.iter().cloned().collect(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
