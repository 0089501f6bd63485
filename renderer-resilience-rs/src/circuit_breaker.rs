//! # Circuit Breaker State Machine
//!
//! One breaker per supervised subject/backend pair. It consumes classified
//! failures together with their signature match counts and decides whether
//! the backend may keep trying (`Allow`), must stand down (`Block`), or is
//! finished for good (`Permanent`).
//!
//! # State Transitions
//! ```text
//! Closed   → Open       identical occurrences or consecutive errors reach the open threshold
//! Closed   → Permanent  identical or similar occurrences reach the permanent threshold
//! Open     → HalfOpen   cooldown elapsed
//! HalfOpen → Open       any error, with an escalated cooldown
//! HalfOpen → Closed     successful recoveries bring consecutive errors to zero
//! any      → Permanent  mount cycle or repeated failed recoveries
//! ```
//!
//! A breaker that closes from HalfOpen is on probation for a while; an error
//! during probation reopens it with the escalated cooldown, as if it were
//! still HalfOpen. Permanent is terminal until an explicit reset.
//!
//! All entry points take `now` explicitly; the registry supplies the clock.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BreakerConfig;
use crate::mount_guard::{MountCycle, MountTrack};
use crate::signature::{ErrorSignature, ErrorSignatureTracker, SignatureHistory, SignatureMatches};

/// Circuit breaker levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerLevel {
    /// Normal operation
    Closed,
    /// Rejecting retries until the cooldown ends
    Open,
    /// Cooldown over, probing with recoveries
    HalfOpen,
    /// Never retried again without an explicit reset
    Permanent,
}

impl fmt::Display for BreakerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerLevel::Closed => write!(f, "CLOSED"),
            BreakerLevel::Open => write!(f, "OPEN"),
            BreakerLevel::HalfOpen => write!(f, "HALF-OPEN"),
            BreakerLevel::Permanent => write!(f, "PERMANENT"),
        }
    }
}

/// What the caller may do after a failure was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerDecision {
    /// Stay on the backend; recover if the policy allows
    Allow,
    /// The breaker is open; move to another backend
    Block,
    /// The backend is finished for this subject
    Permanent,
}

/// Whether a recovery may start now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryGate {
    Ready,
    /// Allowed once the minimum inter-recovery interval has passed
    WaitFor(Duration),
    Denied,
}

/// A recorded level change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: BreakerLevel,
    pub to: BreakerLevel,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Result of recording a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOutcome {
    pub decision: BreakerDecision,
    pub matches: SignatureMatches,
    /// Level change caused by this failure, if any
    pub transition: Option<Transition>,
    /// Cooldown started by this failure, if the breaker opened
    pub cooldown: Option<Duration>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub level: BreakerLevel,
    pub can_mount: bool,
    pub can_recover: bool,
    pub should_fallback: bool,
    pub cooldown_remaining: Duration,
    pub error_count: u32,
    pub mount_attempts: u32,
}

impl BreakerStatus {
    /// Status of a subject nothing has been recorded for
    pub fn fresh() -> Self {
        Self {
            level: BreakerLevel::Closed,
            can_mount: true,
            can_recover: true,
            should_fallback: false,
            cooldown_remaining: Duration::ZERO,
            error_count: 0,
            mount_attempts: 0,
        }
    }
}

/// Per-subject breaker state
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub subject: String,
    pub level: BreakerLevel,
    pub error_count: u32,
    pub consecutive_errors: u32,
    pub last_error_time: Option<Instant>,
    pub cooldown_end_time: Option<Instant>,
    /// Length of the most recent cooldown
    pub last_cooldown: Duration,
    pub signature_history: SignatureHistory,
    pub mounts: MountTrack,
    /// Recoveries that failed since the last successful one
    pub consecutive_mount_failures: u32,
    pub recovery_count: u32,
    pub last_recovery_attempt_time: Option<Instant>,
    pub probation_until: Option<Instant>,
    pub permanent_reason: Option<String>,
    pub transitions: VecDeque<Transition>,
    transition_log_size: usize,
}

impl CircuitBreakerState {
    pub fn new<S: Into<String>>(subject: S, config: &BreakerConfig, history_cap: usize) -> Self {
        Self {
            subject: subject.into(),
            level: BreakerLevel::Closed,
            error_count: 0,
            consecutive_errors: 0,
            last_error_time: None,
            cooldown_end_time: None,
            last_cooldown: Duration::ZERO,
            signature_history: SignatureHistory::new(history_cap),
            mounts: MountTrack::default(),
            consecutive_mount_failures: 0,
            recovery_count: 0,
            last_recovery_attempt_time: None,
            probation_until: None,
            permanent_reason: None,
            transitions: VecDeque::new(),
            transition_log_size: config.transition_log_size.max(1),
        }
    }

    /// Level as of `now`, treating an expired Open cooldown as HalfOpen
    pub fn effective_level(&self, now: Instant) -> BreakerLevel {
        match (self.level, self.cooldown_end_time) {
            (BreakerLevel::Open, Some(end)) if now >= end => BreakerLevel::HalfOpen,
            (level, _) => level,
        }
    }

    /// Time left in the current Open cooldown
    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        match (self.level, self.cooldown_end_time) {
            (BreakerLevel::Open, Some(end)) => end.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    fn is_cooling(&self, now: Instant) -> bool {
        self.effective_level(now) == BreakerLevel::Open
    }

    fn on_probation(&self, now: Instant) -> bool {
        self.probation_until.map_or(false, |until| now < until)
    }

    /// Applies time-driven transitions
    pub fn refresh(&mut self, now: Instant) {
        if self.level == BreakerLevel::Open && self.effective_level(now) == BreakerLevel::HalfOpen {
            self.transition(BreakerLevel::HalfOpen, "cooldown elapsed");
            self.cooldown_end_time = None;
        }
        if self.probation_until.map_or(false, |until| now >= until) {
            self.probation_until = None;
        }
    }

    /// Records a classified failure and decides what the caller may do
    pub fn record_error(
        &mut self,
        signature: ErrorSignature,
        tracker: &ErrorSignatureTracker,
        config: &BreakerConfig,
        now: Instant,
    ) -> ErrorOutcome {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error_time = Some(now);

        if self.level == BreakerLevel::Permanent {
            return ErrorOutcome {
                decision: BreakerDecision::Permanent,
                matches: SignatureMatches::default(),
                transition: None,
                cooldown: None,
            };
        }

        self.refresh(now);

        let matches = tracker.count_matches(&self.signature_history, &signature, now);
        let kind = signature.kind;
        self.signature_history.push(signature);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        debug!(
            subject = %self.subject,
            kind = %kind,
            level = %self.level,
            identical = matches.identical,
            similar = matches.similar,
            consecutive = self.consecutive_errors,
            "Failure recorded"
        );

        if matches.identical >= config.permanent_identical_threshold
            || matches.similar >= config.permanent_similar_threshold
        {
            let reason = format!(
                "critical failure pattern: {} identical, {} similar occurrences",
                matches.identical, matches.similar
            );
            let transition = self.make_permanent(reason);
            return ErrorOutcome {
                decision: BreakerDecision::Permanent,
                matches,
                transition,
                cooldown: None,
            };
        }

        match self.level {
            BreakerLevel::Closed if self.on_probation(now) => {
                let cooldown = self.escalated_cooldown(config);
                let transition = self.open(cooldown, now, "failure during post-recovery probation");
                self.probation_until = None;
                ErrorOutcome {
                    decision: BreakerDecision::Block,
                    matches,
                    transition: Some(transition),
                    cooldown: Some(cooldown),
                }
            }
            BreakerLevel::Closed
                if matches.identical >= config.open_identical_threshold
                    || self.consecutive_errors >= config.open_consecutive_threshold =>
            {
                let cooldown = self.backoff(config);
                let reason = format!(
                    "{} identical occurrences, {} consecutive errors",
                    matches.identical, self.consecutive_errors
                );
                let transition = self.open(cooldown, now, &reason);
                ErrorOutcome {
                    decision: BreakerDecision::Block,
                    matches,
                    transition: Some(transition),
                    cooldown: Some(cooldown),
                }
            }
            BreakerLevel::Closed => ErrorOutcome {
                decision: BreakerDecision::Allow,
                matches,
                transition: None,
                cooldown: None,
            },
            BreakerLevel::Open => {
                debug!(
                    subject = %self.subject,
                    remaining_ms = self.cooldown_remaining(now).as_millis() as u64,
                    "Breaker open, failure blocked"
                );
                ErrorOutcome {
                    decision: BreakerDecision::Block,
                    matches,
                    transition: None,
                    cooldown: None,
                }
            }
            BreakerLevel::HalfOpen => {
                let cooldown = self.escalated_cooldown(config);
                let transition = self.open(cooldown, now, "failure while probing");
                ErrorOutcome {
                    decision: BreakerDecision::Block,
                    matches,
                    transition: Some(transition),
                    cooldown: Some(cooldown),
                }
            }
            BreakerLevel::Permanent => ErrorOutcome {
                decision: BreakerDecision::Permanent,
                matches,
                transition: None,
                cooldown: None,
            },
        }
    }

    /// Bookkeeping for a recovery that succeeded
    pub fn record_successful_recovery(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        if self.level == BreakerLevel::Permanent {
            return None;
        }
        self.refresh(now);

        self.consecutive_errors = self.consecutive_errors.saturating_sub(1);
        self.error_count = self.error_count.saturating_sub(1);
        self.consecutive_mount_failures = 0;
        self.signature_history.retire_newest();

        if self.level == BreakerLevel::HalfOpen && self.consecutive_errors == 0 {
            let transition = self.transition(BreakerLevel::Closed, "recovered");
            self.probation_until = Some(now + config.probation());
            info!(subject = %self.subject, "Breaker closed after recovery");
            return Some(transition);
        }

        debug!(
            subject = %self.subject,
            level = %self.level,
            consecutive = self.consecutive_errors,
            "Recovery succeeded"
        );
        None
    }

    /// Bookkeeping for a recovery that failed; returns a transition to Permanent at the limit
    pub fn record_failed_recovery(&mut self, config: &BreakerConfig) -> Option<Transition> {
        if self.level == BreakerLevel::Permanent {
            return None;
        }
        self.consecutive_mount_failures = self.consecutive_mount_failures.saturating_add(1);
        if self.consecutive_mount_failures >= config.failed_recovery_limit {
            let reason = format!("{} consecutive failed recoveries", self.consecutive_mount_failures);
            return self.make_permanent(reason);
        }
        None
    }

    /// Notes that a recovery attempt has been scheduled
    pub fn mark_recovery_attempt(&mut self, now: Instant) {
        self.recovery_count = self.recovery_count.saturating_add(1);
        self.last_recovery_attempt_time = Some(now);
    }

    /// Whether a recovery may start now
    pub fn recovery_gate(&self, config: &BreakerConfig, now: Instant) -> RecoveryGate {
        if self.level == BreakerLevel::Permanent || self.mounts.cycle_detected || self.is_cooling(now) {
            return RecoveryGate::Denied;
        }
        match self.last_recovery_attempt_time {
            Some(last) => {
                let required = config.recovery_interval(self.recovery_count);
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= required {
                    RecoveryGate::Ready
                } else {
                    RecoveryGate::WaitFor(required - elapsed)
                }
            }
            None => RecoveryGate::Ready,
        }
    }

    /// Forces Permanent after a mount cycle
    pub fn record_mount_cycle(&mut self, cycle: &MountCycle) -> Option<Transition> {
        self.make_permanent(format!("mount cycle: {}", cycle.describe()))
    }

    /// Forces Permanent for an arbitrary reason
    pub fn force_permanent<S: Into<String>>(&mut self, reason: S) -> Option<Transition> {
        self.make_permanent(reason.into())
    }

    pub fn status(&self, config: &BreakerConfig, now: Instant) -> BreakerStatus {
        let level = self.effective_level(now);
        let cooling = level == BreakerLevel::Open;
        BreakerStatus {
            level,
            can_mount: !matches!(level, BreakerLevel::Permanent | BreakerLevel::Open),
            can_recover: self.recovery_gate(config, now) == RecoveryGate::Ready,
            should_fallback: level == BreakerLevel::Permanent || cooling,
            cooldown_remaining: self.cooldown_remaining(now),
            error_count: self.error_count,
            mount_attempts: self.mounts.attempts,
        }
    }

    /// Cooldown for Closed → Open
    fn backoff(&self, config: &BreakerConfig) -> Duration {
        exponential(config.base_cooldown(), self.consecutive_errors, config.max_cooldown())
    }

    /// Cooldown after a failed probe; never shorter than twice the previous one
    fn escalated_cooldown(&self, config: &BreakerConfig) -> Duration {
        let cap = config.max_escalated_cooldown();
        let from_errors = exponential(config.escalation_base(), self.consecutive_errors, cap);
        let doubled = self.last_cooldown.saturating_mul(2).min(cap);
        from_errors.max(doubled)
    }

    fn open(&mut self, cooldown: Duration, now: Instant, reason: &str) -> Transition {
        self.cooldown_end_time = Some(now + cooldown);
        self.last_cooldown = cooldown;
        let transition = self.transition(BreakerLevel::Open, reason);
        warn!(
            subject = %self.subject,
            cooldown_ms = cooldown.as_millis() as u64,
            consecutive = self.consecutive_errors,
            reason = %reason,
            "Breaker OPEN"
        );
        transition
    }

    fn make_permanent(&mut self, reason: String) -> Option<Transition> {
        if self.level == BreakerLevel::Permanent {
            return None;
        }
        self.cooldown_end_time = None;
        self.probation_until = None;
        let transition = self.transition(BreakerLevel::Permanent, &reason);
        error!(subject = %self.subject, reason = %reason, "Breaker PERMANENT");
        self.permanent_reason = Some(reason);
        Some(transition)
    }

    fn transition(&mut self, to: BreakerLevel, reason: &str) -> Transition {
        let transition = Transition {
            from: self.level,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        self.level = to;

        while self.transitions.len() >= self.transition_log_size {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());

        counter!(
            "renderer_breaker_transitions_total",
            1,
            "from" => transition.from.to_string(),
            "to" => transition.to.to_string()
        );

        transition
    }
}

/// `min(cap, base × 2^(n−1))`, with n clamped to at least 1
pub fn exponential(base: Duration, n: u32, cap: Duration) -> Duration {
    let exponent = n.max(1) - 1;
    let factor = 2u32.saturating_pow(exponent.min(31));
    base.saturating_mul(factor).min(cap)
}
