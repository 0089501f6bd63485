//! # Renderer Orchestrator
//!
//! Owns the active backend of every supervised subject and routes each
//! backend failure through the pipeline:
//!
//! ```text
//! failure → classify → breaker decision ─ Allow + recoverable + budget → schedule recovery
//!                                       └ Block / Permanent / otherwise → advance the chain
//! ```
//!
//! A swap clears the subject's transient state (retry budget, degraded
//! features) but never the breaker history of the backend it swaps to.
//! Each subject's events are handled serially: the subject's session entry
//! stays locked while a failure, mount or recovery outcome is processed.
//!
//! Recoveries run on the tokio runtime; the failure and mount entry points
//! are synchronous but must be called from within a runtime when a recovery
//! may be scheduled.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerDecision, BreakerLevel, BreakerStatus, RecoveryGate};
use crate::classifier::classify_report;
use crate::config::ResilienceConfig;
use crate::fallback::{DegradedFeature, DegradedFeatures, FallbackChainResolver};
use crate::monitoring::{EventBus, RendererEvent, DEFAULT_EVENT_CAPACITY};
use crate::policy::{policy_for, RecoveryStrategy};
use crate::recovery::{CompletionFn, RecoveryHooks, RecoveryOutcome, RecoveryRequest, RecoveryScheduler};
use crate::registry::{breaker_key, BreakerSnapshot, GlobalCircuitBreakerRegistry};
use crate::types::{Error, ErrorKind, FailureReport, Result};

/// What the orchestrator did with a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// A recovery was scheduled on the current backend
    Recovering {
        kind: ErrorKind,
        strategy: RecoveryStrategy,
        attempt: u32,
        delay: Duration,
    },
    /// The subject moved to another backend
    FellBack {
        kind: ErrorKind,
        from: String,
        to: String,
        reason: String,
    },
    /// Already on the terminal backend; nothing left to fall back to
    Exhausted {
        kind: ErrorKind,
        backend: String,
        reason: String,
    },
}

impl FailureDecision {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureDecision::Recovering { kind, .. }
            | FailureDecision::FellBack { kind, .. }
            | FailureDecision::Exhausted { kind, .. } => *kind,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, FailureDecision::FellBack { .. })
    }
}

/// Status of a subject on its active backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStatus {
    pub subject_id: String,
    pub active_backend: String,
    pub breaker: BreakerStatus,
    pub recovery_pending: bool,
    pub degraded_features: Vec<DegradedFeature>,
}

/// Diagnostic snapshot of a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSnapshot {
    pub subject_id: String,
    pub active_backend: String,
    pub level: BreakerLevel,
    pub error_count: u32,
    pub mount_attempts: u32,
    pub cooldown_remaining_ms: u64,
    pub mounted: bool,
    pub fallbacks: u32,
    pub recovery_pending: bool,
    pub last_failure: Option<ErrorKind>,
    pub degraded: DegradedFeatures,
    /// Breaker entries of every backend this subject has used
    pub breakers: Vec<BreakerSnapshot>,
}

/// Transient per-subject state, reset on every swap
#[derive(Debug, Clone)]
struct SubjectSession {
    active: String,
    attempts: HashMap<ErrorKind, u32>,
    last_failure: Option<ErrorKind>,
    degraded: DegradedFeatures,
    mounted: bool,
    fallbacks: u32,
    /// Generation of the recovery whose outcome this session still accepts
    recovery: Option<u64>,
}

impl SubjectSession {
    fn new(active: String) -> Self {
        Self {
            active,
            attempts: HashMap::new(),
            last_failure: None,
            degraded: DegradedFeatures::new(),
            mounted: false,
            fallbacks: 0,
            recovery: None,
        }
    }

    fn swap_to(&mut self, backend: String) {
        self.active = backend;
        self.attempts.clear();
        self.last_failure = None;
        self.degraded.clear();
        self.recovery = None;
    }
}

/// Supervises backend selection for a set of subjects
pub struct RendererOrchestrator {
    this: Weak<RendererOrchestrator>,
    config: ResilienceConfig,
    registry: Arc<GlobalCircuitBreakerRegistry>,
    resolver: FallbackChainResolver,
    scheduler: RecoveryScheduler,
    sessions: DashMap<String, SubjectSession>,
    events: EventBus,
}

impl std::fmt::Debug for RendererOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererOrchestrator")
            .field("subjects", &self.sessions.len())
            .field("resolver", &self.resolver)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl RendererOrchestrator {
    /// Creates an orchestrator with its own breaker registry
    pub fn new(
        config: ResilienceConfig,
        resolver: FallbackChainResolver,
        hooks: Arc<dyn RecoveryHooks>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(GlobalCircuitBreakerRegistry::new(&config));
        Self::with_registry(config, resolver, hooks, registry)
    }

    /// Creates an orchestrator sharing an existing registry
    pub fn with_registry(
        config: ResilienceConfig,
        resolver: FallbackChainResolver,
        hooks: Arc<dyn RecoveryHooks>,
        registry: Arc<GlobalCircuitBreakerRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let scheduler = RecoveryScheduler::new(config.recovery.clone(), hooks);

        info!(chain = ?resolver.chain().ids(), "Renderer orchestrator created");

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            registry,
            resolver,
            scheduler,
            sessions: DashMap::new(),
            events: EventBus::new(DEFAULT_EVENT_CAPACITY),
        }))
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GlobalCircuitBreakerRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &FallbackChainResolver {
        &self.resolver
    }

    /// Subscribes to fallback, recovery and permanent events
    pub fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.events.subscribe()
    }

    /// Registers a subject and returns its initial backend
    ///
    /// The initial backend is the highest fidelity one whose breaker entry
    /// for this subject is not Permanent. Registering twice is a no-op.
    pub fn register_subject(&self, subject: &str) -> String {
        if let Some(session) = self.sessions.get(subject) {
            return session.active.clone();
        }

        let chain = self.resolver.chain();
        let first = chain.first();
        let initial = if self.registry.is_permanent(&breaker_key(subject, &first.id)) {
            chain
                .next_where(&first.id, |backend| !self.registry.is_permanent(&breaker_key(subject, &backend.id)))
                .id
                .clone()
        } else {
            first.id.clone()
        };

        let active = self
            .sessions
            .entry(subject.to_string())
            .or_insert_with(|| SubjectSession::new(initial))
            .active
            .clone();
        info!(subject = %subject, backend = %active, "Subject registered");
        active
    }

    /// Drops a subject's session; its breaker history stays in the registry
    pub fn remove_subject(&self, subject: &str) -> bool {
        self.scheduler.cancel(subject);
        self.sessions.remove(subject).is_some()
    }

    pub fn active_backend(&self, subject: &str) -> Option<String> {
        self.sessions.get(subject).map(|session| session.active.clone())
    }

    /// Routes a backend failure through classification, the breaker and the chain
    pub fn on_backend_failure(&self, subject: &str, report: FailureReport) -> Result<FailureDecision> {
        let mut session = self
            .sessions
            .get_mut(subject)
            .ok_or_else(|| Error::UnknownSubject(subject.to_string()))?;

        // At most one recovery in flight; a new failure supersedes it, even one
        // whose task already finished and is waiting for this session
        self.scheduler.cancel(subject);
        session.recovery = None;

        let kind = classify_report(&report);
        let policy = policy_for(kind);
        let backend = session.active.clone();
        let key = breaker_key(subject, &backend);
        session.last_failure = Some(kind);

        debug!(
            subject = %subject,
            backend = %backend,
            kind = %kind,
            severity = %kind.severity(),
            message = %report.message,
            "Backend failure"
        );

        let outcome = self.registry.record_error(&key, &report, kind);
        if let Some(transition) = &outcome.transition {
            if transition.to == BreakerLevel::Permanent {
                self.events
                    .emit(RendererEvent::permanent(subject, &backend, transition.reason.clone()));
            }
        }

        match outcome.decision {
            BreakerDecision::Permanent => {
                Ok(self.advance(subject, &mut session, kind, format!("{} ({}), breaker permanent", kind, kind.explain())))
            }
            BreakerDecision::Block => {
                Ok(self.advance(subject, &mut session, kind, format!("{} ({}), breaker open", kind, kind.explain())))
            }
            BreakerDecision::Allow => {
                let attempts_made = session.attempts.get(&kind).copied().unwrap_or(0);
                if !policy.can_recover {
                    return Ok(self.advance(subject, &mut session, kind, format!("{} ({}), not recoverable", kind, kind.explain())));
                }
                if !policy.has_budget(attempts_made) {
                    return Ok(self.advance(
                        subject,
                        &mut session,
                        kind,
                        format!("{} ({}), {} recovery attempts exhausted", kind, kind.explain(), policy.max_retries),
                    ));
                }

                let delay = match self.registry.recovery_gate(&key) {
                    RecoveryGate::Ready => policy.recovery_delay,
                    RecoveryGate::WaitFor(remaining) => policy.recovery_delay.max(remaining),
                    RecoveryGate::Denied => {
                        return Ok(self.advance(subject, &mut session, kind, format!("{} ({}), recovery denied", kind, kind.explain())));
                    }
                };

                let attempt = attempts_made + 1;
                let mut request = RecoveryRequest::new(subject, backend.as_str(), kind, policy, attempt);
                request.delay = delay;

                let generation = self.scheduler.schedule(request, self.completion())?;
                session.recovery = Some(generation);
                self.registry.mark_recovery_attempt(&key);
                session.attempts.insert(kind, attempt);

                info!(
                    subject = %subject,
                    backend = %backend,
                    kind = %kind,
                    strategy = %policy.strategy,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Recovery scheduled"
                );

                Ok(FailureDecision::Recovering {
                    kind,
                    strategy: policy.strategy,
                    attempt,
                    delay,
                })
            }
        }
    }

    /// Records a mount of the subject's active backend
    ///
    /// Returns the fallback taken when the mount completes a mount cycle.
    pub fn on_mount(&self, subject: &str) -> Result<Option<FailureDecision>> {
        let mut session = self
            .sessions
            .get_mut(subject)
            .ok_or_else(|| Error::UnknownSubject(subject.to_string()))?;
        session.mounted = true;

        let backend = session.active.clone();
        let terminal = self.resolver.chain().is_terminal(&backend);
        let outcome = self.registry.record_mount(&breaker_key(subject, &backend), terminal);

        match (outcome.cycle, outcome.transition) {
            (Some(cycle), Some(transition)) => {
                self.scheduler.cancel(subject);
                session.recovery = None;
                self.events
                    .emit(RendererEvent::permanent(subject, &backend, transition.reason));
                let kind = session.last_failure.unwrap_or(ErrorKind::Generic);
                let reason = format!("mount cycle: {}", cycle.describe());
                Ok(Some(self.advance(subject, &mut session, kind, reason)))
            }
            _ => {
                debug!(subject = %subject, backend = %backend, attempts = outcome.attempts, "Mount recorded");
                Ok(None)
            }
        }
    }

    /// Records an unmount; cancels any pending recovery
    pub fn on_unmount(&self, subject: &str) -> Result<bool> {
        let mut session = self
            .sessions
            .get_mut(subject)
            .ok_or_else(|| Error::UnknownSubject(subject.to_string()))?;
        session.mounted = false;
        session.recovery = None;
        Ok(self.scheduler.cancel(subject))
    }

    pub fn get_status(&self, subject: &str) -> Result<SubjectStatus> {
        let session = self
            .sessions
            .get(subject)
            .ok_or_else(|| Error::UnknownSubject(subject.to_string()))?;
        Ok(SubjectStatus {
            subject_id: subject.to_string(),
            active_backend: session.active.clone(),
            breaker: self.registry.status(&breaker_key(subject, &session.active)),
            recovery_pending: self.scheduler.is_pending(subject),
            degraded_features: session.degraded.active(),
        })
    }

    /// Clears every breaker entry of the subject and restarts it on the best backend
    pub fn reset_subject(&self, subject: &str) -> usize {
        self.scheduler.cancel(subject);
        let removed = self.registry.reset_subject(subject);
        let first = self.resolver.chain().first().id.clone();
        if let Some(mut session) = self.sessions.get_mut(subject) {
            *session = SubjectSession::new(first);
        }
        info!(subject = %subject, removed, "Subject reset");
        removed
    }

    /// Clears every breaker and restarts every subject on the best backend
    pub fn reset_all(&self) {
        let cancelled = self.scheduler.cancel_all();
        self.registry.reset_all();
        let first = self.resolver.chain().first().id.clone();
        for mut session in self.sessions.iter_mut() {
            *session = SubjectSession::new(first.clone());
        }
        info!(subjects = self.sessions.len(), cancelled, "All subjects reset");
    }

    pub fn snapshot(&self, subject: &str) -> Result<DebugSnapshot> {
        let session = self
            .sessions
            .get(subject)
            .ok_or_else(|| Error::UnknownSubject(subject.to_string()))?;
        Ok(self.snapshot_of(subject, &session))
    }

    /// Snapshots of every registered subject, sorted by subject id
    pub fn snapshot_all(&self) -> Vec<DebugSnapshot> {
        let mut snapshots: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| self.snapshot_of(entry.key(), entry.value()))
            .collect();
        snapshots.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        snapshots
    }

    /// Re-probes capabilities; moves subjects off backends the new chain dropped
    ///
    /// A displaced subject lands on the best remaining backend of no higher
    /// tier than the one it lost.
    pub fn rebuild_chain(&self) -> Result<bool> {
        let previous = self.resolver.chain();
        if !self.resolver.rebuild()? {
            return Ok(false);
        }
        let chain = self.resolver.chain();
        for mut entry in self.sessions.iter_mut() {
            if chain.get(&entry.active).is_some() {
                continue;
            }
            let subject = entry.key().clone();
            self.scheduler.cancel(&subject);
            let from = entry.active.clone();
            let tier = previous.get(&from).map_or(0, |backend| backend.capability_tier);
            let to = chain
                .iter()
                .find(|backend| {
                    backend.capability_tier <= tier
                        && !self.registry.is_permanent(&breaker_key(&subject, &backend.id))
                })
                .unwrap_or_else(|| chain.terminal())
                .id
                .clone();
            entry.swap_to(to.clone());
            entry.fallbacks += 1;
            self.events
                .emit(RendererEvent::fallback(subject.as_str(), &from, &to, "device capabilities changed"));
        }
        Ok(true)
    }

    fn snapshot_of(&self, subject: &str, session: &SubjectSession) -> DebugSnapshot {
        let status = self.registry.status(&breaker_key(subject, &session.active));
        let mut keys = self.registry.keys_for(subject);
        keys.sort();
        DebugSnapshot {
            subject_id: subject.to_string(),
            active_backend: session.active.clone(),
            level: status.level,
            error_count: status.error_count,
            mount_attempts: status.mount_attempts,
            cooldown_remaining_ms: u64::try_from(status.cooldown_remaining.as_millis()).unwrap_or(u64::MAX),
            mounted: session.mounted,
            fallbacks: session.fallbacks,
            recovery_pending: self.scheduler.is_pending(subject),
            last_failure: session.last_failure,
            degraded: session.degraded.clone(),
            breakers: keys.iter().filter_map(|key| self.registry.snapshot(key)).collect(),
        }
    }

    /// Moves the subject down the chain, skipping backends already Permanent for it
    fn advance(&self, subject: &str, session: &mut SubjectSession, kind: ErrorKind, reason: String) -> FailureDecision {
        let chain = self.resolver.chain();
        let from = session.active.clone();
        let to = chain
            .next_where(&from, |backend| !self.registry.is_permanent(&breaker_key(subject, &backend.id)))
            .id
            .clone();

        if to == from {
            warn!(subject = %subject, backend = %from, reason = %reason, "No backend left to fall back to");
            return FailureDecision::Exhausted {
                kind,
                backend: from,
                reason,
            };
        }

        session.swap_to(to.clone());
        session.fallbacks += 1;
        counter!("renderer_fallbacks_total", 1, "from" => from.clone(), "to" => to.clone());
        self.events
            .emit(RendererEvent::fallback(subject, &from, &to, reason.clone()));

        FailureDecision::FellBack { kind, from, to, reason }
    }

    fn completion(&self) -> CompletionFn {
        let this = self.this.clone();
        Arc::new(move |outcome| {
            let this = this.clone();
            Box::pin(async move {
                if let Some(orchestrator) = this.upgrade() {
                    orchestrator.complete_recovery(outcome);
                }
            })
        })
    }

    /// Applies a finished recovery; a failed one re-enters the pipeline as a new failure
    fn complete_recovery(&self, outcome: RecoveryOutcome) {
        let RecoveryOutcome {
            generation,
            request,
            result,
            ..
        } = outcome;
        let subject = request.subject.as_str();
        let key = breaker_key(subject, &request.backend);

        let retry = {
            let mut session = match self.sessions.get_mut(subject) {
                Some(session) => session,
                None => return,
            };
            if session.recovery != Some(generation) || session.active != request.backend {
                debug!(
                    subject = %subject,
                    backend = %request.backend,
                    generation,
                    "Stale recovery outcome ignored"
                );
                return;
            }
            session.recovery = None;

            match result {
                Ok(degraded) => {
                    self.registry.record_successful_recovery(&key);
                    if let Some(feature) = degraded {
                        session.degraded.activate(feature, request.kind.explain());
                    }
                    session.attempts.clear();
                    session.last_failure = None;
                    self.events
                        .emit(RendererEvent::recovery(subject, &request.backend, request.strategy().name()));
                    None
                }
                Err(err) => {
                    if let Some(transition) = self.registry.record_failed_recovery(&key) {
                        self.events
                            .emit(RendererEvent::permanent(subject, &request.backend, transition.reason));
                    }
                    let message = match err {
                        Error::Recovery(message) => message,
                        other => other.to_string(),
                    };
                    Some(FailureReport::new(message).context(format!("recovery:{}", request.strategy())))
                }
            }
        };

        if let Some(report) = retry {
            if let Err(err) = self.on_backend_failure(subject, report) {
                warn!(subject = %subject, error = %err, "Failed recovery could not be re-processed");
            }
        }
    }
}

impl Drop for RendererOrchestrator {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
    }
}
