//! # Recovery Scheduling
//!
//! Runs the named recovery strategies as cancellable background tasks.
//!
//! A recovery waits out its delay, performs its strategy against the host's
//! [`RecoveryHooks`] and reports the outcome through a completion callback.
//! At most one recovery is in flight per subject: scheduling a new one, or
//! cancelling, aborts whatever was pending for that subject. A task removes
//! its own pending entry before reporting, so a cancelled task never
//! reports.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::fallback::DegradedFeature;
use crate::policy::{RecoveryPolicy, RecoveryStrategy};
use crate::types::{Error, ErrorKind, Result};

/// Operations the host performs on behalf of a recovery strategy
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    /// Drops cached GPU/asset resources held by the subject's backend
    async fn release_cached_resources(&self, subject: &str, backend: &str) -> Result<()>;

    /// Turns one capability off on the subject's backend
    async fn degrade(&self, subject: &str, backend: &str, feature: DegradedFeature) -> Result<()>;

    /// Tears the backend down and mounts it again
    async fn remount(&self, subject: &str, backend: &str) -> Result<()>;
}

/// Hooks that succeed without doing anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl RecoveryHooks for NoopHooks {
    async fn release_cached_resources(&self, _subject: &str, _backend: &str) -> Result<()> {
        Ok(())
    }

    async fn degrade(&self, _subject: &str, _backend: &str, _feature: DegradedFeature) -> Result<()> {
        Ok(())
    }

    async fn remount(&self, _subject: &str, _backend: &str) -> Result<()> {
        Ok(())
    }
}

/// A recovery to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub subject: String,
    pub backend: String,
    pub kind: ErrorKind,
    pub policy: RecoveryPolicy,
    /// 1 for the first attempt on this backend
    pub attempt: u32,
    /// Wait before the strategy runs
    pub delay: Duration,
}

impl RecoveryRequest {
    pub fn new<S1, S2>(subject: S1, backend: S2, kind: ErrorKind, policy: RecoveryPolicy, attempt: u32) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            subject: subject.into(),
            backend: backend.into(),
            kind,
            policy,
            attempt,
            delay: policy.recovery_delay,
        }
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.policy.strategy
    }
}

/// Outcome reported once a recovery task finishes
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    /// Generation returned by [`RecoveryScheduler::schedule`] for this recovery
    pub generation: u64,
    pub request: RecoveryRequest,
    /// The feature degraded by the strategy, if any, or the failure
    pub result: Result<Option<DegradedFeature>>,
    pub elapsed: Duration,
}

impl RecoveryOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Callback invoked with the outcome of each recovery that was not cancelled
pub type CompletionFn = Arc<dyn Fn(RecoveryOutcome) -> BoxFuture<'static, ()> + Send + Sync>;

struct PendingRecovery {
    generation: u64,
    strategy: RecoveryStrategy,
    handle: JoinHandle<()>,
}

/// Schedules and cancels recoveries, one per subject
pub struct RecoveryScheduler {
    config: RecoveryConfig,
    hooks: Arc<dyn RecoveryHooks>,
    pending: Arc<DashMap<String, PendingRecovery>>,
    generation: AtomicU64,
}

impl fmt::Debug for RecoveryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryScheduler")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl RecoveryScheduler {
    pub fn new(config: RecoveryConfig, hooks: Arc<dyn RecoveryHooks>) -> Self {
        Self {
            config,
            hooks,
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedules a recovery, replacing any pending one for the same subject
    ///
    /// Returns immediately; `on_complete` runs on the spawned task once the
    /// strategy finishes. Fails outside a tokio runtime.
    pub fn schedule(&self, request: RecoveryRequest, on_complete: CompletionFn) -> Result<u64> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Initialization(format!("recovery scheduled outside a tokio runtime: {}", e)))?;
        self.cancel(&request.subject);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let subject = request.subject.clone();
        let strategy = request.strategy();
        let pending = self.pending.clone();
        let hooks = self.hooks.clone();
        let config = self.config.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        debug!(
            subject = %subject,
            backend = %request.backend,
            strategy = %strategy,
            attempt = request.attempt,
            delay_ms = request.delay.as_millis() as u64,
            "Recovery scheduled"
        );

        let handle = runtime.spawn(async move {
            // Wait until the pending entry exists so it can be removed below
            if armed_rx.await.is_err() {
                return;
            }

            sleep(request.delay).await;

            let started = Instant::now();
            let result = run_strategy(hooks.as_ref(), &config, &request).await;
            let elapsed = started.elapsed();

            let still_current = pending
                .remove_if(&request.subject, |_, entry| entry.generation == generation)
                .is_some();
            if !still_current {
                return;
            }

            let outcome_label = if result.is_ok() { "success" } else { "failure" };
            counter!(
                "renderer_recoveries_total",
                1,
                "strategy" => strategy.name(),
                "outcome" => outcome_label
            );
            histogram!("renderer_recovery_duration_ms", elapsed.as_millis() as f64, "strategy" => strategy.name());

            on_complete(RecoveryOutcome {
                generation,
                request,
                result,
                elapsed,
            })
            .await;
        });

        self.pending.insert(
            subject,
            PendingRecovery {
                generation,
                strategy,
                handle,
            },
        );
        let _ = armed_tx.send(());

        Ok(generation)
    }

    /// Cancels the subject's pending recovery, if any
    pub fn cancel(&self, subject: &str) -> bool {
        match self.pending.remove(subject) {
            Some((_, pending)) => {
                pending.handle.abort();
                info!(subject = %subject, strategy = %pending.strategy, "Pending recovery cancelled");
                counter!("renderer_recoveries_cancelled_total", 1);
                true
            }
            None => false,
        }
    }

    /// Cancels every pending recovery
    pub fn cancel_all(&self) -> usize {
        let subjects: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        subjects.iter().filter(|subject| self.cancel(subject)).count()
    }

    pub fn is_pending(&self, subject: &str) -> bool {
        self.pending.contains_key(subject)
    }

    /// Strategy of the subject's pending recovery
    pub fn pending_strategy(&self, subject: &str) -> Option<RecoveryStrategy> {
        self.pending.get(subject).map(|entry| entry.strategy)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for RecoveryScheduler {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.value().handle.abort();
        }
    }
}

/// Wait used by retry-with-backoff for the given attempt
pub fn backoff_wait(config: &RecoveryConfig, attempt: u32) -> Duration {
    let base = config
        .backoff_step_ms
        .saturating_mul(u64::from(attempt.max(1)))
        .min(config.max_backoff_ms) as f64;
    let jitter = if config.jitter_factor > 0.0 && base > 0.0 {
        rand::thread_rng().gen_range(0.0..=base * config.jitter_factor)
    } else {
        0.0
    };
    Duration::from_millis((base + jitter) as u64)
}

/// Feature degraded by the fallback-materials strategy for a failure kind
fn material_feature(kind: ErrorKind) -> DegradedFeature {
    match kind {
        ErrorKind::Texture => DegradedFeature::Textures,
        _ => DegradedFeature::Materials,
    }
}

/// Performs one strategy; returns the feature it degraded, if any
pub async fn run_strategy(
    hooks: &dyn RecoveryHooks,
    config: &RecoveryConfig,
    request: &RecoveryRequest,
) -> Result<Option<DegradedFeature>> {
    let subject = request.subject.as_str();
    let backend = request.backend.as_str();
    let minimal_wait = Duration::from_millis(config.minimal_wait_ms);

    let degraded = match request.strategy() {
        RecoveryStrategy::CleanupAndRetry => {
            hooks.release_cached_resources(subject, backend).await?;
            sleep(Duration::from_millis(config.cleanup_settle_ms)).await;
            None
        }
        RecoveryStrategy::RetryWithBackoff => {
            sleep(backoff_wait(config, request.attempt)).await;
            None
        }
        RecoveryStrategy::DisableFeature => {
            hooks.degrade(subject, backend, DegradedFeature::Animation).await?;
            Some(DegradedFeature::Animation)
        }
        RecoveryStrategy::FallbackMaterials => {
            let feature = material_feature(request.kind);
            hooks.degrade(subject, backend, feature).await?;
            Some(feature)
        }
        RecoveryStrategy::RetryImmediate | RecoveryStrategy::RetryOnce => {
            sleep(minimal_wait).await;
            None
        }
        RecoveryStrategy::FallbackBackend => {
            return Err(Error::NotRecoverable(request.strategy().name().to_string()));
        }
    };

    hooks.remount(subject, backend).await.map_err(|err| {
        warn!(subject = %subject, backend = %backend, error = %err, "Remount failed during recovery");
        err
    })?;

    Ok(degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::policy_for;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok, block_on};

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
        fail_remount: bool,
    }

    #[async_trait]
    impl RecoveryHooks for RecordingHooks {
        async fn release_cached_resources(&self, subject: &str, _backend: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("release:{}", subject));
            Ok(())
        }

        async fn degrade(&self, subject: &str, _backend: &str, feature: DegradedFeature) -> Result<()> {
            self.calls.lock().unwrap().push(format!("degrade:{}:{}", subject, feature));
            Ok(())
        }

        async fn remount(&self, subject: &str, _backend: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remount:{}", subject));
            if self.fail_remount {
                Err(Error::recovery("context lost"))
            } else {
                Ok(())
            }
        }
    }

    fn collector() -> (CompletionFn, mpsc::UnboundedReceiver<RecoveryOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_complete: CompletionFn = Arc::new(move |outcome| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(outcome);
            })
        });
        (on_complete, rx)
    }

    fn request(kind: ErrorKind) -> RecoveryRequest {
        RecoveryRequest::new("hero", "webgl", kind, policy_for(kind), 1)
    }

    #[test]
    fn test_backoff_wait_scales_and_caps() {
        let config = RecoveryConfig {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(backoff_wait(&config, 1), Duration::from_millis(500));
        assert_eq!(backoff_wait(&config, 3), Duration::from_millis(1500));
        assert_eq!(backoff_wait(&config, 100), Duration::from_millis(8000));

        let jittered = backoff_wait(&RecoveryConfig::default(), 2);
        assert!(jittered >= Duration::from_millis(1000));
        assert!(jittered <= Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_strategy_releases_then_remounts() {
        let hooks = RecordingHooks::default();
        let result = run_strategy(&hooks, &RecoveryConfig::default(), &request(ErrorKind::Memory)).await;
        assert_eq!(result, Ok(None));
        assert_eq!(*hooks.calls.lock().unwrap(), vec!["release:hero", "remount:hero"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrading_strategies() {
        let hooks = RecordingHooks::default();
        let config = RecoveryConfig::default();

        let animation = run_strategy(&hooks, &config, &request(ErrorKind::Animation)).await;
        assert_eq!(animation, Ok(Some(DegradedFeature::Animation)));

        let texture = run_strategy(&hooks, &config, &request(ErrorKind::Texture)).await;
        assert_eq!(texture, Ok(Some(DegradedFeature::Textures)));

        let material = run_strategy(&hooks, &config, &request(ErrorKind::Material)).await;
        assert_eq!(material, Ok(Some(DegradedFeature::Materials)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_backend_is_not_recoverable() {
        let hooks = RecordingHooks::default();
        let result = run_strategy(&hooks, &RecoveryConfig::default(), &request(ErrorKind::Parsing)).await;
        assert!(matches!(result, Err(Error::NotRecoverable(_))));
        assert!(hooks.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_recovery_reports_after_delay() {
        let scheduler = RecoveryScheduler::new(RecoveryConfig::default(), Arc::new(NoopHooks));
        let (on_complete, mut rx) = collector();

        let started = Instant::now();
        scheduler.schedule(request(ErrorKind::Generic), on_complete).unwrap();
        assert!(scheduler.is_pending("hero"));
        assert_eq!(scheduler.pending_strategy("hero"), Some(RecoveryStrategy::RetryOnce));

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.succeeded());
        // 1000ms policy delay plus the 50ms minimal wait
        assert!(started.elapsed() >= Duration::from_millis(1050));
        assert!(!scheduler.is_pending("hero"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_remount_is_reported() {
        let hooks = Arc::new(RecordingHooks {
            fail_remount: true,
            ..Default::default()
        });
        let scheduler = RecoveryScheduler::new(RecoveryConfig::default(), hooks);
        let (on_complete, mut rx) = collector();

        scheduler.schedule(request(ErrorKind::Loading), on_complete).unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.result, Err(Error::recovery("context lost")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_schedule_replaces_pending() {
        let scheduler = RecoveryScheduler::new(RecoveryConfig::default(), Arc::new(NoopHooks));
        let (on_complete, mut rx) = collector();

        let first = scheduler.schedule(request(ErrorKind::Network), on_complete.clone()).unwrap();
        let second = scheduler.schedule(request(ErrorKind::Loading), on_complete).unwrap();
        assert!(second > first);
        assert_eq!(scheduler.pending_count(), 1);

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.request.kind, ErrorKind::Loading);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_schedule_outside_runtime_fails() {
        let scheduler = RecoveryScheduler::new(RecoveryConfig::default(), Arc::new(NoopHooks));
        let (on_complete, _rx) = collector();
        let err = assert_err!(scheduler.schedule(request(ErrorKind::Generic), on_complete));
        assert!(matches!(err, Error::Initialization(_)));
        assert!(!scheduler.is_pending("hero"));
    }

    #[test]
    fn test_immediate_strategies_only_remount() {
        let hooks = RecordingHooks::default();
        let config = RecoveryConfig {
            minimal_wait_ms: 0,
            ..Default::default()
        };
        let result = block_on(run_strategy(&hooks, &config, &request(ErrorKind::Loading)));
        assert_ok!(result);
        assert_eq!(*hooks.calls.lock().unwrap(), vec!["remount:hero"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_carries_scheduled_generation() {
        let scheduler = RecoveryScheduler::new(RecoveryConfig::default(), Arc::new(NoopHooks));
        let (on_complete, mut rx) = collector();

        let generation = scheduler.schedule(request(ErrorKind::Generic), on_complete).unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.generation, generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_recovery_never_reports() {
        let scheduler = RecoveryScheduler::new(RecoveryConfig::default(), Arc::new(NoopHooks));
        let (on_complete, mut rx) = collector();

        scheduler.schedule(request(ErrorKind::Memory), on_complete).unwrap();
        assert!(scheduler.cancel("hero"));
        assert!(!scheduler.cancel("hero"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.cancel_all(), 0);
    }
}
