//! Properties the pipeline must hold regardless of timing or input

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::advance;

    use crate::circuit_breaker::{BreakerDecision, BreakerLevel};
    use crate::classifier::classify;
    use crate::config::ResilienceConfig;
    use crate::fallback::{BackendDescriptor, FallbackChainResolver};
    use crate::monitoring::{drain, EventKind};
    use crate::orchestrator::{FailureDecision, RendererOrchestrator};
    use crate::recovery::NoopHooks;
    use crate::registry::GlobalCircuitBreakerRegistry;
    use crate::types::{ErrorKind, FailureReport};

    fn registry() -> GlobalCircuitBreakerRegistry {
        GlobalCircuitBreakerRegistry::new(&ResilienceConfig::default())
    }

    fn orchestrator() -> Arc<RendererOrchestrator> {
        let resolver = FallbackChainResolver::fixed(vec![
            BackendDescriptor::new("high", 2),
            BackendDescriptor::new("mid", 1),
            BackendDescriptor::new("low", 0).always_available(),
        ])
        .unwrap();
        RendererOrchestrator::new(ResilienceConfig::default(), resolver, Arc::new(NoopHooks)).unwrap()
    }

    #[test]
    fn test_classify_is_total_and_deterministic() {
        let samples = [
            "",
            "   ",
            "Failed to fetch",
            "WebGL: CONTEXT_LOST_WEBGL",
            "Unexpected token < in JSON at position 0",
            "\u{1F600} ünïcödé failure",
            "GL_INVALID_OPERATION",
            "THREE.WebGLProgram: shader error",
        ];
        for sample in samples {
            let first = classify(sample, None);
            assert_eq!(first, classify(sample, None));
            assert_eq!(first, classify(&sample.to_uppercase(), None));
            assert!(ErrorKind::ALL.contains(&first));
        }
        assert_eq!(classify("", None), ErrorKind::Generic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_errors_open_then_go_permanent_regardless_of_spacing() {
        let registry = registry();
        let key = "hero@high";
        let report = FailureReport::new("Failed to fetch scene.glb");

        let mut decisions = Vec::new();
        for _ in 0..4 {
            decisions.push(registry.record_error(key, &report, ErrorKind::Network).decision);
            advance(Duration::from_secs(15)).await;
        }

        assert_eq!(
            decisions,
            vec![
                BreakerDecision::Allow,
                BreakerDecision::Allow,
                BreakerDecision::Block,
                BreakerDecision::Permanent,
            ]
        );
        assert_eq!(registry.level(key), Some(BreakerLevel::Permanent));

        // never auto-recovers
        advance(Duration::from_secs(3600)).await;
        assert_eq!(registry.level(key), Some(BreakerLevel::Permanent));
        assert!(registry.record_successful_recovery(key).is_none());
        assert_eq!(registry.level(key), Some(BreakerLevel::Permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seventh_similar_error_is_permanent() {
        let registry = registry();
        let key = "hero@high";

        let mut last = None;
        for i in 1..=7 {
            let report = FailureReport::new(format!("Failed to fetch https://cdn.example.com/assets/scene.glb?retry={}", i));
            last = Some(registry.record_error(key, &report, ErrorKind::Network));
            advance(Duration::from_secs(5)).await;
        }

        let last = last.unwrap();
        assert_eq!(last.decision, BreakerDecision::Permanent);
        assert_eq!(last.matches.similar, 7);
        assert_eq!(last.matches.identical, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_errors_leave_the_window() {
        let registry = registry();
        let key = "hero@high";
        let report = FailureReport::new("Failed to fetch scene.glb");

        for _ in 0..2 {
            registry.record_error(key, &report, ErrorKind::Network);
            advance(Duration::from_secs(61)).await;
        }

        let outcome = registry.record_error(key, &report, ErrorKind::Network);
        assert_eq!(outcome.matches.identical, 1);
        assert_eq!(outcome.matches.similar, 1);
        // still counted as consecutive
        assert_eq!(outcome.decision, BreakerDecision::Block);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_idempotent_while_cooldown_shrinks() {
        let registry = registry();
        let key = "hero@high";
        for message in ["a", "b", "c"] {
            registry.record_error(key, &FailureReport::new(message), ErrorKind::Generic);
        }

        let mut previous = registry.status(key);
        assert_eq!(previous, registry.status(key));

        for _ in 0..7 {
            advance(Duration::from_secs(1)).await;
            let current = registry.status(key);
            assert!(current.cooldown_remaining < previous.cooldown_remaining);
            assert_eq!(current.level, previous.level);
            assert_eq!(current.error_count, previous.error_count);
            assert_eq!(current.mount_attempts, previous.mount_attempts);
            assert_eq!(current.can_mount, previous.can_mount);
            previous = current;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_never_shrinks_across_escalations() {
        let registry = registry();
        let key = "hero@high";
        for message in ["a", "b", "c"] {
            registry.record_error(key, &FailureReport::new(message), ErrorKind::Generic);
        }

        let mut previous = registry.status(key).cooldown_remaining;
        for message in ["d", "e", "f", "g", "h"] {
            advance(previous).await;
            assert_eq!(registry.level(key), Some(BreakerLevel::HalfOpen));

            let outcome = registry.record_error(key, &FailureReport::new(message), ErrorKind::Generic);
            let cooldown = outcome.cooldown.unwrap();
            assert!(cooldown >= previous);
            previous = cooldown;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successes_always_close_half_open() {
        for errors in 3..=6u32 {
            let registry = registry();
            let key = "hero@high";
            for i in 0..errors {
                registry.record_error(key, &FailureReport::new(format!("failure {}", i * 1000)), ErrorKind::Generic);
            }
            advance(Duration::from_secs(200)).await;

            let mut successes = 0;
            while registry.snapshot(key).unwrap().consecutive_errors > 0 {
                registry.record_successful_recovery(key);
                successes += 1;
            }
            assert_eq!(successes, errors);
            assert_eq!(registry.level(key), Some(BreakerLevel::Closed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_mounts_force_permanent_and_one_fallback() {
        let orchestrator = orchestrator();
        let mut rx = orchestrator.subscribe();
        orchestrator.register_subject("hero");

        let mut fallbacks = Vec::new();
        for _ in 0..3 {
            if let Some(decision) = orchestrator.on_mount("hero").unwrap() {
                fallbacks.push(decision);
            }
            advance(Duration::from_millis(600)).await;
        }

        assert_eq!(fallbacks.len(), 1);
        assert!(matches!(&fallbacks[0], FailureDecision::FellBack { from, to, .. } if from == "high" && to == "mid"));
        assert_eq!(orchestrator.registry().level("hero@high"), Some(BreakerLevel::Permanent));

        // the new backend starts with a fresh mount streak
        assert!(orchestrator.on_mount("hero").unwrap().is_none());

        let events = drain(&mut rx);
        let count = |kind| events.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(EventKind::Fallback), 1);
        assert_eq!(count(EventKind::Permanent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_mount_storm_across_subjects() {
        let orchestrator = orchestrator();
        let subjects: Vec<String> = (0..6).map(|i| format!("card-{}", i)).collect();
        for subject in &subjects {
            orchestrator.register_subject(subject);
        }

        let mut decisions = Vec::new();
        for subject in &subjects {
            decisions.push(orchestrator.on_mount(subject).unwrap());
            advance(Duration::from_millis(100)).await;
        }

        assert!(decisions[..5].iter().all(Option::is_none));
        assert!(decisions[5].as_ref().map_or(false, FailureDecision::is_fallback));
        assert_eq!(orchestrator.active_backend("card-5").as_deref(), Some("mid"));
        assert_eq!(orchestrator.active_backend("card-0").as_deref(), Some("high"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_storm_moves_one_subject_one_step() {
        let orchestrator = orchestrator();
        let subjects: Vec<String> = (0..6).map(|i| format!("card-{}", i)).collect();
        for subject in &subjects {
            orchestrator.register_subject(subject);
            orchestrator.on_mount(subject).unwrap();
            advance(Duration::from_millis(100)).await;
        }
        assert_eq!(orchestrator.active_backend("card-5").as_deref(), Some("mid"));

        // remounting on the backend it fell back to stays put
        for _ in 0..2 {
            assert!(orchestrator.on_mount("card-5").unwrap().is_none());
            advance(Duration::from_millis(100)).await;
        }
        assert_eq!(orchestrator.active_backend("card-5").as_deref(), Some("mid"));
        assert_eq!(orchestrator.registry().level("card-5@mid"), Some(BreakerLevel::Closed));

        orchestrator.register_subject("late");
        assert!(orchestrator.on_mount("late").unwrap().is_none());
        assert_eq!(orchestrator.registry().level("late@high"), Some(BreakerLevel::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_backend_survives_mount_cycles() {
        let orchestrator = orchestrator();
        orchestrator.registry().force_permanent("hero@high", "gone");
        orchestrator.registry().force_permanent("hero@mid", "gone");
        assert_eq!(orchestrator.register_subject("hero"), "low");

        for _ in 0..6 {
            assert!(orchestrator.on_mount("hero").unwrap().is_none());
            advance(Duration::from_millis(100)).await;
        }

        let status = orchestrator.get_status("hero").unwrap();
        assert_eq!(status.active_backend, "low");
        assert_eq!(status.breaker.level, BreakerLevel::Closed);
        assert!(status.breaker.can_mount);
        assert!(!status.breaker.should_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_clears_permanent() {
        let orchestrator = orchestrator();
        orchestrator.register_subject("hero");
        for _ in 0..3 {
            orchestrator.on_mount("hero").unwrap();
        }
        assert_eq!(orchestrator.active_backend("hero").as_deref(), Some("mid"));

        orchestrator.reset_all();
        assert!(orchestrator.registry().is_empty());
        assert_eq!(orchestrator.active_backend("hero").as_deref(), Some("high"));
        assert_eq!(orchestrator.get_status("hero").unwrap().breaker.level, BreakerLevel::Closed);
    }
}
