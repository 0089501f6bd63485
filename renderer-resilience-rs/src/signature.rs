//! # Error Signatures
//!
//! Fingerprints failures so the breaker can tell a failure that keeps
//! recurring verbatim from a burst of unrelated ones.
//!
//! - identical: same message, same kind, same stack prefix
//! - similar: same kind, and the leading characters of one message occur
//!   somewhere in the other (catches messages that differ only in a URL
//!   suffix, attempt number or byte offset)

use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::SignatureConfig;
use crate::types::{ErrorKind, FailureReport};

/// Immutable fingerprint of one failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSignature {
    pub message: String,
    pub stack_prefix: String,
    pub kind: ErrorKind,
    #[serde(skip)]
    pub timestamp: Instant,
    pub context_prefix: String,
}

fn prefix(text: &str, len: usize) -> String {
    text.chars().take(len).collect()
}

impl ErrorSignature {
    /// Fingerprints a failure report
    pub fn new(report: &FailureReport, kind: ErrorKind, now: Instant, config: &SignatureConfig) -> Self {
        Self {
            message: report.message.clone(),
            stack_prefix: prefix(report.stack.as_deref().unwrap_or_default(), config.stack_prefix_len),
            kind,
            timestamp: now,
            context_prefix: prefix(report.context.as_deref().unwrap_or_default(), config.stack_prefix_len),
        }
    }

    /// Same message, kind and stack prefix
    pub fn is_identical(&self, other: &ErrorSignature) -> bool {
        self.kind == other.kind && self.message == other.message && self.stack_prefix == other.stack_prefix
    }

    /// Same kind, and one message's leading characters occur in the other
    pub fn is_similar(&self, other: &ErrorSignature, prefix_len: usize) -> bool {
        if self.kind != other.kind {
            return false;
        }
        let ours = prefix(&self.message, prefix_len);
        let theirs = prefix(&other.message, prefix_len);
        other.message.contains(&ours) || self.message.contains(&theirs)
    }
}

/// Occurrence counts of a failure within the recent window
///
/// Counts include the failure being evaluated, so the first sighting of a
/// failure has `identical == 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignatureMatches {
    pub identical: u32,
    pub similar: u32,
}

/// Bounded history of recent signatures, oldest first
#[derive(Debug, Clone)]
pub struct SignatureHistory {
    cap: usize,
    entries: VecDeque<ErrorSignature>,
}

impl SignatureHistory {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            entries: VecDeque::with_capacity(cap),
        }
    }

    /// Appends a signature, evicting the oldest entry at capacity
    pub fn push(&mut self, signature: ErrorSignature) {
        while self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(signature);
    }

    /// Removes the most recent signature
    pub fn retire_newest(&mut self) -> Option<ErrorSignature> {
        self.entries.pop_back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorSignature> {
        self.entries.iter()
    }

    pub fn newest(&self) -> Option<&ErrorSignature> {
        self.entries.back()
    }
}

/// Compares new failures against a subject's history
#[derive(Debug, Clone, Default)]
pub struct ErrorSignatureTracker {
    config: SignatureConfig,
}

impl ErrorSignatureTracker {
    pub fn new(config: SignatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    /// Builds the signature for a failure
    pub fn fingerprint(&self, report: &FailureReport, kind: ErrorKind, now: Instant) -> ErrorSignature {
        ErrorSignature::new(report, kind, now, &self.config)
    }

    /// Empty history sized for this tracker
    pub fn history(&self) -> SignatureHistory {
        SignatureHistory::new(self.config.history_cap)
    }

    /// Counts occurrences of `signature` among in-window history entries, itself included
    pub fn count_matches(&self, history: &SignatureHistory, signature: &ErrorSignature, now: Instant) -> SignatureMatches {
        let window = self.config.window();
        let mut matches = SignatureMatches {
            identical: 1,
            similar: 1,
        };

        for previous in history
            .iter()
            .filter(|previous| now.saturating_duration_since(previous.timestamp) <= window)
        {
            if previous.is_identical(signature) {
                matches.identical += 1;
            }
            if previous.is_similar(signature, self.config.similar_prefix_len) {
                matches.similar += 1;
            }
        }

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> ErrorSignatureTracker {
        ErrorSignatureTracker::new(SignatureConfig::default())
    }

    fn sig(tracker: &ErrorSignatureTracker, message: &str, kind: ErrorKind, at: Instant) -> ErrorSignature {
        tracker.fingerprint(&FailureReport::new(message).stack("at render (scene.js:42)"), kind, at)
    }

    #[test]
    fn test_identical_requires_message_kind_and_stack() {
        let t = tracker();
        let now = Instant::now();
        let a = sig(&t, "Failed to fetch", ErrorKind::Network, now);
        let b = sig(&t, "Failed to fetch", ErrorKind::Network, now);
        let c = t.fingerprint(&FailureReport::new("Failed to fetch").stack("elsewhere"), ErrorKind::Network, now);
        let d = sig(&t, "Failed to fetch", ErrorKind::Loading, now);

        assert!(a.is_identical(&b));
        assert!(!a.is_identical(&c));
        assert!(!a.is_identical(&d));
    }

    #[test]
    fn test_stack_prefix_is_bounded() {
        let t = tracker();
        let long_stack = "x".repeat(1000);
        let signature = t.fingerprint(&FailureReport::new("boom").stack(long_stack), ErrorKind::Generic, Instant::now());
        assert_eq!(signature.stack_prefix.chars().count(), 250);
    }

    #[test]
    fn test_similar_on_shared_prefix() {
        let t = tracker();
        let now = Instant::now();
        let base = "Failed to fetch model asset from https://cdn.example.com/models/hero.glb";
        let a = sig(&t, &format!("{} (attempt 1)", base), ErrorKind::Network, now);
        let b = sig(&t, &format!("{} (attempt 2)", base), ErrorKind::Network, now);
        let other_kind = sig(&t, &format!("{} (attempt 3)", base), ErrorKind::Loading, now);
        let unrelated = sig(&t, "Connection refused", ErrorKind::Network, now);

        assert!(!a.is_identical(&b));
        assert!(a.is_similar(&b, 50));
        assert!(!a.is_similar(&other_kind, 50));
        assert!(!a.is_similar(&unrelated, 50));
    }

    #[test]
    fn test_history_evicts_oldest() {
        let t = tracker();
        let now = Instant::now();
        let mut history = SignatureHistory::new(3);
        for i in 0..5 {
            history.push(sig(&t, &format!("error {}", i), ErrorKind::Generic, now));
        }
        assert_eq!(history.len(), 3);
        let messages: Vec<_> = history.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
    }

    #[test]
    fn test_count_matches_respects_window() {
        let t = tracker();
        let start = Instant::now();
        let mut history = t.history();
        history.push(sig(&t, "Failed to fetch", ErrorKind::Network, start));
        history.push(sig(&t, "Failed to fetch", ErrorKind::Network, start + Duration::from_secs(30)));

        let late = start + Duration::from_secs(75);
        let candidate = sig(&t, "Failed to fetch", ErrorKind::Network, late);
        let matches = t.count_matches(&history, &candidate, late);

        // the first entry is 75s old and falls outside the 60s window
        assert_eq!(matches.identical, 2);
        assert_eq!(matches.similar, 2);
    }

    #[test]
    fn test_retire_newest() {
        let t = tracker();
        let now = Instant::now();
        let mut history = t.history();
        history.push(sig(&t, "first", ErrorKind::Generic, now));
        history.push(sig(&t, "second", ErrorKind::Generic, now));

        assert_eq!(history.retire_newest().map(|s| s.message), Some("second".to_string()));
        assert_eq!(history.newest().map(|s| s.message.as_str()), Some("first"));
    }
}
