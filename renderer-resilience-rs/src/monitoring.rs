//! # Renderer Events
//!
//! Event stream and metrics for the supervision pipeline.
//!
//! Every backend swap, successful recovery and permanent failure is published
//! as a [`RendererEvent`] on a broadcast channel the host can subscribe to,
//! and counted through the `metrics` facade. Publishing never fails: events
//! sent while nobody is subscribed are dropped.

use std::fmt;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Kind of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The active backend was swapped
    Fallback,
    /// A recovery succeeded on the current backend
    Recovery,
    /// A subject's backend was marked permanently failed
    Permanent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Fallback => "fallback",
            EventKind::Recovery => "recovery",
            EventKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An observable supervision event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<String>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl RendererEvent {
    fn new<S: Into<String>, R: Into<String>>(kind: EventKind, subject: S, reason: R) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject_id: subject.into(),
            from: None,
            to: None,
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    /// The subject moved from one backend to another
    pub fn fallback<S, R>(subject: S, from: &str, to: &str, reason: R) -> Self
    where
        S: Into<String>,
        R: Into<String>,
    {
        let mut event = Self::new(EventKind::Fallback, subject, reason);
        event.from = Some(from.to_string());
        event.to = Some(to.to_string());
        event
    }

    /// The subject recovered on `backend`
    pub fn recovery<S, R>(subject: S, backend: &str, reason: R) -> Self
    where
        S: Into<String>,
        R: Into<String>,
    {
        let mut event = Self::new(EventKind::Recovery, subject, reason);
        event.to = Some(backend.to_string());
        event
    }

    /// `backend` will never be retried for the subject
    pub fn permanent<S, R>(subject: S, backend: &str, reason: R) -> Self
    where
        S: Into<String>,
        R: Into<String>,
    {
        let mut event = Self::new(EventKind::Permanent, subject, reason);
        event.from = Some(backend.to_string());
        event
    }
}

/// Broadcast channel for [`RendererEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RendererEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Logs, counts and publishes an event; returns the number of receivers
    pub fn emit(&self, event: RendererEvent) -> usize {
        match event.kind {
            EventKind::Fallback => info!(
                subject = %event.subject_id,
                from = ?event.from,
                to = ?event.to,
                reason = %event.reason,
                "Backend fallback"
            ),
            EventKind::Recovery => info!(
                subject = %event.subject_id,
                backend = ?event.to,
                reason = %event.reason,
                "Backend recovered"
            ),
            EventKind::Permanent => error!(
                subject = %event.subject_id,
                backend = ?event.from,
                reason = %event.reason,
                "Backend permanently failed"
            ),
        }
        counter!("renderer_events_total", 1, "type" => event.kind.as_str());

        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No event subscribers, event dropped");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Drains events a lagging subscriber can still read, logging how many were lost
pub fn drain(rx: &mut broadcast::Receiver<RendererEvent>) -> Vec<RendererEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                warn!(missed, "Event subscriber lagged");
            }
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = RendererEvent::fallback("hero", "webgl", "canvas", "breaker open");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "fallback");
        assert_eq!(json["subjectId"], "hero");
        assert_eq!(json["from"], "webgl");
        assert_eq!(json["to"], "canvas");
        assert_eq!(json["reason"], "breaker open");
        assert!(json.get("id").is_some());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = RendererEvent::recovery("hero", "webgl", "retry-once");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("from").is_none());
        assert_eq!(json["to"], "webgl");

        let back: RendererEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(RendererEvent::permanent("hero", "webgl", "mount cycle")), 0);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(RendererEvent::permanent("hero", "webgl", "mount cycle"));
        bus.emit(RendererEvent::fallback("hero", "webgl", "canvas", "mount cycle"));

        let events = drain(&mut rx);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Permanent, EventKind::Fallback]);
    }

    #[test]
    fn test_drain_survives_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.emit(RendererEvent::recovery(format!("card-{}", i), "webgl", "retry-once"));
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].subject_id, "card-4");
    }
}
