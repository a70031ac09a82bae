use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::DeviceId;
use crate::lifecycle::LifecycleState;
use crate::property::PropertyMetadata;

// ── Severity / priority ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Dispatch priority. High and Critical jump the async dispatch queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

// ── Routing ──────────────────────────────────────────────────────────────────

/// Envelope field directing targeted delivery, persistence, priority and
/// timeouts. Absent routing on an event means `Routing::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Routing {
    /// Explicit delivery targets. A subscription whose `source_ids` intersect
    /// these receives the event even when it did not subscribe to the sender.
    #[serde(default)]
    pub target_ids: HashSet<DeviceId>,
    /// Enqueue the event to the event store before dispatch.
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requires_ack: bool,
    /// Upper bound on waiting for asynchronous handlers during publish.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Routing {
    pub fn targeted(targets: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            target_ids: targets.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The kind tag of an event, parallel to [`EventPayload`]. Subscription
/// options filter on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PropertyChanged,
    Lifecycle,
    Command,
    Telemetry,
    Alert,
    System,
    Timer,
    Custom,
}

/// Kind-tagged payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    PropertyChanged {
        property_name: String,
        /// Declared type tag of the property ("number", "string", "bool",
        /// "object", ...). Drives null canonicalization on persist.
        property_type: String,
        old_value: Option<Value>,
        new_value: Value,
        metadata: Option<PropertyMetadata>,
    },
    Lifecycle {
        new_state: LifecycleState,
        details: Option<String>,
    },
    Command {
        name: String,
        parameters: HashMap<String, Value>,
    },
    Telemetry {
        readings: HashMap<String, f64>,
        units: HashMap<String, String>,
    },
    Alert {
        severity: Severity,
        message: String,
        data: Option<Value>,
        /// Recorded at creation time only. Later acknowledgement is tracked
        /// by the error monitor under the fault's correlation id; the event
        /// itself never mutates.
        acknowledged: bool,
    },
    System {
        message: String,
    },
    Timer {
        timer_id: String,
    },
    Custom {
        name: String,
        data: Value,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PropertyChanged { .. } => EventKind::PropertyChanged,
            EventPayload::Lifecycle { .. } => EventKind::Lifecycle,
            EventPayload::Command { .. } => EventKind::Command,
            EventPayload::Telemetry { .. } => EventKind::Telemetry,
            EventPayload::Alert { .. } => EventKind::Alert,
            EventPayload::System { .. } => EventKind::System,
            EventPayload::Timer { .. } => EventKind::Timer,
            EventPayload::Custom { .. } => EventKind::Custom,
        }
    }
}

/// Common event envelope. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    /// The component the event is *about*. Usually equals `device_id`.
    pub source_id: DeviceId,
    /// The component that emitted the event.
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(default)]
    pub routing: Routing,
}

impl Event {
    pub fn new(device_id: DeviceId, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source_id: device_id,
            device_id,
            timestamp: Utc::now(),
            payload,
            routing: Routing::default(),
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    /// The event is about a different component than the emitter.
    pub fn with_source(mut self, source_id: DeviceId) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn property_changed(
        device_id: DeviceId,
        property_name: impl Into<String>,
        property_type: impl Into<String>,
        old_value: Option<Value>,
        new_value: Value,
        metadata: Option<PropertyMetadata>,
    ) -> Self {
        Self::new(
            device_id,
            EventPayload::PropertyChanged {
                property_name: property_name.into(),
                property_type: property_type.into(),
                old_value,
                new_value,
                metadata,
            },
        )
    }

    pub fn lifecycle(device_id: DeviceId, new_state: LifecycleState, details: Option<String>) -> Self {
        Self::new(device_id, EventPayload::Lifecycle { new_state, details })
    }

    pub fn alert(
        device_id: DeviceId,
        severity: Severity,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self::new(
            device_id,
            EventPayload::Alert {
                severity,
                message: message.into(),
                data,
                acknowledged: false,
            },
        )
    }

    pub fn telemetry(
        device_id: DeviceId,
        readings: HashMap<String, f64>,
        units: HashMap<String, String>,
    ) -> Self {
        Self::new(device_id, EventPayload::Telemetry { readings, units })
    }

    pub fn command(
        device_id: DeviceId,
        name: impl Into<String>,
        parameters: HashMap<String, Value>,
    ) -> Self {
        Self::new(
            device_id,
            EventPayload::Command { name: name.into(), parameters },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_matches_payload() {
        let id = DeviceId::new();
        assert_eq!(
            Event::lifecycle(id, LifecycleState::Ready, None).kind(),
            EventKind::Lifecycle
        );
        assert_eq!(
            Event::alert(id, Severity::Warning, "low flow", None).kind(),
            EventKind::Alert
        );
    }

    #[test]
    fn default_routing_is_inert() {
        let r = Routing::default();
        assert!(r.target_ids.is_empty());
        assert!(!r.persist);
        assert_eq!(r.priority, Priority::Normal);
        assert!(!r.requires_ack);
        assert!(r.timeout.is_none());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let ev = Event::property_changed(
            DeviceId::new(),
            "FlowRate",
            "number",
            Some(json!(50)),
            json!(75),
            Some(PropertyMetadata::derived("FlowRate")),
        )
        .with_routing(Routing::default().persisted().with_priority(Priority::High));

        let s = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&s).unwrap();
        assert_eq!(ev, back);
        assert_eq!(back.kind(), EventKind::PropertyChanged);
    }
}
