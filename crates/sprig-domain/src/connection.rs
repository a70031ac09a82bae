use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, DeviceId};

/// What a connection carries between two components.
///
/// The same `(source, target)` pair may be connected once per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Water / nutrient flow between stages.
    Flow,
    /// Control signal (a controller steering an actuator).
    Control,
    /// Sensor readings feeding a consumer.
    Data,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionType::Flow => "flow",
            ConnectionType::Control => "control",
            ConnectionType::Data => "data",
        };
        write!(f, "{}", s)
    }
}

/// A directed, optionally conditioned edge between two components.
///
/// A disabled connection is invisible to routing. The optional condition is a
/// `side.Property OP literal` expression evaluated against live component
/// properties by the topology service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub source_id: DeviceId,
    pub target_id: DeviceId,
    pub connection_type: ConnectionType,
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Connection {
    pub fn new(source_id: DeviceId, target_id: DeviceId, connection_type: ConnectionType) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            source_id,
            target_id,
            connection_type,
            enabled: true,
            condition: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_is_enabled_and_unconditioned() {
        let c = Connection::new(DeviceId::new(), DeviceId::new(), ConnectionType::Flow);
        assert!(c.enabled);
        assert!(c.condition.is_none());
        assert!(!c.connection_id.is_nil());
    }

    #[test]
    fn round_trips_through_json() {
        let c = Connection::new(DeviceId::new(), DeviceId::new(), ConnectionType::Control)
            .with_condition("source.FlowRate > 50");
        let s = serde_json::to_string(&c).unwrap();
        let back: Connection = serde_json::from_str(&s).unwrap();
        assert_eq!(c, back);
    }
}
