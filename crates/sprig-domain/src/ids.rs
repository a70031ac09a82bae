use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Stable 128-bit identifier of a component (device, service, controller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Reserved id under which the topology service persists its connection
    /// list: all zeros with a trailing one.
    pub const TOPOLOGY: DeviceId = DeviceId(Uuid::from_u128(1));

    /// Reserved nil id for faults not attributable to any one device
    /// (service-level breakers, storage plumbing).
    pub const SYSTEM: DeviceId = DeviceId(Uuid::nil());

    pub fn new() -> Self {
        DeviceId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, crate::DomainError> {
        Uuid::parse_str(s)
            .map(DeviceId)
            .map_err(|_| crate::DomainError::InvalidId(s.to_string()))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    /// The nil id, used by callers that want the topology service to assign
    /// a fresh one on create.
    pub fn nil() -> Self {
        ConnectionId(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a fault record with the alert events raised for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_id_is_trailing_one() {
        assert_eq!(
            DeviceId::TOPOLOGY.to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
    }

    #[test]
    fn device_id_parses_round_trip() {
        let id = DeviceId::new();
        let parsed = DeviceId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn bad_device_id_rejected() {
        assert!(DeviceId::parse("not-a-uuid").is_err());
    }
}
