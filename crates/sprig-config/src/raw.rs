use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw YAML representation of a device config file (device/config.yml).
#[derive(Debug, Deserialize, Serialize)]
pub struct RawDevice {
    /// Stable uuid. Absent means one is generated (and the site will get a
    /// new identity for this device on every load).
    pub id: Option<String>,
    pub name: String,
    /// "pump", "sensor" or "controller".
    pub kind: String,
    /// Initial property values applied after the device is attached.
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, RawMetadata>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawMetadata {
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Raw YAML representation of the site topology file (topology.yml).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawTopology {
    #[serde(default)]
    pub connections: Vec<RawConnection>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawConnection {
    /// Device names, resolved to ids during conversion.
    pub source: String,
    pub target: String,
    /// "flow", "control" or "data".
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub condition: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}
