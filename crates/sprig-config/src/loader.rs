use std::collections::HashMap;
use std::path::Path;

use sprig_domain::{
    Connection, ConnectionId, ConnectionType, DeviceId, MetadataMap, PropertyMap, PropertyMetadata,
};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConnection, RawDevice, RawMetadata, RawTopology};

/// Concrete device type a [`DeviceSpec`] asks the launcher to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Pump,
    Sensor,
    Controller,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceKind::Pump => "pump",
            DeviceKind::Sensor => "sensor",
            DeviceKind::Controller => "controller",
        };
        write!(f, "{}", s)
    }
}

/// A device as declared in the site configuration.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    /// Initial property values applied after attach.
    pub properties: PropertyMap,
    pub metadata: MetadataMap,
}

/// Everything `load_site` found.
#[derive(Debug, Default)]
pub struct SiteConfig {
    pub devices: Vec<DeviceSpec>,
    pub connections: Vec<Connection>,
}

/// Load a site directory.
///
/// Expected layout:
/// ```text
/// <dir>/
///   topology.yml          <- RawTopology (optional)
///   <device-name>/
///     config.yml          <- RawDevice
/// ```
///
/// Connections reference devices by name; unknown names are an error.
pub fn load_site(dir: &Path) -> Result<SiteConfig, ConfigError> {
    let mut devices = Vec::new();

    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let config_path = path.join("config.yml");
        if !config_path.exists() {
            continue;
        }
        debug!("loading device from {}", config_path.display());
        let raw: RawDevice = read_yaml(&config_path)?;
        devices.push(convert_device(raw, &config_path)?);
    }

    // Names are the reference keys in topology.yml; duplicates would make
    // connections ambiguous.
    let mut by_name: HashMap<&str, DeviceId> = HashMap::new();
    for device in &devices {
        if by_name.insert(&device.name, device.id).is_some() {
            return Err(ConfigError::DuplicateDevice(device.name.clone()));
        }
    }

    let topology_path = dir.join("topology.yml");
    let connections = if topology_path.exists() {
        let raw: RawTopology = read_yaml(&topology_path)?;
        raw.connections
            .into_iter()
            .map(|c| convert_connection(c, &by_name, &topology_path))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };

    debug!(
        devices = devices.len(),
        connections = connections.len(),
        "site loaded"
    );
    Ok(SiteConfig {
        devices,
        connections,
    })
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })
}

fn convert_device(raw: RawDevice, path: &Path) -> Result<DeviceSpec, ConfigError> {
    let id = match raw.id {
        Some(text) => DeviceId::parse(&text).map_err(|_| ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("invalid device id '{}'", text),
        })?,
        None => DeviceId::new(),
    };

    let kind = match raw.kind.as_str() {
        "pump" => DeviceKind::Pump,
        "sensor" => DeviceKind::Sensor,
        "controller" => DeviceKind::Controller,
        other => {
            return Err(ConfigError::Conversion {
                path: path.display().to_string(),
                message: format!("unknown device kind '{}'", other),
            })
        }
    };

    let metadata = raw
        .metadata
        .into_iter()
        .map(|(name, m)| {
            let meta = convert_metadata(&name, m);
            (name, meta)
        })
        .collect();

    Ok(DeviceSpec {
        id,
        name: raw.name,
        kind,
        properties: raw.properties.into_iter().collect(),
        metadata,
    })
}

fn convert_metadata(name: &str, raw: RawMetadata) -> PropertyMetadata {
    let derived = PropertyMetadata::derived(name);
    PropertyMetadata {
        is_editable: raw.editable,
        is_visible: raw.visible,
        display_name: raw.display_name.unwrap_or(derived.display_name),
        description: raw.description.unwrap_or(derived.description),
    }
}

fn convert_connection(
    raw: RawConnection,
    by_name: &HashMap<&str, DeviceId>,
    path: &Path,
) -> Result<Connection, ConfigError> {
    let source_id = *by_name
        .get(raw.source.as_str())
        .ok_or_else(|| ConfigError::UnknownDevice(raw.source.clone()))?;
    let target_id = *by_name
        .get(raw.target.as_str())
        .ok_or_else(|| ConfigError::UnknownDevice(raw.target.clone()))?;

    let connection_type = match raw.connection_type.as_str() {
        "flow" => ConnectionType::Flow,
        "control" => ConnectionType::Control,
        "data" => ConnectionType::Data,
        other => {
            return Err(ConfigError::Conversion {
                path: path.display().to_string(),
                message: format!("unknown connection type '{}'", other),
            })
        }
    };

    Ok(Connection {
        connection_id: ConnectionId::new(),
        source_id,
        target_id,
        connection_type,
        enabled: raw.enabled,
        condition: raw.condition,
        metadata: raw.metadata.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn loads_devices_and_topology() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "pump-a/config.yml",
            "name: pump-a\nkind: pump\nproperties:\n  TargetFlowRate: 55\n",
        );
        write(
            dir.path(),
            "tank-b/config.yml",
            "name: tank-b\nkind: sensor\nmetadata:\n  Reading:\n    display_name: Tank Level\n",
        );
        write(
            dir.path(),
            "topology.yml",
            "connections:\n  - source: pump-a\n    target: tank-b\n    type: flow\n    condition: source.FlowRate > 50\n",
        );

        let site = load_site(dir.path()).unwrap();
        assert_eq!(site.devices.len(), 2);
        assert_eq!(site.connections.len(), 1);

        let pump = site.devices.iter().find(|d| d.name == "pump-a").unwrap();
        assert_eq!(pump.kind, DeviceKind::Pump);
        assert_eq!(pump.properties["TargetFlowRate"], serde_json::json!(55));

        let tank = site.devices.iter().find(|d| d.name == "tank-b").unwrap();
        assert_eq!(tank.metadata["Reading"].display_name, "Tank Level");
        assert!(tank.metadata["Reading"].is_editable);

        let conn = &site.connections[0];
        assert_eq!(conn.source_id, pump.id);
        assert_eq!(conn.target_id, tank.id);
        assert!(conn.enabled);
        assert_eq!(conn.condition.as_deref(), Some("source.FlowRate > 50"));
    }

    #[test]
    fn explicit_id_is_kept() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "pump-a/config.yml",
            "id: 7f8ea31c-9d5a-4b6c-a1de-6ae8a1f40d2f\nname: pump-a\nkind: pump\n",
        );
        let site = load_site(dir.path()).unwrap();
        assert_eq!(
            site.devices[0].id.to_string(),
            "7f8ea31c-9d5a-4b6c-a1de-6ae8a1f40d2f"
        );
    }

    #[test]
    fn unknown_connection_device_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "pump-a/config.yml", "name: pump-a\nkind: pump\n");
        write(
            dir.path(),
            "topology.yml",
            "connections:\n  - source: pump-a\n    target: ghost\n    type: flow\n",
        );
        assert!(matches!(
            load_site(dir.path()),
            Err(ConfigError::UnknownDevice(name)) if name == "ghost"
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a/config.yml", "name: pump\nkind: pump\n");
        write(dir.path(), "b/config.yml", "name: pump\nkind: pump\n");
        assert!(matches!(
            load_site(dir.path()),
            Err(ConfigError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "x/config.yml", "name: x\nkind: valve\n");
        assert!(matches!(
            load_site(dir.path()),
            Err(ConfigError::Conversion { .. })
        ));
    }

    #[test]
    fn missing_topology_is_fine() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "pump-a/config.yml", "name: pump-a\nkind: pump\n");
        let site = load_site(dir.path()).unwrap();
        assert!(site.connections.is_empty());
    }
}
