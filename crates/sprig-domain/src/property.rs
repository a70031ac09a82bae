use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A component's property values, keyed by property name.
pub type PropertyMap = HashMap<String, Value>;

/// A component's property metadata, parallel to [`PropertyMap`].
pub type MetadataMap = HashMap<String, PropertyMetadata>;

/// Display and editing metadata attached to a property.
///
/// Metadata is sticky: once recorded for a property, later value updates that
/// omit metadata must not erase it. The stores and the persistence service
/// both uphold this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMetadata {
    pub is_editable: bool,
    pub is_visible: bool,
    pub display_name: String,
    pub description: String,
}

impl PropertyMetadata {
    /// The default metadata derived for a property nobody ever described.
    pub fn derived(name: &str) -> Self {
        Self {
            is_editable: true,
            is_visible: true,
            display_name: name.to_string(),
            description: format!("Property {}", name),
        }
    }

    /// Derived metadata, read-only variant. Used for well-known properties
    /// such as `Id` and `State` that devices own exclusively.
    pub fn derived_read_only(name: &str) -> Self {
        Self {
            is_editable: false,
            ..Self::derived(name)
        }
    }
}
