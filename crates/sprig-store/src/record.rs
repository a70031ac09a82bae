use serde::{Deserialize, Serialize};
use sprig_domain::{MetadataMap, PropertyMap};

/// The persisted shape of one component: a property bag and its parallel
/// metadata bag. The store format is an entry per component id holding one
/// of these; any file-level representation is opaque to callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentRecord {
    #[serde(rename = "Properties", default)]
    pub properties: PropertyMap,
    #[serde(rename = "Metadata", default)]
    pub metadata: MetadataMap,
}

impl ComponentRecord {
    /// Replace the property map and merge the metadata delta.
    ///
    /// `None` metadata keeps everything previously recorded; `Some(delta)`
    /// overwrites only the keys present in the delta. No metadata key is
    /// ever removed by a save.
    pub fn apply(&mut self, properties: PropertyMap, metadata: Option<MetadataMap>) {
        self.properties = properties;
        if let Some(delta) = metadata {
            for (name, meta) in delta {
                self.metadata.insert(name, meta);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_domain::PropertyMetadata;
    use serde_json::json;

    #[test]
    fn apply_with_none_keeps_metadata() {
        let mut rec = ComponentRecord::default();
        rec.metadata
            .insert("FlowRate".into(), PropertyMetadata::derived("FlowRate"));
        rec.apply([("FlowRate".to_string(), json!(75))].into(), None);
        assert!(rec.metadata.contains_key("FlowRate"));
        assert_eq!(rec.properties["FlowRate"], json!(75));
    }

    #[test]
    fn apply_merges_metadata_delta() {
        let mut rec = ComponentRecord::default();
        rec.metadata
            .insert("FlowRate".into(), PropertyMetadata::derived("FlowRate"));

        let mut delta = MetadataMap::new();
        delta.insert(
            "CurrentFlowRate".into(),
            PropertyMetadata::derived("CurrentFlowRate"),
        );
        rec.apply(PropertyMap::new(), Some(delta));

        // Untouched key survives alongside the new one.
        assert!(rec.metadata.contains_key("FlowRate"));
        assert!(rec.metadata.contains_key("CurrentFlowRate"));
    }

    #[test]
    fn serializes_with_store_format_keys() {
        let rec = ComponentRecord::default();
        let v = serde_json::to_value(&rec).unwrap();
        assert!(v.get("Properties").is_some());
        assert!(v.get("Metadata").is_some());
    }
}
