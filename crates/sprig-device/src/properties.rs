use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sprig_domain::{DeviceId, MetadataMap, PropertyMap, PropertyMetadata};
use tracing::{debug, warn};

/// Retry backoffs for [`PropertyBag::update_optimistic`].
const CAS_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(10),
    Duration::from_millis(20),
    Duration::from_millis(30),
];

/// Tag describing a value's declared type; carried in property-changed
/// events and used for null canonicalization on persist.
pub fn value_type_tag(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One observed property mutation, delivered to the bag's bound handler.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub device_id: DeviceId,
    pub property_name: String,
    pub property_type: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    /// The metadata in effect after the write (supplied, previously known,
    /// or derived).
    pub metadata: PropertyMetadata,
}

/// The single handler bound to a bag. Binding is overwrite-only; there is
/// never more than one.
#[async_trait]
pub trait PropertyChangeHandler: Send + Sync {
    async fn on_property_changed(&self, change: PropertyChange);
}

#[derive(Debug, Default)]
struct Inner {
    properties: PropertyMap,
    metadata: MetadataMap,
}

/// Typed property storage with sticky metadata and change notification.
///
/// Values are stored as JSON and read back through typed deserialization.
/// Setting a property to a value equal to the current one emits nothing;
/// otherwise exactly one [`PropertyChange`] goes to the bound handler.
pub struct PropertyBag {
    device_id: DeviceId,
    inner: RwLock<Inner>,
    handler: RwLock<Option<Arc<dyn PropertyChangeHandler>>>,
    /// Default metadata for well-known property names, fixed at
    /// construction. Consulted only when a property has no recorded
    /// metadata and the caller supplies none.
    overrides: HashMap<String, PropertyMetadata>,
}

impl PropertyBag {
    pub fn new(device_id: DeviceId) -> Self {
        Self::with_overrides(device_id, HashMap::new())
    }

    pub fn with_overrides(
        device_id: DeviceId,
        overrides: HashMap<String, PropertyMetadata>,
    ) -> Self {
        Self {
            device_id,
            inner: RwLock::new(Inner::default()),
            handler: RwLock::new(None),
            overrides,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Bind the change handler, replacing any previous one.
    pub fn set_change_handler(&self, handler: Arc<dyn PropertyChangeHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn get_raw(&self, name: &str) -> Option<Value> {
        self.inner
            .read()
            .expect("property lock poisoned")
            .properties
            .get(name)
            .cloned()
    }

    /// Typed read. `None` when the property is absent or does not convert.
    pub fn get_property<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let raw = self.get_raw(name)?;
        match serde_json::from_value(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(property = name, error = %e, "typed property read failed conversion");
                None
            }
        }
    }

    pub fn get_metadata(&self, name: &str) -> Option<PropertyMetadata> {
        self.inner
            .read()
            .expect("property lock poisoned")
            .metadata
            .get(name)
            .cloned()
    }

    pub fn all_properties(&self) -> PropertyMap {
        self.inner
            .read()
            .expect("property lock poisoned")
            .properties
            .clone()
    }

    pub fn all_metadata(&self) -> MetadataMap {
        self.inner
            .read()
            .expect("property lock poisoned")
            .metadata
            .clone()
    }

    /// Write a value and optionally its metadata.
    ///
    /// Metadata is sticky: omitting it keeps whatever was recorded before,
    /// deriving a default only for a property never described. An equal
    /// value is a no-op and emits nothing.
    pub async fn set_property(
        &self,
        name: &str,
        value: Value,
        metadata: Option<PropertyMetadata>,
    ) {
        let change = {
            let mut inner = self.inner.write().expect("property lock poisoned");
            self.write_locked(&mut inner, name, value, metadata)
        };
        if let Some(change) = change {
            self.notify(change).await;
        }
    }

    /// Read-modify-write with compare-and-swap semantics.
    ///
    /// Reads the current typed value, computes the new one via `f`, and
    /// publishes only if no concurrent writer got in between. Retries three
    /// times with 10/20/30 ms backoffs; returns `false` once exhausted (or
    /// when the property is absent or does not convert).
    pub async fn update_optimistic<T, F>(&self, name: &str, f: F) -> bool
    where
        T: DeserializeOwned + Serialize,
        F: Fn(&T) -> T,
    {
        for attempt in 0..=CAS_BACKOFFS.len() {
            let Some(observed) = self.get_raw(name) else {
                warn!(property = name, "optimistic update on unknown property");
                return false;
            };
            let typed: T = match serde_json::from_value(observed.clone()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(property = name, error = %e, "optimistic update failed conversion");
                    return false;
                }
            };
            let next = match serde_json::to_value(f(&typed)) {
                Ok(v) => v,
                Err(e) => {
                    warn!(property = name, error = %e, "optimistic update failed serialization");
                    return false;
                }
            };

            let swapped = {
                let mut inner = self.inner.write().expect("property lock poisoned");
                if inner.properties.get(name) == Some(&observed) {
                    Some(self.write_locked(&mut inner, name, next, None))
                } else {
                    None
                }
            };
            match swapped {
                Some(change) => {
                    if let Some(change) = change {
                        self.notify(change).await;
                    }
                    return true;
                }
                None if attempt < CAS_BACKOFFS.len() => {
                    tokio::time::sleep(CAS_BACKOFFS[attempt]).await;
                }
                None => break,
            }
        }
        warn!(
            device_id = %self.device_id,
            property = name,
            "optimistic update lost the race on every attempt"
        );
        false
    }

    /// Replace both maps atomically. Emits no change events; used when
    /// rehydrating a component from the store.
    pub fn load_properties(&self, properties: PropertyMap, metadata: Option<MetadataMap>) {
        let mut inner = self.inner.write().expect("property lock poisoned");
        inner.properties = properties;
        inner.metadata = metadata.unwrap_or_default();
    }

    /// The write path. Returns the change to emit, `None` for an equal value.
    fn write_locked(
        &self,
        inner: &mut Inner,
        name: &str,
        value: Value,
        metadata: Option<PropertyMetadata>,
    ) -> Option<PropertyChange> {
        let old = inner.properties.get(name).cloned();

        let final_metadata = match metadata {
            Some(m) => {
                inner.metadata.insert(name.to_string(), m.clone());
                m
            }
            None => match inner.metadata.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let derived = self
                        .overrides
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| PropertyMetadata::derived(name));
                    inner.metadata.insert(name.to_string(), derived.clone());
                    derived
                }
            },
        };

        if old.as_ref() == Some(&value) {
            return None;
        }

        let property_type = value_type_tag(&value).to_string();
        inner.properties.insert(name.to_string(), value.clone());

        Some(PropertyChange {
            device_id: self.device_id,
            property_name: name.to_string(),
            property_type,
            old_value: old,
            new_value: value,
            metadata: final_metadata,
        })
    }

    async fn notify(&self, change: PropertyChange) {
        let handler = self
            .handler
            .read()
            .expect("handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            handler.on_property_changed(change).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<PropertyChange>>,
    }

    #[async_trait]
    impl PropertyChangeHandler for Recorder {
        async fn on_property_changed(&self, change: PropertyChange) {
            self.changes.lock().await.push(change);
        }
    }

    fn bag_with_recorder() -> (Arc<PropertyBag>, Arc<Recorder>) {
        let bag = Arc::new(PropertyBag::new(DeviceId::new()));
        let recorder = Arc::new(Recorder::default());
        bag.set_change_handler(recorder.clone());
        (bag, recorder)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (bag, _) = bag_with_recorder();
        bag.set_property("FlowRate", json!(50.0), None).await;
        assert_eq!(bag.get_property::<f64>("FlowRate"), Some(50.0));
        assert_eq!(bag.get_raw("FlowRate"), Some(json!(50.0)));
    }

    #[tokio::test]
    async fn equal_value_emits_nothing() {
        let (bag, recorder) = bag_with_recorder();
        bag.set_property("FlowRate", json!(50), None).await;
        bag.set_property("FlowRate", json!(50), None).await;
        assert_eq!(recorder.changes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn change_carries_old_and_new() {
        let (bag, recorder) = bag_with_recorder();
        bag.set_property("FlowRate", json!(50), None).await;
        bag.set_property("FlowRate", json!(75), None).await;

        let changes = recorder.changes.lock().await;
        let last = changes.last().unwrap();
        assert_eq!(last.old_value, Some(json!(50)));
        assert_eq!(last.new_value, json!(75));
        assert_eq!(last.property_type, "number");
    }

    #[tokio::test]
    async fn metadata_is_sticky() {
        let (bag, _) = bag_with_recorder();
        let custom = PropertyMetadata {
            is_editable: true,
            is_visible: true,
            display_name: "Flow Rate".into(),
            description: "Pump flow rate".into(),
        };
        bag.set_property("FlowRate", json!(50), Some(custom.clone()))
            .await;
        // Later write without metadata must keep the earlier record.
        bag.set_property("FlowRate", json!(60), None).await;
        assert_eq!(bag.get_metadata("FlowRate"), Some(custom));
    }

    #[tokio::test]
    async fn default_metadata_is_derived() {
        let (bag, _) = bag_with_recorder();
        bag.set_property("Humidity", json!(40), None).await;
        let meta = bag.get_metadata("Humidity").unwrap();
        assert!(meta.is_editable);
        assert_eq!(meta.display_name, "Humidity");
        assert_eq!(meta.description, "Property Humidity");
    }

    #[tokio::test]
    async fn override_table_wins_over_derivation() {
        let id = DeviceId::new();
        let overrides = [(
            "State".to_string(),
            PropertyMetadata::derived_read_only("State"),
        )]
        .into();
        let bag = PropertyBag::with_overrides(id, overrides);
        bag.set_property("State", json!("ready"), None).await;
        assert!(!bag.get_metadata("State").unwrap().is_editable);
    }

    #[tokio::test]
    async fn load_properties_is_silent_and_replaces() {
        let (bag, recorder) = bag_with_recorder();
        bag.set_property("A", json!(1), None).await;

        let props: PropertyMap = [("B".to_string(), json!(2))].into();
        bag.load_properties(props, None);

        assert!(bag.get_raw("A").is_none());
        assert_eq!(bag.get_property::<i64>("B"), Some(2));
        // only the original set emitted
        assert_eq!(recorder.changes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn handler_binding_is_overwrite() {
        let bag = Arc::new(PropertyBag::new(DeviceId::new()));
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        bag.set_change_handler(first.clone());
        bag.set_change_handler(second.clone());

        bag.set_property("X", json!(1), None).await;
        assert_eq!(first.changes.lock().await.len(), 0);
        assert_eq!(second.changes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn optimistic_update_applies_fn() {
        let (bag, recorder) = bag_with_recorder();
        bag.set_property("Counter", json!(1), None).await;
        assert!(bag.update_optimistic("Counter", |v: &i64| v + 1).await);
        assert_eq!(bag.get_property::<i64>("Counter"), Some(2));
        assert_eq!(recorder.changes.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn optimistic_update_on_missing_property_fails() {
        let (bag, _) = bag_with_recorder();
        assert!(!bag.update_optimistic("Nope", |v: &i64| v + 1).await);
    }

    #[tokio::test]
    async fn concurrent_monotonic_updates_all_land() {
        let (bag, _) = bag_with_recorder();
        bag.set_property("Counter", json!(0), None).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let bag = bag.clone();
            handles.push(tokio::spawn(async move {
                bag.update_optimistic("Counter", |v: &i64| v + 1).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(bag.get_property::<i64>("Counter"), Some(3));
    }
}
