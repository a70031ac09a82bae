use async_trait::async_trait;
use serde_json::Value;
use sprig_domain::{DeviceId, MetadataMap, PropertyMap};

use crate::error::StoreError;

/// Durable per-component key/value and metadata persistence.
///
/// Guarantees:
/// - single-writer serialization per store instance;
/// - each `commit` has an atomic write-or-nothing visible effect;
/// - `save_with_metadata(_, _, None)` never drops previously saved metadata
///   for untouched keys.
///
/// Unknown value types serialize opaquely as JSON.
#[async_trait]
pub trait PropertyStore: Send + Sync + 'static {
    /// Open a transaction. Dropping it without commit rolls back.
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn load(&self, id: &DeviceId) -> Result<Option<PropertyMap>, StoreError>;

    async fn load_metadata(&self, id: &DeviceId) -> Result<Option<MetadataMap>, StoreError>;

    async fn save(&self, id: &DeviceId, properties: &PropertyMap) -> Result<(), StoreError>;

    async fn save_with_metadata(
        &self,
        id: &DeviceId,
        properties: &PropertyMap,
        metadata: Option<&MetadataMap>,
    ) -> Result<(), StoreError>;

    /// All component ids with a persisted entry.
    async fn list_ids(&self) -> Result<Vec<DeviceId>, StoreError>;
}

/// A buffered transaction against a [`PropertyStore`].
///
/// Saves are staged in memory and applied atomically on `commit`; a dropped
/// or rolled-back transaction leaves the store untouched.
#[async_trait]
pub trait StoreTransaction: Send {
    fn save(&mut self, id: DeviceId, properties: PropertyMap);

    fn save_with_metadata(
        &mut self,
        id: DeviceId,
        properties: PropertyMap,
        metadata: Option<MetadataMap>,
    );

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Read seam used where only single-property lookups are needed, notably by
/// the topology condition evaluator. The persistence service implements this
/// over its pending buffers plus the store; every store implements it
/// directly.
#[async_trait]
pub trait PropertyReader: Send + Sync {
    async fn read_property(
        &self,
        device_id: &DeviceId,
        name: &str,
    ) -> Result<Option<Value>, StoreError>;
}

/// A staged write, shared by the store backends' transaction types.
#[derive(Debug)]
pub(crate) enum StagedSave {
    Properties {
        id: DeviceId,
        properties: PropertyMap,
    },
    WithMetadata {
        id: DeviceId,
        properties: PropertyMap,
        metadata: Option<MetadataMap>,
    },
}

impl StagedSave {
    /// Apply this staged write onto a record table.
    pub(crate) fn apply(
        self,
        table: &mut std::collections::HashMap<DeviceId, crate::record::ComponentRecord>,
    ) {
        match self {
            StagedSave::Properties { id, properties } => {
                table.entry(id).or_default().apply(properties, None);
            }
            StagedSave::WithMetadata { id, properties, metadata } => {
                table.entry(id).or_default().apply(properties, metadata);
            }
        }
    }
}
