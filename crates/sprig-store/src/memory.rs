use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sprig_domain::{DeviceId, MetadataMap, PropertyMap};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::record::ComponentRecord;
use crate::store::{PropertyStore, StagedSave, StoreTransaction};

/// In-memory implementation of [`PropertyStore`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<DeviceId, ComponentRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn commit_staged(&self, staged: Vec<StagedSave>) -> Result<(), StoreError> {
        let mut table = self.inner.write().await;
        for op in staged {
            op.apply(&mut table);
        }
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for MemoryStore {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            staged: Vec::new(),
        }))
    }

    async fn load(&self, id: &DeviceId) -> Result<Option<PropertyMap>, StoreError> {
        let table = self.inner.read().await;
        Ok(table.get(id).map(|rec| rec.properties.clone()))
    }

    async fn load_metadata(&self, id: &DeviceId) -> Result<Option<MetadataMap>, StoreError> {
        let table = self.inner.read().await;
        Ok(table.get(id).map(|rec| rec.metadata.clone()))
    }

    async fn save(&self, id: &DeviceId, properties: &PropertyMap) -> Result<(), StoreError> {
        self.commit_staged(vec![StagedSave::Properties {
            id: *id,
            properties: properties.clone(),
        }])
        .await
    }

    async fn save_with_metadata(
        &self,
        id: &DeviceId,
        properties: &PropertyMap,
        metadata: Option<&MetadataMap>,
    ) -> Result<(), StoreError> {
        self.commit_staged(vec![StagedSave::WithMetadata {
            id: *id,
            properties: properties.clone(),
            metadata: metadata.cloned(),
        }])
        .await
    }

    async fn list_ids(&self) -> Result<Vec<DeviceId>, StoreError> {
        let table = self.inner.read().await;
        Ok(table.keys().copied().collect())
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    staged: Vec<StagedSave>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn save(&mut self, id: DeviceId, properties: PropertyMap) {
        self.staged.push(StagedSave::Properties { id, properties });
    }

    fn save_with_metadata(
        &mut self,
        id: DeviceId,
        properties: PropertyMap,
        metadata: Option<MetadataMap>,
    ) {
        self.staged
            .push(StagedSave::WithMetadata { id, properties, metadata });
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.store.commit_staged(self.staged).await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Staged writes are simply discarded.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprig_domain::PropertyMetadata;

    fn props(pairs: &[(&str, serde_json::Value)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = MemoryStore::new();
        let id = DeviceId::new();
        store
            .save(&id, &props(&[("FlowRate", json!(50))]))
            .await
            .unwrap();

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded["FlowRate"], json!(50));
        assert!(store.load(&DeviceId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nil_metadata_preserves_existing() {
        let store = MemoryStore::new();
        let id = DeviceId::new();

        let mut meta = MetadataMap::new();
        meta.insert("FlowRate".into(), PropertyMetadata::derived("FlowRate"));
        store
            .save_with_metadata(&id, &props(&[("FlowRate", json!(50))]), Some(&meta))
            .await
            .unwrap();

        // A later save without metadata must not drop it.
        store
            .save_with_metadata(&id, &props(&[("FlowRate", json!(60))]), None)
            .await
            .unwrap();

        let loaded = store.load_metadata(&id).await.unwrap().unwrap();
        assert!(loaded.contains_key("FlowRate"));
    }

    #[tokio::test]
    async fn transaction_commit_applies_all() {
        let store = MemoryStore::new();
        let a = DeviceId::new();
        let b = DeviceId::new();

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save(a, props(&[("X", json!(1))]));
        tx.save(b, props(&[("Y", json!(2))]));
        tx.commit().await.unwrap();

        assert!(store.load(&a).await.unwrap().is_some());
        assert!(store.load(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        let id = DeviceId::new();

        {
            let mut tx = store.begin_transaction().await.unwrap();
            tx.save(id, props(&[("X", json!(1))]));
            // dropped without commit
        }
        assert!(store.load(&id).await.unwrap().is_none());

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save(id, props(&[("X", json!(1))]));
        tx.rollback().await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_ids_covers_saved_components() {
        let store = MemoryStore::new();
        let a = DeviceId::new();
        let b = DeviceId::new();
        store.save(&a, &PropertyMap::new()).await.unwrap();
        store.save(&b, &PropertyMap::new()).await.unwrap();

        let mut ids = store.list_ids().await.unwrap();
        ids.sort_by_key(|id| id.to_string());
        let mut want = vec![a, b];
        want.sort_by_key(|id| id.to_string());
        assert_eq!(ids, want);
    }
}
