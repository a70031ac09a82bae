use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sprig_domain::{DeviceId, MetadataMap, PropertyMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::record::ComponentRecord;
use crate::store::{PropertyStore, StagedSave, StoreTransaction};

/// Persistent [`PropertyStore`] backed by a single JSON file.
///
/// The file holds one entry per component id with `Properties` and
/// `Metadata` objects. Every commit rewrites the file through a temp file
/// followed by an atomic rename, so a crash mid-write leaves the previous
/// contents intact. The in-memory table is only updated after the rename
/// succeeds.
#[derive(Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: Arc<RwLock<HashMap<DeviceId, ComponentRecord>>>,
}

impl JsonFileStore {
    /// Open (or create) the store file at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let table = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };

        debug!(path = %path.display(), components = table.len(), "opened property store");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Arc::new(RwLock::new(table)),
        })
    }

    /// Serialize `table` and atomically replace the store file with it.
    fn write_file(&self, table: &HashMap<DeviceId, ComponentRecord>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(table)?;
        let tmp = self.path.with_extension("tmp");

        let mut file = std::fs::File::create(&tmp).map_err(|e| StoreError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        file.write_all(&bytes).map_err(|e| StoreError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        file.sync_all().map_err(|e| StoreError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io {
            path: self.path.display().to_string(),
            source: e,
        })
    }

    /// Apply staged writes onto a copy of the table, persist the copy, then
    /// swap it in. The write lock serializes all writers on this instance.
    async fn commit_staged(&self, staged: Vec<StagedSave>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        for op in staged {
            op.apply(&mut next);
        }
        self.write_file(&next)?;
        *guard = next;
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for JsonFileStore {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(JsonFileTransaction {
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

struct JsonFileTransaction {
    store: JsonFileStore,
    staged: Vec<StagedSave>,
}

#[async_trait]
impl StoreTransaction for JsonFileTransaction {
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprig_domain::PropertyMetadata;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> JsonFileStore {
        JsonFileStore::open(&dir.path().join("site.json")).unwrap()
    }

    fn props(pairs: &[(&str, serde_json::Value)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = DeviceId::new();
        store
            .save(&id, &props(&[("FlowRate", json!(50))]))
            .await
            .unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded["FlowRate"], json!(50));
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.json");
        let id = DeviceId::new();

        // Write
        {
            let store = JsonFileStore::open(&path).unwrap();
            let mut meta = MetadataMap::new();
            meta.insert(
                "FlowRate".into(),
                PropertyMetadata {
                    is_editable: true,
                    is_visible: true,
                    display_name: "Flow Rate".into(),
                    description: "Pump flow rate".into(),
                },
            );
            store
                .save_with_metadata(&id, &props(&[("FlowRate", json!(50))]), Some(&meta))
                .await
                .unwrap();
        }

        // Re-open and verify both maps survived, including metadata.
        {
            let store = JsonFileStore::open(&path).unwrap();
            let loaded = store.load(&id).await.unwrap().unwrap();
            assert_eq!(loaded["FlowRate"], json!(50));
            let meta = store.load_metadata(&id).await.unwrap().unwrap();
            assert_eq!(meta["FlowRate"].display_name, "Flow Rate");
        }
    }

    #[tokio::test]
    async fn transaction_is_atomic_across_components() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let a = DeviceId::new();
        let b = DeviceId::new();

        let mut tx = store.begin_transaction().await.unwrap();
        tx.save(a, props(&[("X", json!(1))]));
        tx.save_with_metadata(b, props(&[("Y", json!(2))]), None);
        tx.commit().await.unwrap();

        assert!(store.load(&a).await.unwrap().is_some());
        assert!(store.load(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.json");
        let store = JsonFileStore::open(&path).unwrap();
        let id = DeviceId::new();

        {
            let mut tx = store.begin_transaction().await.unwrap();
            tx.save(id, props(&[("X", json!(1))]));
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert!(reopened.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nil_metadata_preserves_existing_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = DeviceId::new();

        let mut meta = MetadataMap::new();
        meta.insert("FlowRate".into(), PropertyMetadata::derived("FlowRate"));
        store
            .save_with_metadata(&id, &props(&[("FlowRate", json!(50))]), Some(&meta))
            .await
            .unwrap();
        store
            .save_with_metadata(&id, &props(&[("FlowRate", json!(60))]), None)
            .await
            .unwrap();

        let loaded = store.load_metadata(&id).await.unwrap().unwrap();
        assert!(loaded.contains_key("FlowRate"));
    }
}
