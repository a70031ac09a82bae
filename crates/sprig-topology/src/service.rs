use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sprig_domain::{Connection, ConnectionId, DeviceId, PropertyMap};
use sprig_store::{PropertyReader, PropertyStore};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::condition::{Condition, Side};
use crate::error::TopologyError;

/// Store key holding the connection list under the reserved topology id.
const CONNECTIONS_KEY: &str = "Connections";

#[derive(Debug, Default)]
struct Indexes {
    connections: HashMap<ConnectionId, Connection>,
    by_source: HashMap<DeviceId, Vec<ConnectionId>>,
    by_target: HashMap<DeviceId, Vec<ConnectionId>>,
}

impl Indexes {
    fn insert(&mut self, connection: Connection) {
        self.by_source
            .entry(connection.source_id)
            .or_default()
            .push(connection.connection_id);
        self.by_target
            .entry(connection.target_id)
            .or_default()
            .push(connection.connection_id);
        self.connections
            .insert(connection.connection_id, connection);
    }

    fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        if let Some(ids) = self.by_source.get_mut(&connection.source_id) {
            ids.retain(|c| c != id);
            if ids.is_empty() {
                self.by_source.remove(&connection.source_id);
            }
        }
        if let Some(ids) = self.by_target.get_mut(&connection.target_id) {
            ids.retain(|c| c != id);
            if ids.is_empty() {
                self.by_target.remove(&connection.target_id);
            }
        }
        Some(connection)
    }
}

/// The declared device topology: a directed, conditioned connection graph.
///
/// Connections are persisted under [`DeviceId::TOPOLOGY`] on every mutation
/// and rebuilt from the store by [`initialize`](TopologyService::initialize).
/// The conditioned read path (`connections_from` / `connections_to`) only
/// surfaces enabled connections whose condition currently evaluates true
/// against live component properties.
pub struct TopologyService {
    store: Arc<dyn PropertyStore>,
    /// Live property source for condition evaluation. Defaults to the store;
    /// the launcher points this at the persistence service so pending writes
    /// are visible to conditions.
    reader: RwLock<Option<Arc<dyn PropertyReader>>>,
    inner: RwLock<Indexes>,
}

impl TopologyService {
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self {
            store,
            reader: RwLock::new(None),
            inner: RwLock::new(Indexes::default()),
        }
    }

    pub async fn set_property_reader(&self, reader: Arc<dyn PropertyReader>) {
        *self.reader.write().await = Some(reader);
    }

    /// Load all persisted connections and rebuild both indexes.
    pub async fn initialize(&self) -> Result<(), TopologyError> {
        let connections: Vec<Connection> = match self.store.load(&DeviceId::TOPOLOGY).await? {
            Some(props) => match props.get(CONNECTIONS_KEY) {
                Some(value) => serde_json::from_value(value.clone())?,
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        let mut inner = self.inner.write().await;
        *inner = Indexes::default();
        let count = connections.len();
        for connection in connections {
            inner.insert(connection);
        }
        debug!(connections = count, "topology initialized");
        Ok(())
    }

    /// Register a new connection.
    ///
    /// A nil `connection_id` gets a fresh one assigned; an id already
    /// present is rejected.
    pub async fn create(&self, mut connection: Connection) -> Result<Connection, TopologyError> {
        if connection.connection_id.is_nil() {
            connection.connection_id = ConnectionId::new();
        }
        {
            let mut inner = self.inner.write().await;
            if inner.connections.contains_key(&connection.connection_id) {
                return Err(TopologyError::DuplicateConnection(connection.connection_id));
            }
            inner.insert(connection.clone());
        }
        self.persist().await?;
        debug!(
            connection_id = %connection.connection_id,
            source = %connection.source_id,
            target = %connection.target_id,
            "connection created"
        );
        Ok(connection)
    }

    /// Replace an existing connection, re-indexing if its endpoints moved.
    pub async fn update(&self, connection: Connection) -> Result<(), TopologyError> {
        {
            let mut inner = self.inner.write().await;
            if inner.remove(&connection.connection_id).is_none() {
                return Err(TopologyError::UnknownConnection(connection.connection_id));
            }
            inner.insert(connection.clone());
        }
        self.persist().await?;
        debug!(connection_id = %connection.connection_id, "connection updated");
        Ok(())
    }

    /// Remove a connection from the graph and all indexes.
    /// `false` when the id was unknown.
    pub async fn delete(&self, id: &ConnectionId) -> Result<bool, TopologyError> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.remove(id).is_some()
        };
        if removed {
            self.persist().await?;
            debug!(connection_id = %id, "connection deleted");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner.read().await.connections.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Connection> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    /// Enabled connections leaving `source` whose condition currently holds.
    pub async fn connections_from(&self, source: &DeviceId) -> Vec<Connection> {
        let candidates: Vec<Connection> = {
            let inner = self.inner.read().await;
            inner
                .by_source
                .get(source)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id))
                .filter(|c| c.enabled)
                .cloned()
                .collect()
        };
        self.filter_passing(candidates).await
    }

    /// Enabled connections arriving at `target` whose condition currently
    /// holds.
    pub async fn connections_to(&self, target: &DeviceId) -> Vec<Connection> {
        let candidates: Vec<Connection> = {
            let inner = self.inner.read().await;
            inner
                .by_target
                .get(target)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id))
                .filter(|c| c.enabled)
                .cloned()
                .collect()
        };
        self.filter_passing(candidates).await
    }

    /// Evaluate one connection's condition against live properties.
    ///
    /// Absent or empty conditions pass. A parse error or failed property
    /// fetch fails the condition (and is logged), never the caller.
    pub async fn evaluate_condition(&self, connection: &Connection) -> bool {
        let Some(text) = connection
            .condition
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return true;
        };

        let condition = match Condition::parse(text) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    connection_id = %connection.connection_id,
                    error = %e,
                    "condition failed to parse; treating as false"
                );
                return false;
            }
        };

        let device_id = match condition.side {
            Side::Source => connection.source_id,
            Side::Target => connection.target_id,
        };

        let value = match self.read_property(&device_id, &condition.property).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!(
                    connection_id = %connection.connection_id,
                    device_id = %device_id,
                    property = condition.property,
                    "condition property absent; treating as false"
                );
                return false;
            }
            Err(e) => {
                warn!(
                    connection_id = %connection.connection_id,
                    error = %e,
                    "condition property fetch failed; treating as false"
                );
                return false;
            }
        };

        match condition.evaluate(&value) {
            Some(result) => result,
            None => {
                warn!(
                    connection_id = %connection.connection_id,
                    property = condition.property,
                    "condition type mismatch; treating as false"
                );
                false
            }
        }
    }

    async fn filter_passing(&self, candidates: Vec<Connection>) -> Vec<Connection> {
        let mut passing = Vec::with_capacity(candidates.len());
        for connection in candidates {
            if self.evaluate_condition(&connection).await {
                passing.push(connection);
            }
        }
        passing
    }

    async fn read_property(
        &self,
        device_id: &DeviceId,
        name: &str,
    ) -> Result<Option<Value>, sprig_store::StoreError> {
        let reader = self.reader.read().await.clone();
        match reader {
            Some(reader) => reader.read_property(device_id, name).await,
            None => Ok(self
                .store
                .load(device_id)
                .await?
                .and_then(|props| props.get(name).cloned())),
        }
    }

    async fn persist(&self) -> Result<(), TopologyError> {
        let connections: Vec<Connection> = self.all().await;
        let mut props = PropertyMap::new();
        props.insert(
            CONNECTIONS_KEY.to_string(),
            serde_json::to_value(connections)?,
        );
        self.store.save(&DeviceId::TOPOLOGY, &props).await?;
        Ok(())
    }
}
