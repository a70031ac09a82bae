use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sprig_bus::{EventBus, EventHandler, HandlerError, SubscriptionOptions};
use sprig_device::{Device, DeviceRegistry, PropertyChange, PropertyChangeHandler};
use sprig_domain::{
    DeviceFault, DeviceId, Event, EventKind, EventPayload, FaultSource, MetadataMap, PropertyMap,
    Severity,
};
use sprig_resilience::{
    BreakerRegistry, ComponentRefresher, ErrorMonitor, FaultContextBuilder, ResilienceError,
};
use sprig_store::{PropertyReader, PropertyStore, StoreError};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PersistError;

/// Breaker guarding store commits.
const STORE_BREAKER: &str = "property-store";

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Cadence of the background flush.
    pub batch_interval: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct PendingBatch {
    properties: PropertyMap,
    metadata: MetadataMap,
}

/// Event-driven property persistence with per-device batching.
///
/// The service is every attached component's change handler: each observed
/// change is forwarded to the bus as a property-changed event, and an
/// internal synchronous subscription buffers all property-changed events
/// (from any publisher) into per-device pending batches. A timer, or
/// [`process_pending_events`](Self::process_pending_events), flushes the
/// batches in one transaction, merging on-disk state with the deltas so
/// metadata for untouched properties is carried forward unchanged.
pub struct PersistenceService {
    store: Arc<dyn PropertyStore>,
    bus: Arc<EventBus>,
    monitor: Arc<ErrorMonitor>,
    breakers: Arc<BreakerRegistry>,
    registry: Arc<DeviceRegistry>,
    pending: Mutex<HashMap<DeviceId, PendingBatch>>,
    /// Admits one flush at a time; each call still gets its own transaction.
    flush_gate: Semaphore,
    flush_task: SyncMutex<Option<JoinHandle<()>>>,
    config: PersistConfig,
}

impl PersistenceService {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        bus: Arc<EventBus>,
        monitor: Arc<ErrorMonitor>,
        breakers: Arc<BreakerRegistry>,
        registry: Arc<DeviceRegistry>,
        config: PersistConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            monitor,
            breakers,
            registry,
            pending: Mutex::new(HashMap::new()),
            flush_gate: Semaphore::new(1),
            flush_task: SyncMutex::new(None),
            config,
        })
    }

    /// Subscribe to property-changed events and start the flush timer.
    pub async fn start(self: &Arc<Self>) {
        self.bus
            .subscribe(
                self.clone(),
                SubscriptionOptions::for_kinds([EventKind::PropertyChanged]).synchronous(),
            )
            .await;

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.batch_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else { break };
                if let Err(e) = service.process_pending_events().await {
                    warn!(error = %e, "scheduled flush failed");
                }
            }
        });
        let mut slot = self.flush_task.lock().expect("flush task lock poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Register a component with the persistence layer.
    ///
    /// A component with no persisted state is initialized through the
    /// device contract and its resulting properties become the stored
    /// baseline. A known component is rehydrated from the store instead
    /// and is not re-initialized. Either way the service becomes the
    /// component's change handler.
    pub async fn attach(self: &Arc<Self>, device: Arc<dyn Device>) -> Result<(), PersistError> {
        let id = device.id();
        let prior_props = self.store.load(&id).await?;
        let prior_meta = self.store.load_metadata(&id).await?;

        match prior_props {
            None => {
                info!(device_id = %id, name = device.name(), "first-time component; initializing");
                device.initialize().await?;
                let baseline = device.properties().all_properties();
                let metadata = device.properties().all_metadata();
                self.store
                    .save_with_metadata(&id, &baseline, Some(&metadata))
                    .await?;
            }
            Some(props) => {
                debug!(device_id = %id, name = device.name(), "rehydrating component");
                device.properties().load_properties(props, prior_meta);
            }
        }

        device.properties().set_change_handler(self.clone());
        self.registry.register(device);
        Ok(())
    }

    /// Typed read: the pending buffer wins over the store, so conditions
    /// and callers see writes that have not flushed yet.
    pub async fn get_property<T: DeserializeOwned>(
        &self,
        device_id: &DeviceId,
        name: &str,
    ) -> Result<Option<T>, PersistError> {
        match self.raw_property(device_id, name).await? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }

    /// Flush all pending batches in one transaction.
    ///
    /// On commit failure the batches are restored (newer pending values
    /// win), the fault is reported, and the error is returned.
    pub async fn process_pending_events(&self) -> Result<(), PersistError> {
        let _permit = self
            .flush_gate
            .acquire()
            .await
            .expect("flush gate closed");

        let batch: HashMap<DeviceId, PendingBatch> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let started = std::time::Instant::now();
        match self.flush(&batch).await {
            Ok(()) => {
                debug!(devices = batch.len(), "flushed pending batches");
                Ok(())
            }
            Err(e) => {
                self.restore_pending(batch).await;
                let mut fault = DeviceFault::new(
                    DeviceId::SYSTEM,
                    "storage.flush_failed",
                    format!("pending flush failed: {}", e),
                    Severity::Error,
                    FaultSource::Storage,
                )
                .transient();
                fault.context = FaultContextBuilder::new()
                    .call_site("persist.process_pending_events")
                    .elapsed(started.elapsed())
                    .exception(&e)
                    .build();
                self.monitor.report(fault).await;
                Err(e)
            }
        }
    }

    /// Final flush, then stop the timer.
    pub async fn shutdown(self: &Arc<Self>) {
        if let Some(task) = self
            .flush_task
            .lock()
            .expect("flush task lock poisoned")
            .take()
        {
            task.abort();
        }
        if let Err(e) = self.process_pending_events().await {
            warn!(error = %e, "final flush failed");
        }
    }

    async fn flush(&self, batch: &HashMap<DeviceId, PendingBatch>) -> Result<(), PersistError> {
        let mut tx = self.store.begin_transaction().await?;
        for (device_id, pending) in batch {
            let mut props = self.store.load(device_id).await?.unwrap_or_default();
            let mut meta = self
                .store
                .load_metadata(device_id)
                .await?
                .unwrap_or_default();
            // Disk state plus the delta; untouched keys stay as they are.
            props.extend(pending.properties.clone());
            meta.extend(pending.metadata.clone());
            tx.save_with_metadata(*device_id, props, Some(meta));
        }

        let breaker = self.breakers.get(STORE_BREAKER);
        match breaker.execute(|| tx.commit()).await {
            Err(open) => Err(PersistError::CircuitOpen(open)),
            Ok(Err(e)) => Err(PersistError::Store(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn restore_pending(&self, batch: HashMap<DeviceId, PendingBatch>) {
        let mut pending = self.pending.lock().await;
        for (device_id, old) in batch {
            let entry = pending.entry(device_id).or_default();
            for (name, value) in old.properties {
                entry.properties.entry(name).or_insert(value);
            }
            for (name, meta) in old.metadata {
                entry.metadata.entry(name).or_insert(meta);
            }
        }
    }

    async fn buffer_change(
        &self,
        device_id: DeviceId,
        name: &str,
        property_type: &str,
        old_value: Option<&Value>,
        new_value: &Value,
        metadata: Option<&sprig_domain::PropertyMetadata>,
    ) {
        let value = canonicalize(new_value, property_type, old_value);
        let mut pending = self.pending.lock().await;
        let entry = pending.entry(device_id).or_default();
        entry.properties.insert(name.to_string(), value);
        if let Some(meta) = metadata {
            entry.metadata.insert(name.to_string(), meta.clone());
        }
    }

    async fn raw_property(
        &self,
        device_id: &DeviceId,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        {
            let pending = self.pending.lock().await;
            if let Some(batch) = pending.get(device_id) {
                if let Some(value) = batch.properties.get(name) {
                    return Ok(Some(value.clone()));
                }
            }
        }
        Ok(self
            .store
            .load(device_id)
            .await?
            .and_then(|props| props.get(name).cloned()))
    }
}

/// Never persist literal null: a null incoming value becomes the declared
/// type's zero value (falling back to the prior value's type, then to an
/// empty object), so typed reads never surface null for a known key.
fn canonicalize(new_value: &Value, property_type: &str, old_value: Option<&Value>) -> Value {
    if !new_value.is_null() {
        return new_value.clone();
    }
    let tag = if property_type == "null" {
        old_value
            .map(sprig_device::value_type_tag)
            .unwrap_or("object")
    } else {
        property_type
    };
    match tag {
        "number" => json!(0),
        "string" => json!(""),
        "bool" => json!(false),
        _ => json!({}),
    }
}

/// Direct change capture from attached components: forward to the bus.
/// Buffering happens in the bus subscription so property-changed events
/// from any publisher are persisted the same way.
#[async_trait]
impl PropertyChangeHandler for PersistenceService {
    async fn on_property_changed(&self, change: PropertyChange) {
        let event = Event::property_changed(
            change.device_id,
            change.property_name.clone(),
            change.property_type.clone(),
            change.old_value.clone(),
            change.new_value.clone(),
            Some(change.metadata.clone()),
        );
        if let Err(e) = self.bus.publish(event).await {
            warn!(
                device_id = %change.device_id,
                property = change.property_name,
                error = %e,
                "property change publish failed"
            );
        }
    }
}

/// The internal bus subscription: buffer every property-changed event.
#[async_trait]
impl EventHandler for PersistenceService {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        if let EventPayload::PropertyChanged {
            property_name,
            property_type,
            old_value,
            new_value,
            metadata,
        } = &event.payload
        {
            self.buffer_change(
                event.device_id,
                property_name,
                property_type,
                old_value.as_ref(),
                new_value,
                metadata.as_ref(),
            )
            .await;
        }
        Ok(())
    }
}

#[async_trait]
impl PropertyReader for PersistenceService {
    async fn read_property(
        &self,
        device_id: &DeviceId,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.raw_property(device_id, name).await
    }
}

/// Baseline reload for the reinitialize recovery strategy.
#[async_trait]
impl ComponentRefresher for PersistenceService {
    async fn reload(&self, device_id: &DeviceId) -> Result<(), ResilienceError> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| ResilienceError::Refresh(format!("unknown component {}", device_id)))?;
        let props = self
            .store
            .load(device_id)
            .await
            .map_err(|e| ResilienceError::Refresh(e.to_string()))?
            .unwrap_or_default();
        let meta = self
            .store
            .load_metadata(device_id)
            .await
            .map_err(|e| ResilienceError::Refresh(e.to_string()))?;
        device.properties().load_properties(props, meta);
        info!(device_id = %device_id, "baseline reloaded from store");
        Ok(())
    }
}
