use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sprig_domain::DeviceId;

use crate::device::Device;

/// Shared lookup of live devices by id.
///
/// The recovery strategies and the launcher both resolve devices through
/// this; nothing else holds direct device references across components.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Arc<dyn Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: Arc<dyn Device>) {
        self.devices
            .write()
            .expect("registry lock poisoned")
            .insert(device.id(), device);
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<dyn Device>> {
        self.devices
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Arc<dyn Device>> {
        self.devices
            .write()
            .expect("registry lock poisoned")
            .remove(id)
    }

    pub fn all(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedPump;

    #[tokio::test]
    async fn register_and_get() {
        let registry = DeviceRegistry::new();
        let pump = Arc::new(SimulatedPump::new(DeviceId::new(), "pump-1"));
        let id = pump.id();
        registry.register(pump);

        assert!(registry.get(&id).is_some());
        assert!(registry.get(&DeviceId::new()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_unregisters() {
        let registry = DeviceRegistry::new();
        let pump = Arc::new(SimulatedPump::new(DeviceId::new(), "pump-1"));
        let id = pump.id();
        registry.register(pump);
        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id).is_none());
    }
}
