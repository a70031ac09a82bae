use async_trait::async_trait;
use serde_json::json;
use sprig_domain::{DeviceId, LifecycleState};
use tracing::debug;

use crate::device::{Device, DeviceCore};
use crate::error::DeviceError;
use crate::properties::PropertyBag;

/// A pump simulation: no I/O, just the property surface a real pump driver
/// would expose. Stands in for device firmware in tests and local runs.
pub struct SimulatedPump {
    core: DeviceCore,
    /// Flow rate the pump ramps to on start.
    default_flow_rate: f64,
}

impl SimulatedPump {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            core: DeviceCore::new(id, name, "pump"),
            default_flow_rate: 60.0,
        }
    }

    pub fn with_default_flow_rate(mut self, rate: f64) -> Self {
        self.default_flow_rate = rate;
        self
    }

    /// Adjust the current flow rate, as a real pump would on a control
    /// signal.
    pub async fn set_flow_rate(&self, rate: f64) {
        self.core
            .bag()
            .set_property("FlowRate", json!(rate), None)
            .await;
    }
}

#[async_trait]
impl Device for SimulatedPump {
    fn id(&self) -> DeviceId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn assembly_type(&self) -> &str {
        self.core.assembly_type()
    }

    fn properties(&self) -> &PropertyBag {
        self.core.bag()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        debug!(device_id = %self.id(), "SimulatedPump: initialize");
        self.core.initialize_base().await?;
        self.core
            .bag()
            .set_property("FlowRate", json!(0.0), None)
            .await;
        self.core
            .bag()
            .set_property("TargetFlowRate", json!(self.default_flow_rate), None)
            .await;
        Ok(())
    }

    async fn start(&self) -> Result<(), DeviceError> {
        debug!(device_id = %self.id(), "SimulatedPump: start");
        self.core.start_base().await?;
        let target = self
            .core
            .bag()
            .get_property::<f64>("TargetFlowRate")
            .unwrap_or(self.default_flow_rate);
        self.set_flow_rate(target).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        debug!(device_id = %self.id(), "SimulatedPump: stop");
        self.set_flow_rate(0.0).await;
        self.core.stop_base().await
    }
}

/// A sensor simulation exposing a single `Reading` property.
pub struct SimulatedSensor {
    core: DeviceCore,
    unit: String,
}

impl SimulatedSensor {
    pub fn new(id: DeviceId, name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            core: DeviceCore::new(id, name, "sensor"),
            unit: unit.into(),
        }
    }

    /// Record a new reading, as the sampling loop of a real sensor would.
    pub async fn record_reading(&self, value: f64) {
        self.core
            .bag()
            .set_property("Reading", json!(value), None)
            .await;
    }
}

#[async_trait]
impl Device for SimulatedSensor {
    fn id(&self) -> DeviceId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn assembly_type(&self) -> &str {
        self.core.assembly_type()
    }

    fn properties(&self) -> &PropertyBag {
        self.core.bag()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        debug!(device_id = %self.id(), "SimulatedSensor: initialize");
        self.core.initialize_base().await?;
        self.core
            .bag()
            .set_property("Unit", json!(self.unit), None)
            .await;
        Ok(())
    }

    async fn start(&self) -> Result<(), DeviceError> {
        self.core.start_base().await
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.core.stop_base().await
    }
}

/// A controller simulation holding a setpoint it would steer actuators
/// toward.
pub struct SimulatedController {
    core: DeviceCore,
}

impl SimulatedController {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            core: DeviceCore::new(id, name, "controller"),
        }
    }

    pub async fn set_setpoint(&self, value: f64) {
        self.core
            .bag()
            .set_property("Setpoint", json!(value), None)
            .await;
    }
}

#[async_trait]
impl Device for SimulatedController {
    fn id(&self) -> DeviceId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn assembly_type(&self) -> &str {
        self.core.assembly_type()
    }

    fn properties(&self) -> &PropertyBag {
        self.core.bag()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        debug!(device_id = %self.id(), "SimulatedController: initialize");
        self.core.initialize_base().await?;
        self.core
            .bag()
            .set_property("Setpoint", json!(0.0), None)
            .await;
        Ok(())
    }

    async fn start(&self) -> Result<(), DeviceError> {
        self.core.start_base().await
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.core.stop_base().await
    }
}
