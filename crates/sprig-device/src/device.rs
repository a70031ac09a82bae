use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use sprig_domain::{DeviceId, LifecycleState, PropertyMetadata};
use tracing::debug;

use crate::error::DeviceError;
use crate::properties::PropertyBag;

/// The external device contract.
///
/// `initialize` progresses `Created → Initializing → Ready` and records the
/// standard properties (`Id`, `Name`, `AssemblyType`, `State`); `start`
/// requires `Ready`; `stop` requires `Running`. All external control flows
/// through the event bus and the persistence service, never through direct
/// device references.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    fn id(&self) -> DeviceId;

    fn name(&self) -> &str;

    /// String tag describing the concrete device type.
    fn assembly_type(&self) -> &str;

    fn properties(&self) -> &PropertyBag;

    fn state(&self) -> LifecycleState;

    async fn initialize(&self) -> Result<(), DeviceError>;

    async fn start(&self) -> Result<(), DeviceError>;

    async fn stop(&self) -> Result<(), DeviceError>;
}

/// Shared identity, lifecycle and property plumbing embedded by concrete
/// devices.
///
/// The lifecycle state lives in the property bag under `State`, so a
/// component rehydrated from the store resumes in its persisted state and
/// every transition is observable as an ordinary property change.
pub struct DeviceCore {
    id: DeviceId,
    name: String,
    assembly_type: String,
    bag: PropertyBag,
}

impl DeviceCore {
    pub fn new(id: DeviceId, name: impl Into<String>, assembly_type: impl Into<String>) -> Self {
        let overrides: HashMap<String, PropertyMetadata> = [
            ("Id".to_string(), PropertyMetadata::derived_read_only("Id")),
            (
                "AssemblyType".to_string(),
                PropertyMetadata::derived_read_only("AssemblyType"),
            ),
            (
                "State".to_string(),
                PropertyMetadata::derived_read_only("State"),
            ),
        ]
        .into();
        Self {
            id,
            name: name.into(),
            assembly_type: assembly_type.into(),
            bag: PropertyBag::with_overrides(id, overrides),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn assembly_type(&self) -> &str {
        &self.assembly_type
    }

    pub fn bag(&self) -> &PropertyBag {
        &self.bag
    }

    /// Current lifecycle state, read from the `State` property. A component
    /// with no recorded state is `Created`.
    pub fn state(&self) -> LifecycleState {
        self.bag
            .get_property::<LifecycleState>("State")
            .unwrap_or_default()
    }

    /// Validated lifecycle transition, recorded through the bag.
    pub async fn transition(&self, to: LifecycleState) -> Result<(), DeviceError> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(DeviceError::InvalidTransition {
                device: self.name.clone(),
                from,
                to,
            });
        }
        debug!(device_id = %self.id, %from, %to, "lifecycle transition");
        let state = serde_json::to_value(to).map_err(sprig_domain::DomainError::Serialization)?;
        self.bag.set_property("State", state, None).await;
        Ok(())
    }

    /// The standard initialize sequence: enter `Initializing`, record the
    /// standard properties, land in `Ready`.
    pub async fn initialize_base(&self) -> Result<(), DeviceError> {
        self.transition(LifecycleState::Initializing).await?;
        self.bag
            .set_property("Id", json!(self.id.to_string()), None)
            .await;
        self.bag.set_property("Name", json!(self.name), None).await;
        self.bag
            .set_property("AssemblyType", json!(self.assembly_type), None)
            .await;
        self.transition(LifecycleState::Ready).await
    }

    /// Guard + transition for `start`.
    pub async fn start_base(&self) -> Result<(), DeviceError> {
        let state = self.state();
        if state != LifecycleState::Ready {
            return Err(DeviceError::NotReady {
                device: self.name.clone(),
                state,
            });
        }
        self.transition(LifecycleState::Running).await
    }

    /// Guard + transitions for `stop`: `Running → Stopping → Ready`.
    pub async fn stop_base(&self) -> Result<(), DeviceError> {
        let state = self.state();
        if state != LifecycleState::Running {
            return Err(DeviceError::NotRunning {
                device: self.name.clone(),
                state,
            });
        }
        self.transition(LifecycleState::Stopping).await?;
        self.transition(LifecycleState::Ready).await
    }
}
