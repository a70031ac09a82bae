pub mod connection;
pub mod error;
pub mod event;
pub mod fault;
pub mod ids;
pub mod lifecycle;
pub mod property;

pub use connection::{Connection, ConnectionType};
pub use error::DomainError;
pub use event::{Event, EventKind, EventPayload, Priority, Routing, Severity};
pub use fault::{DeviceFault, FaultSource, MAX_RECOVERY_BACKOFF};
pub use ids::{ConnectionId, CorrelationId, DeviceId, SubscriptionId};
pub use lifecycle::LifecycleState;
pub use property::{MetadataMap, PropertyMap, PropertyMetadata};
