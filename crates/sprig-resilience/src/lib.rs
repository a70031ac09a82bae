pub mod breaker;
pub mod context;
pub mod error;
pub mod monitor;
pub mod recovery;
pub mod registry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState, HealthProbe, StateChange};
pub use context::FaultContextBuilder;
pub use error::ResilienceError;
pub use monitor::{ErrorMonitor, MonitorConfig};
pub use recovery::{
    AlertSink, CommunicationBackoffStrategy, ComponentRefresher, DeviceRestartStrategy,
    RecoveryOrchestrator, RecoveryStrategy, ReinitializeStrategy,
};
pub use registry::BreakerRegistry;
