use sprig_domain::LifecycleState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid lifecycle transition for '{device}': {from} -> {to}")]
    InvalidTransition {
        device: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("device '{device}' cannot start from state {state}; it must be ready")]
    NotReady {
        device: String,
        state: LifecycleState,
    },

    #[error("device '{device}' cannot stop from state {state}; it must be running")]
    NotRunning {
        device: String,
        state: LifecycleState,
    },

    #[error("device '{device}' is disposed")]
    Disposed { device: String },

    #[error(transparent)]
    Domain(#[from] sprig_domain::DomainError),
}
