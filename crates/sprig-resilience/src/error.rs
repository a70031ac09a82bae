use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    Device(#[from] sprig_device::DeviceError),

    #[error("baseline reload failed: {0}")]
    Refresh(String),

    #[error("internal resilience error: {0}")]
    Internal(String),
}
