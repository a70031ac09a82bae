use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store error: {0}")]
    Store(#[from] sprig_store::StoreError),

    #[error(transparent)]
    CircuitOpen(#[from] sprig_resilience::CircuitOpen),

    #[error(transparent)]
    Device(#[from] sprig_device::DeviceError),

    #[error("unknown component: {0}")]
    UnknownComponent(sprig_domain::DeviceId),
}
