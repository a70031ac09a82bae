use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("store error: {0}")]
    Store(#[from] sprig_store::StoreError),

    #[error("event bus is shut down")]
    ShutDown,

    #[error("internal bus error: {0}")]
    Internal(String),
}
