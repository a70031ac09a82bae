use sprig_domain::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("connection already exists: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("invalid condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] sprig_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
