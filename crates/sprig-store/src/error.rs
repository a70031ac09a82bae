use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transaction already completed")]
    TransactionCompleted,

    #[error("internal store error: {0}")]
    Internal(String),
}
