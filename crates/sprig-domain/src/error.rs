use thiserror::Error;

use crate::lifecycle::LifecycleState;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("property '{property}' is not a {expected}")]
    PropertyTypeMismatch {
        property: String,
        expected: &'static str,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
