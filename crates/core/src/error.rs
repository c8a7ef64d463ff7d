use thiserror::Error;

use crate::status::Status;

pub type ChatflowResult<T> = Result<T, ChatflowError>;

#[derive(Error, Debug)]
pub enum ChatflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unresolved node, edge, media or template reference.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ChatflowError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Errors that abort a single flow traversal without failing the
    /// inbound-message handler. Everything else propagates.
    pub fn is_traversal_local(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidTransition { .. } | Self::NotFound { .. }
        )
    }
}
