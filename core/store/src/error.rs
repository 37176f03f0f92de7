use agent_memory_schemas::{RecordKind, ValidationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// Malformed input. Raised before anything is written.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} not found: {key}")]
    NotFound { kind: RecordKind, key: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The backing file opened but is not a usable memory store.
    #[error("Corrupt or incompatible store: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    pub fn not_found(kind: RecordKind, key: impl Into<String>) -> Self {
        MemoryError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        MemoryError::Validation(ValidationError::Invalid(message.into()))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, MemoryError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound { .. })
    }

    /// Errors after which the store handle should be discarded.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            MemoryError::Storage(_)
                | MemoryError::Corrupt(_)
                | MemoryError::LockPoisoned
                | MemoryError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
