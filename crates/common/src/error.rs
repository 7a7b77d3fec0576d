//! Error types for Creevey

use thiserror::Error;

/// Result type alias using Creevey Error
pub type Result<T> = std::result::Result<T, Error>;

/// Creevey error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Test not found: {0}")]
    NotFound(String),

    #[error("Stale approval for test {id}: retry {requested} is not the latest ({latest})")]
    StaleApproval { id: String, requested: u32, latest: u32 },

    #[error("Approval rejected for test {id}: {reason}")]
    ApprovalRejected { id: String, reason: String },

    #[error("Update sequence gap: expected {expected}, got {received}")]
    SyncGap { expected: u64, received: u64 },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
