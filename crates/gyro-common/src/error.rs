//! Error types for gyro

use thiserror::Error;

/// Result type alias for gyro operations
pub type Result<T> = std::result::Result<T, GyroError>;

/// MongoDB server code for a duplicate key on a unique index
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Unified error type for all gyro operations
///
/// `Clone` so that the outcome of a single connection attempt can be handed to
/// every caller waiting on it as well as to `error` listeners.
#[derive(Error, Debug, Clone)]
pub enum GyroError {
    #[error("MongoDB error: {0}")]
    MongoDB(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Unique index violation (server code 11000)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GyroError {
    /// Returns true for failures of the connection itself rather than of an operation
    pub fn is_connection_error(&self) -> bool {
        matches!(self, GyroError::Connection(_))
    }

    /// Returns true if this is a constraint violation error
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, GyroError::Conflict(_))
    }
}

impl From<serde_json::Error> for GyroError {
    fn from(err: serde_json::Error) -> Self {
        GyroError::Serialization(err.to_string())
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for GyroError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(write_error))
                if write_error.code == DUPLICATE_KEY_CODE =>
            {
                GyroError::Conflict(err.to_string())
            }
            ErrorKind::Command(command_error) if command_error.code == DUPLICATE_KEY_CODE => {
                GyroError::Conflict(err.to_string())
            }
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. } => GyroError::Connection(err.to_string()),
            _ => GyroError::MongoDB(err.to_string()),
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for GyroError {
    fn from(err: bson::ser::Error) -> Self {
        GyroError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for GyroError {
    fn from(err: bson::de::Error) -> Self {
        GyroError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}
