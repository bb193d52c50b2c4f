//! Error types for the Keygate service.
//!
//! User-facing denials (rate limited, usage exceeded, disabled...) are not
//! errors; they are carried by [`crate::edge::VerificationCode`]. The variants
//! here are internal failures the caller may retry or must surface as a
//! server error.

use thiserror::Error;

/// Main error type for Keygate operations.
#[derive(Error, Debug)]
pub enum KeygateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The authoritative store could not be reached after retries
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store call exceeded its deadline
    #[error("Store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::mesh::ClusterError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeygateError {
    /// Whether the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeygateError::StoreUnavailable(_) | KeygateError::Timeout(_))
    }
}

impl From<crate::store::StoreError> for KeygateError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::Unavailable(msg) => KeygateError::StoreUnavailable(msg),
            crate::store::StoreError::Corrupt(msg) => {
                KeygateError::StoreUnavailable(format!("corrupt record: {}", msg))
            }
        }
    }
}

impl From<KeygateError> for tonic::Status {
    fn from(err: KeygateError) -> Self {
        match err {
            KeygateError::NotFound(msg) => tonic::Status::not_found(msg),
            KeygateError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            KeygateError::StoreUnavailable(msg) => tonic::Status::unavailable(msg),
            KeygateError::Timeout(d) => {
                tonic::Status::deadline_exceeded(format!("store timed out after {:?}", d))
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Result type alias for Keygate operations.
pub type Result<T> = std::result::Result<T, KeygateError>;
