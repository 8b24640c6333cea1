//! Error types for the sync engine

use crate::resource::ResourceType;
use thiserror::Error;

/// Failures reported by the API client boundary.
///
/// This is a closed taxonomy: every transport or decoding problem is mapped
/// onto one of these four variants before it reaches a controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    /// Map a non-success HTTP status onto the taxonomy
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => ApiError::Unauthorized,
            _ => ApiError::ServerError {
                status,
                message: message.into(),
            },
        }
    }

    /// Whether the rest of a push batch is pointless after this error
    pub fn aborts_batch(&self) -> bool {
        matches!(self, ApiError::NetworkUnavailable(_) | ApiError::Unauthorized)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Dependency unmet: {resource} requires {dependency}")]
    DependencyUnmet {
        resource: ResourceType,
        dependency: ResourceType,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A sync cycle is already in flight")]
    Busy,
}

impl SyncError {
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Database(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Api(ApiError::NetworkUnavailable(_)))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::from_status(401, "nope"), ApiError::Unauthorized);
        assert_eq!(ApiError::from_status(403, "nope"), ApiError::Unauthorized);
        assert_eq!(
            ApiError::from_status(503, "down"),
            ApiError::ServerError {
                status: 503,
                message: "down".to_string()
            }
        );
    }

    #[test]
    fn test_error_classification() {
        let err = SyncError::from(ApiError::NetworkUnavailable("offline".into()));
        assert!(err.is_network());
        assert!(!err.is_storage());
        assert!(SyncError::Storage("disk full".into()).is_storage());
        assert!(ApiError::Unauthorized.aborts_batch());
        assert!(!ApiError::MalformedResponse("x".into()).aborts_batch());
    }
}
