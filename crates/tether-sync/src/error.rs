//! # Sync Error Types
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Remote         │  │  Local                  │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network    (R) │  │  DatabaseError          │ │
//! │  │  ConfigLoad...  │  │  Timeout    (R) │  │  SerializationFailed    │ │
//! │  │  ConfigSave...  │  │  Offline    (R) │  │  Validation             │ │
//! │  │                 │  │  Rejected   (T) │  │  InvalidOperation       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  (R) retryable: the operation stays queued with backoff                │
//! │  (T) terminal:  the operation fails, optimistic writes are reverted    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Every failure the cache and sync engine can report.
///
/// Payloads are strings so the error can be cloned into events and
/// result envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Transport failure talking to the backend.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote call did not finish within the configured timeout.
    #[error("Remote call timed out after {0} ms")]
    Timeout(u64),

    /// The device is known to be offline; the call was not made.
    #[error("Device is offline")]
    Offline,

    /// The backend refused the request (validation, conflict, not found).
    #[error("Rejected by server ({code}): {message}")]
    Rejected { code: String, message: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Queue state did not allow the requested move, or a row was corrupt.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Sync service is not initialized")]
    NotInitialized,

    #[error("Sync service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        SyncError::Network(message.into())
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tether_db::DbError> for SyncError {
    fn from(err: tether_db::DbError) -> Self {
        match err {
            tether_db::DbError::CorruptRow { .. } => SyncError::InvalidOperation(err.to_string()),
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<tether_core::CoreError> for SyncError {
    fn from(err: tether_core::CoreError) -> Self {
        match err {
            tether_core::CoreError::Validation(v) => SyncError::Validation(v.to_string()),
            other => SyncError::InvalidOperation(other.to_string()),
        }
    }
}

impl From<tether_core::ValidationError> for SyncError {
    fn from(err: tether_core::ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation should stay queued and be retried.
    ///
    /// ## Retryable Errors
    /// - Network failures
    /// - Timeouts
    /// - Known offline
    ///
    /// Everything else, including server rejections and local corruption,
    /// is terminal for the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Offline
        )
    }

    /// Returns true if the server refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::Rejected { .. })
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::network("connection reset").is_retryable());
        assert!(SyncError::Timeout(15_000).is_retryable());
        assert!(SyncError::Offline.is_retryable());

        assert!(!SyncError::rejected("conflict", "duplicate key").is_retryable());
        assert!(!SyncError::InvalidOperation("bad row".into()).is_retryable());
        assert!(!SyncError::DatabaseError("disk full".into()).is_retryable());
    }

    #[test]
    fn test_rejection_display() {
        let err = SyncError::rejected("not_found", "challenge c1");
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "Rejected by server (not_found): challenge c1");
    }

    #[test]
    fn test_core_validation_maps_to_validation() {
        let err: SyncError = tether_core::CoreError::Validation(tether_core::ValidationError::EmptyId).into();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
