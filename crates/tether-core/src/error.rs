//! # Error Types
//!
//! Domain error types for tether-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tether-core (this file)                                               │
//! │  ├── CoreError        - State machine and parsing failures             │
//! │  └── ValidationError  - Payload/id validation failures                 │
//! │                                                                         │
//! │  tether-db                                                             │
//! │  └── DbError          - SQLite failures                                │
//! │                                                                         │
//! │  tether-sync                                                           │
//! │  └── SyncError        - Everything the engine reports                  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::{OperationKind, OperationState};

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by the pure domain rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A queue operation was asked to move between states that are not linked.
    ///
    /// ## When This Occurs
    /// - Completing an operation that was never claimed
    /// - Claiming an operation that already completed
    /// - A persisted row was edited out from under the queue
    #[error("Invalid state transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OperationState,
        to: OperationState,
    },

    /// A persisted enum column held a value we do not know.
    #[error("Unknown {kind}: '{value}'")]
    UnknownValue { kind: &'static str, value: String },

    /// Input validation failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation failures for queued payloads and ids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// An entity id was empty or whitespace.
    #[error("Id must not be empty")]
    EmptyId,

    /// Insert and update payloads must be JSON objects.
    #[error("{kind} payload must be a JSON object")]
    NotAnObject { kind: OperationKind },

    /// Update and delete payloads must carry the row id.
    #[error("{kind} payload is missing a non-empty 'id'")]
    MissingId { kind: OperationKind },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
