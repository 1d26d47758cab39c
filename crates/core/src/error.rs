//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// illegal transitions, capacity, conflicts). Infrastructure concerns belong
/// elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: bad time window, missing reason, out-of-range hours.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation is not legal from the current status.
    ///
    /// `status` carries the current status so callers can re-render.
    #[error("invalid state '{status}': {message}")]
    InvalidState { status: String, message: String },

    /// Not enough available quantity or units.
    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: u32, available: i64 },

    /// A domain invariant was violated (e.g. id mismatch between command and stream).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(status: impl core::fmt::Display, msg: impl Into<String>) -> Self {
        Self::InvalidState {
            status: status.to_string(),
            message: msg.into(),
        }
    }

    pub fn insufficient(requested: u32, available: i64) -> Self {
        Self::InsufficientInventory {
            requested,
            available,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
