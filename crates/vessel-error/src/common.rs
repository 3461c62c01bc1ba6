//! Common error types shared across vessel crates.

use thiserror::Error;

/// Errors that occur across multiple vessel crates.
///
/// Crate-specific error enums wrap this type with a transparent `#[from]`
/// variant so callers can match on the common cases without knowing which
/// subsystem produced them.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    ///
    /// Used when a requested volume, plugin, driver, or container does not
    /// exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation attempted on a resource in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation exceeded its allowed time limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected internal error; includes context for debugging.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a new already exists error.
    #[must_use]
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is an I/O error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is an already exists error.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
