//! Error types for container volume operations.

use std::path::PathBuf;
use thiserror::Error;
use vessel_error::CommonError;
use vessel_volume::VolumeError;

/// Result type alias for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors that can occur while resolving and managing container mounts.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Common errors shared across vessel crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Malformed bind or volumes-from specification.
    #[error("invalid volume specification: {0}")]
    InvalidSpec(String),

    /// Same destination named twice in one binds list.
    #[error("duplicate bind mount {0}")]
    DuplicateBind(String),

    /// Container-side path exists and is a regular file.
    #[error("cannot mount volume over existing file: {0}")]
    FileExists(PathBuf),

    /// Volume subsystem failure.
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}

impl ContainerError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::not_found(resource))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Common(CommonError::NotFound(_)))
    }
}
