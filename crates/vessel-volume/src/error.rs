//! Error types for volume operations.

use thiserror::Error;
use vessel_error::CommonError;
use vessel_plugins::PluginError;

/// Result type alias for volume operations.
pub type Result<T> = std::result::Result<T, VolumeError>;

/// Errors that can occur during volume operations.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Common errors shared across vessel crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Volume still referenced by containers.
    #[error("volume {path} is in use by containers: {containers:?}")]
    InUse {
        /// Canonical volume path.
        path: String,
        /// Ids of the referencing containers.
        containers: Vec<String>,
    },

    /// Plugin transport failure while reaching a remote driver.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Remote driver answered with a non-empty `Err` field.
    #[error("volume driver {driver}: {message}")]
    Driver {
        /// Driver name.
        driver: String,
        /// Error text the driver returned.
        message: String,
    },
}

impl From<std::io::Error> for VolumeError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}

impl VolumeError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::not_found(resource))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Common(CommonError::NotFound(_))
                | Self::Plugin(PluginError::Common(CommonError::NotFound(_)))
        )
    }

    /// Returns true if the volume is still referenced.
    #[must_use]
    pub const fn is_in_use(&self) -> bool {
        matches!(self, Self::InUse { .. })
    }
}
