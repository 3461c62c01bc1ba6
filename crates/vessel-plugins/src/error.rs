//! Error types for plugin operations.

use thiserror::Error;
use vessel_error::CommonError;

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors that can occur while discovering or talking to plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Common errors shared across vessel crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Address scheme is not `unix` or `tcp`.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// HTTP-level failure while talking to the plugin.
    #[error("plugin transport error: {0}")]
    Http(String),

    /// Plugin answered with a failure status.
    #[error("plugin returned status {status}: {body}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// Capability missing from the plugin manifest.
    #[error("plugin {plugin} does not implement {capability}")]
    NotImplemented {
        /// Plugin name.
        plugin: String,
        /// Requested capability.
        capability: String,
    },

    /// Request or response payload could not be encoded or decoded.
    #[error("plugin payload error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}

impl PluginError {
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
