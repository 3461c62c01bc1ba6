//! # vessel-error
//!
//! Common error types shared across vessel crates.
//!
//! Each crate defines its own error enum and wraps [`CommonError`] for the
//! scenarios every subsystem runs into (I/O, missing resources, invalid
//! state):
//!
//! ```rust,ignore
//! use thiserror::Error;
//! use vessel_error::CommonError;
//!
//! #[derive(Debug, Error)]
//! pub enum VolumeError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("volume {0} is in use")]
//!     InUse(String),
//! }
//! ```

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
