//! # vessel-volume
//!
//! Container-attached storage for the vessel daemon: the volume driver
//! extension point, the built-in local driver, the remote-plugin driver
//! adapter, and the repository that owns every live volume.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Repository                       │
//! │   canonical path → Volume (refs, metadata on disk)   │
//! └──────────────┬───────────────────────────────────────┘
//!                │ create / remove / mount / unmount
//! ┌──────────────▼───────────────┐
//! │        DriverRegistry        │
//! │  "local" → LocalDriver       │
//! │  "<plugin>" → PluginDriver ──┼──▶ VolumeDriver.* RPC
//! └──────────────────────────────┘
//! ```
//!
//! Drivers are selected by name; a lookup that misses consults the plugin
//! store for a plugin advertising the `VolumeDriver` capability and adapts
//! it on the fly.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod driver;
pub mod error;
pub mod local;
pub mod paths;
pub mod proxy;
pub mod repository;

pub use driver::{DriverRegistry, VolumeDriver, LOCAL_DRIVER_NAME, VOLUME_DRIVER_CAPABILITY};
pub use error::{Result, VolumeError};
pub use local::LocalDriver;
pub use proxy::PluginDriver;
pub use repository::{Repository, Volume, VolumeSource};
