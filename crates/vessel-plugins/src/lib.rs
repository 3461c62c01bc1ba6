//! # vessel-plugins
//!
//! Out-of-process extension plugins for the vessel daemon.
//!
//! Plugins are local processes reached over HTTP/1.1 on a Unix or TCP
//! endpoint. They are discovered from a directory of socket and spec files,
//! activated with a `Plugin.Activate` handshake that returns a capability
//! manifest, and then dispatched to capability handlers registered by the
//! subsystems that consume them (e.g. the volume driver extension point).
//!
//! ```text
//! ┌──────────────┐   scan    ┌───────────────┐  Plugin.Activate  ┌────────┐
//! │ LocalRegistry │ ───────▶ │  PluginStore  │ ────────────────▶ │ plugin │
//! │ (directory)   │          │ (active map + │ ◀──────────────── │ process│
//! └──────────────┘           │  handlers)    │     manifest      └────────┘
//!                            └───────────────┘
//! ```
//!
//! Activation is lazy: nothing talks to a plugin until a subsystem asks for
//! it by name, and the result is cached for the daemon's lifetime.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod discovery;
pub mod error;
pub mod store;

pub use client::{PluginAddr, PluginClient};
pub use discovery::{LocalRegistry, PluginDescriptor, DEFAULT_PLUGIN_DIR};
pub use error::{PluginError, Result};
pub use store::{Manifest, Plugin, PluginStore};
