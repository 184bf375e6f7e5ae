//! Host process for tether
//!
//! This crate is the remote half of the bridge. It runs in its own process,
//! connects to the bridge's five channels and serves them against a
//! [`HostedPlugin`]. In group mode one process serves every plugin of a
//! group, and whichever process binds the group socket first is the host.
//!
//! This crate is used by the `tether-host` binary. Plugin-format shims use
//! `tether-bridge` instead.

pub mod group;
pub mod instance;
pub mod passthrough;
pub mod server;

pub use group::{GroupHost, GroupHostConfig};
pub use instance::{HostedPlugin, PluginLoader};
pub use passthrough::PassthroughPlugin;
pub use server::{HostCallbackProxy, PluginServer};
