//! # tether - cross-process audio plugin bridge
//!
//! Runs a plugin in a separate host process and makes it look local to the
//! application that loaded it.
//!
//! ## Architecture
//!
//! tether is an umbrella crate over:
//! - **tether-bridge** - the half inside the host application: wire codec,
//!   channels, event marshaling, bridge instances and group attach
//! - **tether-host** - the remote half: serves the channels against a
//!   hosted plugin and runs shared group hosts
//!
//! ## Quick Start
//!
//! ```ignore
//! use tether::prelude::*;
//!
//! let registry = InstanceRegistry::new();
//! let handle = registry.load(config, paths, environment, host_callback);
//! ```
//!
//! ## Feature Flags
//!
//! - `bridge` (default) - the plugin-side half
//! - `host` - the host-process half
//! - `full` - both

#[cfg(feature = "bridge")]
pub use tether_bridge as bridge;

#[cfg(feature = "host")]
pub use tether_host as host;

#[cfg(feature = "bridge")]
pub use tether_bridge::{
    BridgeConfig, BridgeError, BridgeInstance, HostCallback, HostEnvironment, InstanceHandle,
    InstanceRegistry, LifecycleState, PluginArchitecture, PluginDescriptor, PluginPaths, Result,
};

#[cfg(feature = "host")]
pub use tether_host::{GroupHost, GroupHostConfig, HostedPlugin, PluginServer};

pub mod prelude {
    #[cfg(feature = "bridge")]
    pub use crate::{
        BridgeConfig, BridgeError, HostCallback, HostEnvironment, InstanceHandle,
        InstanceRegistry, PluginArchitecture, PluginPaths, Result,
    };

    #[cfg(feature = "host")]
    pub use crate::{HostedPlugin, PluginServer};
}
