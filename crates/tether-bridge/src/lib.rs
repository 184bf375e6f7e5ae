//! Cross-process plugin bridging for tether
//!
//! This crate is the half of the bridge that lives inside the host
//! application. It starts (or attaches to) a host process that loads the real
//! plugin, connects to it over five Unix socket channels and turns every
//! native plugin call into a typed message and back. The remote half is in
//! `tether-host`.
//!
//! ## Channels
//!
//! - **dispatch**: general plugin calls
//! - **MIDI dispatch**: event delivery, kept apart so it never waits behind a
//!   modal dialog on the dispatch channel
//! - **host callback**: plugin-to-host calls, served by a background thread
//! - **parameters**: parameter reads and writes
//! - **audio**: one round trip per processing callback
//!
//! ## Usage
//!
//! ```ignore
//! use tether_bridge::{BridgeConfig, HostEnvironment, InstanceRegistry, PluginPaths};
//!
//! let registry = InstanceRegistry::new();
//! let handle = registry.load(
//!     BridgeConfig::default(),
//!     paths,
//!     HostEnvironment::detect(&paths.plugin_path),
//!     host_callback,
//! );
//! ```

pub mod error;
pub use error::{BridgeError, Result, StartupStage};

pub mod codec;
pub mod native;
pub mod opcodes;
pub mod protocol;

pub use protocol::{
    AudioBuffers, AudioSamples, ChannelKind, DynamicEvents, DynamicSpeakerArrangement, Event,
    EventPayload, EventResult, EventResultPayload, GroupRequest, GroupResponse, NativeEvent,
    Parameter, ParameterResult, PluginDescriptor,
};

pub mod transport;
pub use transport::{Channel, ChannelSet};

pub mod callback;
pub use callback::HostCallback;

pub mod marshal;

mod config;
pub use config::{BridgeConfig, HostEnvironment, PluginArchitecture, PluginPaths};

pub mod endpoint;
pub mod logging;
pub mod notify;

mod audio;
pub use audio::PendingEvents;

mod process;
pub use process::HostProcess;

mod group;
pub use group::{request_attach, GroupAttachment};

mod instance;
pub use instance::{BridgeInstance, LifecycleState};

mod registry;
pub use registry::{InstanceHandle, InstanceRegistry};
