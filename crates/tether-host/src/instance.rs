//! The plugin interface the host process serves.
//!
//! [`HostedPlugin`] is the typed mirror of the native plugin entry points:
//! one call per native function, with pointer arguments already turned into
//! [`Event`] payloads by the bridge. All methods take `&self` because the
//! channels are served from separate threads, the same way a native plugin
//! is called from the host's GUI and audio threads at once.

use crate::server::HostCallbackProxy;
use std::path::Path;
use std::sync::Arc;
use tether_bridge::{Event, EventResult, PluginDescriptor, Result};

pub trait HostedPlugin: Send + Sync {
    /// Current counts, flags and ids. Sent once after connecting and again
    /// whenever the bridge asks for a descriptor update.
    fn descriptor(&self) -> PluginDescriptor;

    fn dispatch(&self, event: Event) -> EventResult;

    fn get_parameter(&self, index: i32) -> f32;

    fn set_parameter(&self, index: i32, value: f32);

    /// `outputs` holds one zeroed buffer of `sample_frames` samples per
    /// output channel in the descriptor.
    fn process_f32(&self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], sample_frames: usize);

    fn process_f64(&self, inputs: &[Vec<f64>], outputs: &mut [Vec<f64>], sample_frames: usize);
}

/// Turns a plugin path into a running plugin.
///
/// The loader gets the plugin's [`HostCallbackProxy`] so the plugin can call
/// back into the native host from any thread.
pub trait PluginLoader: Send + Sync {
    fn load(&self, plugin_path: &Path, host: HostCallbackProxy) -> Result<Arc<dyn HostedPlugin>>;
}

impl<F> PluginLoader for F
where
    F: Fn(&Path, HostCallbackProxy) -> Result<Arc<dyn HostedPlugin>> + Send + Sync,
{
    fn load(&self, plugin_path: &Path, host: HostCallbackProxy) -> Result<Arc<dyn HostedPlugin>> {
        self(plugin_path, host)
    }
}
