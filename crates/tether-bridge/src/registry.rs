//! Instance registry for plugin-format shims
//!
//! Native entry points only receive an opaque plugin handle. The shim keeps
//! one [`InstanceRegistry`] and resolves that handle to the owning
//! [`BridgeInstance`] on every call.
//!
//! # Example
//! ```ignore
//! let registry = InstanceRegistry::new();
//! let handle = registry.load(config, paths, environment, host_callback)?;
//!
//! // From the native dispatcher:
//! let result = unsafe { registry.dispatch(handle, opcode, index, value, data, option) };
//! ```

use crate::callback::HostCallback;
use crate::config::{BridgeConfig, HostEnvironment, PluginPaths};
use crate::instance::{BridgeInstance, LifecycleState};
use crate::notify;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Opaque handle the shim stores in its native plugin struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(usize);

impl InstanceHandle {
    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceHandle, Arc<BridgeInstance>>>,
    next_handle: AtomicUsize,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a bridged plugin. On failure the reason is logged and shown as a
    /// desktop notification, and `None` is returned, which the shim reports
    /// to the host as a plugin that failed to load.
    pub fn load(
        &self,
        config: BridgeConfig,
        paths: PluginPaths,
        environment: HostEnvironment,
        host_callback: Arc<dyn HostCallback>,
    ) -> Option<InstanceHandle> {
        let plugin_path = paths.plugin_path.clone();
        match BridgeInstance::new(config, paths, environment, host_callback) {
            Ok(instance) => Some(self.insert(instance)),
            Err(e) => {
                tracing::error!(
                    "Error during initialization of '{}': {}",
                    plugin_path.display(),
                    e
                );
                notify::send_notification(
                    "Failed to initialize plugin",
                    &format!("{}\n{}", plugin_path.display(), e),
                );
                None
            }
        }
    }

    pub fn insert(&self, instance: BridgeInstance) -> InstanceHandle {
        // Zero stays free so a null handle never resolves
        let handle = InstanceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.instances.write().insert(handle, Arc::new(instance));
        handle
    }

    pub fn get(&self, handle: InstanceHandle) -> Option<Arc<BridgeInstance>> {
        self.instances.read().get(&handle).cloned()
    }

    pub fn remove(&self, handle: InstanceHandle) -> Option<Arc<BridgeInstance>> {
        self.instances.write().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Route a native dispatch call. The entry is dropped once the call
    /// closed the instance, so the shim never sees a closed instance again.
    ///
    /// # Safety
    /// See [`BridgeInstance::dispatch`].
    pub unsafe fn dispatch(
        &self,
        handle: InstanceHandle,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> isize {
        let Some(instance) = self.get(handle) else {
            tracing::warn!(?handle, opcode, "dispatch for an unknown plugin handle");
            return 0;
        };

        let result = instance.dispatch(opcode, index, value, data, option);
        if instance.state() == LifecycleState::Closed {
            self.remove(handle);
        }
        result
    }

    pub fn get_parameter(&self, handle: InstanceHandle, index: i32) -> f32 {
        self.get(handle)
            .map_or(0.0, |instance| instance.get_parameter(index))
    }

    pub fn set_parameter(&self, handle: InstanceHandle, index: i32, value: f32) {
        if let Some(instance) = self.get(handle) {
            instance.set_parameter(index, value);
        }
    }

    pub fn process_f32(
        &self,
        handle: InstanceHandle,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        sample_frames: usize,
    ) {
        if let Some(instance) = self.get(handle) {
            instance.process_f32(inputs, outputs, sample_frames);
        }
    }

    pub fn process_f64(
        &self,
        handle: InstanceHandle,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
        sample_frames: usize,
    ) {
        if let Some(instance) = self.get(handle) {
            instance.process_f64(inputs, outputs, sample_frames);
        }
    }
}
