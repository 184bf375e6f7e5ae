//! The native host's callback function, as seen by the bridge.

use std::ffi::c_void;

/// Calls back into the native host that loaded the plugin.
///
/// The plugin-format shim implements this over the host's C callback and
/// binds the plugin handle the host expects as first argument. `data`
/// follows the native calling convention for `opcode`.
pub trait HostCallback: Send + Sync {
    fn call(&self, opcode: i32, index: i32, value: isize, data: *mut c_void, option: f32) -> isize;
}

impl<F> HostCallback for F
where
    F: Fn(i32, i32, isize, *mut c_void, f32) -> isize + Send + Sync,
{
    fn call(&self, opcode: i32, index: i32, value: isize, data: *mut c_void, option: f32) -> isize {
        self(opcode, index, value, data, option)
    }
}
