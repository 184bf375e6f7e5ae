//! End-to-end tests: the bridge spawning the real `tether-host` binary.

use parking_lot::Mutex;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether_bridge::marshal;
use tether_bridge::native::{VstEvents, VstMidiEvent};
use tether_bridge::opcodes::{dispatch, host};
use tether_bridge::{
    BridgeConfig, BridgeError, BridgeInstance, DynamicEvents, HostCallback, HostEnvironment,
    InstanceRegistry, LifecycleState, NativeEvent, PluginArchitecture, PluginPaths,
};

fn plugin_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"MZ").unwrap();
    path
}

fn paths(plugin_path: PathBuf) -> PluginPaths {
    PluginPaths {
        plugin_path,
        architecture: PluginArchitecture::X86_64,
        host_path: PathBuf::from(env!("CARGO_BIN_EXE_tether-host")),
    }
}

fn fast_config() -> BridgeConfig {
    BridgeConfig {
        liveness_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Records every MIDI batch the native host receives.
fn recording_host() -> (Arc<dyn HostCallback>, Arc<Mutex<Vec<DynamicEvents>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let callback = move |opcode: i32, _: i32, _: isize, data: *mut c_void, _: f32| -> isize {
        if opcode == host::PROCESS_EVENTS && !data.is_null() {
            let events = unsafe { marshal::read_events(data as *const VstEvents) };
            sink.lock().push(events);
            return 1;
        }
        0
    };
    (Arc::new(callback), received)
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

#[test]
fn test_individual_host_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (host_callback, received) = recording_host();
    let registry = InstanceRegistry::new();

    let plugin_path = plugin_file(dir.path(), "Passthrough.dll");
    let handle = registry
        .load(
            fast_config(),
            paths(plugin_path.clone()),
            HostEnvironment::default(),
            host_callback,
        )
        .expect("plugin should load");
    let instance = registry.get(handle).unwrap();

    let descriptor = instance.descriptor();
    assert!(descriptor.is_initialized());
    assert_eq!(descriptor.num_inputs, 2);
    assert_eq!(descriptor.num_outputs, 2);
    assert_eq!(descriptor.unique_id, i32::from_be_bytes(*b"TthP"));
    assert!(!instance.endpoint().exists());

    let mut name = [0u8; 64];
    let result = unsafe {
        registry.dispatch(handle, dispatch::GET_EFFECT_NAME, 0, 0, name.as_mut_ptr().cast(), 0.0)
    };
    assert_eq!(result, 1);
    assert_eq!(&name[..19], b"Tether Passthrough\0");

    registry.set_parameter(handle, 0, 0.5);
    assert_eq!(registry.get_parameter(handle, 0), 0.5);

    // MIDI sent to the plugin comes back through the host callback, but only
    // once the next processing call returns
    let mut events = DynamicEvents::new();
    events.push(NativeEvent::Midi(VstMidiEvent::new(0, [0x90, 60, 100])));
    events.push(NativeEvent::Midi(VstMidiEvent::new(8, [0x80, 60, 0])));
    let mut native = events.to_native();
    let accepted = unsafe {
        registry.dispatch(handle, dispatch::PROCESS_EVENTS, 0, 0, native.as_ptr().cast(), 0.0)
    };
    assert_eq!(accepted, 1);
    assert!(received.lock().is_empty());

    let left = [1.0f32; 32];
    let right = [-1.0f32; 32];
    let inputs: [&[f32]; 2] = [&left, &right];
    let mut out_left = [0.0f32; 32];
    let mut out_right = [0.0f32; 32];
    let mut outputs: [&mut [f32]; 2] = [&mut out_left, &mut out_right];
    registry.process_f32(handle, &inputs, &mut outputs, 32);

    assert_eq!(out_left, [0.5f32; 32]);
    assert_eq!(out_right, [-0.5f32; 32]);
    assert_eq!(*received.lock(), vec![events]);
    assert_eq!(instance.pending_events(), 0);

    // Double precision takes the same path
    let mono = [0.25f64; 4];
    let inputs: [&[f64]; 1] = [&mono];
    let mut out = [0.0f64; 4];
    let mut outputs: [&mut [f64]; 1] = [&mut out];
    registry.process_f64(handle, &inputs, &mut outputs, 4);
    assert_eq!(out, [0.125f64; 4]);
    assert_eq!(received.lock().len(), 1);

    let closed =
        unsafe { registry.dispatch(handle, dispatch::CLOSE, 0, 0, std::ptr::null_mut(), 0.0) };
    assert_eq!(closed, 0);
    assert_eq!(instance.state(), LifecycleState::Closed);
    assert!(registry.is_empty());
}

#[test]
fn test_missing_plugin_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let (host_callback, _) = recording_host();

    let result = BridgeInstance::new(
        fast_config(),
        paths(dir.path().join("Missing.dll")),
        HostEnvironment::default(),
        host_callback,
    );
    assert!(matches!(
        result,
        Err(BridgeError::StartupFailed { .. }) | Err(BridgeError::ProcessCrashed)
    ));
}

#[test]
fn test_calls_after_host_crash_are_neutral() {
    let dir = tempfile::tempdir().unwrap();
    let (host_callback, _) = recording_host();

    let instance = BridgeInstance::new(
        fast_config(),
        paths(plugin_file(dir.path(), "Doomed.dll")),
        HostEnvironment::default(),
        host_callback,
    )
    .unwrap();

    let pid = instance.host_process_id().unwrap();
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    // The socket goes away with the process
    assert!(wait_for(|| instance.get_parameter(0) == 0.0));
    let result = unsafe {
        instance.dispatch(dispatch::GET_VENDOR_VERSION, 0, 0, std::ptr::null_mut(), 0.0)
    };
    assert_eq!(result, 0);

    drop(instance);
}

#[test]
fn test_group_instances_share_one_host() {
    let dir = tempfile::tempdir().unwrap();
    let group = format!("e2e-{}", std::process::id());
    let config = BridgeConfig {
        group: Some(group),
        liveness_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let environment = HostEnvironment::with_prefix(Some(dir.path().join("prefix")));

    let spawn_instance = |name: &'static str| {
        let config = config.clone();
        let environment = environment.clone();
        let plugin_path = plugin_file(dir.path(), name);
        thread::spawn(move || {
            let (host_callback, _) = recording_host();
            BridgeInstance::new(config, paths(plugin_path), environment, host_callback)
        })
    };

    // Both may spawn a group host; only the one that binds the group socket
    // keeps running
    let first = spawn_instance("First.dll");
    let second = spawn_instance("Second.dll");
    let first = first.join().unwrap().unwrap();
    let second = second.join().unwrap().unwrap();

    assert!(wait_for(|| first.host_process_id().is_some()));
    assert!(wait_for(|| second.host_process_id().is_some()));
    assert_eq!(first.host_process_id(), second.host_process_id());

    // Closing one plugin leaves the other one running in the shared host
    unsafe { first.dispatch(dispatch::CLOSE, 0, 0, std::ptr::null_mut(), 0.0) };
    assert_eq!(first.state(), LifecycleState::Closed);

    second.set_parameter(1, 0.75);
    assert_eq!(second.get_parameter(1), 0.75);
    drop(second);
}
