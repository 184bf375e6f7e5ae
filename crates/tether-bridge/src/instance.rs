//! A bridged plugin instance: one remote plugin, its host process and the
//! five channels between them.

use crate::audio::{self, PendingEvents, Sample};
use crate::callback::HostCallback;
use crate::config::{BridgeConfig, HostEnvironment, PluginPaths};
use crate::endpoint;
use crate::error::{BridgeError, Result, StartupStage};
use crate::group::GroupLaunch;
use crate::logging::{self, EventLogger};
use crate::marshal::{self, DispatchBuffers, DispatchConverter};
use crate::opcodes::{dispatch, host, Direction};
use crate::process::HostProcess;
use crate::protocol::{
    Event, EventPayload, EventResult, EventResultPayload, GroupRequest, Parameter,
    ParameterResult, PluginDescriptor,
};
use crate::transport::{self, Channel, ChannelSet};
use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lifecycle of a [`BridgeInstance`]. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    Closing = 1,
    Closed = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Running,
            1 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }
}

/// Query that would make some hosts hand us a window handle type the remote
/// editor cannot embed into.
const UNSUPPORTED_VIEW_QUERY: &[u8] = b"hasCockosViewAsConfig";

/// State shared with the host callback thread.
struct Shared {
    channels: ChannelSet,
    host_callback: Arc<dyn HostCallback>,
    pending: PendingEvents,
    logger: EventLogger,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Serve plugin-to-host callbacks until the channel closes.
    fn run_host_callbacks(&self) {
        loop {
            let result = self.channels.host_callback.serve_one(|event: Event| {
                self.logger.log_request(Direction::HostCallback, &event);
                let opcode = event.opcode;
                let response = self.handle_host_callback(event);
                self.logger
                    .log_response(Direction::HostCallback, opcode, &response);
                response
            });

            if let Err(e) = result {
                if self.state() == LifecycleState::Running && !e.is_disconnect() {
                    tracing::error!("Host callback channel failed: {}", e);
                } else {
                    tracing::debug!("host callback channel closed: {}", e);
                }
                return;
            }
        }
    }

    fn handle_host_callback(&self, event: Event) -> EventResult {
        // Hosts drop MIDI that is not sent from inside the processing
        // callback, so it waits for the end of the next audio round trip
        if event.opcode == host::PROCESS_EVENTS {
            if let EventPayload::Events(events) = event.payload {
                self.pending.push(events);
                return EventResult::new(1);
            }
        }

        marshal::passthrough_event(self.host_callback.as_ref(), &event)
    }
}

/// The plugin-side end of one bridged plugin.
///
/// Created when the native host loads the plugin, closed by the native close
/// dispatch. Dropping an instance that was never closed tears it down the
/// same way.
pub struct BridgeInstance {
    shared: Arc<Shared>,
    config: BridgeConfig,
    endpoint: PathBuf,
    span: tracing::Span,
    process: HostProcess,
    descriptor: ArcSwap<PluginDescriptor>,
    dispatch_buffers: Mutex<DispatchBuffers>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Dropping this stops the output forwarders and the group attach retry
    /// thread.
    worker_stop: Mutex<Option<Sender<()>>>,
}

impl BridgeInstance {
    /// Start the host process (or attach to a group host), accept the five
    /// channels and read the plugin's descriptor.
    pub fn new(
        config: BridgeConfig,
        paths: PluginPaths,
        environment: HostEnvironment,
        host_callback: Arc<dyn HostCallback>,
    ) -> Result<Self> {
        let settings = logging::init();
        let endpoint = endpoint::instance_endpoint(&paths.plugin_path);
        let endpoint_name = endpoint
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = tracing::info_span!("bridge", endpoint = %endpoint_name);

        span.in_scope(|| {
            Self::start(
                config,
                paths,
                environment,
                host_callback,
                EventLogger::new(settings),
                endpoint,
                span.clone(),
            )
        })
    }

    fn start(
        config: BridgeConfig,
        paths: PluginPaths,
        environment: HostEnvironment,
        host_callback: Arc<dyn HostCallback>,
        logger: EventLogger,
        endpoint: PathBuf,
        span: tracing::Span,
    ) -> Result<Self> {
        config.validate()?;
        let listener = UnixListener::bind(&endpoint).map_err(|e| BridgeError::StartupFailed {
            stage: StartupStage::Accepting,
            reason: format!("could not bind '{}': {}", endpoint.display(), e),
        })?;
        logging::log_init_message(&paths, &config, &endpoint, environment.prefix.as_deref());

        let mut workers = Vec::new();
        let (worker_stop, worker_stop_rx) = bounded(0);
        let launched = match &config.group {
            None => HostProcess::spawn_individual(
                &paths.host_path,
                &paths.plugin_path,
                &endpoint,
                &environment,
                &worker_stop_rx,
                &mut workers,
            ),
            Some(group) => GroupLaunch {
                group_socket: endpoint::group_endpoint(
                    group,
                    &environment.group_prefix(),
                    paths.architecture,
                ),
                request: GroupRequest {
                    plugin_path: paths.plugin_path.clone(),
                    instance_socket_path: endpoint.clone(),
                },
                host_path: paths.host_path.clone(),
                environment: environment.clone(),
                poll_interval: config.group_poll_interval,
            }
            .attach_or_spawn(&worker_stop_rx, &mut workers),
        };
        let process = match launched {
            Ok(process) => process,
            Err(e) => {
                drop(worker_stop);
                join_all(workers);
                let _ = std::fs::remove_file(&endpoint);
                return Err(e);
            }
        };

        let accepted = accept_supervised(&listener, &endpoint, &process, config.liveness_interval);
        // Every channel has its own descriptor now, so nobody else may connect
        drop(listener);
        let _ = std::fs::remove_file(&endpoint);

        let channels = match accepted {
            Ok(channels) => channels,
            Err(e) => {
                process.terminate();
                drop(worker_stop);
                join_all(workers);
                return Err(e);
            }
        };

        let instance = Self {
            shared: Arc::new(Shared {
                channels,
                host_callback,
                pending: PendingEvents::new(),
                logger,
                state: AtomicU8::new(LifecycleState::Running as u8),
            }),
            config,
            endpoint,
            span,
            process,
            descriptor: ArcSwap::from_pointee(PluginDescriptor::default()),
            dispatch_buffers: Mutex::new(DispatchBuffers::default()),
            workers: Mutex::new(workers),
            worker_stop: Mutex::new(Some(worker_stop)),
        };

        // The plugin may call back into the host while it initializes, so the
        // callback thread has to run before the descriptor can arrive
        let shared = Arc::clone(&instance.shared);
        let span = instance.span.clone();
        let callback_thread = thread::Builder::new()
            .name("tether-host-callback".into())
            .spawn(move || span.in_scope(|| shared.run_host_callbacks()));
        match callback_thread {
            Ok(handle) => instance.workers.lock().push(handle),
            Err(e) => {
                instance.teardown();
                return Err(e.into());
            }
        }

        match instance.read_descriptor() {
            Ok(descriptor) => {
                tracing::info!(
                    params = descriptor.num_params,
                    inputs = descriptor.num_inputs,
                    outputs = descriptor.num_outputs,
                    "plugin initialized"
                );
                instance.descriptor.store(Arc::new(descriptor));
                Ok(instance)
            }
            Err(e) => {
                instance.teardown();
                Err(e)
            }
        }
    }

    fn read_descriptor(&self) -> Result<PluginDescriptor> {
        let initialization: EventResult =
            self.shared.channels.dispatch.receive().map_err(|e| BridgeError::StartupFailed {
                stage: StartupStage::Initializing,
                reason: e.to_string(),
            })?;

        match initialization.payload {
            EventResultPayload::Descriptor(descriptor) => Ok(descriptor),
            other => Err(BridgeError::StartupFailed {
                stage: StartupStage::Initializing,
                reason: format!("expected the plugin descriptor, got {:?}", other),
            }),
        }
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        **self.descriptor.load()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Pid of the process hosting the plugin, once known.
    pub fn host_process_id(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Number of plugin-emitted event batches waiting for the next audio
    /// callback.
    pub fn pending_events(&self) -> usize {
        self.shared.pending.len()
    }

    /// Forward a native dispatch call to the remote plugin.
    ///
    /// # Safety
    /// `value` and `data` must follow the native calling convention for
    /// `opcode`, exactly as the host passed them.
    pub unsafe fn dispatch(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> isize {
        let _entered = self.span.enter();

        if let Err(e) = self.ensure_running() {
            tracing::warn!(opcode, "{}, ignoring the dispatch", e);
            return 0;
        }

        if !self.descriptor.load().is_initialized() {
            tracing::warn!(
                opcode,
                "The host dispatched an event before the plugin finished initializing, ignoring it"
            );
            return 0;
        }

        match opcode {
            dispatch::CLOSE => return self.close(index, value, data, option),
            dispatch::CAN_DO
                if !data.is_null()
                    && CStr::from_ptr(data as *const c_char).to_bytes()
                        == UNSUPPORTED_VIEW_QUERY =>
            {
                tracing::info!(
                    "The host asked for an editor view type that cannot be embedded, declining"
                );
                return -1;
            }
            _ => {}
        }

        // MIDI gets its own channel so it keeps flowing while a dispatch call
        // is stuck behind a modal dialog
        let channel = if opcode == dispatch::PROCESS_EVENTS {
            &self.shared.channels.midi_dispatch
        } else {
            &self.shared.channels.dispatch
        };

        match self.send_dispatch(channel, opcode, index, value, data, option) {
            Ok(return_value) => return_value,
            Err(e) => {
                tracing::error!(opcode, "Dispatch failed: {}", e);
                0
            }
        }
    }

    unsafe fn send_dispatch(
        &self,
        channel: &Channel,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> Result<isize> {
        let event = DispatchConverter::new(&mut self.dispatch_buffers.lock(), &self.descriptor)
            .encode_request(opcode, index, value, data, option);
        if opcode == dispatch::EDIT_OPEN {
            self.shared.logger.log_editor("embedding the editor into the host window");
        }

        let logger = &self.shared.logger;
        logger.log_request(Direction::Dispatch, &event);
        let response: EventResult = channel.call(&event)?;
        logger.log_response(Direction::Dispatch, opcode, &response);

        Ok(
            DispatchConverter::new(&mut self.dispatch_buffers.lock(), &self.descriptor)
                .apply_response(opcode, value, data, &response),
        )
    }

    /// Forward the close, then tear everything down.
    unsafe fn close(&self, index: i32, value: isize, data: *mut c_void, option: f32) -> isize {
        if self
            .shared
            .state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return 0;
        }

        let return_value = match self.send_dispatch(
            &self.shared.channels.dispatch,
            dispatch::CLOSE,
            index,
            value,
            data,
            option,
        ) {
            Ok(return_value) => return_value,
            Err(e) => {
                tracing::info!("The plugin crashed during shutdown, ignoring: {}", e);
                0
            }
        };

        self.teardown();
        return_value
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            _ => Err(BridgeError::InstanceClosed),
        }
    }

    /// Release everything in order. Idempotent.
    ///
    /// Never waits for the host's output pipes to close: whatever the host
    /// left running in the background may hold them open indefinitely.
    fn teardown(&self) {
        self.shared
            .state
            .store(LifecycleState::Closing as u8, Ordering::SeqCst);

        if self.process.is_group() {
            // The group host retires just this plugin when its dispatch
            // channel goes away
            self.shared.channels.dispatch.close();
        } else {
            self.process.terminate();
        }
        self.shared.channels.close_all();
        self.worker_stop.lock().take();

        join_all(std::mem::take(&mut *self.workers.lock()));
        self.shared
            .state
            .store(LifecycleState::Closed as u8, Ordering::SeqCst);
        tracing::debug!("bridge instance closed");
    }

    /// Read a parameter from the remote plugin.
    pub fn get_parameter(&self, index: i32) -> f32 {
        let _entered = self.span.enter();
        if self.ensure_running().is_err() {
            return 0.0;
        }

        let logger = &self.shared.logger;
        logger.log_get_parameter(index);
        let response: Result<ParameterResult> = self
            .shared
            .channels
            .parameters
            .call(&Parameter { index, value: None });

        match response {
            Ok(ParameterResult { value: Some(value) }) => {
                logger.log_get_parameter_response(value);
                value
            }
            Ok(ParameterResult { value: None }) => {
                tracing::warn!(index, "parameter read was answered without a value");
                0.0
            }
            Err(e) => {
                tracing::error!(index, "getParameter failed: {}", e);
                0.0
            }
        }
    }

    /// Write a parameter on the remote plugin.
    pub fn set_parameter(&self, index: i32, value: f32) {
        let _entered = self.span.enter();
        if self.ensure_running().is_err() {
            return;
        }

        let logger = &self.shared.logger;
        logger.log_set_parameter(index, value);
        let response: Result<ParameterResult> = self.shared.channels.parameters.call(&Parameter {
            index,
            value: Some(value),
        });

        match response {
            Ok(ParameterResult { value: None }) => logger.log_set_parameter_response(),
            Ok(ParameterResult { value: Some(_) }) => {
                tracing::warn!(index, "parameter write acknowledgement carried a value")
            }
            Err(e) => tracing::error!(index, "setParameter failed: {}", e),
        }
    }

    /// Single precision processing callback.
    pub fn process_f32(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], sample_frames: usize) {
        self.process(inputs, outputs, sample_frames)
    }

    /// Double precision processing callback.
    pub fn process_f64(&self, inputs: &[&[f64]], outputs: &mut [&mut [f64]], sample_frames: usize) {
        self.process(inputs, outputs, sample_frames)
    }

    fn process<T: Sample>(&self, inputs: &[&[T]], outputs: &mut [&mut [T]], sample_frames: usize) {
        if self.state() != LifecycleState::Running {
            return;
        }

        if let Err(e) =
            audio::process_round_trip(&self.shared.channels.audio, inputs, outputs, sample_frames)
        {
            let _entered = self.span.enter();
            tracing::error!("Audio processing failed: {}", e);
        }

        // Still inside the host's processing callback, the only place it
        // accepts plugin MIDI from
        self.shared.pending.flush(self.shared.host_callback.as_ref());
    }
}

impl Drop for BridgeInstance {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Closed {
            let _entered = self.span.enter();
            self.teardown();
        }
    }
}

impl std::fmt::Debug for BridgeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeInstance")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("process", &self.process)
            .finish()
    }
}

/// Accept the five channels while a supervisor thread makes sure the host
/// process is still there to connect them.
///
/// If the host dies first, the supervisor raises the abort flag and connects
/// a throwaway socket to wake up the blocked accept.
fn accept_supervised(
    listener: &UnixListener,
    endpoint: &Path,
    process: &HostProcess,
    interval: Duration,
) -> Result<ChannelSet> {
    let abort = AtomicBool::new(false);
    let (done, done_rx) = bounded::<()>(0);

    thread::scope(|scope| {
        scope.spawn(|| loop {
            match done_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }

            if !process.is_alive() {
                tracing::error!(
                    "The host process has exited unexpectedly. Check the output above for more information."
                );
                abort.store(true, Ordering::SeqCst);
                let _ = UnixStream::connect(endpoint);
                return;
            }
        });

        let result = transport::accept_channels(listener, &abort);
        drop(done);
        result
    })
    .map_err(|e| match e {
        BridgeError::ProcessCrashed | BridgeError::ChannelOrder { .. } => e,
        other => BridgeError::StartupFailed {
            stage: StartupStage::Accepting,
            reason: other.to_string(),
        },
    })
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    let current = thread::current().id();
    for worker in workers {
        // Closing from one of our own threads cannot wait for itself
        if worker.thread().id() == current {
            continue;
        }
        let _ = worker.join();
    }
}
