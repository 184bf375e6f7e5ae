//! Serving one plugin over the five bridge channels.
//!
//! The server connects the channels in their mandated order, sends the
//! plugin's descriptor unsolicited on the dispatch channel and then answers
//! requests, one thread per channel. Host callbacks go the other way through
//! [`HostCallbackProxy`].

use crate::instance::{HostedPlugin, PluginLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tether_bridge::codec::limits;
use tether_bridge::opcodes::{dispatch, host};
use tether_bridge::transport::{self, Channel, ChannelSet};
use tether_bridge::{
    AudioBuffers, AudioSamples, ChannelKind, DynamicEvents, Event, EventPayload, EventResult,
    EventResultPayload, Parameter, ParameterResult, Result,
};

/// The plugin's way back into the native host.
///
/// Calls block until the bridge answered them. Cloning is cheap; every clone
/// shares the same single-flight host-callback channel.
#[derive(Clone)]
pub struct HostCallbackProxy {
    channels: Arc<ChannelSet>,
}

impl HostCallbackProxy {
    pub fn from_channels(channels: Arc<ChannelSet>) -> Self {
        Self { channels }
    }

    pub fn call(&self, event: &Event) -> Result<EventResult> {
        self.channels.host_callback.call(event)
    }

    /// Hand MIDI to the native host. The bridge holds these back until the
    /// current processing callback returns.
    pub fn send_events(&self, events: DynamicEvents) -> Result<i64> {
        let event = Event::new(host::PROCESS_EVENTS, 0, 0, 0.0, EventPayload::Events(events));
        Ok(self.call(&event)?.return_value)
    }
}

impl std::fmt::Debug for HostCallbackProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCallbackProxy").finish_non_exhaustive()
    }
}

pub struct PluginServer {
    plugin_path: PathBuf,
    channels: Arc<ChannelSet>,
    plugin: Arc<dyn HostedPlugin>,
}

impl PluginServer {
    /// Connect to the bridge listening on `socket_path`, load the plugin and
    /// send its descriptor.
    pub fn connect(plugin_path: &Path, socket_path: &Path, loader: &dyn PluginLoader) -> Result<Self> {
        let channels = Arc::new(transport::connect_channels(socket_path)?);
        tracing::debug!(socket = %socket_path.display(), "connected all channels");

        let proxy = HostCallbackProxy::from_channels(Arc::clone(&channels));
        let plugin = match loader.load(plugin_path, proxy) {
            Ok(plugin) => plugin,
            Err(e) => {
                // The bridge is waiting for the descriptor and reads this as
                // a failed startup
                channels.close_all();
                return Err(e);
            }
        };

        let descriptor = plugin.descriptor();
        channels.dispatch.send(&EventResult::with_payload(
            0,
            EventResultPayload::Descriptor(descriptor),
        ))?;
        tracing::info!(
            plugin = %plugin_path.display(),
            inputs = descriptor.num_inputs,
            outputs = descriptor.num_outputs,
            "plugin loaded"
        );

        Ok(Self {
            plugin_path: plugin_path.to_path_buf(),
            channels,
            plugin,
        })
    }

    /// Serve requests until the plugin is closed or the bridge goes away.
    ///
    /// The dispatch channel runs on the calling thread. When it stops, every
    /// other channel is shut down and its thread joined before returning.
    pub fn run(self) -> Result<()> {
        let server = &self;
        let workers = [
            ("tether-midi-dispatch", ChannelKind::MidiDispatch),
            ("tether-parameters", ChannelKind::Parameters),
            ("tether-audio", ChannelKind::Audio),
        ];

        thread::scope(|scope| -> Result<()> {
            for (name, kind) in workers {
                let spawned = thread::Builder::new()
                    .name(name.into())
                    .spawn_scoped(scope, move || server.serve(kind));
                if let Err(e) = spawned {
                    // Threads that did start would otherwise block the scope
                    server.channels.close_all();
                    return Err(e.into());
                }
            }

            server.serve(ChannelKind::Dispatch);
            server.channels.close_all();
            Ok(())
        })?;

        tracing::info!(plugin = %self.plugin_path.display(), "plugin closed");
        Ok(())
    }

    fn serve(&self, kind: ChannelKind) {
        let channel = self.channels.get(kind);
        match kind {
            ChannelKind::Dispatch | ChannelKind::MidiDispatch => self.serve_dispatch(channel),
            ChannelKind::Parameters => self.serve_parameters(channel),
            ChannelKind::Audio => self.serve_audio(channel),
            // Served from the other end
            ChannelKind::HostCallback => {}
        }
    }

    fn serve_dispatch(&self, channel: &Channel) {
        loop {
            let mut closing = false;
            let served = channel.serve_one(|event: Event| {
                closing = event.opcode == dispatch::CLOSE;
                self.dispatch(event)
            });

            if let Err(e) = served {
                log_stopped(channel, &e);
                return;
            }
            if closing {
                tracing::debug!("received close");
                return;
            }
        }
    }

    fn dispatch(&self, event: Event) -> EventResult {
        let wants_descriptor = matches!(event.payload, EventPayload::WantsDescriptorUpdate);
        let mut result = self.plugin.dispatch(event);
        if wants_descriptor {
            result.payload = EventResultPayload::Descriptor(self.plugin.descriptor());
        }
        result
    }

    fn serve_parameters(&self, channel: &Channel) {
        loop {
            let served = channel.serve_one(|request: Parameter| match request.value {
                Some(value) => {
                    self.plugin.set_parameter(request.index, value);
                    ParameterResult { value: None }
                }
                None => ParameterResult {
                    value: Some(self.plugin.get_parameter(request.index)),
                },
            });

            if let Err(e) = served {
                log_stopped(channel, &e);
                return;
            }
        }
    }

    fn serve_audio(&self, channel: &Channel) {
        loop {
            if let Err(e) = channel.serve_one(|request: AudioBuffers| self.process(request)) {
                log_stopped(channel, &e);
                return;
            }
        }
    }

    fn process(&self, request: AudioBuffers) -> AudioBuffers {
        let sample_frames = request.sample_frames as usize;
        let num_outputs = usize::try_from(self.plugin.descriptor().num_outputs)
            .unwrap_or(0)
            .min(limits::MAX_AUDIO_CHANNELS);

        let buffers = match request.buffers {
            AudioSamples::Float32(inputs) => {
                let mut outputs = vec![vec![0.0f32; sample_frames]; num_outputs];
                self.plugin.process_f32(&inputs, &mut outputs, sample_frames);
                AudioSamples::Float32(outputs)
            }
            AudioSamples::Float64(inputs) => {
                let mut outputs = vec![vec![0.0f64; sample_frames]; num_outputs];
                self.plugin.process_f64(&inputs, &mut outputs, sample_frames);
                AudioSamples::Float64(outputs)
            }
        };

        AudioBuffers {
            buffers,
            sample_frames: request.sample_frames,
        }
    }
}

impl std::fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginServer")
            .field("plugin_path", &self.plugin_path)
            .finish_non_exhaustive()
    }
}

fn log_stopped(channel: &Channel, error: &tether_bridge::BridgeError) {
    if error.is_disconnect() {
        tracing::debug!(channel = %channel.kind(), "bridge disconnected");
    } else {
        tracing::error!(channel = %channel.kind(), "stopped serving: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::AtomicBool;
    use tether_bridge::native::{VstMidiEvent, PLUGIN_MAGIC};
    use tether_bridge::{NativeEvent, PluginDescriptor};

    /// Records every call and echoes received MIDI through the host
    /// callback while processing.
    struct RecordingPlugin {
        host: HostCallbackProxy,
        calls: Mutex<Vec<i32>>,
        parameter: Mutex<f32>,
        descriptor: Mutex<PluginDescriptor>,
    }

    impl HostedPlugin for RecordingPlugin {
        fn descriptor(&self) -> PluginDescriptor {
            *self.descriptor.lock()
        }

        fn dispatch(&self, event: Event) -> EventResult {
            self.calls.lock().push(event.opcode);
            if event.opcode == dispatch::OPEN {
                self.descriptor.lock().num_params = 8;
            }
            EventResult::new(event.opcode as i64 + 100)
        }

        fn get_parameter(&self, _index: i32) -> f32 {
            *self.parameter.lock()
        }

        fn set_parameter(&self, _index: i32, value: f32) {
            *self.parameter.lock() = value;
        }

        fn process_f32(&self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], _: usize) {
            for (output, input) in outputs.iter_mut().zip(inputs) {
                output.copy_from_slice(input);
            }
            let mut events = DynamicEvents::new();
            events.push(NativeEvent::Midi(VstMidiEvent::new(0, [0x90, 60, 100])));
            assert_eq!(self.host.send_events(events).unwrap(), 1);
        }

        fn process_f64(&self, _: &[Vec<f64>], outputs: &mut [Vec<f64>], _: usize) {
            for output in outputs {
                output.fill(0.25);
            }
        }
    }

    fn recording_loader(path: &Path, host: HostCallbackProxy) -> Result<Arc<dyn HostedPlugin>> {
        assert_eq!(path, Path::new("/plugins/Recorder.dll"));
        Ok(Arc::new(RecordingPlugin {
            host,
            calls: Mutex::new(Vec::new()),
            parameter: Mutex::new(0.0),
            descriptor: Mutex::new(PluginDescriptor {
                magic: PLUGIN_MAGIC,
                num_inputs: 2,
                num_outputs: 2,
                ..Default::default()
            }),
        }))
    }

    fn serve(dir: &Path) -> (ChannelSet, thread::JoinHandle<Result<()>>) {
        let socket = dir.join("server.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = thread::spawn(move || -> Result<()> {
            PluginServer::connect(Path::new("/plugins/Recorder.dll"), &socket, &recording_loader)?
                .run()
        });

        let bridge = transport::accept_channels(&listener, &AtomicBool::new(false)).unwrap();
        (bridge, server)
    }

    #[test]
    fn test_descriptor_then_dispatch_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, server) = serve(dir.path());

        let hello: EventResult = bridge.dispatch.receive().unwrap();
        match hello.payload {
            EventResultPayload::Descriptor(descriptor) => assert_eq!(descriptor.num_outputs, 2),
            other => panic!("Expected descriptor, got {:?}", other),
        }

        let opened: EventResult = bridge
            .dispatch
            .call(&Event::new(dispatch::OPEN, 0, 0, 0.0, EventPayload::WantsDescriptorUpdate))
            .unwrap();
        assert_eq!(opened.return_value, 100);
        match opened.payload {
            EventResultPayload::Descriptor(descriptor) => assert_eq!(descriptor.num_params, 8),
            other => panic!("Expected descriptor update, got {:?}", other),
        }

        let closed: EventResult = bridge
            .dispatch
            .call(&Event::new(dispatch::CLOSE, 0, 0, 0.0, EventPayload::Null))
            .unwrap();
        assert_eq!(closed.return_value, 101);

        server.join().unwrap().unwrap();
        // Every other channel was shut down along with dispatch
        assert!(bridge.parameters.call::<_, ParameterResult>(&Parameter { index: 0, value: None }).is_err());
    }

    #[test]
    fn test_parameters_and_audio() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, server) = serve(dir.path());
        let _: EventResult = bridge.dispatch.receive().unwrap();

        let set: ParameterResult = bridge
            .parameters
            .call(&Parameter {
                index: 3,
                value: Some(0.75),
            })
            .unwrap();
        assert_eq!(set.value, None);
        let get: ParameterResult = bridge
            .parameters
            .call(&Parameter {
                index: 3,
                value: None,
            })
            .unwrap();
        assert_eq!(get.value, Some(0.75));

        // The plugin's MIDI arrives on the host-callback channel while the
        // audio request is still outstanding
        let callbacks = thread::scope(|scope| {
            let answered = scope.spawn(|| {
                let mut seen = Vec::new();
                bridge
                    .host_callback
                    .serve_one(|event: Event| {
                        seen.push(event.opcode);
                        EventResult::new(1)
                    })
                    .unwrap();
                seen
            });

            let response: AudioBuffers = bridge
                .audio
                .call(&AudioBuffers {
                    buffers: AudioSamples::Float32(vec![vec![0.5; 4], vec![-0.5; 4]]),
                    sample_frames: 4,
                })
                .unwrap();
            assert_eq!(
                response.buffers,
                AudioSamples::Float32(vec![vec![0.5; 4], vec![-0.5; 4]])
            );
            answered.join().unwrap()
        });
        assert_eq!(callbacks, vec![host::PROCESS_EVENTS]);

        let response: AudioBuffers = bridge
            .audio
            .call(&AudioBuffers {
                buffers: AudioSamples::Float64(vec![vec![0.0; 3]; 2]),
                sample_frames: 3,
            })
            .unwrap();
        assert_eq!(response.buffers, AudioSamples::Float64(vec![vec![0.25; 3]; 2]));

        // Dropping the bridge side ends the server without a close
        bridge.dispatch.close();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_load_closes_channels() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broken.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = thread::spawn(move || {
            let loader = |_: &Path, _: HostCallbackProxy| -> Result<Arc<dyn HostedPlugin>> {
                Err(tether_bridge::BridgeError::ProtocolError("not a plugin".into()))
            };
            PluginServer::connect(Path::new("/plugins/Broken.dll"), &socket, &loader).map(|_| ())
        });

        let bridge = transport::accept_channels(&listener, &AtomicBool::new(false)).unwrap();
        assert!(bridge.dispatch.receive::<EventResult>().is_err());
        assert!(server.join().unwrap().is_err());
    }
}
