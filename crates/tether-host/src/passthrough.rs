//! Built-in plugin served when no foreign plugin loader is linked in.
//!
//! It passes audio through with a gain parameter, keeps a small parameter
//! store that survives chunk save/restore, and echoes every MIDI event it
//! receives back to the native host during the next processing call.

use crate::instance::HostedPlugin;
use crate::server::HostCallbackProxy;
use parking_lot::{Mutex, RwLock};
use std::ops::Mul;
use std::path::Path;
use std::sync::Arc;
use tether_bridge::native::PLUGIN_MAGIC;
use tether_bridge::opcodes::dispatch;
use tether_bridge::{
    BridgeError, DynamicEvents, Event, EventPayload, EventResult, EventResultPayload,
    PluginDescriptor, Result, StartupStage,
};

const FLAG_CAN_REPLACING: i32 = 1 << 4;
const FLAG_PROGRAM_CHUNKS: i32 = 1 << 5;
const FLAG_CAN_DOUBLE_REPLACING: i32 = 1 << 12;

const UNIQUE_ID: i32 = i32::from_be_bytes(*b"TthP");
const PLUGIN_CATEGORY_EFFECT: i64 = 1;
const VST_VERSION: i64 = 2400;

const PARAMETER_NAMES: [&str; 4] = ["Gain", "Pan", "Mix", "Trim"];
const DEFAULT_PARAMETERS: [f32; 4] = [1.0, 0.5, 1.0, 0.0];
const GAIN: usize = 0;

const CAN_DO: [&str; 3] = ["receiveVstEvents", "receiveVstMidiEvent", "sendVstMidiEvent"];

pub struct PassthroughPlugin {
    host: HostCallbackProxy,
    parameters: RwLock<[f32; 4]>,
    /// MIDI received since the last processing call.
    received: Mutex<DynamicEvents>,
}

impl PassthroughPlugin {
    pub fn new(host: HostCallbackProxy) -> Self {
        Self {
            host,
            parameters: RwLock::new(DEFAULT_PARAMETERS),
            received: Mutex::new(DynamicEvents::new()),
        }
    }

    /// [`PluginLoader`](crate::PluginLoader) entry point. The plugin file
    /// only has to exist.
    pub fn load(plugin_path: &Path, host: HostCallbackProxy) -> Result<Arc<dyn HostedPlugin>> {
        if !plugin_path.exists() {
            return Err(BridgeError::StartupFailed {
                stage: StartupStage::Initializing,
                reason: format!("'{}' does not exist", plugin_path.display()),
            });
        }
        Ok(Arc::new(Self::new(host)))
    }

    fn chunk(&self) -> Vec<u8> {
        self.parameters
            .read()
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect()
    }

    fn restore_chunk(&self, chunk: &[u8]) -> bool {
        let mut parameters = self.parameters.write();
        if chunk.len() != parameters.len() * 4 {
            return false;
        }
        for (parameter, bytes) in parameters.iter_mut().zip(chunk.chunks_exact(4)) {
            *parameter = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        true
    }

    fn process<T>(&self, inputs: &[Vec<T>], outputs: &mut [Vec<T>], sample_frames: usize)
    where
        T: Copy + From<f32> + Mul<Output = T>,
    {
        let gain = T::from(self.parameters.read()[GAIN]);
        for (output, input) in outputs.iter_mut().zip(inputs) {
            let frames = sample_frames.min(output.len()).min(input.len());
            for (out, sample) in output[..frames].iter_mut().zip(&input[..frames]) {
                *out = *sample * gain;
            }
        }

        let events = std::mem::take(&mut *self.received.lock());
        if !events.is_empty() {
            if let Err(e) = self.host.send_events(events) {
                tracing::warn!("could not send MIDI to the host: {}", e);
            }
        }
    }
}

impl HostedPlugin for PassthroughPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            magic: PLUGIN_MAGIC,
            num_programs: 1,
            num_params: PARAMETER_NAMES.len() as i32,
            num_inputs: 2,
            num_outputs: 2,
            flags: FLAG_CAN_REPLACING | FLAG_PROGRAM_CHUNKS | FLAG_CAN_DOUBLE_REPLACING,
            initial_delay: 0,
            unique_id: UNIQUE_ID,
            version: 1,
        }
    }

    fn dispatch(&self, event: Event) -> EventResult {
        let string = |s: &str| EventResult::with_payload(1, EventResultPayload::String(s.into()));
        let parameter_name = usize::try_from(event.index)
            .ok()
            .and_then(|index| PARAMETER_NAMES.get(index));

        match (event.opcode, event.payload) {
            (dispatch::GET_EFFECT_NAME | dispatch::GET_PRODUCT_STRING, _) => {
                string("Tether Passthrough")
            }
            (dispatch::GET_VENDOR_STRING, _) => string("tether"),
            (dispatch::GET_PROGRAM_NAME | dispatch::GET_PROGRAM_NAME_INDEXED, _) => {
                string("Default")
            }
            (dispatch::GET_PARAM_NAME, _) => string(parameter_name.copied().unwrap_or("")),
            (dispatch::GET_PARAM_LABEL, _) => string(""),
            (dispatch::GET_PARAM_DISPLAY, _) => {
                string(&format!("{:.2}", self.get_parameter(event.index)))
            }
            (dispatch::GET_VENDOR_VERSION, _) => EventResult::new(1),
            (dispatch::GET_VST_VERSION, _) => EventResult::new(VST_VERSION),
            (dispatch::GET_PLUG_CATEGORY, _) => EventResult::new(PLUGIN_CATEGORY_EFFECT),
            (dispatch::CAN_BE_AUTOMATED, _) => EventResult::new(parameter_name.is_some() as i64),
            (dispatch::CAN_DO, EventPayload::String(query)) => {
                EventResult::new(if CAN_DO.contains(&query.as_str()) { 1 } else { 0 })
            }
            (dispatch::PROCESS_EVENTS, EventPayload::Events(events)) => {
                self.received.lock().events.extend(events.events);
                EventResult::new(1)
            }
            (dispatch::GET_CHUNK, _) => {
                let chunk = self.chunk();
                EventResult::with_payload(chunk.len() as i64, EventResultPayload::Chunk(chunk))
            }
            (dispatch::SET_CHUNK, EventPayload::Chunk(chunk)) => {
                EventResult::new(self.restore_chunk(&chunk) as i64)
            }
            (dispatch::SET_SAMPLE_RATE, _) => {
                tracing::debug!(sample_rate = event.option, "sample rate changed");
                EventResult::new(0)
            }
            (dispatch::SET_BLOCK_SIZE, _) => {
                tracing::debug!(block_size = event.value, "block size changed");
                EventResult::new(0)
            }
            _ => EventResult::new(0),
        }
    }

    fn get_parameter(&self, index: i32) -> f32 {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.parameters.read().get(index).copied())
            .unwrap_or(0.0)
    }

    fn set_parameter(&self, index: i32, value: f32) {
        let Ok(index) = usize::try_from(index) else {
            return;
        };
        if let Some(parameter) = self.parameters.write().get_mut(index) {
            *parameter = value;
        }
    }

    fn process_f32(&self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], sample_frames: usize) {
        self.process(inputs, outputs, sample_frames);
    }

    fn process_f64(&self, inputs: &[Vec<f64>], outputs: &mut [Vec<f64>], sample_frames: usize) {
        self.process(inputs, outputs, sample_frames);
    }
}
