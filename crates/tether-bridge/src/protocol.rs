//! Wire messages exchanged between the bridge and the host process.
//!
//! Nothing on the wire carries a type tag: every channel has a fixed request
//! type and a fixed response type, and both ends know which one comes next
//! from call order alone.

use crate::codec::limits;
use crate::native::{
    VstEvent, VstIoProperties, VstMidiEvent, VstMidiKeyName, VstParameterProperties, VstRect,
    VstSpeaker, VstTimeInfo, PLUGIN_MAGIC,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::PathBuf;

const EVENT_STACK_CAPACITY: usize = 64;

/// The five channels of a bridge instance, in the order they are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelKind {
    Dispatch = 0,
    MidiDispatch = 1,
    HostCallback = 2,
    Parameters = 3,
    Audio = 4,
}

impl ChannelKind {
    /// Connection order mandated by the handshake.
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Dispatch,
        ChannelKind::MidiDispatch,
        ChannelKind::HostCallback,
        ChannelKind::Parameters,
        ChannelKind::Audio,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Dispatch => write!(f, "dispatch"),
            ChannelKind::MidiDispatch => write!(f, "MIDI dispatch"),
            ChannelKind::HostCallback => write!(f, "host callback"),
            ChannelKind::Parameters => write!(f, "parameters"),
            ChannelKind::Audio => write!(f, "audio"),
        }
    }
}

/// The plugin's self-description, mirrored from the remote plugin.
///
/// A descriptor with a zero `magic` belongs to a plugin that has not finished
/// initializing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub magic: i32,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

impl PluginDescriptor {
    pub fn new(num_inputs: i32, num_outputs: i32) -> Self {
        Self {
            magic: PLUGIN_MAGIC,
            num_inputs,
            num_outputs,
            ..Default::default()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.magic != 0
    }
}

/// One event inside an event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NativeEvent {
    Midi(VstMidiEvent),
    Sysex {
        delta_frames: i32,
        flags: i32,
        #[serde(deserialize_with = "limits::bytes")]
        data: Vec<u8>,
    },
    /// Any other event type, copied verbatim.
    Other(VstEvent),
}

/// Owned copy of a dynamically sized native event list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicEvents {
    #[serde(deserialize_with = "limits::events")]
    pub events: SmallVec<[NativeEvent; EVENT_STACK_CAPACITY]>,
}

impl DynamicEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: NativeEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Owned copy of a dynamically sized speaker arrangement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicSpeakerArrangement {
    pub arrangement_type: i32,
    #[serde(deserialize_with = "limits::speakers")]
    pub speakers: Vec<VstSpeaker>,
}

/// Payload of a request event. Which variant an opcode uses is fixed by the
/// marshaling table, not inferred from the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Null,
    String(#[serde(deserialize_with = "limits::string")] String),
    /// Binary block, e.g. a state chunk of `value` bytes.
    Chunk(#[serde(deserialize_with = "limits::bytes")] Vec<u8>),
    /// Native window handle.
    WindowHandle(u64),
    Events(DynamicEvents),
    SpeakerArrangement(DynamicSpeakerArrangement),
    IoProperties(VstIoProperties),
    ParameterProperties(VstParameterProperties),
    MidiKeyName(VstMidiKeyName),
    /// The caller passed an empty buffer and expects a string back.
    WantsString,
    WantsChunkBuffer,
    WantsRect,
    WantsDescriptorUpdate,
    WantsTimeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub opcode: i32,
    pub index: i32,
    pub value: i64,
    pub option: f32,
    pub payload: EventPayload,
    /// Second payload for opcodes that also pass a structure through `value`.
    pub value_payload: Option<EventPayload>,
}

impl Event {
    pub fn new(opcode: i32, index: i32, value: i64, option: f32, payload: EventPayload) -> Self {
        Self {
            opcode,
            index,
            value,
            option,
            payload,
            value_payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventResultPayload {
    Null,
    String(#[serde(deserialize_with = "limits::string")] String),
    Chunk(#[serde(deserialize_with = "limits::bytes")] Vec<u8>),
    Descriptor(PluginDescriptor),
    Rect(VstRect),
    TimeInfo(VstTimeInfo),
    SpeakerArrangement(DynamicSpeakerArrangement),
    IoProperties(VstIoProperties),
    ParameterProperties(VstParameterProperties),
    MidiKeyName(VstMidiKeyName),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub return_value: i64,
    pub payload: EventResultPayload,
    pub value_payload: Option<EventResultPayload>,
}

impl EventResult {
    pub fn new(return_value: i64) -> Self {
        Self {
            return_value,
            payload: EventResultPayload::Null,
            value_payload: None,
        }
    }

    pub fn with_payload(return_value: i64, payload: EventResultPayload) -> Self {
        Self {
            return_value,
            payload,
            value_payload: None,
        }
    }
}

/// Parameter channel request. `value: None` reads the parameter, `Some`
/// writes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub index: i32,
    pub value: Option<f32>,
}

/// Parameter channel response. Carries the value for a read and nothing for
/// a write acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterResult {
    pub value: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AudioSamples {
    Float32(#[serde(deserialize_with = "limits::channels")] Vec<Vec<f32>>),
    Float64(#[serde(deserialize_with = "limits::channels")] Vec<Vec<f64>>),
}

impl AudioSamples {
    pub fn num_channels(&self) -> usize {
        match self {
            AudioSamples::Float32(buffers) => buffers.len(),
            AudioSamples::Float64(buffers) => buffers.len(),
        }
    }
}

/// Audio channel request and response: channel-major sample buffers of
/// `sample_frames` frames each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBuffers {
    pub buffers: AudioSamples,
    pub sample_frames: u32,
}

/// Request sent to a group host's rendezvous socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRequest {
    pub plugin_path: PathBuf,
    pub instance_socket_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResponse {
    pub host_process_id: u32,
}
