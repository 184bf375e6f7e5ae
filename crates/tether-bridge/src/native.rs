//! `#[repr(C)]` mirrors of the fixed-layout structures the native plugin
//! interface passes through its untyped pointer arguments.
//!
//! The structs double as wire types: every field serializes in declaration
//! order, so the owned copy that crosses the socket has the same contents the
//! native struct had, byte for byte.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// `'VstP'`, the magic number of an initialized plugin descriptor.
pub const PLUGIN_MAGIC: i32 = 0x5673_7450;

pub const EVENT_TYPE_MIDI: i32 = 1;
pub const EVENT_TYPE_SYSEX: i32 = 6;

/// Fixed-size byte array (C `char[N]`) with a serde representation that works
/// for any `N`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteArray<const N: usize>(pub [u8; N]);

impl<const N: usize> ByteArray<N> {
    /// Copy a string into a zero-padded array, truncating so that a trailing
    /// NUL always fits.
    pub fn from_str_lossy(s: &str) -> Self {
        let mut bytes = [0u8; N];
        let len = s.len().min(N.saturating_sub(1));
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self(bytes)
    }

    /// Contents up to the first NUL byte.
    pub fn to_string_lossy(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl<const N: usize> Default for ByteArray<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> fmt::Debug for ByteArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl<const N: usize> Serialize for ByteArray<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for ByteArray<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
            type Value = ByteArray<N>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "exactly {} bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                let bytes: [u8; N] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(ByteArray(bytes))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = [0u8; N];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(ByteArray(bytes))
            }
        }

        deserializer.deserialize_bytes(ArrayVisitor::<N>)
    }
}

/// Editor rectangle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VstRect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

/// Input/output pin description (`VstPinProperties`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VstIoProperties {
    pub label: ByteArray<64>,
    pub flags: i32,
    pub arrangement_type: i32,
    pub short_label: ByteArray<8>,
    pub future: ByteArray<48>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VstParameterProperties {
    pub step_float: f32,
    pub small_step_float: f32,
    pub large_step_float: f32,
    pub label: ByteArray<64>,
    pub flags: i32,
    pub min_integer: i32,
    pub max_integer: i32,
    pub step_integer: i32,
    pub large_step_integer: i32,
    pub short_label: ByteArray<8>,
    pub display_index: i16,
    pub category: i16,
    pub num_parameters_in_category: i16,
    pub reserved: i16,
    pub category_label: ByteArray<24>,
    pub future: ByteArray<16>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VstMidiKeyName {
    pub this_program_index: i32,
    pub this_key_number: i32,
    pub key_name: ByteArray<64>,
    pub reserved: i32,
    pub flags: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VstSpeaker {
    pub azimuth: f32,
    pub elevation: f32,
    pub radius: f32,
    pub reserved: f32,
    pub name: ByteArray<64>,
    pub speaker_type: i32,
    pub future: ByteArray<28>,
}

/// Header of a speaker arrangement. The native struct declares eight speakers
/// but hosts allocate `num_channels` of them, so the speakers that follow the
/// header are read through pointer arithmetic rather than a fixed array.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VstSpeakerArrangementHeader {
    pub arrangement_type: i32,
    pub num_channels: i32,
}

/// Byte offset of the first speaker after the header.
pub const SPEAKER_ARRANGEMENT_HEADER_SIZE: usize =
    std::mem::size_of::<VstSpeakerArrangementHeader>();

/// Generic event header; the payload bytes depend on `event_type`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VstEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub data: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VstMidiEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub note_length: i32,
    pub note_offset: i32,
    pub midi_data: [u8; 4],
    pub detune: i8,
    pub note_off_velocity: u8,
    pub reserved1: u8,
    pub reserved2: u8,
}

impl VstMidiEvent {
    pub fn new(delta_frames: i32, midi_data: [u8; 3]) -> Self {
        Self {
            event_type: EVENT_TYPE_MIDI,
            byte_size: std::mem::size_of::<Self>() as i32,
            delta_frames,
            midi_data: [midi_data[0], midi_data[1], midi_data[2], 0],
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct VstMidiSysexEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub dump_bytes: i32,
    pub resvd1: isize,
    pub sysex_dump: *mut u8,
    pub resvd2: isize,
}

/// Event list header. `events` is a flexible array: the host allocates
/// `num_events` pointers even though two are declared.
#[repr(C)]
#[derive(Debug)]
pub struct VstEvents {
    pub num_events: i32,
    pub reserved: isize,
    pub events: [*mut VstEvent; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VstTimeInfo {
    pub sample_pos: f64,
    pub sample_rate: f64,
    pub nano_seconds: f64,
    pub ppq_pos: f64,
    pub tempo: f64,
    pub bar_start_pos: f64,
    pub cycle_start_pos: f64,
    pub cycle_end_pos: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub smpte_offset: i32,
    pub smpte_frame_rate: i32,
    pub samples_to_next_clock: i32,
    pub flags: i32,
}
