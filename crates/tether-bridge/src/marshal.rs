//! Event marshaling: native `(opcode, index, value, data, option)` calls to
//! typed [`Event`]s and back.
//!
//! Most opcodes pass a string (or nothing) through `data`. The exceptions are
//! listed in [`request_kind`], [`request_value_kind`] and [`write_back_kind`];
//! both ends of the bridge must agree on these tables.

use crate::callback::HostCallback;
use crate::codec::limits::{MAX_EVENTS, MAX_SPEAKERS};
use crate::native::*;
use crate::opcodes::dispatch;
use crate::protocol::{
    DynamicEvents, DynamicSpeakerArrangement, Event, EventPayload, EventResult,
    EventResultPayload, NativeEvent, PluginDescriptor,
};
use arc_swap::ArcSwap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

/// How a request reads its `data` (or `value`) argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Null pointer, empty buffer (wants a string) or a C string.
    Generic,
    WantsString,
    WantsDescriptorUpdate,
    WantsRect,
    WantsChunkBuffer,
    WindowHandle,
    /// `value` bytes of binary data.
    Chunk,
    Events,
    IoProperties,
    ParameterProperties,
    MidiKeyName,
    SpeakerArrangement,
}

/// What happens with a response once it comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBack {
    /// Copy a string result into `data`, if there is one.
    Generic,
    Descriptor,
    /// Store the rect in the instance and write a pointer to it into `data`.
    RectPointer,
    /// Store the chunk in the instance and write a pointer to it into `data`.
    ChunkPointer,
    IoProperties,
    ParameterProperties,
    MidiKeyName,
    SpeakerArrangement,
}

pub fn request_kind(opcode: i32) -> PayloadKind {
    match opcode {
        // Some plugins only finish filling in their descriptor when opened
        dispatch::OPEN => PayloadKind::WantsDescriptorUpdate,
        dispatch::EDIT_GET_RECT => PayloadKind::WantsRect,
        dispatch::EDIT_OPEN => PayloadKind::WindowHandle,
        dispatch::GET_CHUNK => PayloadKind::WantsChunkBuffer,
        dispatch::SET_CHUNK => PayloadKind::Chunk,
        dispatch::PROCESS_EVENTS => PayloadKind::Events,
        // Hosts may pre-populate these, so the struct is sent rather than a marker
        dispatch::GET_INPUT_PROPERTIES | dispatch::GET_OUTPUT_PROPERTIES => {
            PayloadKind::IoProperties
        }
        dispatch::GET_PARAMETER_PROPERTIES => PayloadKind::ParameterProperties,
        dispatch::GET_MIDI_KEY_NAME => PayloadKind::MidiKeyName,
        // Output arrangement; the input arrangement travels through `value`
        dispatch::SET_SPEAKER_ARRANGEMENT | dispatch::GET_SPEAKER_ARRANGEMENT => {
            PayloadKind::SpeakerArrangement
        }
        dispatch::GET_PROGRAM_NAME
        | dispatch::GET_PARAM_LABEL
        | dispatch::GET_PARAM_DISPLAY
        | dispatch::GET_PARAM_NAME
        | dispatch::GET_PROGRAM_NAME_INDEXED
        | dispatch::GET_EFFECT_NAME
        | dispatch::GET_VENDOR_STRING
        | dispatch::GET_PRODUCT_STRING
        | dispatch::SHELL_GET_NEXT_PLUGIN => PayloadKind::WantsString,
        _ => PayloadKind::Generic,
    }
}

/// Second payload read from the `value` slot.
pub fn request_value_kind(opcode: i32) -> Option<PayloadKind> {
    match opcode {
        dispatch::SET_SPEAKER_ARRANGEMENT | dispatch::GET_SPEAKER_ARRANGEMENT => {
            Some(PayloadKind::SpeakerArrangement)
        }
        _ => None,
    }
}

pub fn write_back_kind(opcode: i32) -> WriteBack {
    match opcode {
        dispatch::OPEN => WriteBack::Descriptor,
        dispatch::EDIT_GET_RECT => WriteBack::RectPointer,
        dispatch::GET_CHUNK => WriteBack::ChunkPointer,
        dispatch::GET_INPUT_PROPERTIES | dispatch::GET_OUTPUT_PROPERTIES => {
            WriteBack::IoProperties
        }
        dispatch::GET_PARAMETER_PROPERTIES => WriteBack::ParameterProperties,
        dispatch::GET_MIDI_KEY_NAME => WriteBack::MidiKeyName,
        dispatch::GET_SPEAKER_ARRANGEMENT => WriteBack::SpeakerArrangement,
        _ => WriteBack::Generic,
    }
}

/// Whether the response's value payload is written back through `value`.
pub fn writes_back_value(opcode: i32) -> bool {
    opcode == dispatch::GET_SPEAKER_ARRANGEMENT
}

/// Read one argument slot as `kind`.
///
/// # Safety
/// `data` must be null or point to what the native calling convention
/// promises for an opcode with this payload kind. For [`PayloadKind::Chunk`]
/// it must point to at least `value` readable bytes.
pub unsafe fn read_payload(kind: PayloadKind, value: isize, data: *const c_void) -> EventPayload {
    match kind {
        PayloadKind::Generic => read_generic(data),
        PayloadKind::WantsString => EventPayload::WantsString,
        PayloadKind::WantsDescriptorUpdate => EventPayload::WantsDescriptorUpdate,
        PayloadKind::WantsRect => EventPayload::WantsRect,
        PayloadKind::WantsChunkBuffer => EventPayload::WantsChunkBuffer,
        PayloadKind::WindowHandle => EventPayload::WindowHandle(data as usize as u64),
        _ if data.is_null() => EventPayload::Null,
        PayloadKind::Chunk => {
            let len = value.max(0) as usize;
            EventPayload::Chunk(std::slice::from_raw_parts(data as *const u8, len).to_vec())
        }
        PayloadKind::Events => EventPayload::Events(read_events(data as *const VstEvents)),
        PayloadKind::IoProperties => {
            EventPayload::IoProperties(ptr::read_unaligned(data as *const VstIoProperties))
        }
        PayloadKind::ParameterProperties => EventPayload::ParameterProperties(
            ptr::read_unaligned(data as *const VstParameterProperties),
        ),
        PayloadKind::MidiKeyName => {
            EventPayload::MidiKeyName(ptr::read_unaligned(data as *const VstMidiKeyName))
        }
        PayloadKind::SpeakerArrangement => {
            EventPayload::SpeakerArrangement(read_speaker_arrangement(data))
        }
    }
}

unsafe fn read_generic(data: *const c_void) -> EventPayload {
    if data.is_null() {
        return EventPayload::Null;
    }

    let c_str = data as *const c_char;
    if *c_str == 0 {
        EventPayload::WantsString
    } else {
        EventPayload::String(CStr::from_ptr(c_str).to_string_lossy().into_owned())
    }
}

/// # Safety
/// `events` must point to a valid native event list.
pub unsafe fn read_events(events: *const VstEvents) -> DynamicEvents {
    let mut result = DynamicEvents::new();
    let num_events = ((*events).num_events.max(0) as usize).min(MAX_EVENTS);
    let pointers = ptr::addr_of!((*events).events) as *const *const VstEvent;

    for i in 0..num_events {
        let event = *pointers.add(i);
        if event.is_null() {
            continue;
        }

        result.push(match (*event).event_type {
            EVENT_TYPE_MIDI => NativeEvent::Midi(ptr::read_unaligned(event as *const VstMidiEvent)),
            EVENT_TYPE_SYSEX => {
                let sysex = &*(event as *const VstMidiSysexEvent);
                let data = if sysex.sysex_dump.is_null() {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts(sysex.sysex_dump, sysex.dump_bytes.max(0) as usize)
                        .to_vec()
                };
                NativeEvent::Sysex {
                    delta_frames: sysex.delta_frames,
                    flags: sysex.flags,
                    data,
                }
            }
            _ => NativeEvent::Other(ptr::read_unaligned(event)),
        });
    }

    result
}

/// # Safety
/// `data` must point to a speaker arrangement header followed by
/// `num_channels` speakers.
pub unsafe fn read_speaker_arrangement(data: *const c_void) -> DynamicSpeakerArrangement {
    let header = ptr::read_unaligned(data as *const VstSpeakerArrangementHeader);
    let num_channels = (header.num_channels.max(0) as usize).min(MAX_SPEAKERS);
    let first = (data as *const u8).add(SPEAKER_ARRANGEMENT_HEADER_SIZE) as *const VstSpeaker;

    DynamicSpeakerArrangement {
        arrangement_type: header.arrangement_type,
        speakers: (0..num_channels)
            .map(|i| ptr::read_unaligned(first.add(i)))
            .collect(),
    }
}

/// # Safety
/// `data` must have room for the header and every speaker in `arrangement`.
pub unsafe fn write_speaker_arrangement(arrangement: &DynamicSpeakerArrangement, data: *mut c_void) {
    ptr::write_unaligned(
        data as *mut VstSpeakerArrangementHeader,
        VstSpeakerArrangementHeader {
            arrangement_type: arrangement.arrangement_type,
            num_channels: arrangement.speakers.len() as i32,
        },
    );
    let first = (data as *mut u8).add(SPEAKER_ARRANGEMENT_HEADER_SIZE) as *mut VstSpeaker;
    for (i, speaker) in arrangement.speakers.iter().enumerate() {
        ptr::write_unaligned(first.add(i), *speaker);
    }
}

/// Native event list built from a [`DynamicEvents`]. Borrows the sysex data
/// of the events it was built from.
pub struct NativeEventList<'a> {
    header: Vec<usize>,
    _midi: Vec<VstMidiEvent>,
    _sysex: Vec<VstMidiSysexEvent>,
    _other: Vec<VstEvent>,
    _events: PhantomData<&'a DynamicEvents>,
}

enum Slot {
    Midi(usize),
    Sysex(usize),
    Other(usize),
}

impl DynamicEvents {
    pub fn to_native(&self) -> NativeEventList<'_> {
        let mut midi = Vec::new();
        let mut sysex = Vec::new();
        let mut other = Vec::new();
        let mut slots = Vec::with_capacity(self.events.len());

        for event in &self.events {
            slots.push(match event {
                NativeEvent::Midi(e) => {
                    midi.push(*e);
                    Slot::Midi(midi.len() - 1)
                }
                NativeEvent::Sysex {
                    delta_frames,
                    flags,
                    data,
                } => {
                    sysex.push(VstMidiSysexEvent {
                        event_type: EVENT_TYPE_SYSEX,
                        byte_size: std::mem::size_of::<VstMidiSysexEvent>() as i32,
                        delta_frames: *delta_frames,
                        flags: *flags,
                        dump_bytes: data.len() as i32,
                        resvd1: 0,
                        sysex_dump: data.as_ptr() as *mut u8,
                        resvd2: 0,
                    });
                    Slot::Sysex(sysex.len() - 1)
                }
                NativeEvent::Other(e) => {
                    other.push(*e);
                    Slot::Other(other.len() - 1)
                }
            });
        }

        // Header words, then one pointer per event (at least the two declared)
        let mut header = vec![0usize; 2 + slots.len().max(2)];
        // SAFETY: `header` is pointer-aligned and large enough for the
        // `VstEvents` header plus `slots.len()` pointers. The event vectors
        // are not touched again after this, so the pointers stay valid for as
        // long as the list lives.
        unsafe {
            let list = header.as_mut_ptr() as *mut VstEvents;
            (*list).num_events = slots.len() as i32;
            (*list).reserved = 0;
            let pointers = ptr::addr_of_mut!((*list).events) as *mut *mut VstEvent;
            for (i, slot) in slots.iter().enumerate() {
                let event = match slot {
                    Slot::Midi(j) => midi.as_mut_ptr().add(*j) as *mut VstEvent,
                    Slot::Sysex(j) => sysex.as_mut_ptr().add(*j) as *mut VstEvent,
                    Slot::Other(j) => other.as_mut_ptr().add(*j),
                };
                *pointers.add(i) = event;
            }
        }

        NativeEventList {
            header,
            _midi: midi,
            _sysex: sysex,
            _other: other,
            _events: PhantomData,
        }
    }
}

impl NativeEventList<'_> {
    pub fn as_ptr(&mut self) -> *mut VstEvents {
        self.header.as_mut_ptr() as *mut VstEvents
    }
}

/// Storage the instance keeps for results it hands out by pointer. A pointer
/// stays valid until the next call with the same opcode.
#[derive(Debug, Default)]
pub struct DispatchBuffers {
    pub chunk: Vec<u8>,
    pub rect: VstRect,
}

/// Converts dispatch calls from the native host into events and applies the
/// plugin's responses.
pub struct DispatchConverter<'a> {
    buffers: &'a mut DispatchBuffers,
    descriptor: &'a ArcSwap<PluginDescriptor>,
}

impl<'a> DispatchConverter<'a> {
    pub fn new(buffers: &'a mut DispatchBuffers, descriptor: &'a ArcSwap<PluginDescriptor>) -> Self {
        Self {
            buffers,
            descriptor,
        }
    }

    /// # Safety
    /// `data` and `value` must follow the native calling convention for
    /// `opcode`.
    pub unsafe fn encode_request(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> Event {
        let mut event = Event::new(
            opcode,
            index,
            value as i64,
            option,
            read_payload(request_kind(opcode), value, data),
        );
        event.value_payload =
            request_value_kind(opcode).map(|kind| read_payload(kind, 0, value as *const c_void));
        event
    }

    /// Write the response back into the caller's arguments and return the
    /// value the native call should return.
    ///
    /// # Safety
    /// Same contract as [`Self::encode_request`] for the same call.
    pub unsafe fn apply_response(
        &mut self,
        opcode: i32,
        value: isize,
        data: *mut c_void,
        response: &EventResult,
    ) -> isize {
        match (write_back_kind(opcode), &response.payload) {
            (WriteBack::Descriptor, EventResultPayload::Descriptor(descriptor)) => {
                self.descriptor.store(Arc::new(*descriptor));
            }
            (_, EventResultPayload::Null) => {}
            (_, _) if data.is_null() => {}
            (WriteBack::RectPointer, EventResultPayload::Rect(rect)) => {
                self.buffers.rect = *rect;
                *(data as *mut *mut VstRect) = &mut self.buffers.rect;
            }
            (WriteBack::ChunkPointer, EventResultPayload::Chunk(chunk)) => {
                self.buffers.chunk.clone_from(chunk);
                *(data as *mut *mut u8) = self.buffers.chunk.as_mut_ptr();
            }
            (WriteBack::IoProperties, EventResultPayload::IoProperties(properties)) => {
                ptr::write_unaligned(data as *mut VstIoProperties, *properties);
            }
            (WriteBack::ParameterProperties, EventResultPayload::ParameterProperties(properties)) => {
                ptr::write_unaligned(data as *mut VstParameterProperties, *properties);
            }
            (WriteBack::MidiKeyName, EventResultPayload::MidiKeyName(key_name)) => {
                ptr::write_unaligned(data as *mut VstMidiKeyName, *key_name);
            }
            (WriteBack::SpeakerArrangement, EventResultPayload::SpeakerArrangement(arrangement)) => {
                write_speaker_arrangement(arrangement, data);
            }
            (_, EventResultPayload::String(s)) => write_c_string(s, data),
            (kind, payload) => {
                tracing::warn!(
                    opcode,
                    ?kind,
                    ?payload,
                    "response payload does not match the opcode, ignoring it"
                );
            }
        }

        if writes_back_value(opcode) && value != 0 {
            if let Some(EventResultPayload::SpeakerArrangement(arrangement)) =
                &response.value_payload
            {
                write_speaker_arrangement(arrangement, value as *mut c_void);
            }
        }

        response.return_value as isize
    }
}

/// Write `s` as a terminated C string into a buffer whose size the native
/// interface does not pass along.
///
/// Longer strings are cut at [`STRING_BUFFER_SIZE`] bytes, terminator
/// included, on a character boundary.
unsafe fn write_c_string(s: &str, data: *mut c_void) {
    let bytes = clamp_c_string(s, STRING_BUFFER_SIZE);
    let dest = data as *mut u8;
    ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
    *dest.add(bytes.len()) = 0;
}

/// The bytes of `s` that fit into `capacity` bytes with a terminator.
fn clamp_c_string(s: &str, capacity: usize) -> &[u8] {
    let limit = capacity.saturating_sub(1);
    if s.len() <= limit {
        return s.as_bytes();
    }

    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    tracing::warn!(
        length = s.len(),
        kept = end,
        "string result is longer than a native string buffer, truncating it"
    );
    &s.as_bytes()[..end]
}

/// Backing storage for one native argument while a callback is running.
enum NativeArg<'a> {
    Null,
    Pointer(usize),
    CString(CString),
    Bytes(Vec<u8>),
    Events(NativeEventList<'a>),
    IoProperties(Box<VstIoProperties>),
    ParameterProperties(Box<VstParameterProperties>),
    MidiKeyName(Box<VstMidiKeyName>),
    SpeakerArrangement(Vec<u64>),
}

/// Size of the buffer handed to the host when the plugin asks for a string.
const STRING_BUFFER_SIZE: usize = 1024;

impl<'a> NativeArg<'a> {
    fn from_payload(payload: &'a EventPayload) -> Self {
        match payload {
            EventPayload::Null
            | EventPayload::WantsTimeInfo
            | EventPayload::WantsDescriptorUpdate
            | EventPayload::WantsRect
            | EventPayload::WantsChunkBuffer => NativeArg::Null,
            EventPayload::String(s) => NativeArg::CString(
                CString::new(s.replace('\0', "")).unwrap_or_default(),
            ),
            EventPayload::WantsString => NativeArg::Bytes(vec![0; STRING_BUFFER_SIZE]),
            EventPayload::Chunk(bytes) => NativeArg::Bytes(bytes.clone()),
            EventPayload::WindowHandle(handle) => NativeArg::Pointer(*handle as usize),
            EventPayload::Events(events) => NativeArg::Events(events.to_native()),
            EventPayload::IoProperties(p) => NativeArg::IoProperties(Box::new(*p)),
            EventPayload::ParameterProperties(p) => NativeArg::ParameterProperties(Box::new(*p)),
            EventPayload::MidiKeyName(k) => NativeArg::MidiKeyName(Box::new(*k)),
            EventPayload::SpeakerArrangement(arrangement) => {
                let bytes = SPEAKER_ARRANGEMENT_HEADER_SIZE
                    + arrangement.speakers.len() * std::mem::size_of::<VstSpeaker>();
                let mut storage = vec![0u64; bytes.div_ceil(8)];
                // SAFETY: `storage` holds at least `bytes` bytes.
                unsafe {
                    write_speaker_arrangement(arrangement, storage.as_mut_ptr() as *mut c_void)
                };
                NativeArg::SpeakerArrangement(storage)
            }
        }
    }

    fn as_ptr(&mut self) -> *mut c_void {
        match self {
            NativeArg::Null => ptr::null_mut(),
            NativeArg::Pointer(p) => *p as *mut c_void,
            NativeArg::CString(s) => s.as_ptr() as *mut c_void,
            NativeArg::Bytes(b) => b.as_mut_ptr() as *mut c_void,
            NativeArg::Events(list) => list.as_ptr() as *mut c_void,
            NativeArg::IoProperties(p) => p.as_mut() as *mut VstIoProperties as *mut c_void,
            NativeArg::ParameterProperties(p) => {
                p.as_mut() as *mut VstParameterProperties as *mut c_void
            }
            NativeArg::MidiKeyName(k) => k.as_mut() as *mut VstMidiKeyName as *mut c_void,
            NativeArg::SpeakerArrangement(s) => s.as_mut_ptr() as *mut c_void,
        }
    }

    /// What the host left behind in this argument after the call.
    fn into_result(self, requested: &EventPayload) -> EventResultPayload {
        match (self, requested) {
            (NativeArg::Bytes(buffer), EventPayload::WantsString) => {
                let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
                EventResultPayload::String(String::from_utf8_lossy(&buffer[..end]).into_owned())
            }
            (NativeArg::IoProperties(p), _) => EventResultPayload::IoProperties(*p),
            (NativeArg::ParameterProperties(p), _) => EventResultPayload::ParameterProperties(*p),
            (NativeArg::MidiKeyName(k), _) => EventResultPayload::MidiKeyName(*k),
            (NativeArg::SpeakerArrangement(mut storage), _) => {
                // SAFETY: the storage was filled by `write_speaker_arrangement`
                // and the host may only update it in place.
                EventResultPayload::SpeakerArrangement(unsafe {
                    read_speaker_arrangement(storage.as_mut_ptr() as *const c_void)
                })
            }
            _ => EventResultPayload::Null,
        }
    }
}

/// Forward an event from the remote plugin to the native host callback and
/// package whatever the host returned.
pub fn passthrough_event(host: &dyn HostCallback, event: &Event) -> EventResult {
    let mut data = NativeArg::from_payload(&event.payload);
    let return_value = host.call(
        event.opcode,
        event.index,
        event.value as isize,
        data.as_ptr(),
        event.option,
    );

    let payload = if matches!(event.payload, EventPayload::WantsTimeInfo) {
        if return_value == 0 {
            EventResultPayload::Null
        } else {
            // SAFETY: the host returns a pointer to its time info struct for
            // time info queries, valid until the next query.
            EventResultPayload::TimeInfo(unsafe {
                ptr::read_unaligned(return_value as *const VstTimeInfo)
            })
        }
    } else {
        data.into_result(&event.payload)
    };

    EventResult {
        return_value: return_value as i64,
        payload,
        value_payload: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::opcodes::host;
    use parking_lot::Mutex;

    fn struct_bytes<T>(value: &T) -> &[u8] {
        // SAFETY: only used on padding-free `repr(C)` structs.
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
    }

    /// Push an event and its response through the wire codec, as the remote
    /// side would see and answer it.
    fn over_the_wire(event: &Event, answer: impl FnOnce(Event) -> EventResult) -> EventResult {
        let remote_event: Event = codec::decode(&codec::encode(event).unwrap()).unwrap();
        assert_eq!(&remote_event, event);
        let response = answer(remote_event);
        codec::decode(&codec::encode(&response).unwrap()).unwrap()
    }

    fn converter_parts() -> (DispatchBuffers, ArcSwap<PluginDescriptor>) {
        (
            DispatchBuffers::default(),
            ArcSwap::from_pointee(PluginDescriptor::new(2, 2)),
        )
    }

    fn sample_speakers(count: usize, seed: f32) -> Vec<u8> {
        let mut raw = vec![0u8; SPEAKER_ARRANGEMENT_HEADER_SIZE + count * 112];
        let arrangement = DynamicSpeakerArrangement {
            arrangement_type: count as i32 + 100,
            speakers: (0..count)
                .map(|i| VstSpeaker {
                    azimuth: seed + i as f32,
                    elevation: -seed,
                    radius: 1.0,
                    name: ByteArray::from_str_lossy(&format!("Speaker {}", i)),
                    speaker_type: i as i32,
                    ..Default::default()
                })
                .collect(),
        };
        unsafe { write_speaker_arrangement(&arrangement, raw.as_mut_ptr() as *mut c_void) };
        raw
    }

    #[test]
    fn test_payload_kind_table() {
        assert_eq!(request_kind(dispatch::OPEN), PayloadKind::WantsDescriptorUpdate);
        assert_eq!(request_kind(dispatch::GET_CHUNK), PayloadKind::WantsChunkBuffer);
        assert_eq!(request_kind(dispatch::SET_CHUNK), PayloadKind::Chunk);
        assert_eq!(request_kind(dispatch::PROCESS_EVENTS), PayloadKind::Events);
        assert_eq!(request_kind(dispatch::EDIT_GET_RECT), PayloadKind::WantsRect);
        assert_eq!(request_kind(dispatch::GET_EFFECT_NAME), PayloadKind::WantsString);
        assert_eq!(request_kind(dispatch::CAN_DO), PayloadKind::Generic);
        assert_eq!(request_kind(12345), PayloadKind::Generic);
        assert_eq!(
            request_value_kind(dispatch::GET_SPEAKER_ARRANGEMENT),
            Some(PayloadKind::SpeakerArrangement)
        );
        assert_eq!(request_value_kind(dispatch::SET_CHUNK), None);
        assert!(writes_back_value(dispatch::GET_SPEAKER_ARRANGEMENT));
        assert!(!writes_back_value(dispatch::SET_SPEAKER_ARRANGEMENT));
    }

    #[test]
    fn test_generic_read_distinguishes_null_empty_and_string() {
        let empty = [0u8; 16];
        let query = CString::new("sendVstEvents").unwrap();
        unsafe {
            assert_eq!(read_payload(PayloadKind::Generic, 0, ptr::null()), EventPayload::Null);
            assert_eq!(
                read_payload(PayloadKind::Generic, 0, empty.as_ptr() as *const c_void),
                EventPayload::WantsString
            );
            assert_eq!(
                read_payload(PayloadKind::Generic, 0, query.as_ptr() as *const c_void),
                EventPayload::String("sendVstEvents".into())
            );
        }
    }

    #[test]
    fn test_string_opcode_ignores_prepopulated_buffer() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        let mut name = [0u8; 64];
        name[..7].copy_from_slice(b"garbage");
        let event = unsafe {
            converter.encode_request(
                dispatch::GET_EFFECT_NAME,
                0,
                0,
                name.as_mut_ptr() as *mut c_void,
                0.0,
            )
        };
        assert_eq!(event.payload, EventPayload::WantsString);

        let response = over_the_wire(&event, |_| {
            EventResult::with_payload(1, EventResultPayload::String("Big Synth".into()))
        });
        let ret = unsafe {
            converter.apply_response(
                dispatch::GET_EFFECT_NAME,
                0,
                name.as_mut_ptr() as *mut c_void,
                &response,
            )
        };
        assert_eq!(ret, 1);
        assert_eq!(&name[..10], b"Big Synth\0");
    }

    #[test]
    fn test_chunk_get_and_set() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        let state: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        let set = unsafe {
            converter.encode_request(
                dispatch::SET_CHUNK,
                0,
                state.len() as isize,
                state.as_ptr() as *mut c_void,
                0.0,
            )
        };
        let received = over_the_wire(&set, |remote| {
            assert_eq!(remote.payload, EventPayload::Chunk(state.clone()));
            EventResult::new(1)
        });
        assert_eq!(received.return_value, 1);

        let mut chunk_ptr: *mut u8 = ptr::null_mut();
        let get = unsafe {
            converter.encode_request(
                dispatch::GET_CHUNK,
                0,
                0,
                &mut chunk_ptr as *mut *mut u8 as *mut c_void,
                0.0,
            )
        };
        assert_eq!(get.payload, EventPayload::WantsChunkBuffer);
        let response = over_the_wire(&get, |_| {
            EventResult::with_payload(state.len() as i64, EventResultPayload::Chunk(state.clone()))
        });
        let len = unsafe {
            converter.apply_response(
                dispatch::GET_CHUNK,
                0,
                &mut chunk_ptr as *mut *mut u8 as *mut c_void,
                &response,
            )
        };

        assert_eq!(len as usize, state.len());
        let returned = unsafe { std::slice::from_raw_parts(chunk_ptr, len as usize) };
        assert_eq!(returned, &state[..]);
    }

    #[test]
    fn test_editor_rect_pointer() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);
        let rect = VstRect {
            top: 0,
            left: 0,
            bottom: 480,
            right: 640,
        };

        let mut rect_ptr: *mut VstRect = ptr::null_mut();
        let data = &mut rect_ptr as *mut *mut VstRect as *mut c_void;
        let event = unsafe { converter.encode_request(dispatch::EDIT_GET_RECT, 0, 0, data, 0.0) };
        assert_eq!(event.payload, EventPayload::WantsRect);

        // No rect from the plugin leaves the pointer alone
        let nothing = over_the_wire(&event, |_| EventResult::new(0));
        unsafe { converter.apply_response(dispatch::EDIT_GET_RECT, 0, data, &nothing) };
        assert!(rect_ptr.is_null());

        let response = over_the_wire(&event, |_| {
            EventResult::with_payload(1, EventResultPayload::Rect(rect))
        });
        unsafe { converter.apply_response(dispatch::EDIT_GET_RECT, 0, data, &response) };
        assert!(!rect_ptr.is_null());
        assert_eq!(struct_bytes(unsafe { &*rect_ptr }), struct_bytes(&rect));
    }

    #[test]
    fn test_long_string_result_is_truncated() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        // Two byte characters, so the cut cannot land on the exact limit
        let long = "é".repeat(STRING_BUFFER_SIZE);
        let response = EventResult::with_payload(1, EventResultPayload::String(long));

        let mut name = vec![0xaau8; STRING_BUFFER_SIZE + 64];
        let ret = unsafe {
            converter.apply_response(dispatch::GET_EFFECT_NAME, 0, name.as_mut_ptr().cast(), &response)
        };
        assert_eq!(ret, 1);

        let written = CStr::from_bytes_until_nul(&name).unwrap();
        assert_eq!(written.to_bytes().len(), STRING_BUFFER_SIZE - 2);
        assert!(std::str::from_utf8(written.to_bytes()).is_ok());
        assert!(name[STRING_BUFFER_SIZE..].iter().all(|&b| b == 0xaa));

        assert_eq!(clamp_c_string("short", STRING_BUFFER_SIZE), b"short");
        assert_eq!(clamp_c_string("abcdef", 4), b"abc");
    }

    #[test]
    fn test_io_properties_byte_for_byte() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        // Hosts may hand over a pre-populated struct
        let original = VstIoProperties {
            label: ByteArray::from_str_lossy("Main In L"),
            flags: 0b101,
            arrangement_type: 1,
            short_label: ByteArray::from_str_lossy("InL"),
            future: ByteArray([7; 48]),
        };
        let mut input = original;
        let event = unsafe {
            converter.encode_request(
                dispatch::GET_INPUT_PROPERTIES,
                0,
                0,
                &mut input as *mut VstIoProperties as *mut c_void,
                0.0,
            )
        };

        let response = over_the_wire(&event, |remote| match remote.payload {
            EventPayload::IoProperties(p) => {
                EventResult::with_payload(1, EventResultPayload::IoProperties(p))
            }
            other => panic!("Expected IoProperties, got {:?}", other),
        });

        let mut output = VstIoProperties::default();
        unsafe {
            converter.apply_response(
                dispatch::GET_INPUT_PROPERTIES,
                0,
                &mut output as *mut VstIoProperties as *mut c_void,
                &response,
            )
        };
        assert_eq!(struct_bytes(&output), struct_bytes(&original));
    }

    #[test]
    fn test_parameter_properties_and_key_name_write_back() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        let properties = VstParameterProperties {
            step_float: 0.1,
            label: ByteArray::from_str_lossy("Cutoff"),
            flags: 1,
            max_integer: 127,
            category_label: ByteArray::from_str_lossy("Filter"),
            ..Default::default()
        };
        let mut output = VstParameterProperties::default();
        let response = EventResult::with_payload(1, EventResultPayload::ParameterProperties(properties));
        unsafe {
            converter.apply_response(
                dispatch::GET_PARAMETER_PROPERTIES,
                0,
                &mut output as *mut VstParameterProperties as *mut c_void,
                &response,
            )
        };
        assert_eq!(struct_bytes(&output), struct_bytes(&properties));

        let key_name = VstMidiKeyName {
            this_program_index: 2,
            this_key_number: 36,
            key_name: ByteArray::from_str_lossy("Kick"),
            ..Default::default()
        };
        let mut output = VstMidiKeyName::default();
        let response = EventResult::with_payload(1, EventResultPayload::MidiKeyName(key_name));
        unsafe {
            converter.apply_response(
                dispatch::GET_MIDI_KEY_NAME,
                0,
                &mut output as *mut VstMidiKeyName as *mut c_void,
                &response,
            )
        };
        assert_eq!(output, key_name);
    }

    #[test]
    fn test_speaker_arrangement_slots() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        // Input arrangement through `value`, output through `data`
        let input = sample_speakers(2, 10.0);
        let output = sample_speakers(6, 20.0);
        let mut input_host = vec![0u8; input.len()];
        let mut output_host = vec![0u8; output.len()];
        input_host.copy_from_slice(&input);
        output_host.copy_from_slice(&output);

        let value = input_host.as_mut_ptr() as isize;
        let data = output_host.as_mut_ptr() as *mut c_void;
        let event = unsafe {
            converter.encode_request(dispatch::GET_SPEAKER_ARRANGEMENT, 0, value, data, 0.0)
        };

        let (out_arrangement, in_arrangement) = match (&event.payload, &event.value_payload) {
            (
                EventPayload::SpeakerArrangement(out_arrangement),
                Some(EventPayload::SpeakerArrangement(in_arrangement)),
            ) => (out_arrangement.clone(), in_arrangement.clone()),
            other => panic!("Expected two speaker arrangements, got {:?}", other),
        };
        assert_eq!(out_arrangement.speakers.len(), 6);
        assert_eq!(in_arrangement.speakers.len(), 2);

        let response = over_the_wire(&event, |_| EventResult {
            return_value: 1,
            payload: EventResultPayload::SpeakerArrangement(out_arrangement),
            value_payload: Some(EventResultPayload::SpeakerArrangement(in_arrangement)),
        });

        input_host.fill(0);
        output_host.fill(0);
        unsafe {
            converter.apply_response(dispatch::GET_SPEAKER_ARRANGEMENT, value, data, &response)
        };
        assert_eq!(input_host, input);
        assert_eq!(output_host, output);
    }

    #[test]
    fn test_open_updates_descriptor() {
        let (mut buffers, descriptor) = converter_parts();
        let mut converter = DispatchConverter::new(&mut buffers, &descriptor);

        let event = unsafe { converter.encode_request(dispatch::OPEN, 0, 0, ptr::null_mut(), 0.0) };
        assert_eq!(event.payload, EventPayload::WantsDescriptorUpdate);

        let mut late = PluginDescriptor::new(2, 2);
        late.num_params = 64;
        late.unique_id = 0x5465_7468;
        let response = over_the_wire(&event, |_| {
            EventResult::with_payload(0, EventResultPayload::Descriptor(late))
        });
        unsafe { converter.apply_response(dispatch::OPEN, 0, ptr::null_mut(), &response) };
        assert_eq!(**descriptor.load(), late);
    }

    #[test]
    fn test_events_native_roundtrip() {
        let mut events = DynamicEvents::new();
        events.push(NativeEvent::Midi(VstMidiEvent::new(0, [0x90, 60, 100])));
        events.push(NativeEvent::Sysex {
            delta_frames: 3,
            flags: 1,
            data: vec![0xf0, 0x41, 0x10, 0x42, 0xf7],
        });
        events.push(NativeEvent::Midi(VstMidiEvent::new(17, [0x80, 60, 0])));

        let mut native = events.to_native();
        let read_back = unsafe { read_events(native.as_ptr()) };
        assert_eq!(read_back, events);
    }

    #[test]
    fn test_passthrough_string_and_events() {
        let calls = Mutex::new(Vec::new());
        let host = |opcode: i32, _index: i32, _value: isize, data: *mut c_void, _option: f32| {
            match opcode {
                host::GET_VENDOR_STRING => {
                    unsafe { write_c_string("Tether Labs", data) };
                    1
                }
                host::PROCESS_EVENTS => {
                    let events = unsafe { read_events(data as *const VstEvents) };
                    calls.lock().push(events.len());
                    1
                }
                host::CAN_DO => {
                    let query = unsafe { CStr::from_ptr(data as *const c_char) };
                    (query.to_bytes() == b"sendVstEvents") as isize
                }
                _ => 0,
            }
        };

        let vendor = passthrough_event(
            &host,
            &Event::new(host::GET_VENDOR_STRING, 0, 0, 0.0, EventPayload::WantsString),
        );
        assert_eq!(vendor.payload, EventResultPayload::String("Tether Labs".into()));

        let can_do = passthrough_event(
            &host,
            &Event::new(
                host::CAN_DO,
                0,
                0,
                0.0,
                EventPayload::String("sendVstEvents".into()),
            ),
        );
        assert_eq!(can_do.return_value, 1);

        let mut events = DynamicEvents::new();
        events.push(NativeEvent::Midi(VstMidiEvent::new(0, [0xb0, 7, 100])));
        events.push(NativeEvent::Midi(VstMidiEvent::new(1, [0xb0, 10, 64])));
        passthrough_event(
            &host,
            &Event::new(host::PROCESS_EVENTS, 0, 0, 0.0, EventPayload::Events(events)),
        );
        assert_eq!(*calls.lock(), vec![2]);
    }

    #[test]
    fn test_passthrough_time_info() {
        static TIME_INFO: VstTimeInfo = VstTimeInfo {
            sample_pos: 1024.0,
            sample_rate: 48000.0,
            nano_seconds: 0.0,
            ppq_pos: 2.0,
            tempo: 128.0,
            bar_start_pos: 0.0,
            cycle_start_pos: 0.0,
            cycle_end_pos: 0.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            smpte_offset: 0,
            smpte_frame_rate: 0,
            samples_to_next_clock: 0,
            flags: 0,
        };
        let host = |opcode: i32, _: i32, _: isize, _: *mut c_void, _: f32| {
            if opcode == host::GET_TIME {
                &TIME_INFO as *const VstTimeInfo as isize
            } else {
                0
            }
        };

        let result = passthrough_event(
            &host,
            &Event::new(host::GET_TIME, 0, 0, 0.0, EventPayload::WantsTimeInfo),
        );
        assert_eq!(result.payload, EventResultPayload::TimeInfo(TIME_INFO));
    }
}
