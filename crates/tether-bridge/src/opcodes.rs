//! Opcode numbers of the native plugin interface.
//!
//! `dispatch` opcodes flow from the host to the plugin, `host` opcodes flow
//! back through the host callback.

pub mod dispatch {
    pub const OPEN: i32 = 0;
    pub const CLOSE: i32 = 1;
    pub const SET_PROGRAM: i32 = 2;
    pub const GET_PROGRAM: i32 = 3;
    pub const SET_PROGRAM_NAME: i32 = 4;
    pub const GET_PROGRAM_NAME: i32 = 5;
    pub const GET_PARAM_LABEL: i32 = 6;
    pub const GET_PARAM_DISPLAY: i32 = 7;
    pub const GET_PARAM_NAME: i32 = 8;
    pub const SET_SAMPLE_RATE: i32 = 10;
    pub const SET_BLOCK_SIZE: i32 = 11;
    pub const MAINS_CHANGED: i32 = 12;
    pub const EDIT_GET_RECT: i32 = 13;
    pub const EDIT_OPEN: i32 = 14;
    pub const EDIT_CLOSE: i32 = 15;
    pub const EDIT_IDLE: i32 = 19;
    pub const GET_CHUNK: i32 = 23;
    pub const SET_CHUNK: i32 = 24;
    pub const PROCESS_EVENTS: i32 = 25;
    pub const CAN_BE_AUTOMATED: i32 = 26;
    pub const STRING_TO_PARAMETER: i32 = 27;
    pub const GET_PROGRAM_NAME_INDEXED: i32 = 29;
    pub const GET_INPUT_PROPERTIES: i32 = 33;
    pub const GET_OUTPUT_PROPERTIES: i32 = 34;
    pub const GET_PLUG_CATEGORY: i32 = 35;
    pub const SET_SPEAKER_ARRANGEMENT: i32 = 42;
    pub const SET_BYPASS: i32 = 44;
    pub const GET_EFFECT_NAME: i32 = 45;
    pub const GET_VENDOR_STRING: i32 = 47;
    pub const GET_PRODUCT_STRING: i32 = 48;
    pub const GET_VENDOR_VERSION: i32 = 49;
    pub const VENDOR_SPECIFIC: i32 = 50;
    pub const CAN_DO: i32 = 51;
    pub const GET_TAIL_SIZE: i32 = 52;
    pub const GET_PARAMETER_PROPERTIES: i32 = 56;
    pub const GET_VST_VERSION: i32 = 58;
    pub const GET_MIDI_KEY_NAME: i32 = 66;
    pub const BEGIN_SET_PROGRAM: i32 = 67;
    pub const END_SET_PROGRAM: i32 = 68;
    pub const GET_SPEAKER_ARRANGEMENT: i32 = 69;
    pub const SHELL_GET_NEXT_PLUGIN: i32 = 70;
    pub const START_PROCESS: i32 = 71;
    pub const STOP_PROCESS: i32 = 72;
    pub const BEGIN_LOAD_BANK: i32 = 75;
    pub const BEGIN_LOAD_PROGRAM: i32 = 76;
}

pub mod host {
    pub const AUTOMATE: i32 = 0;
    pub const VERSION: i32 = 1;
    pub const CURRENT_ID: i32 = 2;
    pub const IDLE: i32 = 3;
    pub const GET_TIME: i32 = 7;
    pub const PROCESS_EVENTS: i32 = 8;
    pub const IO_CHANGED: i32 = 13;
    pub const SIZE_WINDOW: i32 = 15;
    pub const GET_SAMPLE_RATE: i32 = 16;
    pub const GET_BLOCK_SIZE: i32 = 17;
    pub const GET_INPUT_LATENCY: i32 = 18;
    pub const GET_OUTPUT_LATENCY: i32 = 19;
    pub const GET_CURRENT_PROCESS_LEVEL: i32 = 23;
    pub const GET_AUTOMATION_STATE: i32 = 24;
    pub const GET_VENDOR_STRING: i32 = 32;
    pub const GET_PRODUCT_STRING: i32 = 33;
    pub const GET_VENDOR_VERSION: i32 = 34;
    pub const CAN_DO: i32 = 37;
    pub const GET_LANGUAGE: i32 = 38;
    pub const UPDATE_DISPLAY: i32 = 42;
    pub const BEGIN_EDIT: i32 = 43;
    pub const END_EDIT: i32 = 44;
}

/// Which side of the bridge an opcode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host calling into the plugin.
    Dispatch,
    /// Plugin calling back into the host.
    HostCallback,
}

pub fn opcode_name(direction: Direction, opcode: i32) -> Option<&'static str> {
    match direction {
        Direction::Dispatch => dispatch_opcode_name(opcode),
        Direction::HostCallback => host_opcode_name(opcode),
    }
}

fn dispatch_opcode_name(opcode: i32) -> Option<&'static str> {
    use dispatch::*;

    Some(match opcode {
        OPEN => "effOpen",
        CLOSE => "effClose",
        SET_PROGRAM => "effSetProgram",
        GET_PROGRAM => "effGetProgram",
        SET_PROGRAM_NAME => "effSetProgramName",
        GET_PROGRAM_NAME => "effGetProgramName",
        GET_PARAM_LABEL => "effGetParamLabel",
        GET_PARAM_DISPLAY => "effGetParamDisplay",
        GET_PARAM_NAME => "effGetParamName",
        SET_SAMPLE_RATE => "effSetSampleRate",
        SET_BLOCK_SIZE => "effSetBlockSize",
        MAINS_CHANGED => "effMainsChanged",
        EDIT_GET_RECT => "effEditGetRect",
        EDIT_OPEN => "effEditOpen",
        EDIT_CLOSE => "effEditClose",
        EDIT_IDLE => "effEditIdle",
        GET_CHUNK => "effGetChunk",
        SET_CHUNK => "effSetChunk",
        PROCESS_EVENTS => "effProcessEvents",
        CAN_BE_AUTOMATED => "effCanBeAutomated",
        STRING_TO_PARAMETER => "effString2Parameter",
        GET_PROGRAM_NAME_INDEXED => "effGetProgramNameIndexed",
        GET_INPUT_PROPERTIES => "effGetInputProperties",
        GET_OUTPUT_PROPERTIES => "effGetOutputProperties",
        GET_PLUG_CATEGORY => "effGetPlugCategory",
        SET_SPEAKER_ARRANGEMENT => "effSetSpeakerArrangement",
        SET_BYPASS => "effSetBypass",
        GET_EFFECT_NAME => "effGetEffectName",
        GET_VENDOR_STRING => "effGetVendorString",
        GET_PRODUCT_STRING => "effGetProductString",
        GET_VENDOR_VERSION => "effGetVendorVersion",
        VENDOR_SPECIFIC => "effVendorSpecific",
        CAN_DO => "effCanDo",
        GET_TAIL_SIZE => "effGetTailSize",
        GET_PARAMETER_PROPERTIES => "effGetParameterProperties",
        GET_VST_VERSION => "effGetVstVersion",
        GET_MIDI_KEY_NAME => "effGetMidiKeyName",
        BEGIN_SET_PROGRAM => "effBeginSetProgram",
        END_SET_PROGRAM => "effEndSetProgram",
        GET_SPEAKER_ARRANGEMENT => "effGetSpeakerArrangement",
        SHELL_GET_NEXT_PLUGIN => "effShellGetNextPlugin",
        START_PROCESS => "effStartProcess",
        STOP_PROCESS => "effStopProcess",
        BEGIN_LOAD_BANK => "effBeginLoadBank",
        BEGIN_LOAD_PROGRAM => "effBeginLoadProgram",
        _ => return None,
    })
}

fn host_opcode_name(opcode: i32) -> Option<&'static str> {
    use host::*;

    Some(match opcode {
        AUTOMATE => "audioMasterAutomate",
        VERSION => "audioMasterVersion",
        CURRENT_ID => "audioMasterCurrentId",
        IDLE => "audioMasterIdle",
        GET_TIME => "audioMasterGetTime",
        PROCESS_EVENTS => "audioMasterProcessEvents",
        IO_CHANGED => "audioMasterIOChanged",
        SIZE_WINDOW => "audioMasterSizeWindow",
        GET_SAMPLE_RATE => "audioMasterGetSampleRate",
        GET_BLOCK_SIZE => "audioMasterGetBlockSize",
        GET_INPUT_LATENCY => "audioMasterGetInputLatency",
        GET_OUTPUT_LATENCY => "audioMasterGetOutputLatency",
        GET_CURRENT_PROCESS_LEVEL => "audioMasterGetCurrentProcessLevel",
        GET_AUTOMATION_STATE => "audioMasterGetAutomationState",
        GET_VENDOR_STRING => "audioMasterGetVendorString",
        GET_PRODUCT_STRING => "audioMasterGetProductString",
        GET_VENDOR_VERSION => "audioMasterGetVendorVersion",
        CAN_DO => "audioMasterCanDo",
        GET_LANGUAGE => "audioMasterGetLanguage",
        UPDATE_DISPLAY => "audioMasterUpdateDisplay",
        BEGIN_EDIT => "audioMasterBeginEdit",
        END_EDIT => "audioMasterEndEdit",
        _ => return None,
    })
}

/// Opcodes a host or plugin calls many times per second. These are only
/// logged at the most verbose level.
pub fn is_periodic(direction: Direction, opcode: i32) -> bool {
    match direction {
        Direction::Dispatch => matches!(
            opcode,
            dispatch::EDIT_IDLE | dispatch::PROCESS_EVENTS | dispatch::GET_TAIL_SIZE
        ),
        Direction::HostCallback => matches!(
            opcode,
            host::GET_TIME | host::GET_CURRENT_PROCESS_LEVEL | host::IDLE
        ),
    }
}
