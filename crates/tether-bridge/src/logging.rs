//! Log sink setup and event tracing.
//!
//! Everything goes through `tracing`. [`init`] installs a fmt subscriber the
//! first time a bridge is created in a process; later calls reuse it.
//!
//! `TETHER_DEBUG_FILE` redirects output to a file. `TETHER_DEBUG_LEVEL` picks
//! how much event traffic is logged (see [`Verbosity`]), optionally followed
//! by `+editor` to trace editor embedding.

use crate::config::{BridgeConfig, PluginPaths};
use crate::opcodes::{self, Direction};
use crate::protocol::{Event, EventPayload, EventResult, EventResultPayload};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::EnvFilter;

pub const DEBUG_FILE_VAR: &str = "TETHER_DEBUG_FILE";
pub const DEBUG_LEVEL_VAR: &str = "TETHER_DEBUG_LEVEL";

const EDITOR_TRACING_FLAG: &str = "+editor";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Startup, shutdown and errors only.
    #[default]
    Basic = 0,
    /// Also every event except the ones sent many times per second.
    MostEvents = 1,
    /// Every event.
    AllEvents = 2,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbosity: Verbosity,
    pub editor_tracing: bool,
    pub file: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var(DEBUG_LEVEL_VAR).ok().as_deref(),
            std::env::var_os(DEBUG_FILE_VAR).map(PathBuf::from),
        )
    }

    /// Anything that is not a known level number means [`Verbosity::Basic`].
    pub fn parse(level: Option<&str>, file: Option<PathBuf>) -> Self {
        let level = level.unwrap_or("");
        let (level, editor_tracing) = match level.strip_suffix(EDITOR_TRACING_FLAG) {
            Some(rest) => (rest, true),
            None => (level, false),
        };
        let verbosity = match level.trim().parse::<u8>() {
            Ok(1) => Verbosity::MostEvents,
            Ok(n) if n >= 2 => Verbosity::AllEvents,
            _ => Verbosity::Basic,
        };

        Self {
            verbosity,
            editor_tracing,
            file: file.filter(|f| !f.as_os_str().is_empty()),
        }
    }
}

static SETTINGS: OnceLock<LogSettings> = OnceLock::new();

/// Install the subscriber once per process and return the active settings.
///
/// If the embedding application already installed a global subscriber, that
/// one stays in place and receives our events.
pub fn init() -> &'static LogSettings {
    SETTINGS.get_or_init(|| {
        let settings = LogSettings::from_env();
        install_subscriber(&settings);
        settings
    })
}

fn install_subscriber(settings: &LogSettings) {
    let default_level = match settings.verbosity {
        Verbosity::Basic => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let file = settings.file.as_ref().and_then(|path| {
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Logs the startup banner for a bridge instance.
pub fn log_init_message(
    paths: &PluginPaths,
    config: &BridgeConfig,
    endpoint: &Path,
    prefix: Option<&Path>,
) {
    let hosting_mode = match &config.group {
        Some(group) => format!("plugin group \"{}\"", group),
        None => "individually".to_string(),
    };

    tracing::info!(
        "Initializing tether version {}\n\
         host:         '{}'\n\
         plugin:       '{}'\n\
         socket:       '{}'\n\
         prefix:       '{}'\n\
         config from:  '{}'\n\
         hosting mode: '{}, {}'",
        env!("CARGO_PKG_VERSION"),
        paths.host_path.display(),
        paths.plugin_path.display(),
        endpoint.display(),
        prefix.map_or_else(|| "<default>".into(), |p| p.display().to_string()),
        config
            .matched_file
            .as_deref()
            .map_or_else(|| "<defaults>".into(), |p| p.display().to_string()),
        hosting_mode,
        paths.architecture,
    );
}

/// Formats events and their responses according to the configured verbosity.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogger {
    verbosity: Verbosity,
    editor_tracing: bool,
}

impl EventLogger {
    pub fn new(settings: &LogSettings) -> Self {
        Self {
            verbosity: settings.verbosity,
            editor_tracing: settings.editor_tracing,
        }
    }

    fn should_log(&self, direction: Direction, opcode: i32) -> bool {
        match self.verbosity {
            Verbosity::Basic => false,
            Verbosity::MostEvents => !opcodes::is_periodic(direction, opcode),
            Verbosity::AllEvents => true,
        }
    }

    pub fn log_request(&self, direction: Direction, event: &Event) {
        if !self.should_log(direction, event.opcode) {
            return;
        }

        tracing::info!(
            "{} >> {}({}, {}, {}, {})",
            origin(direction),
            name(direction, event.opcode),
            event.index,
            event.value,
            describe_payload(&event.payload),
            event.option
        );
    }

    pub fn log_response(&self, direction: Direction, opcode: i32, response: &EventResult) {
        if !self.should_log(direction, opcode) {
            return;
        }

        tracing::info!(
            "{}    {}() :: {}, {}",
            origin(direction),
            name(direction, opcode),
            response.return_value,
            describe_result(&response.payload)
        );
    }

    pub fn log_get_parameter(&self, index: i32) {
        if self.verbosity >= Verbosity::MostEvents {
            tracing::info!("[host -> plugin] >> getParameter({})", index);
        }
    }

    pub fn log_get_parameter_response(&self, value: f32) {
        if self.verbosity >= Verbosity::MostEvents {
            tracing::info!("[host -> plugin]    getParameter() :: {}", value);
        }
    }

    pub fn log_set_parameter(&self, index: i32, value: f32) {
        if self.verbosity >= Verbosity::MostEvents {
            tracing::info!("[host -> plugin] >> setParameter({}, {})", index, value);
        }
    }

    pub fn log_set_parameter_response(&self) {
        if self.verbosity >= Verbosity::MostEvents {
            tracing::info!("[host -> plugin]    setParameter() :: OK");
        }
    }

    pub fn log_editor(&self, message: &str) {
        if self.editor_tracing {
            tracing::info!("[editor] {}", message);
        }
    }
}

fn origin(direction: Direction) -> &'static str {
    match direction {
        Direction::Dispatch => "[host -> plugin]",
        Direction::HostCallback => "[plugin -> host]",
    }
}

fn name(direction: Direction, opcode: i32) -> String {
    opcodes::opcode_name(direction, opcode)
        .map(str::to_string)
        .unwrap_or_else(|| format!("<opcode {}>", opcode))
}

pub fn describe_payload(payload: &EventPayload) -> String {
    match payload {
        EventPayload::Null => "<nullptr>".into(),
        EventPayload::String(s) => format!("\"{}\"", s),
        EventPayload::Chunk(bytes) => format!("<{} bytes>", bytes.len()),
        EventPayload::WindowHandle(handle) => format!("<window {:#x}>", handle),
        EventPayload::Events(events) => format!("<{} events>", events.len()),
        EventPayload::SpeakerArrangement(arrangement) => {
            format!("<{} speakers>", arrangement.speakers.len())
        }
        EventPayload::IoProperties(_) => "<io properties>".into(),
        EventPayload::ParameterProperties(_) => "<parameter properties>".into(),
        EventPayload::MidiKeyName(_) => "<MIDI key name>".into(),
        EventPayload::WantsString => "<writable string>".into(),
        EventPayload::WantsChunkBuffer => "<writable buffer>".into(),
        EventPayload::WantsRect => "<writable rect>".into(),
        EventPayload::WantsDescriptorUpdate => "<descriptor update>".into(),
        EventPayload::WantsTimeInfo => "<time info>".into(),
    }
}

pub fn describe_result(payload: &EventResultPayload) -> String {
    match payload {
        EventResultPayload::Null => "<nullptr>".into(),
        EventResultPayload::String(s) => format!("\"{}\"", s),
        EventResultPayload::Chunk(bytes) => format!("<{} byte chunk>", bytes.len()),
        EventResultPayload::Descriptor(_) => "<descriptor>".into(),
        EventResultPayload::Rect(rect) => format!(
            "{{l: {}, t: {}, r: {}, b: {}}}",
            rect.left, rect.top, rect.right, rect.bottom
        ),
        EventResultPayload::TimeInfo(info) => {
            format!("<tempo {} bpm, position {}>", info.tempo, info.sample_pos)
        }
        EventResultPayload::SpeakerArrangement(arrangement) => {
            format!("<{} speakers>", arrangement.speakers.len())
        }
        EventResultPayload::IoProperties(_) => "<io properties>".into(),
        EventResultPayload::ParameterProperties(_) => "<parameter properties>".into(),
        EventResultPayload::MidiKeyName(_) => "<MIDI key name>".into(),
    }
}
