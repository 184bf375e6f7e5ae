//! Bridge configuration and the collaborator interfaces it is resolved from.

use crate::error::{BridgeError, Result, StartupStage};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Per-plugin settings. Resolving these from configuration files is done by
/// the caller; the bridge only consumes the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host the plugin inside the shared group host with this name instead
    /// of a dedicated process.
    #[serde(default)]
    pub group: Option<String>,
    /// The configuration file these settings came from, for logging.
    #[serde(default)]
    pub matched_file: Option<PathBuf>,
    /// How often the startup supervisor checks that the host is still alive.
    pub liveness_interval: Duration,
    /// Delay between attach attempts after spawning a new group host.
    pub group_poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            group: None,
            matched_file: None,
            liveness_interval: Duration::from_secs(1),
            group_poll_interval: Duration::from_millis(20),
        }
    }
}

impl BridgeConfig {
    /// Reject settings the bridge cannot start with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| BridgeError::StartupFailed {
            stage: StartupStage::Configuration,
            reason,
        };

        if let Some(group) = &self.group {
            if group.is_empty() {
                return Err(invalid("the group name is empty".into()));
            }
        }
        if self.liveness_interval.is_zero() {
            return Err(invalid("the liveness interval must not be zero".into()));
        }
        if self.group.is_some() && self.group_poll_interval.is_zero() {
            return Err(invalid("the group poll interval must not be zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginArchitecture {
    X86,
    X86_64,
}

impl PluginArchitecture {
    /// Short name used in group socket names.
    pub fn as_str(self) -> &'static str {
        match self {
            PluginArchitecture::X86 => "x32",
            PluginArchitecture::X86_64 => "x64",
        }
    }
}

impl std::fmt::Display for PluginArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginArchitecture::X86 => write!(f, "32-bit"),
            PluginArchitecture::X86_64 => write!(f, "64-bit"),
        }
    }
}

/// Where the plugin and the matching host binary live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginPaths {
    pub plugin_path: PathBuf,
    pub architecture: PluginArchitecture,
    pub host_path: PathBuf,
}

const PREFIX_VAR: &str = "WINEPREFIX";

/// The execution environment the host process runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    /// Explicit or detected execution prefix. `None` means the default one.
    pub prefix: Option<PathBuf>,
    /// Variables added on top of the inherited environment.
    pub vars: Vec<(OsString, OsString)>,
}

impl HostEnvironment {
    /// Use `$WINEPREFIX` if set, otherwise look for the prefix containing
    /// `plugin_path`.
    pub fn detect(plugin_path: &Path) -> Self {
        let explicit = std::env::var_os(PREFIX_VAR)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        Self::with_prefix(explicit.or_else(|| find_prefix(plugin_path)))
    }

    pub fn with_prefix(prefix: Option<PathBuf>) -> Self {
        let vars = prefix
            .iter()
            .map(|p| (OsString::from(PREFIX_VAR), p.clone().into_os_string()))
            .collect();
        Self { prefix, vars }
    }

    /// Prefix used to key group sockets. Hosts started without a prefix end up
    /// in `$HOME/.wine`, so that is what an unknown prefix means.
    pub fn group_prefix(&self) -> PathBuf {
        match &self.prefix {
            Some(prefix) => prefix.clone(),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join(".wine"),
        }
    }

    pub fn apply(&self, command: &mut Command) {
        command.envs(self.vars.iter().map(|(k, v)| (k, v)));
    }
}

/// Walk up from `path` to the first directory that contains `dosdevices`.
pub fn find_prefix(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|dir| dir.join("dosdevices").is_dir())
        .map(Path::to_path_buf)
}
