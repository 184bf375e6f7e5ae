//! Rendezvous socket paths.

use crate::config::PluginArchitecture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

const SUFFIX_LEN: usize = 8;

/// Directory for rendezvous sockets: `$XDG_RUNTIME_DIR`, or the temp dir.
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// A fresh, unique socket path for one bridge instance.
pub fn instance_endpoint(plugin_path: &Path) -> PathBuf {
    instance_endpoint_in(&runtime_dir(), plugin_path)
}

pub fn instance_endpoint_in(dir: &Path, plugin_path: &Path) -> PathBuf {
    let stem = plugin_path
        .file_stem()
        .map(|s| sanitize(&s.to_string_lossy()))
        .unwrap_or_else(|| "plugin".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();

    dir.join(format!("tether-{}-{}.sock", stem, suffix))
}

/// The socket path of a group host. Every instance that agrees on the group
/// name, prefix and architecture ends up at the same path.
pub fn group_endpoint(group: &str, prefix: &Path, architecture: PluginArchitecture) -> PathBuf {
    group_endpoint_in(&runtime_dir(), group, prefix, architecture)
}

pub fn group_endpoint_in(
    dir: &Path,
    group: &str,
    prefix: &Path,
    architecture: PluginArchitecture,
) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);

    dir.join(format!(
        "tether-group-{}-{:016x}-{}.sock",
        sanitize(group),
        hasher.finish(),
        architecture.as_str()
    ))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
