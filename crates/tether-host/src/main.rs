//! Host process binary. Spawned by the bridge to run plugins out of process.
//!
//! ```text
//! tether-host <plugin_path> <socket_path>   host one plugin
//! tether-host <group_socket>                run a group host
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tether_bridge::logging::{LogSettings, Verbosity};
use tether_host::{GroupHost, GroupHostConfig, PassthroughPlugin, PluginLoader, PluginServer};

#[tokio::main]
async fn main() -> ExitCode {
    // Our output is captured and logged by the bridge, which adds its own
    // timestamps
    let level = match LogSettings::from_env().verbosity {
        Verbosity::Basic => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .init();

    let args: Vec<PathBuf> = env::args_os().skip(1).map(PathBuf::from).collect();
    let loader: Arc<dyn PluginLoader> = Arc::new(PassthroughPlugin::load);

    let result = match args.as_slice() {
        [group_socket] => run_group(group_socket.clone(), loader).await,
        [plugin_path, socket_path] => {
            let (plugin_path, socket_path) = (plugin_path.clone(), socket_path.clone());
            tokio::task::spawn_blocking(move || -> tether_bridge::Result<()> {
                PluginServer::connect(&plugin_path, &socket_path, loader.as_ref())?.run()
            })
            .await
            .unwrap_or_else(|e| {
                Err(tether_bridge::BridgeError::ProtocolError(format!(
                    "plugin thread failed: {}",
                    e
                )))
            })
        }
        _ => {
            eprintln!("usage: tether-host <plugin_path> <socket_path>");
            eprintln!("       tether-host <group_socket>");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_group(group_socket: PathBuf, loader: Arc<dyn PluginLoader>) -> tether_bridge::Result<()> {
    match GroupHost::bind(GroupHostConfig::new(group_socket), loader).await? {
        Some(host) => host.run().await,
        None => Ok(()),
    }
}
