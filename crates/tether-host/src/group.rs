//! Group host: one process serving every plugin of a group.
//!
//! Bridges find the group host through a socket whose path is derived from
//! the group name, prefix and architecture. Whoever binds that socket first
//! is the group host; a process that loses the bind race exits quietly and
//! the winner answers everyone's attach requests. Each attached plugin is
//! served on its own blocking thread. The host shuts down once it has had no
//! plugins for `idle_timeout`.

use crate::instance::PluginLoader;
use crate::server::PluginServer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_bridge::codec;
use tether_bridge::{BridgeError, GroupRequest, GroupResponse, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHostConfig {
    pub socket_path: PathBuf,
    /// Reported to attaching bridges, which watch it for liveness.
    pub process_id: u32,
    pub idle_timeout: Duration,
}

impl GroupHostConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            process_id: std::process::id(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

pub struct GroupHost {
    config: GroupHostConfig,
    listener: UnixListener,
    loader: Arc<dyn PluginLoader>,
}

impl GroupHost {
    /// Try to become the group host. Returns `None` when another process is
    /// already listening on the group socket.
    pub async fn bind(config: GroupHostConfig, loader: Arc<dyn PluginLoader>) -> Result<Option<Self>> {
        let Some(listener) = bind_listener(&config.socket_path).await? else {
            tracing::info!(
                "Another process is already hosting this group on '{}', exiting",
                config.socket_path.display()
            );
            return Ok(None);
        };

        Ok(Some(Self {
            config,
            listener,
            loader,
        }))
    }

    pub fn config(&self) -> &GroupHostConfig {
        &self.config
    }

    /// Serve attach requests until the host has been idle for
    /// `idle_timeout`, then remove the group socket.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            socket = %self.config.socket_path.display(),
            pid = self.config.process_id,
            "group host listening"
        );

        // Connections count as active from accept until their plugin closed
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<()>();
        let mut active = 0usize;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::error!("Failed to accept an attach request: {}", e);
                            continue;
                        }
                    };

                    active += 1;
                    let finished = finished_tx.clone();
                    let loader = Arc::clone(&self.loader);
                    let process_id = self.config.process_id;
                    tokio::spawn(async move {
                        if let Err(e) = serve_attach(stream, process_id, loader).await {
                            if e.is_disconnect() {
                                tracing::debug!("attach connection ended: {}", e);
                            } else {
                                tracing::error!("Failed to host plugin: {}", e);
                            }
                        }
                        let _ = finished.send(());
                    });
                }
                Some(()) = finished_rx.recv() => {
                    active = active.saturating_sub(1);
                    tracing::debug!(active, "plugin finished");
                }
                _ = tokio::time::sleep(self.config.idle_timeout), if active == 0 => {
                    tracing::info!("No plugins left to host, shutting down");
                    break;
                }
            }
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            tracing::warn!("Could not remove the group socket: {}", e);
        }
        Ok(())
    }
}

/// Bind the group socket. A socket file nobody listens on is left over
/// from a crashed host; it is removed and the bind retried once.
async fn bind_listener(socket_path: &Path) -> Result<Option<UnixListener>> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => return Ok(Some(listener)),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {}
        Err(e) => return Err(e.into()),
    }

    if UnixStream::connect(socket_path).await.is_ok() {
        return Ok(None);
    }

    tracing::debug!("removing stale group socket '{}'", socket_path.display());
    match std::fs::remove_file(socket_path) {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }

    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(Some(listener)),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Answer one attach request with our pid, then serve the plugin until it
/// is closed.
async fn serve_attach(
    mut stream: UnixStream,
    process_id: u32,
    loader: Arc<dyn PluginLoader>,
) -> Result<()> {
    let request: GroupRequest = read_frame(&mut stream).await?;
    write_frame(
        &mut stream,
        &GroupResponse {
            host_process_id: process_id,
        },
    )
    .await?;
    drop(stream);

    tracing::info!(plugin = %request.plugin_path.display(), "attaching plugin");
    let span = tracing::info_span!("plugin", path = %request.plugin_path.display());

    tokio::task::spawn_blocking(move || -> Result<()> {
        let _entered = span.enter();
        PluginServer::connect(
            &request.plugin_path,
            &request.instance_socket_path,
            loader.as_ref(),
        )?
        .run()
    })
    .await
    .map_err(|e| BridgeError::ProtocolError(format!("plugin thread failed: {}", e)))?
}

async fn read_frame<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<T> {
    let len = codec::check_frame_len(stream.read_u64_le().await?)?;
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    codec::decode(&buffer)
}

async fn write_frame<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<()> {
    let buffer = codec::encode(message)?;
    stream.write_u64_le(buffer.len() as u64).await?;
    stream.write_all(&buffer).await?;
    stream.flush().await?;
    Ok(())
}
