//! Attaching to a shared group host.
//!
//! A group host listens on a socket whose path is derived from the group
//! name, the execution prefix and the architecture. Attaching means sending a
//! [`GroupRequest`] there and reading back the host's pid. When nobody is
//! listening yet we spawn a group host ourselves and keep retrying in the
//! background until it (or whichever host won the bind race) answers.

use crate::codec;
use crate::config::HostEnvironment;
use crate::error::{BridgeError, Result, StartupStage};
use crate::process::{self, HostProcess};
use crate::protocol::{GroupRequest, GroupResponse};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What an instance knows about the group host serving it.
#[derive(Debug, Default)]
pub struct GroupAttachment {
    /// Zero until an attach request has been answered.
    host_pid: AtomicU32,
    /// Set when the group host we spawned exited without ever answering.
    failed: AtomicBool,
}

impl GroupAttachment {
    pub fn host_pid(&self) -> Option<u32> {
        match self.host_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn set_host_pid(&self, pid: u32) {
        self.host_pid.store(pid, Ordering::SeqCst);
    }

    /// While the attach is still in progress the group host counts as alive
    /// unless the retry loop gave up on it.
    pub fn is_alive(&self) -> bool {
        if self.failed.load(Ordering::SeqCst) {
            return false;
        }
        self.host_pid().map_or(true, process::pid_alive)
    }
}

/// Send one attach request to the group host at `group_socket`.
pub fn request_attach(group_socket: &Path, request: &GroupRequest) -> Result<GroupResponse> {
    let mut stream = UnixStream::connect(group_socket).map_err(|e| {
        BridgeError::ConnectionFailed(format!("'{}': {}", group_socket.display(), e))
    })?;
    let mut buffer = Vec::new();
    codec::write_message(&mut stream, request, &mut buffer)?;
    codec::read_message(&mut stream, &mut buffer)
}

/// Everything needed to get a plugin hosted by a group.
#[derive(Debug, Clone)]
pub struct GroupLaunch {
    pub group_socket: PathBuf,
    pub request: GroupRequest,
    pub host_path: PathBuf,
    pub environment: HostEnvironment,
    pub poll_interval: Duration,
}

impl GroupLaunch {
    /// Attach to a running group host, or spawn one and keep attaching in the
    /// background. The retry thread and the threads forwarding the spawned
    /// host's output are pushed onto `workers`. All of them stop once `stop`
    /// is signalled or disconnected, even though the group host lives on.
    pub fn attach_or_spawn(
        self,
        stop: &Receiver<()>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<HostProcess> {
        let attachment = Arc::new(GroupAttachment::default());

        match request_attach(&self.group_socket, &self.request) {
            Ok(response) => {
                tracing::debug!(
                    pid = response.host_process_id,
                    "attached to running group host"
                );
                attachment.set_host_pid(response.host_process_id);
                return Ok(HostProcess::Group(attachment));
            }
            Err(e) => tracing::debug!("no group host answered yet ({}), starting one", e),
        }

        let mut child = self.spawn_group_host()?;
        process::capture_output(&mut child, stop, workers)?;

        let retry_attachment = Arc::clone(&attachment);
        let retry_stop = stop.clone();
        let span = tracing::Span::current();
        let handle = thread::Builder::new()
            .name("tether-group-attach".into())
            .spawn(move || {
                let _entered = span.enter();
                self.retry_attach(child, &retry_attachment, &retry_stop);
            })
            .map_err(|e| BridgeError::StartupFailed {
                stage: StartupStage::Attaching,
                reason: format!("could not start the attach thread: {}", e),
            })?;
        workers.push(handle);

        Ok(HostProcess::Group(attachment))
    }

    /// The group host takes the group socket as its only argument. Its output
    /// is logged for as long as this instance lives.
    fn spawn_group_host(&self) -> Result<Child> {
        let mut command = Command::new(&self.host_path);
        command
            .arg(&self.group_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.environment.apply(&mut command);

        let child = command.spawn().map_err(|source| BridgeError::SpawnFailed {
            path: self.host_path.clone(),
            source,
        })?;
        tracing::info!(pid = child.id(), "started group host");
        Ok(child)
    }

    fn retry_attach(&self, mut child: Child, attachment: &GroupAttachment, stop: &Receiver<()>) {
        loop {
            match stop.recv_timeout(self.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }

            // A host that lost the bind race exits right away, but only after
            // the winner is listening, so one more attempt is always worth it
            let exited = !matches!(child.try_wait(), Ok(None));

            match request_attach(&self.group_socket, &self.request) {
                Ok(response) => {
                    tracing::debug!(pid = response.host_process_id, "attached to group host");
                    attachment.set_host_pid(response.host_process_id);
                    return;
                }
                Err(_) if exited => {
                    tracing::error!("The group host exited before accepting our attach request");
                    attachment.failed.store(true, Ordering::SeqCst);
                    return;
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelKind;
    use crate::transport::Channel;
    use crossbeam_channel::bounded;
    use std::os::unix::net::UnixListener;
    use std::time::Instant;

    fn request(dir: &Path) -> GroupRequest {
        GroupRequest {
            plugin_path: dir.join("Synth.dll"),
            instance_socket_path: dir.join("instance.sock"),
        }
    }

    #[test]
    fn test_attach_to_running_group_host() {
        let dir = tempfile::tempdir().unwrap();
        let group_socket = dir.path().join("group.sock");
        let listener = UnixListener::bind(&group_socket).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let channel = Channel::new(ChannelKind::Dispatch, stream).unwrap();
            let mut seen = None;
            channel
                .serve_one(|request: GroupRequest| {
                    seen = Some(request);
                    GroupResponse {
                        host_process_id: 4321,
                    }
                })
                .unwrap();
            seen
        });

        let launch = GroupLaunch {
            group_socket,
            request: request(dir.path()),
            host_path: PathBuf::from("/nonexistent"),
            environment: HostEnvironment::default(),
            poll_interval: Duration::from_millis(20),
        };
        let (_stop_tx, stop_rx) = bounded(0);
        let mut workers = Vec::new();
        let process = launch.attach_or_spawn(&stop_rx, &mut workers).unwrap();

        assert_eq!(process.pid(), Some(4321));
        assert!(workers.is_empty());
        assert_eq!(server.join().unwrap(), Some(request(dir.path())));
    }

    #[test]
    fn test_spawned_group_host_that_exits_marks_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launch = GroupLaunch {
            group_socket: dir.path().join("nobody.sock"),
            request: request(dir.path()),
            host_path: PathBuf::from("/bin/false"),
            environment: HostEnvironment::default(),
            poll_interval: Duration::from_millis(10),
        };

        let (_stop_tx, stop_rx) = bounded(0);
        let mut workers = Vec::new();
        let process = launch.attach_or_spawn(&stop_rx, &mut workers).unwrap();
        // Retry thread plus both output forwarders
        assert_eq!(workers.len(), 3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while process.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!process.is_alive());
        assert_eq!(process.pid(), None);
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_retry_thread_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let launch = GroupLaunch {
            group_socket: dir.path().join("nobody.sock"),
            request: request(dir.path()),
            host_path: PathBuf::from("/bin/sleep"),
            environment: HostEnvironment::default(),
            poll_interval: Duration::from_secs(30),
        };

        let (stop_tx, stop_rx) = bounded(0);
        let mut workers = Vec::new();
        let process = launch.attach_or_spawn(&stop_rx, &mut workers).unwrap();
        assert!(process.is_alive());

        let started = Instant::now();
        drop(stop_tx);
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_request_attach_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let result = request_attach(&dir.path().join("nobody.sock"), &request(dir.path()));
        assert!(matches!(result, Err(BridgeError::ConnectionFailed(_))));
    }

    #[test]
    fn test_stop_does_not_wait_for_long_lived_group_host() {
        let dir = tempfile::tempdir().unwrap();
        // The group socket path doubles as the script the shell runs, so the
        // spawned host talks a little and then outlives the instance
        let group_socket = dir.path().join("group.sock");
        std::fs::write(&group_socket, "echo 'group host starting' >&2\nexec sleep 3\n").unwrap();

        let launch = GroupLaunch {
            group_socket,
            request: request(dir.path()),
            host_path: PathBuf::from("/bin/sh"),
            environment: HostEnvironment::default(),
            poll_interval: Duration::from_secs(30),
        };
        let (stop_tx, stop_rx) = bounded(0);
        let mut workers = Vec::new();
        let process = launch.attach_or_spawn(&stop_rx, &mut workers).unwrap();
        assert_eq!(workers.len(), 3);

        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        drop(stop_tx);
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(process.is_alive());
    }
}
