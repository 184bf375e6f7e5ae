//! The external host process: spawning it, watching it and forwarding its
//! output into the log.

use crate::config::HostEnvironment;
use crate::error::{BridgeError, Result, StartupStage};
use crate::group::GroupAttachment;
use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a forwarding thread waits on its pipe before checking whether it
/// should stop.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reads made after a stop signal to pick up output that was already written.
const MAX_DRAIN_READS: usize = 16;

/// The process hosting the remote plugin.
#[derive(Debug)]
pub enum HostProcess {
    /// A dedicated process we spawned and terminate on close.
    Owned(Mutex<Child>),
    /// A shared group host. We never own it; we only know its pid once the
    /// attach request has been answered.
    Group(Arc<GroupAttachment>),
}

impl HostProcess {
    /// Spawn a dedicated host: `host_path plugin_path socket_path`, with its
    /// output forwarded into the log by threads pushed onto `workers` until
    /// `stop` is signalled or disconnected.
    pub fn spawn_individual(
        host_path: &Path,
        plugin_path: &Path,
        socket_path: &Path,
        environment: &HostEnvironment,
        stop: &Receiver<()>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<Self> {
        let mut command = Command::new(host_path);
        command
            .arg(plugin_path)
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        environment.apply(&mut command);

        let mut child = command.spawn().map_err(|source| BridgeError::SpawnFailed {
            path: host_path.to_path_buf(),
            source,
        })?;
        capture_output(&mut child, stop, workers)?;

        tracing::debug!(pid = child.id(), "spawned host process");
        Ok(HostProcess::Owned(Mutex::new(child)))
    }

    /// Pid of the hosting process, if known yet.
    pub fn pid(&self) -> Option<u32> {
        match self {
            HostProcess::Owned(child) => Some(child.lock().id()),
            HostProcess::Group(attachment) => attachment.host_pid(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            HostProcess::Owned(child) => matches!(child.lock().try_wait(), Ok(None)),
            HostProcess::Group(attachment) => attachment.is_alive(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, HostProcess::Group(_))
    }

    /// Kill and reap an owned process. Group hosts are left alone; they shut
    /// down on their own once their last plugin is gone.
    pub fn terminate(&self) {
        if let HostProcess::Owned(child) = self {
            let mut child = child.lock();
            if let Ok(None) = child.try_wait() {
                tracing::debug!(pid = child.id(), "terminating host process");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

/// Whether a process we did not spawn still exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs the permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Forward a freshly spawned child's output, killing the child if the
/// forwarding threads cannot be started.
pub(crate) fn capture_output(
    child: &mut Child,
    stop: &Receiver<()>,
    workers: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    match forward_output(child, stop) {
        Ok(handles) => {
            workers.extend(handles);
            Ok(())
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(BridgeError::StartupFailed {
                stage: StartupStage::Spawning,
                reason: format!("could not capture the host's output: {}", e),
            })
        }
    }
}

/// Start one thread per captured stream that logs it line by line.
///
/// The threads stop at end of file or once `stop` is signalled or
/// disconnected, whichever comes first. Anything that inherited the pipes,
/// like a server the host started in the background, can keep them open long
/// after the host itself is gone.
pub fn forward_output(child: &mut Child, stop: &Receiver<()>) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        handles.push(forward_lines(stdout, "STDOUT", stop.clone())?);
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(forward_lines(stderr, "STDERR", stop.clone())?);
    }
    Ok(handles)
}

fn forward_lines<R>(mut stream: R, label: &'static str, stop: Receiver<()>) -> Result<JoinHandle<()>>
where
    R: Read + AsRawFd + Send + 'static,
{
    let span = tracing::Span::current();
    let handle = thread::Builder::new()
        .name(format!("tether-host-{}", label.to_lowercase()))
        .spawn(move || {
            let _entered = span.enter();
            let fd = stream.as_raw_fd();
            let mut lines = LineBuffer::new(label);
            let mut buffer = [0u8; 4096];
            let mut drained = 0;

            loop {
                let stopping = !matches!(stop.try_recv(), Err(TryRecvError::Empty));
                if stopping {
                    if drained == MAX_DRAIN_READS {
                        break;
                    }
                    drained += 1;
                }

                let timeout = if stopping { Duration::ZERO } else { OUTPUT_POLL_INTERVAL };
                match wait_readable(fd, timeout) {
                    Ok(true) => {}
                    Ok(false) if stopping => break,
                    Ok(false) => continue,
                    Err(_) => break,
                }

                match stream.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => lines.push(&buffer[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            lines.finish();
        })?;
    Ok(handle)
}

/// Wait up to `timeout` for `fd` to become readable. End of file and a hung
/// up peer count as readable.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: `pollfd` is a single valid entry that outlives the call.
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0)
}

/// Splits raw pipe output into log lines.
struct LineBuffer {
    label: &'static str,
    pending: Vec<u8>,
}

impl LineBuffer {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.emit(&line[..end]);
        }
    }

    /// Log a trailing line that never got its newline.
    fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        tracing::info!("[host {}] {}", self.label, line.trim_end_matches('\r'));
    }
}
