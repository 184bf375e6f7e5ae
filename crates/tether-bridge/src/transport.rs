//! IPC transport layer
//!
//! A [`Channel`] is one Unix socket carrying strict request/response traffic.
//! The mutex inside it is held for the whole round trip, so at most one
//! request is ever in flight per channel and concurrent callers queue up in
//! FIFO order.

use crate::codec;
use crate::error::{BridgeError, Result};
use crate::protocol::ChannelKind;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

struct ChannelInner {
    stream: UnixStream,
    buffer: Vec<u8>,
    /// Set after any error mid-message; the stream position is unknown from
    /// then on.
    poisoned: bool,
}

pub struct Channel {
    kind: ChannelKind,
    inner: Mutex<ChannelInner>,
    /// Second handle to the same socket so another thread can interrupt a
    /// blocked read without taking the lock.
    shutdown_handle: UnixStream,
}

impl Channel {
    pub fn new(kind: ChannelKind, stream: UnixStream) -> Result<Self> {
        let shutdown_handle = stream.try_clone()?;
        Ok(Self {
            kind,
            inner: Mutex::new(ChannelInner {
                stream,
                buffer: Vec::new(),
                poisoned: false,
            }),
            shutdown_handle,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Send `request` and block until the matching response arrives.
    pub fn call<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.with_stream(|stream, buffer| {
            codec::write_message(stream, request, buffer)?;
            codec::read_message(stream, buffer)
        })
    }

    /// Write one message without waiting for anything in return.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        self.with_stream(|stream, buffer| codec::write_message(stream, message, buffer))
    }

    /// Block until one message arrives.
    pub fn receive<T: DeserializeOwned>(&self) -> Result<T> {
        self.with_stream(|stream, buffer| codec::read_message(stream, buffer))
    }

    /// Serve one request: read it, run `handler`, write its response.
    pub fn serve_one<Req, Resp, F>(&self, handler: F) -> Result<()>
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: FnOnce(Req) -> Resp,
    {
        let request = self.receive()?;
        let response = handler(request);
        self.send(&response)
    }

    fn with_stream<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut UnixStream, &mut Vec<u8>) -> Result<T>,
    {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(BridgeError::ChannelClosed(self.kind));
        }

        let ChannelInner { stream, buffer, .. } = &mut *inner;
        let result = f(stream, buffer);
        if result.is_err() {
            inner.poisoned = true;
        }
        result
    }

    /// Close both directions of the socket. Any thread blocked on this
    /// channel wakes up with an error.
    pub fn close(&self) {
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("kind", &self.kind).finish()
    }
}

/// The five channels of one bridge instance.
#[derive(Debug)]
pub struct ChannelSet {
    pub dispatch: Channel,
    pub midi_dispatch: Channel,
    pub host_callback: Channel,
    pub parameters: Channel,
    pub audio: Channel,
}

impl ChannelSet {
    fn from_streams(streams: Vec<UnixStream>) -> Result<Self> {
        let mut channels = ChannelKind::ALL
            .iter()
            .zip(streams)
            .map(|(kind, stream)| Channel::new(*kind, stream));

        let mut next = || {
            channels
                .next()
                .unwrap_or_else(|| Err(BridgeError::ProtocolError("missing channel".into())))
        };

        Ok(Self {
            dispatch: next()?,
            midi_dispatch: next()?,
            host_callback: next()?,
            parameters: next()?,
            audio: next()?,
        })
    }

    pub fn get(&self, kind: ChannelKind) -> &Channel {
        match kind {
            ChannelKind::Dispatch => &self.dispatch,
            ChannelKind::MidiDispatch => &self.midi_dispatch,
            ChannelKind::HostCallback => &self.host_callback,
            ChannelKind::Parameters => &self.parameters,
            ChannelKind::Audio => &self.audio,
        }
    }

    pub fn close_all(&self) {
        for kind in ChannelKind::ALL {
            self.get(kind).close();
        }
    }
}

/// Accept the five channels in their mandated order.
///
/// Every connection starts with a one-byte channel tag; a tag that does not
/// match the next expected channel fails the handshake. `abort` is checked
/// after every accept so a supervisor can break us out of a blocking accept
/// by setting it and then connecting a throwaway socket.
pub fn accept_channels(listener: &UnixListener, abort: &AtomicBool) -> Result<ChannelSet> {
    let mut streams = Vec::with_capacity(ChannelKind::ALL.len());

    for expected in ChannelKind::ALL {
        let (mut stream, _) = listener.accept()?;
        if abort.load(Ordering::SeqCst) {
            return Err(BridgeError::ProcessCrashed);
        }

        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag)?;
        if tag[0] != expected.tag() {
            return Err(BridgeError::ChannelOrder {
                expected,
                actual: tag[0],
            });
        }

        tracing::trace!(channel = %expected, "accepted channel");
        streams.push(stream);
    }

    ChannelSet::from_streams(streams)
}

/// Connect a single channel and announce which one it is.
pub fn connect_channel(socket_path: &Path, kind: ChannelKind) -> Result<Channel> {
    let mut stream = UnixStream::connect(socket_path)?;
    stream.write_all(&[kind.tag()])?;
    Channel::new(kind, stream)
}

/// Connect all five channels in order. Used by the host-process side.
pub fn connect_channels(socket_path: &Path) -> Result<ChannelSet> {
    Ok(ChannelSet {
        dispatch: connect_channel(socket_path, ChannelKind::Dispatch)?,
        midi_dispatch: connect_channel(socket_path, ChannelKind::MidiDispatch)?,
        host_callback: connect_channel(socket_path, ChannelKind::HostCallback)?,
        parameters: connect_channel(socket_path, ChannelKind::Parameters)?,
        audio: connect_channel(socket_path, ChannelKind::Audio)?,
    })
}
