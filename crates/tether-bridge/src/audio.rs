//! Audio round trip and the deferred-event queue.
//!
//! Events the plugin emits while the audio channel is busy arrive on the host
//! callback thread. Hosts only accept them from inside the processing
//! callback, so they wait in [`PendingEvents`] until the round trip returns and
//! are flushed right before control goes back to the host.

use crate::callback::HostCallback;
use crate::error::{BridgeError, Result};
use crate::opcodes::host;
use crate::protocol::{AudioBuffers, AudioSamples, DynamicEvents};
use crate::transport::Channel;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct PendingEvents {
    queue: Mutex<Vec<DynamicEvents>>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, events: DynamicEvents) {
        self.queue.lock().push(events);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Deliver every queued batch to the host in arrival order and clear the
    /// queue. Returns the number of batches delivered.
    ///
    /// The lock stays held while delivering so a batch arriving mid-flush
    /// waits for the next callback instead of jumping the queue.
    pub fn flush(&self, host: &dyn HostCallback) -> usize {
        let mut queue = self.queue.lock();
        for events in queue.iter() {
            let mut native = events.to_native();
            host.call(host::PROCESS_EVENTS, 0, 0, native.as_ptr().cast(), 0.0);
        }

        let delivered = queue.len();
        queue.clear();
        delivered
    }
}

/// Sample types the audio channel can carry.
pub trait Sample: Copy + Default {
    fn wrap(buffers: Vec<Vec<Self>>) -> AudioSamples;
    fn unwrap(samples: AudioSamples) -> Option<Vec<Vec<Self>>>;
}

impl Sample for f32 {
    fn wrap(buffers: Vec<Vec<Self>>) -> AudioSamples {
        AudioSamples::Float32(buffers)
    }

    fn unwrap(samples: AudioSamples) -> Option<Vec<Vec<Self>>> {
        match samples {
            AudioSamples::Float32(buffers) => Some(buffers),
            AudioSamples::Float64(_) => None,
        }
    }
}

impl Sample for f64 {
    fn wrap(buffers: Vec<Vec<Self>>) -> AudioSamples {
        AudioSamples::Float64(buffers)
    }

    fn unwrap(samples: AudioSamples) -> Option<Vec<Vec<Self>>> {
        match samples {
            AudioSamples::Float64(buffers) => Some(buffers),
            AudioSamples::Float32(_) => None,
        }
    }
}

/// Send `inputs` to the plugin, wait for its outputs and copy them into
/// `outputs`. Missing output channels or frames are left untouched.
pub fn process_round_trip<T: Sample>(
    channel: &Channel,
    inputs: &[&[T]],
    outputs: &mut [&mut [T]],
    sample_frames: usize,
) -> Result<()> {
    let request = AudioBuffers {
        buffers: T::wrap(
            inputs
                .iter()
                .map(|input| input[..sample_frames.min(input.len())].to_vec())
                .collect(),
        ),
        sample_frames: sample_frames as u32,
    };

    let response: AudioBuffers = channel.call(&request)?;
    let buffers = T::unwrap(response.buffers).ok_or_else(|| {
        BridgeError::ProtocolError("audio response uses a different sample format".into())
    })?;

    for (output, buffer) in outputs.iter_mut().zip(buffers) {
        let frames = sample_frames.min(output.len()).min(buffer.len());
        output[..frames].copy_from_slice(&buffer[..frames]);
    }

    Ok(())
}
