//! Wire codec: typed messages to and from length-prefixed byte frames.
//!
//! A frame is a little-endian `u64` payload length followed by the payload.
//! Payloads use bincode with fixed-width little-endian integers; optional
//! fields are a presence byte followed by the value, containers are prefixed
//! with their `u64` length. Decoding rejects trailing bytes, so reading a
//! frame as the wrong message type fails instead of yielding garbage.

use crate::error::{BridgeError, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Upper bound for a single frame. Chunks dominate this; audio frames are
/// orders of magnitude smaller.
pub const MAX_MESSAGE_SIZE: u64 = 512 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE)
        .reject_trailing_bytes()
}

/// Serialize `message` into `buffer`, replacing its contents.
pub fn encode_into<T: Serialize>(message: &T, buffer: &mut Vec<u8>) -> Result<()> {
    buffer.clear();
    options().serialize_into(&mut *buffer, message)?;
    Ok(())
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    encode_into(message, &mut buffer)?;
    Ok(buffer)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| BridgeError::Framing(format!("malformed {}: {}", short_type_name::<T>(), e)))
}

/// Encode `message` and write it as one frame. `buffer` is scratch space that
/// callers keep around between calls to avoid reallocating.
pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    encode_into(message, buffer)?;
    writer.write_all(&(buffer.len() as u64).to_le_bytes())?;
    writer.write_all(buffer)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and decode it as `T`.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<T> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = check_frame_len(u64::from_le_bytes(len_bytes))?;

    buffer.resize(len, 0);
    reader.read_exact(buffer)?;
    decode(buffer)
}

/// Validate a frame length read from an untrusted peer before allocating.
pub fn check_frame_len(len: u64) -> Result<usize> {
    if len > MAX_MESSAGE_SIZE {
        return Err(BridgeError::MessageTooLarge {
            size: len,
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len as usize)
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// Per-field size ceilings, applied through `#[serde(deserialize_with)]`.
pub mod limits {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use smallvec::SmallVec;

    pub const MAX_STRING_LEN: usize = 64 * 1024;
    pub const MAX_CHUNK_LEN: usize = 256 * 1024 * 1024;
    pub const MAX_EVENTS: usize = 16 * 1024;
    pub const MAX_SPEAKERS: usize = 256;
    pub const MAX_AUDIO_CHANNELS: usize = 1024;

    fn check_len<E: Error>(len: usize, limit: usize, what: &str) -> Result<(), E> {
        if len > limit {
            return Err(E::custom(format!(
                "{} of length {} exceeds limit {}",
                what, len, limit
            )));
        }
        Ok(())
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let value = String::deserialize(deserializer)?;
        check_len(value.len(), MAX_STRING_LEN, "string")?;
        Ok(value)
    }

    pub fn bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Vec::<u8>::deserialize(deserializer)?;
        check_len(value.len(), MAX_CHUNK_LEN, "byte block")?;
        Ok(value)
    }

    pub fn events<'de, D, T, const N: usize>(deserializer: D) -> Result<SmallVec<[T; N]>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let value = SmallVec::<[T; N]>::deserialize(deserializer)?;
        check_len(value.len(), MAX_EVENTS, "event list")?;
        Ok(value)
    }

    pub fn speakers<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let value = Vec::<T>::deserialize(deserializer)?;
        check_len(value.len(), MAX_SPEAKERS, "speaker arrangement")?;
        Ok(value)
    }

    pub fn channels<'de, D, T>(deserializer: D) -> Result<Vec<Vec<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let value = Vec::<Vec<T>>::deserialize(deserializer)?;
        check_len(value.len(), MAX_AUDIO_CHANNELS, "channel list")?;
        Ok(value)
    }
}
