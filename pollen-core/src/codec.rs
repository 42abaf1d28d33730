//! Chunk wire codec: serializes one chunk unit as
//! `u32-LE len | uri bytes | u32-LE message count | { u32-LE len | message bytes }*`
//! and decodes streams of such units into a chunk store.

use crate::era::Era;
use crate::store::{Chunk, ChunkStorage, StoreError};

const LEN_SIZE: usize = 4;

/// Notified after all messages of one received chunk were appended.
pub trait ChunkReceivedListener: Send + Sync {
    fn chunk_received(&self, sender: &str, uri: &str, era: Era);
}

/// Error decoding or storing a chunk unit.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Stream ended in the middle of a unit. A clean end between units is
    /// not an error, it signals that the peer closed the session.
    #[error("stream ended mid chunk unit")]
    Truncated,
    #[error("text field is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("no destination chunk for uri {0:?}")]
    NoDestination(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

/// Encode one chunk unit for the wire: uri field, message count, then the
/// messages in storage order.
pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, CodecError> {
    let messages = chunk.messages().map_err(CodecError::Store)?;
    Ok(encode_unit(chunk.uri(), &messages))
}

/// Encode a unit from loose parts. Used by the online router, which carries
/// a single application message per unit.
pub fn encode_unit<S: AsRef<str>>(uri: &str, messages: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    put_text(&mut out, uri);
    out.extend_from_slice(&(messages.len() as u32).to_le_bytes());
    for m in messages {
        put_text(&mut out, m.as_ref());
    }
    out
}

fn put_text(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
}

/// Tri-state outcome of reading one unit from the front of a buffer.
#[derive(Debug)]
pub enum UnitOutcome {
    /// One complete unit: uri, messages, bytes consumed.
    Unit {
        uri: String,
        messages: Vec<String>,
        consumed: usize,
    },
    /// Buffer exhausted at a unit boundary; the normal end of a stream.
    End,
}

/// Decode one unit from the front of `bytes`. Ending exactly at a unit
/// boundary yields [`UnitOutcome::End`]; ending mid-unit is
/// [`CodecError::Truncated`].
pub fn decode_unit(bytes: &[u8]) -> Result<UnitOutcome, CodecError> {
    if bytes.is_empty() {
        return Ok(UnitOutcome::End);
    }
    let mut at = 0usize;
    let uri = take_text(bytes, &mut at)?;
    if at + LEN_SIZE > bytes.len() {
        return Err(CodecError::Truncated);
    }
    let count =
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
    at += LEN_SIZE;
    // the count is wire-controlled: never reserve more than the remaining
    // bytes could possibly hold (every message costs at least its prefix)
    let mut messages = Vec::with_capacity(count.min(bytes.len().saturating_sub(at) / LEN_SIZE));
    for _ in 0..count {
        messages.push(take_text(bytes, &mut at)?);
    }
    Ok(UnitOutcome::Unit {
        uri,
        messages,
        consumed: at,
    })
}

fn take_text(bytes: &[u8], at: &mut usize) -> Result<String, CodecError> {
    if *at + LEN_SIZE > bytes.len() {
        return Err(CodecError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[*at], bytes[*at + 1], bytes[*at + 2], bytes[*at + 3]])
        as usize;
    *at += LEN_SIZE;
    if *at + len > bytes.len() {
        return Err(CodecError::Truncated);
    }
    let text = std::str::from_utf8(&bytes[*at..*at + len])?;
    *at += len;
    Ok(text.to_string())
}

/// Read chunk units from `bytes` until exhausted, appending each into
/// `storage` at `era` and firing `listener` per completed unit. A unit is
/// decoded in full before anything is committed; an unresolvable destination
/// aborts the loop without committing that unit. Returns the number of units
/// stored.
pub fn read_chunks(
    sender: &str,
    bytes: &[u8],
    storage: &ChunkStorage,
    era: Era,
    listener: &dyn ChunkReceivedListener,
) -> Result<u32, CodecError> {
    let mut rest = bytes;
    let mut stored = 0u32;
    loop {
        match decode_unit(rest)? {
            UnitOutcome::End => return Ok(stored),
            UnitOutcome::Unit {
                uri,
                messages,
                consumed,
            } => {
                let chunk = storage
                    .chunk(&uri, era)
                    .map_err(|_| CodecError::NoDestination(uri.clone()))?;
                for message in &messages {
                    chunk.add_message(message).map_err(CodecError::Store)?;
                }
                tracing::debug!(sender, uri = %uri, count = messages.len(), "chunk assimilated");
                listener.chunk_received(sender, &uri, era);
                stored += 1;
                rest = &rest[consumed..];
            }
        }
    }
}
