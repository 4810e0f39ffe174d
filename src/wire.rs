//! Length-prefixed JSON framing.
//!
//! A frame is a 4-byte unsigned length in native byte order followed by that
//! many bytes of UTF-8 JSON. The same format is used in both directions.

use crate::error::{is_eof_kind, BridgeError, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default inbound limit (helper -> bridge).
pub const MAX_READ: u32 = 1024 * 1024;
/// Default outbound limit (bridge -> helper): everything the prefix can express.
pub const MAX_WRITE: u64 = 0xFFFF_FFFF;

#[inline]
fn read_exact_u32_len<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    Ok(u32::from_ne_bytes(len_buf))
}

fn prefix_for(payload: &[u8]) -> Result<[u8; 4]> {
    let len = u32::try_from(payload.len()).map_err(|_| BridgeError::WriteTooLarge {
        len: payload.len(),
        limit: MAX_WRITE,
    })?;
    Ok(len.to_ne_bytes())
}

/// Serialize `msg` to the wire-ready payload: JSON text as UTF-8 bytes, without
/// the length prefix.
///
/// Fails with [`BridgeError::WriteTooLarge`] before anything is queued when the
/// payload is longer than `max_write`.
pub fn encode_message<T: Serialize + ?Sized>(msg: &T, max_write: u64) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    check_write_len(json.len(), max_write)?;
    Ok(json)
}

pub(crate) fn check_write_len(len: usize, max_write: u64) -> Result<()> {
    if len as u64 > max_write.min(MAX_WRITE) {
        return Err(BridgeError::WriteTooLarge {
            len,
            limit: max_write.min(MAX_WRITE),
        });
    }
    Ok(())
}

/// Build a complete frame (prefix + payload).
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let prefix = prefix_for(payload)?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write one frame to a blocking writer.
pub fn write_frame_sync<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let prefix = prefix_for(payload)?;
    writer.write_all(&prefix)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Decode a single framed message from a blocking reader (useful in tests and
/// in helper programs).
pub fn decode_message<R: Read>(reader: &mut R, max_read: u32) -> Result<Value> {
    let len = read_exact_u32_len(&mut *reader)?;
    if len > max_read {
        return Err(BridgeError::OversizedMessage {
            len,
            limit: max_read,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    parse_payload(&buf)
}

fn parse_payload(buf: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(buf).map_err(|_| BridgeError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

/// Read the length prefix. `Ok(None)` means the stream ended cleanly on a frame
/// boundary.
async fn read_len<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a length prefix",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if filled == 0 && is_eof_kind(e.kind()) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(u32::from_ne_bytes(buf)))
}

/// Read and decode one frame.
///
/// Returns `Ok(None)` on a clean end of stream. A declared length above
/// `max_read` fails with [`BridgeError::OversizedMessage`] without touching the
/// payload bytes. A stream that ends in the middle of a frame is an I/O error.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_read: u32,
) -> Result<Option<Value>> {
    let Some(len) = read_len(reader).await? else {
        return Ok(None);
    };
    if len > max_read {
        return Err(BridgeError::OversizedMessage {
            len,
            limit: max_read,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    parse_payload(&buf).map(Some)
}

/// Write one frame: the prefix, then the payload, awaited in order.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let prefix = prefix_for(payload)?;
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
