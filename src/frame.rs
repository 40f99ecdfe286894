//! Wire codec for broker frames.
//!
//! Every message on a channel is a single frame: a fixed header followed by
//! a NUL-terminated JSON payload. The same layout is used in both
//! directions, for requests, replies, and pushed events.
//!
//! # Wire Format
//!
//! ```text
//! offset  size  field        (all fields little-endian u32)
//! 0       4     flags        bit 0 set when a reply right is attached
//! 4       4     size         total frame size in bytes
//! 8       4     destination  channel id the frame was sent to
//! 12      4     reply_to     reply channel id, 0 when none
//! 16      4     msg_id       see below
//! 20      4     reserved     always 0
//! 24      ...   payload      UTF-8 JSON document, NUL-terminated
//! ```
//!
//! The payload is padded with zero bytes so the total size is a multiple of
//! 4, and the whole frame is never smaller than 64 bytes. Plain requests
//! carry [`MSG_ID_REQUEST`]; administrative requests sent over an event
//! channel stamp that channel's id as the message id.

use crate::channel::ChannelId;
use crate::error::Error;

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 24;

/// Minimum total frame size in bytes.
pub const MIN_FRAME_LEN: usize = 64;

/// Maximum total frame size (64 KiB), bounding both directions.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Message id stamped on plain requests.
pub const MSG_ID_REQUEST: u32 = 1;

/// Header flag: a reply send right accompanies this frame.
pub const FLAG_REPLY_ATTACHED: u32 = 1;

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub flags: u32,
    pub size: u32,
    pub destination: u32,
    pub reply_to: u32,
    pub msg_id: u32,
}

/// A decoded frame: the header plus the payload with NUL terminator and
/// padding stripped.
#[derive(Debug)]
pub struct Decoded<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

/// Encode a payload into a complete frame.
///
/// # Errors
///
/// Returns [`Error::ResourceExhausted`] when the encoded frame would exceed
/// [`MAX_FRAME_LEN`].
pub fn encode(
    payload: &str,
    destination: ChannelId,
    reply_to: Option<ChannelId>,
    msg_id: u32,
) -> Result<Vec<u8>, Error> {
    // Payload bytes + NUL, padded up to a 4-byte boundary.
    let body_len = (payload.len() + 1 + 3) & !3;
    let total = (HEADER_LEN + body_len).max(MIN_FRAME_LEN);
    if total > MAX_FRAME_LEN {
        return Err(Error::ResourceExhausted(format!(
            "frame of {} bytes exceeds the {} byte cap",
            total, MAX_FRAME_LEN
        )));
    }

    let (flags, reply_id) = match reply_to {
        Some(id) => (FLAG_REPLY_ATTACHED, id.as_u32()),
        None => (0, 0),
    };

    let mut frame = vec![0u8; total];
    write_u32(&mut frame, 0, flags);
    write_u32(&mut frame, 4, total as u32);
    write_u32(&mut frame, 8, destination.as_u32());
    write_u32(&mut frame, 12, reply_id);
    write_u32(&mut frame, 16, msg_id);
    frame[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload.as_bytes());
    // The NUL terminator and pad bytes are already zero.
    Ok(frame)
}

/// Decode a frame, validating the header against the buffer.
///
/// # Protocol
///
/// 1. The buffer must hold at least a full header.
/// 2. The header's size field must equal the buffer length and fall within
///    \[[`MIN_FRAME_LEN`], [`MAX_FRAME_LEN`]\].
/// 3. The payload runs from the header to the first NUL (or to the end of
///    the frame when no NUL is present).
///
/// # Errors
///
/// Returns [`Error::Protocol`] for truncated, mis-sized, or oversized
/// frames.
pub fn decode(bytes: &[u8]) -> Result<Decoded<'_>, Error> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "frame truncated: {} bytes is shorter than the {} byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let header = Header {
        flags: read_u32(bytes, 0),
        size: read_u32(bytes, 4),
        destination: read_u32(bytes, 8),
        reply_to: read_u32(bytes, 12),
        msg_id: read_u32(bytes, 16),
    };

    let size = header.size as usize;
    if size != bytes.len() {
        return Err(Error::Protocol(format!(
            "frame size mismatch: header says {} bytes, buffer holds {}",
            size,
            bytes.len()
        )));
    }
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&size) {
        return Err(Error::Protocol(format!(
            "frame size {} outside the {}..{} byte range",
            size, MIN_FRAME_LEN, MAX_FRAME_LEN
        )));
    }

    let body = &bytes[HEADER_LEN..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    Ok(Decoded {
        header,
        payload: &body[..end],
    })
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}
