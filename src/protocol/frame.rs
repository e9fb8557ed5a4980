//! Length-prefixed framing.
//!
//! ```text
//! +----------------------+-------------------------------+
//! | length: i32 (BE)     | length bytes of array message |
//! +----------------------+-------------------------------+
//! ```
//!
//! End of stream is signalled by the transport. A header of `0` at a frame
//! boundary is also taken as the end of the session, never as an empty
//! array: an empty array message encodes to zero bytes, so the two cannot
//! be told apart on the wire.

use crate::error::FrameError;
use crate::protocol::message::ArrayMessage;
use crate::runtime::GrowableBuffer;
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use std::io::{self, ErrorKind, Read, Write};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest frame accepted unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Interpret a length header.
///
/// Returns `None` for the zero-length end-of-session marker.
pub fn decode_length(header: [u8; HEADER_LEN], max_len: usize) -> Result<Option<usize>, FrameError> {
    let length = i32::from_be_bytes(header);
    if length < 0 || length as usize > max_len {
        return Err(FrameError::InvalidLength(length as i64));
    }
    Ok((length > 0).then_some(length as usize))
}

/// Read one length header from a blocking stream.
///
/// Returns `Ok(None)` when the stream ends at the frame boundary or carries
/// the zero-length marker. A stream ending inside the header is truncation.
pub fn read_header<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<usize>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(FrameError::Truncated {
                    received: filled,
                    expected: HEADER_LEN,
                })
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    decode_length(header, max_len)
}

/// Read exactly `len` body bytes into `buf`, which is prepared for the body.
pub fn read_body<R: Read>(reader: &mut R, buf: &mut GrowableBuffer, len: usize) -> Result<(), FrameError> {
    buf.prepare(len);
    while !buf.is_full() {
        match reader.read(buf.remaining_slice_mut()) {
            Ok(0) => {
                return Err(FrameError::Truncated {
                    received: buf.position(),
                    expected: len,
                })
            }
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read one whole frame; the payload is left in `buf.filled()`.
///
/// Returns the payload length, or `None` at a graceful end of stream.
#[cfg(test)]
pub fn read_frame<R: Read>(
    reader: &mut R,
    buf: &mut GrowableBuffer,
    max_len: usize,
) -> Result<Option<usize>, FrameError> {
    match read_header(reader, max_len)? {
        Some(len) => {
            read_body(reader, buf, len)?;
            Ok(Some(len))
        }
        None => Ok(None),
    }
}

/// Write one frame carrying `payload`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = i32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "payload exceeds i32::MAX"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)
}

/// Encode a message into a complete frame (header and payload).
pub fn encode_frame(message: &ArrayMessage) -> Bytes {
    let len = message.encoded_len();
    let mut out = BytesMut::with_capacity(HEADER_LEN + len);
    out.put_i32(len as i32);
    // BytesMut grows on demand, so encoding cannot run out of space
    let _ = message.encode(&mut out);
    out.freeze()
}

/// Encode a message as a frame into `buf`, leaving it ready to be written.
pub fn encode_frame_into(message: &ArrayMessage, buf: &mut GrowableBuffer) {
    let len = message.encoded_len();
    buf.prepare(HEADER_LEN + len);
    let region = buf.remaining_slice_mut();
    region[..HEADER_LEN].copy_from_slice(&(len as i32).to_be_bytes());
    let mut body = &mut region[HEADER_LEN..];
    // `prepare` sized the region to `encoded_len`, which is exact
    let _ = message.encode(&mut body);
}
