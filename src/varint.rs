//! Unsigned base-128 little-endian varint codec.
//!
//! Every group of 7 bits is emitted least-significant first; all groups but
//! the last have the continuation bit (0x80) set. Encoded width is 1-10
//! bytes for a `u64`.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Maximum number of bytes a `u64` varint can occupy (`ceil(64 / 7)`).
const MAX_VARINT_LEN: usize = 10;

/// Encode `value` as a varint, appending the bytes to `out`.
pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
            out.push(byte);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Return the standalone encoding of `value`.
pub fn encoded(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1);
    encode(value, &mut out);
    out
}

/// Decode a varint from the front of `data`.
///
/// Returns the decoded value and the number of bytes consumed. Mirrors
/// [`read_varint`]'s byte budget exactly: the 10th byte is the last one
/// allowed to carry a continuation bit, so a 10-byte buffer that is still
/// unterminated is `Overflow`, while a buffer that runs out before any
/// terminator appears is `UnexpectedEof`.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = match data.get(i) {
            Some(&b) => b,
            None => return Err(Error::UnexpectedEof),
        };
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::Overflow)
}

/// Decode a varint directly off an async reader, one byte at a time.
///
/// Used on the frame hot path, where the varint's length is not known ahead
/// of time and cannot be sliced out of a pre-read buffer.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::UnexpectedEof);
            }
            Err(e) => return Err(Error::Io(e)),
        };
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Overflow)
}

/// Decode a frame's header varint off `reader`, distinguishing a clean
/// "no more frames" EOF (nothing read yet) from one that arrives partway
/// through the header.
///
/// `Ok(None)` means the transport ended before a single header byte
/// arrived -- the clean, between-frames shutdown case. Anything else that
/// fails mid-header is a genuine `UnexpectedEof`, since a peer that starts
/// a frame is expected to finish it.
pub async fn read_header_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEof);
            }
            Err(e) => return Err(Error::Io(e)),
        };
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(Error::Overflow)
}
