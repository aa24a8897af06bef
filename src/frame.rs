//! Wire frame codec.
//!
//! A frame is `varint(header) ‖ varint(length) ‖ payload[length]`, where
//! `header = (stream_id << 3) | tag`. See §4.2 of the protocol notes for the
//! tag table.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::varint;

/// Frame tag: the low 3 bits of the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Payload is the UTF-8 name of a newly opened stream.
    NewStream,
    /// Data frame written by the non-initiator side of `stream_id`.
    Receiver,
    /// Data frame written by the initiator side of `stream_id`.
    Initiator,
    /// Reserved; treated as a data frame.
    Unknown,
    /// Empty payload; closes `stream_id`.
    Close,
}

impl Tag {
    fn from_u64(value: u64) -> Self {
        match value {
            0 => Tag::NewStream,
            1 => Tag::Receiver,
            2 => Tag::Initiator,
            5 => Tag::Close,
            // 3, 4, 6, 7: reserved. The reference behavior treats anything
            // that isn't NewStream or Close as opaque stream data.
            _ => Tag::Unknown,
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Tag::NewStream => 0,
            Tag::Receiver => 1,
            Tag::Initiator => 2,
            Tag::Unknown => 3,
            Tag::Close => 5,
        }
    }
}

/// Build the outbound data-frame header for `stream_id`, given which side
/// locally initiated the stream.
pub fn data_header(stream_id: u64, locally_initiated: bool) -> u64 {
    let tag = if locally_initiated {
        Tag::Initiator
    } else {
        Tag::Receiver
    };
    (stream_id << 3) | tag.as_u64()
}

pub fn close_header(stream_id: u64) -> u64 {
    (stream_id << 3) | Tag::Close.as_u64()
}

pub fn new_stream_header(stream_id: u64) -> u64 {
    (stream_id << 3) | Tag::NewStream.as_u64()
}

/// Split a decoded header into `(stream_id, tag)`.
pub fn split_header(header: u64) -> (u64, Tag) {
    (header >> 3, Tag::from_u64(header & 0x7))
}

/// Read one frame off `reader`.
///
/// Returns `Ok(None)` when the transport ends cleanly before any header
/// byte arrives -- the ordinary "no more frames" shutdown, which `serve`
/// maps to `Ok(())`. Anything that truncates the header, the length, or
/// the payload after that point is a genuine error (`UnexpectedEof` or
/// `ShortRead`), since a peer that starts a frame is expected to finish it.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(u64, Tag, Bytes)>> {
    let header = match varint::read_header_varint(reader).await? {
        Some(h) => h,
        None => return Ok(None),
    };
    let (stream_id, tag) = split_header(header);
    let length = varint::read_varint(reader).await? as usize;

    let mut payload = BytesMut::zeroed(length);
    let mut read = 0;
    while read < length {
        let n = reader.read(&mut payload[read..]).await?;
        if n == 0 {
            return Err(Error::ShortRead {
                expected: length,
                actual: read,
            });
        }
        read += n;
    }

    Ok(Some((stream_id, tag, payload.freeze())))
}

/// Write one frame to `writer`: `varint(header) ‖ varint(length) ‖ payload`.
///
/// Not required to be a single atomic write at the byte level — the caller
/// (the connection's outbound serializer) is responsible for ensuring no
/// other frame's bytes interleave with this one.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: u64,
    payload: &[u8],
) -> Result<()> {
    let mut prefix = Vec::with_capacity(2 * 10);
    varint::encode(header, &mut prefix);
    varint::encode(payload.len() as u64, &mut prefix);
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = data_header(42, true);
        assert_eq!(header, (42 << 3) | 2);
        let (id, tag) = split_header(header);
        assert_eq!(id, 42);
        assert_eq!(tag, Tag::Initiator);
    }

    #[test]
    fn close_header_for_id_42() {
        assert_eq!(close_header(42), 341);
    }

    #[test]
    fn unknown_tags_map_to_unknown() {
        for raw in [3u64, 4, 6, 7] {
            let (_, tag) = split_header(raw);
            assert_eq!(tag, Tag::Unknown);
        }
    }

    #[tokio::test]
    async fn write_then_read_hello() {
        let mut buf = Vec::new();
        write_frame(&mut buf, new_stream_header(4), b"greet")
            .await
            .unwrap();
        write_frame(&mut buf, data_header(4, true), b"hi")
            .await
            .unwrap();

        // Expected literal wire bytes from §8 scenario 1.
        assert_eq!(
            buf,
            vec![0x08, 0x05, b'g', b'r', b'e', b'e', b't', 0x0a, 0x02, b'h', b'i']
        );

        let mut cursor = std::io::Cursor::new(buf);
        let (id, tag, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(id, 4);
        assert_eq!(tag, Tag::NewStream);
        assert_eq!(&payload[..], b"greet");

        let (id, tag, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(id, 4);
        assert_eq!(tag, Tag::Initiator);
        assert_eq!(&payload[..], b"hi");

        // Clean EOF between frames once both have been consumed.
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_payload_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, close_header(1), b"").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (id, tag, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(id, 1);
        assert_eq!(tag, Tag::Close);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn short_read_reports_truncation() {
        let mut buf = Vec::new();
        varint::encode(data_header(1, true), &mut buf);
        varint::encode(10, &mut buf); // claim 10 payload bytes
        buf.extend_from_slice(b"abc"); // but only provide 3

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ShortRead {
                expected: 10,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_not_an_error() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_header_is_unexpected_eof() {
        // A continuation byte promising a second header byte, then nothing:
        // the peer started a frame and never finished it, unlike a clean
        // shutdown between frames.
        let buf = vec![0x80u8];
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }

    #[tokio::test]
    async fn eof_mid_length_is_unexpected_eof() {
        // A complete header followed by nothing: truncated before the
        // length varint even starts.
        let mut buf = Vec::new();
        varint::encode(data_header(1, true), &mut buf);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }
}
