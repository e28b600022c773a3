//! Frame model and the length-prefixed binary codec.
//!
//! The envelope is validated against the configured bound before any
//! buffer for it is allocated; every field is then sliced out of that one
//! exact-length buffer, so a frame is either decoded whole or rejected.

use super::types::FrameType;
use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on `totalLength` (4 MiB).
pub const MAX_FRAME_LEN: usize = 1 << 22;

/// Size of the `totalLength` prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed part after the prefix: tag (1) + sender len (2) + recipient len (2)
/// + body len (4).
pub const FIXED_HEADER_SIZE: usize = 9;

/// Fixed part of the chunk trailer: transfer id len (2) + seq (4) + last (1)
/// + bin len (4).
pub const CHUNK_TRAILER_SIZE: usize = 11;

/// Transfer fields, present only on chunk frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFields {
    /// Transfer this chunk belongs to.
    pub transfer_id: String,
    /// Position in the transfer, starting at 0.
    pub seq: u32,
    /// Set on the final chunk only.
    pub last: bool,
    /// Payload bytes.
    pub bin: Vec<u8>,
}

/// One self-delimited protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type tag.
    pub frame_type: FrameType,
    /// Originating username.
    pub sender: String,
    /// Target username or room.
    pub recipient: String,
    /// UTF-8 text body; meaning depends on the type.
    pub body: String,
    /// Populated if and only if `frame_type` is a chunk type.
    pub chunk: Option<ChunkFields>,
}

impl Frame {
    /// Create a non-chunk frame.
    pub fn new(
        frame_type: FrameType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            frame_type,
            sender: sender.into(),
            recipient: recipient.into(),
            body: body.into(),
            chunk: None,
        }
    }

    /// Create a chunk frame with an empty body.
    pub fn chunk(
        frame_type: FrameType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        transfer_id: impl Into<String>,
        seq: u32,
        last: bool,
        bin: Vec<u8>,
    ) -> Self {
        Self {
            frame_type,
            sender: sender.into(),
            recipient: recipient.into(),
            body: String::new(),
            chunk: Some(ChunkFields {
                transfer_id: transfer_id.into(),
                seq,
                last,
                bin,
            }),
        }
    }

    /// Number of bytes following the length prefix.
    pub fn encoded_len(&self) -> usize {
        let mut len = FIXED_HEADER_SIZE + self.sender.len() + self.recipient.len() + self.body.len();
        if let Some(chunk) = &self.chunk {
            len += CHUNK_TRAILER_SIZE + chunk.transfer_id.len() + chunk.bin.len();
        }
        len
    }

    /// Serialize the frame, length prefix included.
    pub fn encode(&self, max_len: usize) -> Result<Vec<u8>> {
        if self.frame_type.is_chunk() != self.chunk.is_some() {
            return Err(Error::InvalidMessage(format!(
                "{} frame with mismatched transfer fields",
                self.frame_type
            )));
        }

        let total = self.encoded_len();
        if total > max_len {
            return Err(Error::InvalidMessage(format!(
                "frame of {} bytes exceeds limit of {}",
                total, max_len
            )));
        }

        let mut bytes = Vec::with_capacity(LENGTH_PREFIX_SIZE + total);
        bytes.extend_from_slice(&to_i32(total, "total length")?.to_be_bytes());
        bytes.push(self.frame_type.to_byte());
        bytes.extend_from_slice(&to_u16(self.sender.len(), "sender")?.to_be_bytes());
        bytes.extend_from_slice(&to_u16(self.recipient.len(), "recipient")?.to_be_bytes());
        bytes.extend_from_slice(&to_i32(self.body.len(), "body")?.to_be_bytes());
        bytes.extend_from_slice(self.sender.as_bytes());
        bytes.extend_from_slice(self.recipient.as_bytes());
        bytes.extend_from_slice(self.body.as_bytes());

        if let Some(chunk) = &self.chunk {
            bytes.extend_from_slice(&to_u16(chunk.transfer_id.len(), "transfer id")?.to_be_bytes());
            bytes.extend_from_slice(chunk.transfer_id.as_bytes());
            bytes.extend_from_slice(&to_i32(chunk.seq as usize, "seq")?.to_be_bytes());
            bytes.push(u8::from(chunk.last));
            bytes.extend_from_slice(&to_i32(chunk.bin.len(), "bin")?.to_be_bytes());
            bytes.extend_from_slice(&chunk.bin);
        }

        Ok(bytes)
    }

    /// Parse the bytes that follow the length prefix.
    ///
    /// The slice must hold exactly one frame; leftovers are a framing error.
    pub fn decode_body(bytes: &[u8]) -> Result<Self> {
        let mut cursor = FieldCursor::new(bytes);

        let frame_type = FrameType::from_byte(cursor.u8()?)?;
        let sender_len = cursor.u16()? as usize;
        let recipient_len = cursor.u16()? as usize;
        let body_len = cursor.len_i32("body")?;

        let sender = cursor.utf8(sender_len, "sender")?;
        let recipient = cursor.utf8(recipient_len, "recipient")?;
        let body = cursor.utf8(body_len, "body")?;

        let chunk = if frame_type.is_chunk() {
            let id_len = cursor.u16()? as usize;
            let transfer_id = cursor.utf8(id_len, "transfer id")?;
            let seq = cursor.len_i32("seq")? as u32;
            let last = match cursor.u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::Framing(format!("invalid last flag: {}", other)));
                }
            };
            let bin_len = cursor.len_i32("bin")?;
            let bin = cursor.take(bin_len)?.to_vec();
            Some(ChunkFields {
                transfer_id,
                seq,
                last,
                bin,
            })
        } else {
            None
        };

        if cursor.remaining() != 0 {
            return Err(Error::Framing(format!(
                "{} trailing bytes after frame",
                cursor.remaining()
            )));
        }

        Ok(Self {
            frame_type,
            sender,
            recipient,
            body,
            chunk,
        })
    }

    /// Transfer id, for chunk frames.
    pub fn transfer_id(&self) -> Option<&str> {
        self.chunk.as_ref().map(|c| c.transfer_id.as_str())
    }

    /// Whether this is the terminal chunk of a transfer.
    pub fn is_last_chunk(&self) -> bool {
        self.chunk.as_ref().map(|c| c.last).unwrap_or(false)
    }
}

fn to_u16(len: usize, field: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::InvalidMessage(format!("{} too long", field)))
}

fn to_i32(len: usize, field: &str) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::InvalidMessage(format!("{} too long", field)))
}

/// Bounds-checked reader over one frame's bytes.
struct FieldCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Framing(format!(
                "field of {} bytes overruns frame ({} left)",
                n,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian int32 that must not be negative.
    fn len_i32(&mut self, field: &str) -> Result<usize> {
        let b = self.take(4)?;
        let value = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        usize::try_from(value)
            .map_err(|_| Error::Framing(format!("negative {} field: {}", field, value)))
    }

    fn utf8(&mut self, n: usize, field: &str) -> Result<String> {
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Framing(format!("{} is not valid UTF-8", field)))
    }
}

/// Reads and writes frames on a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Create a codec with the given envelope bound.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Envelope bound in bytes.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` on clean end-of-stream, i.e. when no byte of the
    /// length prefix arrived. A stream that ends anywhere later is
    /// `Error::Truncated`.
    pub async fn read<R>(&self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(Error::Truncated)
                };
            }
            filled += n;
        }

        let total = i32::from_be_bytes(len_buf);
        if total <= 0 || total as usize > self.max_frame_len {
            return Err(Error::Framing(format!(
                "frame length {} outside 1..={}",
                total, self.max_frame_len
            )));
        }

        let mut body = vec![0u8; total as usize];
        reader.read_exact(&mut body).await?;

        Frame::decode_body(&body).map(Some)
    }

    /// Write one frame and flush.
    pub async fn write<W>(&self, writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = frame.encode(self.max_frame_len)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_frame(bin: Vec<u8>) -> Frame {
        Frame::chunk(FrameType::FileChunk, "alice", "bob", "f1", 7, true, bin)
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(FrameType::Dm, "alice", "bob", "héllo");
        let bytes = frame.encode(MAX_FRAME_LEN).expect("should encode");
        assert_eq!(bytes.len(), LENGTH_PREFIX_SIZE + frame.encoded_len());

        let parsed = Frame::decode_body(&bytes[LENGTH_PREFIX_SIZE..]).expect("should parse");
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_every_type_roundtrips() {
        for ft in FrameType::ALL {
            let frame = if ft.is_chunk() {
                Frame::chunk(ft, "a", "b", "t", 0, false, vec![9])
            } else {
                Frame::new(ft, "a", "b", "body")
            };
            let bytes = frame.encode(MAX_FRAME_LEN).expect("should encode");
            let parsed = Frame::decode_body(&bytes[LENGTH_PREFIX_SIZE..]).expect("should parse");
            assert_eq!(parsed, frame, "{}", ft);
        }
    }

    #[test]
    fn test_payload_edges() {
        let overhead = FIXED_HEADER_SIZE + CHUNK_TRAILER_SIZE + "alice".len() + "bob".len() + 2;
        for len in [0, 1, MAX_FRAME_LEN - overhead] {
            let frame = chunk_frame(vec![0xAB; len]);
            let bytes = frame.encode(MAX_FRAME_LEN).expect("should encode");
            let parsed = Frame::decode_body(&bytes[LENGTH_PREFIX_SIZE..]).expect("should parse");
            assert_eq!(parsed.chunk.expect("chunk").bin.len(), len);
        }
    }

    #[test]
    fn test_oversize_rejected_on_encode() {
        let frame = chunk_frame(vec![0; MAX_FRAME_LEN]);
        assert!(frame.encode(MAX_FRAME_LEN).is_err());
    }

    #[test]
    fn test_transfer_fields_must_match_type() {
        let mut frame = Frame::new(FrameType::FileChunk, "a", "b", "");
        assert!(frame.encode(MAX_FRAME_LEN).is_err());

        frame = chunk_frame(vec![1]);
        frame.frame_type = FrameType::Dm;
        assert!(frame.encode(MAX_FRAME_LEN).is_err());
    }

    #[test]
    fn test_field_overrun_is_framing_error() {
        let bytes = Frame::new(FrameType::Dm, "alice", "bob", "hi")
            .encode(MAX_FRAME_LEN)
            .expect("should encode");
        let short = &bytes[LENGTH_PREFIX_SIZE..bytes.len() - 1];
        assert!(matches!(Frame::decode_body(short), Err(Error::Framing(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Frame::new(FrameType::Who, "", "", "")
            .encode(MAX_FRAME_LEN)
            .expect("should encode");
        bytes.push(0);
        assert!(matches!(
            Frame::decode_body(&bytes[LENGTH_PREFIX_SIZE..]),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_negative_seq_rejected() {
        let mut bytes = chunk_frame(vec![]).encode(MAX_FRAME_LEN).expect("should encode");
        // seq sits after prefix, header, "alice", "bob", id len and "f1"
        let seq_at = LENGTH_PREFIX_SIZE + FIXED_HEADER_SIZE + 5 + 3 + 2 + 2;
        bytes[seq_at] = 0x80;
        assert!(matches!(
            Frame::decode_body(&bytes[LENGTH_PREFIX_SIZE..]),
            Err(Error::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_codec_stream_roundtrip() {
        let codec = FrameCodec::default();
        let (mut client, mut server) = tokio::io::duplex(64);

        let frames = vec![
            Frame::new(FrameType::FileMeta, "alice", "bob", r#"{"name":"a","size":3}"#),
            chunk_frame(vec![1, 2, 3]),
        ];
        let expected = frames.clone();

        let writer = tokio::spawn(async move {
            for frame in &frames {
                codec.write(&mut client, frame).await.expect("write");
            }
        });

        for frame in expected {
            let read = codec.read(&mut server).await.expect("read").expect("frame");
            assert_eq!(read, frame);
        }
        writer.await.expect("join");

        assert!(codec.read(&mut server).await.expect("clean eof").is_none());
    }

    #[tokio::test]
    async fn test_codec_truncated_prefix() {
        let codec = FrameCodec::default();
        let mut input: &[u8] = &[0, 0];
        assert!(matches!(codec.read(&mut input).await, Err(Error::Truncated)));
    }

    #[tokio::test]
    async fn test_codec_truncated_body() {
        let codec = FrameCodec::default();
        let bytes = Frame::new(FrameType::Dm, "alice", "bob", "hello")
            .encode(MAX_FRAME_LEN)
            .expect("should encode");
        let mut input = &bytes[..bytes.len() - 2];
        assert!(matches!(codec.read(&mut input).await, Err(Error::Truncated)));
    }

    #[tokio::test]
    async fn test_codec_length_bounds() {
        let codec = FrameCodec::new(1024);

        let mut zero: &[u8] = &[0, 0, 0, 0];
        assert!(matches!(codec.read(&mut zero).await, Err(Error::Framing(_))));

        let mut negative: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(codec.read(&mut negative).await, Err(Error::Framing(_))));

        // Rejected from the prefix alone; no body bytes follow.
        let mut huge: &[u8] = &[0, 0, 0x04, 0x01];
        assert!(matches!(codec.read(&mut huge).await, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn test_codec_unknown_tag() {
        let codec = FrameCodec::default();
        let mut bytes = Frame::new(FrameType::Dm, "a", "b", "c")
            .encode(MAX_FRAME_LEN)
            .expect("should encode");
        bytes[LENGTH_PREFIX_SIZE] = 0xEE;
        let mut input = bytes.as_slice();
        assert!(matches!(codec.read(&mut input).await, Err(Error::Framing(_))));
    }
}
