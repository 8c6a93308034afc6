//! Transport layer for agent ↔ client connections.
//!
//! Provides length-prefixed framing, the pluggable [`Codec`] that turns
//! frames into bytes, and the per-connection [`mux::Mux`].

pub mod mux;
pub mod protocol;

pub use mux::{Mux, MuxBuilder};
pub use protocol::{Completion, Frame, Message, MessageType, Request, Routable, Signal};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Default maximum frame size (16 MB). Safety valve against malformed frames.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream so plain TCP and TLS connections share one code path.
pub type BoxStream = Box<dyn AsyncStream>;

/// Encodes frames into record payloads and back.
///
/// The concrete encoding is pluggable; implementations must keep the
/// message kind inside the payload.
pub trait Codec: Send + Sync + 'static {
    /// Encode one frame.
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>>;

    /// Decode one frame.
    fn decode(&self, payload: &[u8]) -> Result<Frame>;
}

/// JSON codec, the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        serde_json::to_vec(frame).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Frame> {
        serde_json::from_slice(payload).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    payload: &[u8],
    max_size: usize,
) -> Result<()> {
    if payload.len() > max_size {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn recv_message<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(Error::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        send_message(&mut buf, payload, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some(&payload[..]));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let received = recv_message(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_error() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"hello", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        buf.truncate(6);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_message(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        let err = send_message(&mut buf, &[0u8; 32], 16).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 32, max: 16 }));

        send_message(&mut buf, &[0u8; 32], 64).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = recv_message(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 32, max: 16 }));
    }

    #[test]
    fn json_codec_roundtrip_request() {
        let frame = Frame::Request(Request::new("echo", "{}"));
        let bytes = JsonCodec.encode(&frame).unwrap();
        assert_eq!(JsonCodec.decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn json_codec_rejects_garbage() {
        assert!(matches!(
            JsonCodec.decode(b"not json"),
            Err(Error::Codec(_))
        ));
    }
}
