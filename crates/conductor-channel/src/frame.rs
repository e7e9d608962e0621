//! Length-prefixed frame codec.
//!
//! Each frame is a 4-byte big-endian unsigned length followed by exactly
//! that many bytes of JSON. The prefix keeps frames self-delimited, so a
//! short read never splits a message and a malformed body never desyncs
//! the stream.

use conductor_core::message::AgentMessage;
use conductor_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ceiling on a single frame body. Anything larger is treated as a corrupt
/// header and the connection is dropped.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one message as a single buffered frame.
pub async fn write_frame<W>(writer: &mut W, message: &AgentMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);

    writer
        .write_all(&buf)
        .await
        .map_err(|e| Error::ChannelWrite(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::ChannelWrite(e.to_string()))?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end-of-stream at a frame
/// boundary. A body that fails to decode is a `Protocol` error, but the
/// stream stays synchronized and the caller may keep reading.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<AgentMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(Error::Io)?;

    let message = serde_json::from_slice(&body)
        .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::ids::AgentId;
    use conductor_core::message::MessageType;
    use serde_json::Map;
    use std::io::Cursor;

    fn sample() -> AgentMessage {
        let mut payload = Map::new();
        payload.insert("k".into(), serde_json::json!("v"));
        AgentMessage::new(
            AgentId::numbered(0),
            AgentId::numbered(1),
            MessageType::Coordination,
            payload,
        )
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let message = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &message).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let parsed = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed.message_id, message.message_id);
        assert_eq!(parsed.payload, message.payload);
    }

    #[tokio::test]
    async fn test_back_to_back_frames_stay_delimited() {
        let first = sample();
        let second = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &first).await.unwrap();
        write_frame(&mut buf, &second).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let a = read_frame(&mut cursor).await.unwrap().unwrap();
        let b = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(a.message_id, first.message_id);
        assert_eq!(b.message_id, second.message_id);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let message = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &message).await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_keeps_stream_synchronized() {
        let garbage = b"{\"message_type\": \"telepathy\"}";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        buf.extend_from_slice(garbage);
        let good = sample();
        write_frame(&mut buf, &good).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::Protocol(_))
        ));
        // The bad body was consumed in full; the next frame is intact.
        let parsed = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed.message_id, good.message_id);
    }
}
