//! Length-prefixed framing for raw TCP.
//!
//! `[u32 big-endian length][length bytes of UTF-8 JSON]`, no checksum.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::CrossSystemMessage;
use crate::CommError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Build `prefix + body` in one buffer so it goes out in a single write.
pub fn encode_frame(body: &[u8], max_size: usize) -> Result<Vec<u8>, CommError> {
    if body.len() > max_size || body.len() > u32::MAX as usize {
        return Err(CommError::MessageTooLarge {
            size: body.len(),
            max: max_size,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Serialize a message and write it as one frame, then flush.
pub async fn write_message<W>(
    writer: &mut W,
    message: &CrossSystemMessage,
    max_size: usize,
    peer: &str,
) -> Result<(), CommError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(&message.to_bytes()?, max_size)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| send_error(peer, e))?;
    writer.flush().await.map_err(|e| send_error(peer, e))?;
    Ok(())
}

/// Read one frame body.
///
/// A short read on either the prefix or the body is connection loss; no
/// partial body is ever returned.
pub async fn read_frame<R>(reader: &mut R, max_size: usize, peer: &str) -> Result<Vec<u8>, CommError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| read_error(peer, e))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(CommError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| read_error(peer, e))?;
    Ok(buf)
}

/// Read one frame and decode it as an envelope.
pub async fn read_message<R>(
    reader: &mut R,
    max_size: usize,
    peer: &str,
) -> Result<CrossSystemMessage, CommError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader, max_size, peer).await?;
    CrossSystemMessage::from_slice(&body)
}

fn read_error(peer: &str, e: std::io::Error) -> CommError {
    tracing::debug!("frame read from {peer} ended: {e}");
    CommError::ConnectionClosed(peer.to_string())
}

fn send_error(peer: &str, e: std::io::Error) -> CommError {
    CommError::Send {
        system_id: peer.to_string(),
        source: e.into(),
    }
}
