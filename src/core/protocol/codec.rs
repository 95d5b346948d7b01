//! Length-prefixed bincode framing.
//!
//! Frame layout: `u32` big-endian payload length, then the bincode payload.
//! Payloads larger than [`MAX_FRAME_SIZE`] are rejected before allocation.

use crate::core::config::{IO_TIMEOUT, MAX_FRAME_SIZE};
use crate::core::error::TransferError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Serialize `msg` and write it as one frame.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg).map_err(|e| TransferError::Protocol(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(TransferError::Protocol(format!(
            "outgoing frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let len = (payload.len() as u32).to_be_bytes();

    timeout(IO_TIMEOUT, async {
        w.write_all(&len).await?;
        w.write_all(&payload).await?;
        w.flush().await
    })
    .await
    .map_err(|_| TransferError::Connectivity("write timed out".into()))??;
    Ok(())
}

/// Read one frame.
///
/// `idle` bounds the wait for the first byte; the rest of the frame must
/// arrive within the I/O timeout. Returns `Ok(None)` when the peer closed
/// the stream cleanly between frames.
pub async fn read_frame<R, T>(r: &mut R, idle: Duration) -> Result<Option<T>, TransferError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    let n = timeout(idle, r.read(&mut header[..1]))
        .await
        .map_err(|_| TransferError::Connectivity("idle timeout".into()))??;
    if n == 0 {
        return Ok(None);
    }

    let payload = timeout(IO_TIMEOUT, async {
        r.read_exact(&mut header[1..]).await?;
        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_SIZE {
            return Err(TransferError::Protocol(format!(
                "incoming frame of {len} bytes exceeds limit"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload).await?;
        Ok::<_, TransferError>(payload)
    })
    .await
    .map_err(|_| TransferError::Connectivity("read timed out".into()))??;

    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|e| TransferError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::message::{Request, Response};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_frame(&mut a, &Request::GetChunk { digest: "ab".into(), index: 7 })
            .await
            .unwrap();
        write_frame(&mut a, &Request::Ping).await.unwrap();
        drop(a);

        let first: Request = read_frame(&mut b, IO_TIMEOUT).await.unwrap().unwrap();
        assert!(matches!(first, Request::GetChunk { index: 7, .. }));
        let second: Request = read_frame(&mut b, IO_TIMEOUT).await.unwrap().unwrap();
        assert!(matches!(second, Request::Ping));
        let eof: Option<Request> = read_frame(&mut b, IO_TIMEOUT).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        let res: Result<Option<Response>, _> = read_frame(&mut b, IO_TIMEOUT).await;
        assert!(matches!(res, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        let res: Result<Option<Response>, _> = read_frame(&mut b, IO_TIMEOUT).await;
        assert!(matches!(res, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_connectivity_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2]).await.unwrap();
        drop(a);
        let res: Result<Option<Response>, _> = read_frame(&mut b, IO_TIMEOUT).await;
        assert!(matches!(res, Err(TransferError::Connectivity(_))));
    }
}
