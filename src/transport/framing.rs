//! Frame codec
//!
//! A frame is a 4-byte big-endian length followed by that many payload bytes.

use super::TransportError;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], limit: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > limit || payload.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            limit,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one frame, giving up after `timeout`
pub async fn write_frame_timeout<W>(
    writer: &mut W,
    payload: &[u8],
    limit: usize,
    timeout: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, write_frame(writer, payload, limit)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > limit {
        return Err(TransportError::FrameTooLarge { size, limit });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello", 64).await.unwrap();
        write_frame(&mut a, b"", 64).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(read_frame(&mut b, 64).await.unwrap().unwrap().is_empty());
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        assert!(matches!(
            write_frame(&mut a, &[0u8; 10], 4).await,
            Err(TransportError::FrameTooLarge { size: 10, limit: 4 })
        ));

        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 16).await,
            Err(TransportError::FrameTooLarge { size: 100, .. })
        ));
    }
}
