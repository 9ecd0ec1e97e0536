use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AimError, Result};

/// Largest accepted payload (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(AimError::InvalidMessage(format!(
            "frame of {} bytes exceeds {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Check a length prefix against the frame limit.
pub fn check_length(len: u32) -> Result<usize> {
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(AimError::InvalidMessage(format!(
            "frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(len)
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closes the stream cleanly between
/// frames. EOF inside a frame is a length mismatch.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(AimError::InvalidMessage(
                "connection closed inside frame header".to_string(),
            ));
        }
        filled += n;
    }

    let len = check_length(u32::from_be_bytes(header))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            AimError::InvalidMessage(format!("frame shorter than declared {} bytes", len))
        } else {
            AimError::from(err)
        }
    })?;
    Ok(Some(payload))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
