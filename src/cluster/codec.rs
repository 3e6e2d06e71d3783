//! Length-prefixed JSON framing for [`WireMessage`]s.
//!
//! Each frame is a 4-byte big-endian body length followed by the JSON body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broker::WireMessage;
use crate::bus::{BusError, Result};

/// Largest accepted frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .map_err(|_| BusError::Codec(format!("frame of {} bytes is too large", body.len())))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(BusError::Codec(format!(
            "frame of {len} bytes exceeds limit of {max_frame_bytes}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Forward decoded frames from `reader` into `tx` until end of stream.
///
/// A body that fails to decode is skipped; framing errors end the stream.
pub fn spawn_reader<R>(mut reader: R, max_frame_bytes: usize, tx: mpsc::UnboundedSender<WireMessage>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        debug!("Frame receiver dropped, stopping reader");
                        return;
                    }
                }
                Ok(None) => {
                    debug!("Frame stream ended");
                    return;
                }
                Err(BusError::Serialization(e)) => {
                    warn!(error = %e, "Failed to decode frame, skipping");
                }
                Err(e) => {
                    error!(error = %e, "Frame stream failed");
                    return;
                }
            }
        }
    })
}

/// Encode messages from `rx` onto `writer` until the channel closes.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WireMessage>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                error!(error = %e, kind = message.kind(), "Failed to write frame");
                return;
            }
        }
        debug!("Frame sender dropped, stopping writer");
    })
}
