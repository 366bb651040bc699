//! Per-connection loop: read a frame, decode it, hand it to the coordinator, repeat.
//! DATA payloads are left on the stream for the coordinator to consume.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use ingest_core::wire::{decode_body, frame_len, LEN_SIZE};
use ingest_core::{FrameDecodeError, Message};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::Result;

/// Serve one connection until the peer closes it at a frame boundary. Any protocol, store or
/// I/O error ends this connection only.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut frames = 0u64;
    while let Some(msg) = read_message(&mut stream).await? {
        frames += 1;
        debug!(%peer, ?msg, "received frame");
        coordinator.handle_message(msg, &mut stream).await?;
    }
    debug!(%peer, frames, "peer closed connection");
    Ok(())
}

/// Read one frame. `None` on end of stream before the first byte of a frame; a stream that ends
/// inside a frame is a truncated frame.
pub async fn read_message<R>(stream: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    let n = stream.read(&mut len_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    stream
        .read_exact(&mut len_buf[n..])
        .await
        .map_err(truncated)?;
    let len = frame_len(len_buf)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(truncated)?;
    Ok(Some(decode_body(&body)?))
}

fn truncated(e: io::Error) -> crate::error::IngestError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameDecodeError::Truncated.into()
    } else {
        e.into()
    }
}
