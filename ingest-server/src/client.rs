//! Sender side of the protocol: one persistent connection carrying frames and DATA payloads.

use ingest_core::{encode_frame, FrameEncodeError, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;

pub struct IngestClient {
    stream: TcpStream,
}

impl IngestClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one frame. Use [`IngestClient::send_data`] for DATA so the payload follows the frame.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Send a DATA frame followed by its payload. `offset`, `stride_length` and `stride_spacing`
    /// are in pixels.
    pub async fn send_data(
        &mut self,
        image_name: &str,
        offset: u32,
        stride_length: u32,
        stride_spacing: u32,
        payload: &[u8],
    ) -> Result<()> {
        let data_length = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
        self.send(&Message::Data {
            image_name: image_name.to_owned(),
            offset,
            stride_length,
            stride_spacing,
            data_length,
        })
        .await?;
        self.stream.write_all(payload).await?;
        Ok(())
    }

    pub async fn start(
        &mut self,
        image_name: &str,
        width: u32,
        height: u32,
        header_count: u32,
        client_count: u32,
    ) -> Result<()> {
        self.send(&Message::Start {
            image_name: image_name.to_owned(),
            width,
            height,
            header_count,
            client_count,
        })
        .await
    }

    pub async fn header(&mut self, image_name: &str, line: &str) -> Result<()> {
        self.send(&Message::Header {
            image_name: image_name.to_owned(),
            line: line.to_owned(),
        })
        .await
    }

    pub async fn end(&mut self, image_name: &str) -> Result<()> {
        self.send(&Message::End {
            image_name: image_name.to_owned(),
        })
        .await
    }

    /// Flush and close the write side; the server sees a clean end of stream.
    pub async fn shutdown(mut self) -> Result<()> {
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
