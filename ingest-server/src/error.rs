//! Error a connection can terminate with.

use std::io;

use ingest_core::{FrameDecodeError, FrameEncodeError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
