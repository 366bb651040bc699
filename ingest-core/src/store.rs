//! Image store contract: the durable sink a session writes its header lines and byte regions to.

use std::io;

/// Parameters of an image, taken from its START frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image_name: String,
    pub width: u32,
    pub height: u32,
    pub header_count: u32,
    pub client_count: u32,
}

impl ImageSpec {
    /// Size of the pixel data in bytes (4 bytes per pixel). Fails if it does not fit in a `u64`.
    pub fn image_bytes(&self) -> Result<u64, StoreError> {
        crate::protocol::BYTES_PER_PIXEL
            .checked_mul(self.width as u64)
            .and_then(|n| n.checked_mul(self.height as u64))
            .ok_or(StoreError::TooLarge {
                width: self.width,
                height: self.height,
            })
    }
}

/// One open image. Writers may address any byte range; concurrent callers are serialized by
/// whoever owns the store.
pub trait ImageStore: Send {
    /// Write `bytes` at `byte_offset` from the start of the pixel data.
    fn write_region(&mut self, byte_offset: u64, bytes: &[u8]) -> Result<(), StoreError>;

    /// Append one textual header record.
    fn append_header_line(&mut self, line: &str) -> Result<(), StoreError>;

    /// Finalize and flush. Later writes fail with [`StoreError::Closed`]; closing twice is a no-op.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// Creates a store per image.
pub trait StoreFactory: Send + Sync {
    fn open(&self, spec: &ImageSpec) -> Result<Box<dyn ImageStore>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid image name {0:?}")]
    InvalidName(String),
    #[error("image of {width}x{height} pixels is too large")]
    TooLarge { width: u32, height: u32 },
    #[error("store already closed")]
    Closed,
    #[error("{dropped} header lines did not fit in the reserved header space")]
    HeaderOverflow { dropped: usize },
}

/// Reject names that cannot be used as a single file name.
pub fn validate_image_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_owned()));
    }
    Ok(())
}
