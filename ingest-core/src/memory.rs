//! In-memory store. Every opened image stays observable through the factory after it is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::store::{ImageSpec, ImageStore, StoreError, StoreFactory};

/// Observable state of one in-memory image.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    pub spec: Option<ImageSpec>,
    /// Pixel canvas, grown on demand by writes past its end.
    pub canvas: Vec<u8>,
    pub bytes_received: u64,
    pub header_lines: Vec<String>,
    pub close_count: u32,
}

impl MemoryImage {
    pub fn is_closed(&self) -> bool {
        self.close_count > 0
    }
}

pub type SharedImage = Arc<Mutex<MemoryImage>>;

fn lock(image: &SharedImage) -> MutexGuard<'_, MemoryImage> {
    image.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStoreFactory {
    opened: Arc<Mutex<HashMap<String, Vec<SharedImage>>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every store opened for `name`, oldest first.
    pub fn images(&self, name: &str) -> Vec<MemoryImage> {
        let opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        opened
            .get(name)
            .map(|v| v.iter().map(|img| lock(img).clone()).collect())
            .unwrap_or_default()
    }

    /// The most recently opened store for `name`.
    pub fn latest(&self, name: &str) -> Option<MemoryImage> {
        self.images(name).pop()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, spec: &ImageSpec) -> Result<Box<dyn ImageStore>, StoreError> {
        spec.image_bytes()?;
        // The canvas grows with the writes; nothing is allocated up front.
        let image: SharedImage = Arc::new(Mutex::new(MemoryImage {
            spec: Some(spec.clone()),
            ..MemoryImage::default()
        }));
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(spec.image_name.clone())
            .or_default()
            .push(image.clone());
        Ok(Box::new(MemoryStore { image }))
    }
}

pub struct MemoryStore {
    image: SharedImage,
}

impl ImageStore for MemoryStore {
    fn write_region(&mut self, byte_offset: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let mut img = lock(&self.image);
        if img.is_closed() {
            return Err(StoreError::Closed);
        }
        let start = byte_offset as usize;
        let end = start + bytes.len();
        if img.canvas.len() < end {
            img.canvas.resize(end, 0);
        }
        img.canvas[start..end].copy_from_slice(bytes);
        img.bytes_received += bytes.len() as u64;
        Ok(())
    }

    fn append_header_line(&mut self, line: &str) -> Result<(), StoreError> {
        let mut img = lock(&self.image);
        if img.is_closed() {
            return Err(StoreError::Closed);
        }
        img.header_lines.push(line.to_owned());
        Ok(())
    }

    /// Counts every call so tests can assert a store is closed exactly once.
    fn close(&mut self) -> Result<(), StoreError> {
        lock(&self.image).close_count += 1;
        Ok(())
    }
}
