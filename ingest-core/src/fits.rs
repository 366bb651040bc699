//! FITS file store: one primary HDU per image, 32-bit pixels, header cards appended as they arrive.
//!
//! Header space for the expected number of cards is reserved when the file is created so that
//! pixel data can be written at its final position immediately; the header block is rewritten
//! in place on close.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::store::{validate_image_name, ImageSpec, ImageStore, StoreError, StoreFactory};

/// FITS logical record size.
pub const BLOCK_SIZE: u64 = 2880;
/// Header card size.
pub const CARD_SIZE: usize = 80;
const CARDS_PER_BLOCK: u64 = BLOCK_SIZE / CARD_SIZE as u64;

/// Creates `<dir>/<image_name>.fits` for every image.
#[derive(Debug, Clone)]
pub struct FitsStoreFactory {
    dir: PathBuf,
}

impl FitsStoreFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl StoreFactory for FitsStoreFactory {
    fn open(&self, spec: &ImageSpec) -> Result<Box<dyn ImageStore>, StoreError> {
        Ok(Box::new(FitsStore::create(&self.dir, spec)?))
    }
}

pub struct FitsStore {
    path: PathBuf,
    file: Option<File>,
    fixed_cards: Vec<[u8; CARD_SIZE]>,
    extra_cards: Vec<[u8; CARD_SIZE]>,
    /// Byte position of the first pixel; also the size of the reserved header space.
    data_start: u64,
}

impl FitsStore {
    pub fn create(dir: &Path, spec: &ImageSpec) -> Result<Self, StoreError> {
        validate_image_name(&spec.image_name)?;
        let image_bytes = spec.image_bytes()?;
        let too_large = || StoreError::TooLarge {
            width: spec.width,
            height: spec.height,
        };
        let fixed_cards = vec![
            value_card("SIMPLE", "T"),
            value_card("BITPIX", "32"),
            value_card("NAXIS", "2"),
            value_card("NAXIS1", &spec.width.to_string()),
            value_card("NAXIS2", &spec.height.to_string()),
        ];
        let total_cards = fixed_cards.len() as u64 + spec.header_count as u64 + 1;
        let data_start = total_cards.div_ceil(CARDS_PER_BLOCK) * BLOCK_SIZE;
        let file_len = padded(image_bytes)
            .and_then(|n| n.checked_add(data_start))
            .ok_or_else(too_large)?;

        let path = dir.join(format!("{}.fits", spec.image_name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut store = Self {
            path,
            file: Some(file),
            fixed_cards,
            extra_cards: Vec::new(),
            data_start,
        };
        store.write_header()?;
        if let Some(file) = &store.file {
            file.set_len(file_len)?;
        }
        info!(
            path = %store.path.display(),
            image_bytes,
            clients = spec.client_count,
            headers = spec.header_count,
            "created FITS file"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    fn header_capacity(&self) -> usize {
        // Reserved cards minus the fixed cards and END.
        (self.data_start / CARD_SIZE as u64) as usize - self.fixed_cards.len() - 1
    }

    /// Write fixed cards, as many extra cards as fit, END, then space padding up to `data_start`.
    /// Returns how many extra cards were left out.
    fn write_header(&mut self) -> Result<usize, StoreError> {
        let capacity = self.header_capacity();
        let kept = self.extra_cards.len().min(capacity);
        let mut block = Vec::with_capacity(self.data_start as usize);
        for card in self.fixed_cards.iter().chain(&self.extra_cards[..kept]) {
            block.extend_from_slice(card);
        }
        block.extend_from_slice(&text_card("END"));
        block.resize(self.data_start as usize, b' ');

        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&block)?;
        Ok(self.extra_cards.len() - kept)
    }
}

impl ImageStore for FitsStore {
    fn write_region(&mut self, byte_offset: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let position = self.data_start + byte_offset;
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn append_header_line(&mut self, line: &str) -> Result<(), StoreError> {
        if self.file.is_none() {
            return Err(StoreError::Closed);
        }
        self.extra_cards.push(text_card(line));
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.file.is_none() {
            return Ok(());
        }
        let dropped = self.write_header()?;
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        info!(path = %self.path.display(), "closed FITS file");
        if dropped > 0 {
            warn!(path = %self.path.display(), dropped, "header lines exceeded reserved space");
            return Err(StoreError::HeaderOverflow { dropped });
        }
        Ok(())
    }
}

fn padded(len: u64) -> Option<u64> {
    len.div_ceil(BLOCK_SIZE).checked_mul(BLOCK_SIZE)
}

/// `KEYWORD = value` with the value right-justified in columns 11-30.
fn value_card(keyword: &str, value: &str) -> [u8; CARD_SIZE] {
    text_card(&format!("{keyword:<8}= {value:>20}"))
}

/// Truncate or space-pad a line to one card. Non-ASCII bytes are replaced with '?'.
fn text_card(line: &str) -> [u8; CARD_SIZE] {
    let mut card = [b' '; CARD_SIZE];
    for (dst, src) in card.iter_mut().zip(line.bytes()) {
        *dst = if src.is_ascii() && !src.is_ascii_control() {
            src
        } else {
            b'?'
        };
    }
    card
}
