//! # File Header
//!
//! The first 100 bytes of page 1 identify the index file and carry the
//! handful of fields the tree needs before it can navigate: the page size,
//! the usable size, the current root page number, and the total page count.
//! The page header of page 1 follows immediately after.
//!
//! ## Layout (100 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------
//! 0       4     magic ("BTRE")
//! 4       4     page size
//! 8       4     usable size
//! 12      4     root page number
//! 16      4     total page count
//! 20      80    reserved, zero
//! ```
//!
//! The struct uses `zerocopy` little-endian fields so it can be read from
//! and written into a page buffer without copying or manual shifting.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, FILE_MAGIC, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 4],
    page_size: U32,
    usable_size: U32,
    root_pgno: U32,
    page_count: U32,
    reserved: [u8; 80],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(page_size: u32, usable_size: u32, root_pgno: u32, page_count: u32) -> Self {
        Self {
            magic: FILE_MAGIC,
            page_size: U32::new(page_size),
            usable_size: U32::new(usable_size),
            root_pgno: U32::new(root_pgno),
            page_count: U32::new(page_count),
            reserved: [0u8; 80],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        bytes[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    /// Checks magic, page-size bounds, and root range. Run on every open.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic == FILE_MAGIC,
            "bad magic {:02x?}, expected {:02x?}",
            self.magic,
            FILE_MAGIC
        );

        let page_size = self.page_size() as usize;
        ensure!(
            page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "unsupported page size {}",
            page_size
        );

        ensure!(
            self.usable_size() <= self.page_size(),
            "usable size {} exceeds page size {}",
            self.usable_size(),
            self.page_size()
        );

        ensure!(
            self.root_pgno() >= 1 && self.root_pgno() <= self.page_count(),
            "root page {} out of range (page count {})",
            self.root_pgno(),
            self.page_count()
        );

        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn usable_size(&self) -> u32 {
        self.usable_size.get()
    }

    pub fn root_pgno(&self) -> u32 {
        self.root_pgno.get()
    }

    pub fn set_root_pgno(&mut self, pgno: u32) {
        self.root_pgno = U32::new(pgno);
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, count: u32) {
        self.page_count = U32::new(count);
    }
}
