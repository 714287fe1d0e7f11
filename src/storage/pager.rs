//! # Pager Interface
//!
//! The cache and tree never touch backing storage directly; they consume
//! the narrow [`Pager`] trait. Durability, journaling, and free-space
//! reclamation on disk are the Pager's problem (or the problem of whatever
//! sits behind it) — the core only asks for page-sized reads and writes
//! and monotonically increasing page allocation.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemPager`] keeps pages in a hash map. Useful for tests and for
//!   ephemeral indexes that never outlive the process.
//! - [`FilePager`] maps a single file and serves pages out of the mapping,
//!   growing it by remap when a new page is allocated. Page `pgno` lives
//!   at byte offset `(pgno - 1) * page_size`; page numbers start at 1.
//!
//! Neither implementation journals. A write reaches the OS when the
//! mapping is flushed ([`FilePager::sync`]); crash consistency is out of
//! scope here.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::MmapMut;

use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::WrenError;
use crate::storage::FileHeader;

/// Page-sized block I/O consumed by the cache↔tree glue.
pub trait Pager {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Number of allocated pages. Valid page numbers are `1..=page_count`.
    fn page_count(&self) -> u32;

    /// Copies page `pgno` into `buf`. `buf.len()` must equal `page_size`.
    fn read_page(&self, pgno: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` as page `pgno`.
    fn write_page(&mut self, pgno: u32, buf: &[u8]) -> Result<()>;

    /// Allocates the next page number. Monotonically increasing; never
    /// reuses a number.
    fn allocate_page(&mut self) -> Result<u32>;
}

/// In-memory Pager backed by a page map.
pub struct MemPager {
    pages: HashMap<u32, Box<[u8]>>,
    page_size: usize,
    page_count: u32,
}

impl MemPager {
    pub fn new(page_size: usize) -> Result<Self> {
        ensure!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "unsupported page size {}",
            page_size
        );
        Ok(Self {
            pages: HashMap::new(),
            page_size,
            page_count: 0,
        })
    }
}

impl Pager for MemPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, pgno: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "read buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );
        if pgno == 0 || pgno > self.page_count {
            return Err(WrenError::PageNotFound { pgno }.into());
        }
        match self.pages.get(&pgno) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&mut self, pgno: u32, buf: &[u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "write buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );
        ensure!(
            pgno >= 1 && pgno <= self.page_count,
            "write to unallocated page {}",
            pgno
        );
        self.pages.insert(pgno, buf.to_vec().into_boxed_slice());
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<u32> {
        if self.page_count == u32::MAX {
            return Err(WrenError::NoSpace.into());
        }
        self.page_count += 1;
        Ok(self.page_count)
    }
}

/// File-backed Pager serving pages out of a memory map.
pub struct FilePager {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u32,
}

impl FilePager {
    /// Creates the file with a single zeroed page.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "unsupported page size {}",
            page_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;

        file.set_len(page_size as u64)
            .wrap_err("failed to size new index file")?;

        // SAFETY: the file was just created with exclusive read/write
        // access and sized to one page; index files are not modified by
        // other processes, and the mapping's lifetime is tied to the
        // FilePager, which bounds-checks every access.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: 1,
        })
    }

    /// Opens an existing file, taking the page size from the file header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            file_size >= MIN_PAGE_SIZE as u64,
            "index file '{}' is too small ({} bytes)",
            path.display(),
            file_size
        );

        // SAFETY: as in `create`; the file is held with read/write access
        // for the life of the mapping and all access is bounds-checked.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = FileHeader::from_bytes(&mmap)?;
        let page_size = header.page_size() as usize;
        ensure!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "index file '{}' declares unsupported page size {}",
            path.display(),
            page_size
        );
        ensure!(
            file_size % page_size as u64 == 0,
            "index file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: (file_size / page_size as u64) as u32,
        })
    }

    /// Flushes the mapping to disk.
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(WrenError::Io)
            .wrap_err("failed to flush index file")
    }

    fn page_range(&self, pgno: u32) -> Result<std::ops::Range<usize>> {
        if pgno == 0 || pgno > self.page_count {
            return Err(WrenError::PageNotFound { pgno }.into());
        }
        let start = (pgno as usize - 1) * self.page_size;
        Ok(start..start + self.page_size)
    }
}

impl Pager for FilePager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, pgno: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "read buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );
        let range = self.page_range(pgno)?;
        buf.copy_from_slice(&self.mmap[range]);
        Ok(())
    }

    fn write_page(&mut self, pgno: u32, buf: &[u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "write buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );
        let range = self.page_range(pgno)?;
        self.mmap[range].copy_from_slice(buf);
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<u32> {
        if self.page_count == u32::MAX {
            return Err(WrenError::NoSpace.into());
        }
        let new_count = self.page_count + 1;

        self.mmap
            .flush()
            .map_err(WrenError::Io)
            .wrap_err("failed to flush before growing index file")?;
        self.file
            .set_len(new_count as u64 * self.page_size as u64)
            .map_err(WrenError::Io)
            .wrap_err("failed to grow index file")?;

        // SAFETY: remapping after set_len; the old mapping is replaced
        // atomically from the borrow checker's point of view because this
        // method holds `&mut self`, so no page slice can be live.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .map_err(WrenError::Io)
                .wrap_err("failed to remap grown index file")?
        };

        self.page_count = new_count;
        Ok(new_count)
    }
}
