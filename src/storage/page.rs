//! # Slotted Page Codec
//!
//! Every page is divided into three sections: the page header, the
//! cell-pointer array, and the cell content area. Page 1 additionally
//! carries the 100-byte file header before the page header.
//!
//! ```text
//!      |----------------|
//!      | file header    |   100 bytes.  Page 1 only.
//!      |----------------|
//!      | page header    |   8 bytes on leaves, 12 on interior pages
//!      |----------------|
//!      | cell pointer   |   |  2 bytes per cell, key-ascending order.
//!      | array          |   |  Grows downward.
//!      |----------------|   v
//!      | unallocated    |
//!      | space          |
//!      |----------------|   ^  Grows upward.
//!      | cell content   |   |  Cell bodies interspersed with freeblocks
//!      | area           |   |  and fragmented free bytes.
//!      |----------------|
//! ```
//!
//! ## Page Header Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------------
//! 0       1     flags: 0x01 interior, 0x02 leaf, 0x04 overflow, 0x08 zero
//! 1       2     offset of the first freeblock (0 = none)
//! 3       2     cell count
//! 5       2     first byte of the cell content area
//! 7       1     fragmented free bytes
//! 8       4     rightmost child page number (interior pages only)
//! ```
//!
//! All multi-byte fields are little-endian. On a 65536-byte page the
//! content-area offset cannot be represented in 16 bits, so a stored 0 is
//! read back as 65536.
//!
//! ## Free-Space Accounting
//!
//! Deleted cell bodies become freeblocks: a singly linked list threaded
//! through the content area, each node holding a 2-byte next pointer and a
//! 2-byte size. Allocation is first-fit; a remainder smaller than
//! [`MIN_FREEBLOCK_SIZE`] cannot carry a freeblock header and is counted in
//! the header's fragmented-bytes field instead. Fragmented bytes are only
//! reclaimed by [`PageMut::defragment`], which rewrites all live cells
//! contiguously at the high end of the page and empties the freeblock list.
//!
//! [`PageView::free_space`] reports the bytes reusable without
//! defragmentation (gap + freeblocks); [`PageView::total_free`] adds the
//! fragmented bytes on top. `insert_cell` never defragments internally: when
//! `total_free` would fit a cell but no contiguous run does, the caller
//! defragments first.
//!
//! The codec is pure over byte slices. It holds no reference to the cache
//! or the tree and performs bounds checks on every offset that originates
//! from disk.

use eyre::{bail, ensure, Result};

use crate::config::{
    CELL_POINTER_SIZE, INTERIOR_HEADER_SIZE, LEAF_HEADER_SIZE, MIN_FREEBLOCK_SIZE,
    PAYLOAD_ENTRY_SIZE, PAYLOAD_HEADER_SIZE,
};
use crate::error::WrenError;

pub const PAGE_FLAG_INTERIOR: u8 = 0x01;
pub const PAGE_FLAG_LEAF: u8 = 0x02;
pub const PAGE_FLAG_OVERFLOW: u8 = 0x04;
pub const PAGE_FLAG_ZERO: u8 = 0x08;

const FLAGS_OFFSET: usize = 0;
const FREEBLOCK_OFFSET: usize = 1;
const CELL_COUNT_OFFSET: usize = 3;
const CONTENT_START_OFFSET: usize = 5;
const FRAG_BYTES_OFFSET: usize = 7;
const RIGHT_CHILD_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Interior,
    Leaf,
    Overflow,
    Zero,
}

impl PageKind {
    pub fn from_flags(flags: u8) -> Result<Self> {
        match flags {
            PAGE_FLAG_INTERIOR => Ok(PageKind::Interior),
            PAGE_FLAG_LEAF => Ok(PageKind::Leaf),
            PAGE_FLAG_OVERFLOW => Ok(PageKind::Overflow),
            PAGE_FLAG_ZERO => Ok(PageKind::Zero),
            _ => bail!("invalid page flags {:#04x}", flags),
        }
    }

    pub fn flags(self) -> u8 {
        match self {
            PageKind::Interior => PAGE_FLAG_INTERIOR,
            PageKind::Leaf => PAGE_FLAG_LEAF,
            PageKind::Overflow => PAGE_FLAG_OVERFLOW,
            PageKind::Zero => PAGE_FLAG_ZERO,
        }
    }

    /// On-disk header size for pages of this kind. The rightmost-child
    /// field exists only on interior pages.
    pub fn header_size(self) -> usize {
        match self {
            PageKind::Interior => INTERIOR_HEADER_SIZE,
            _ => LEAF_HEADER_SIZE,
        }
    }
}

/// Read-only decoded view over one page buffer.
///
/// `hdr` is the byte offset of the page header within the buffer (100 on
/// page 1, 0 elsewhere); `usable` is the end of usable space. Cell offsets
/// are absolute within the buffer.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
    hdr: usize,
    usable: usize,
}

/// Mutable counterpart of [`PageView`].
pub struct PageMut<'a> {
    data: &'a mut [u8],
    hdr: usize,
    usable: usize,
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn write_u16(data: &mut [u8], off: usize, value: u16) {
    data[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn write_u32(data: &mut [u8], off: usize, value: u32) {
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8], hdr: usize, usable: usize) -> Result<Self> {
        ensure!(
            usable <= data.len(),
            "usable size {} exceeds buffer size {}",
            usable,
            data.len()
        );
        ensure!(
            hdr + INTERIOR_HEADER_SIZE <= usable,
            "page header at {} does not fit in usable space {}",
            hdr,
            usable
        );
        Ok(Self { data, hdr, usable })
    }

    pub fn kind(&self) -> Result<PageKind> {
        PageKind::from_flags(self.data[self.hdr + FLAGS_OFFSET])
    }

    pub fn cell_count(&self) -> usize {
        read_u16(self.data, self.hdr + CELL_COUNT_OFFSET) as usize
    }

    pub fn frag_bytes(&self) -> usize {
        self.data[self.hdr + FRAG_BYTES_OFFSET] as usize
    }

    pub fn first_freeblock(&self) -> usize {
        read_u16(self.data, self.hdr + FREEBLOCK_OFFSET) as usize
    }

    /// First byte of the cell content area. A stored 0 means the area is
    /// empty, i.e. it starts at the end of usable space.
    pub fn content_start(&self) -> usize {
        let raw = read_u16(self.data, self.hdr + CONTENT_START_OFFSET) as usize;
        if raw == 0 {
            self.usable
        } else {
            raw
        }
    }

    pub fn right_child(&self) -> u32 {
        read_u32(self.data, self.hdr + RIGHT_CHILD_OFFSET)
    }

    pub fn usable_end(&self) -> usize {
        self.usable
    }

    fn cells_start(&self) -> Result<usize> {
        Ok(self.hdr + self.kind()?.header_size())
    }

    fn pointer_array_end(&self) -> Result<usize> {
        Ok(self.cells_start()? + self.cell_count() * CELL_POINTER_SIZE)
    }

    /// Bytes of the unallocated gap between the pointer array and the heap.
    pub fn gap(&self) -> Result<usize> {
        let ptr_end = self.pointer_array_end()?;
        let content = self.content_start();
        ensure!(
            ptr_end <= content,
            "cell pointer array at {} overlaps content area at {}",
            ptr_end,
            content
        );
        Ok(content - ptr_end)
    }

    /// Reusable free bytes: the gap plus the freeblock list. Fragmented
    /// bytes are excluded until a defragment folds them back in.
    pub fn free_space(&self) -> Result<usize> {
        Ok(self.gap()? + self.freeblock_bytes()?)
    }

    /// All free bytes including fragments. This is what a defragmented
    /// page would report as `free_space`.
    pub fn total_free(&self) -> Result<usize> {
        Ok(self.free_space()? + self.frag_bytes())
    }

    /// True when the page cannot take a cell of `cell_size` bytes even
    /// after defragmentation.
    pub fn full(&self, cell_size: usize) -> bool {
        match self.total_free() {
            Ok(free) => free < cell_size + CELL_POINTER_SIZE,
            Err(_) => true,
        }
    }

    fn freeblock_bytes(&self) -> Result<usize> {
        let mut total = 0usize;
        let mut off = self.first_freeblock();
        // Chain length is bounded by the number of minimum-size blocks that
        // fit in the heap; anything longer is a cycle.
        let mut remaining = self.usable / MIN_FREEBLOCK_SIZE + 1;

        while off != 0 {
            ensure!(
                remaining > 0,
                "freeblock chain cycle detected at offset {}",
                off
            );
            remaining -= 1;

            ensure!(
                off + MIN_FREEBLOCK_SIZE <= self.usable && off >= self.cells_start()?,
                "freeblock offset {} out of range",
                off
            );

            let size = read_u16(self.data, off + 2) as usize;
            ensure!(
                size >= MIN_FREEBLOCK_SIZE && off + size <= self.usable,
                "freeblock at {} has invalid size {}",
                off,
                size
            );

            total += size;
            off = read_u16(self.data, off) as usize;
        }

        Ok(total)
    }

    pub fn cell_offset(&self, index: usize) -> Result<usize> {
        ensure!(
            index < self.cell_count(),
            "cell index {} out of bounds (cell count {})",
            index,
            self.cell_count()
        );
        let slot = self.cells_start()? + index * CELL_POINTER_SIZE;
        let off = read_u16(self.data, slot) as usize;
        ensure!(
            off >= self.cells_start()? && off < self.usable,
            "cell offset {} out of range [{}, {})",
            off,
            self.cells_start()?,
            self.usable
        );
        Ok(off)
    }

    /// Byte length of the cell body starting at `off`, derived from the
    /// page kind: interior cells are fixed-size, leaf payloads carry their
    /// value count inline.
    pub fn cell_len_at(&self, off: usize) -> Result<usize> {
        let len = match self.kind()? {
            PageKind::Interior => crate::config::INTERIOR_CELL_SIZE,
            PageKind::Leaf => {
                ensure!(
                    off + PAYLOAD_HEADER_SIZE <= self.usable,
                    "payload header at {} extends past usable space",
                    off
                );
                let n = read_u16(self.data, off + 4) as usize;
                PAYLOAD_HEADER_SIZE + n * PAYLOAD_ENTRY_SIZE
            }
            kind => bail!("page kind {:?} has no cells", kind),
        };
        ensure!(
            off + len <= self.usable,
            "cell at {} (len {}) extends past usable space {}",
            off,
            len,
            self.usable
        );
        Ok(len)
    }

    pub fn cell_bytes(&self, index: usize) -> Result<&'a [u8]> {
        let off = self.cell_offset(index)?;
        let len = self.cell_len_at(off)?;
        Ok(&self.data[off..off + len])
    }

    /// Key of cell `index`. Both cell kinds begin with the 4-byte key.
    pub fn cell_key(&self, index: usize) -> Result<u32> {
        let off = self.cell_offset(index)?;
        ensure!(
            off + 4 <= self.usable,
            "cell key at {} extends past usable space",
            off
        );
        Ok(read_u32(self.data, off))
    }

    /// Cheap structural check run when a page is decoded from the Pager.
    pub fn validate(&self, pgno: u32) -> Result<()> {
        let kind = self
            .kind()
            .map_err(|e| WrenError::corruption(pgno, e.to_string()))?;
        if matches!(kind, PageKind::Overflow | PageKind::Zero) {
            return Ok(());
        }

        let cells_start = self.cells_start()?;
        let ptr_end = self.pointer_array_end()?;
        let content = self.content_start();

        if ptr_end > content || content > self.usable {
            return Err(WrenError::corruption(
                pgno,
                format!(
                    "content area [{}, {}) disagrees with {} cell pointers at {}",
                    content, self.usable, self.cell_count(), cells_start
                ),
            )
            .into());
        }

        self.freeblock_bytes()
            .map_err(|e| WrenError::corruption(pgno, e.to_string()))?;

        Ok(())
    }

    /// Thorough per-cell check: offsets in range and bodies non-overlapping.
    /// Used by the tree's integrity walk and by tests.
    pub fn validate_cells(&self, pgno: u32) -> Result<()> {
        let mut extents: Vec<(usize, usize)> = Vec::with_capacity(self.cell_count());

        for i in 0..self.cell_count() {
            let off = self
                .cell_offset(i)
                .map_err(|e| WrenError::corruption(pgno, e.to_string()))?;
            let len = self
                .cell_len_at(off)
                .map_err(|e| WrenError::corruption(pgno, e.to_string()))?;
            if off < self.content_start() {
                return Err(WrenError::corruption(
                    pgno,
                    format!("cell {} at {} sits below the content area", i, off),
                )
                .into());
            }
            extents.push((off, len));
        }

        extents.sort_unstable();
        for pair in extents.windows(2) {
            let (off, len) = pair[0];
            if off + len > pair[1].0 {
                return Err(WrenError::corruption(
                    pgno,
                    format!("cell bodies at {} and {} overlap", off, pair[1].0),
                )
                .into());
            }
        }

        Ok(())
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8], hdr: usize, usable: usize) -> Result<Self> {
        ensure!(
            usable <= data.len(),
            "usable size {} exceeds buffer size {}",
            usable,
            data.len()
        );
        ensure!(
            hdr + INTERIOR_HEADER_SIZE <= usable,
            "page header at {} does not fit in usable space {}",
            hdr,
            usable
        );
        Ok(Self { data, hdr, usable })
    }

    /// Initializes a fresh page of `kind`: empty pointer array, content
    /// area starting at the end of usable space, no freeblocks.
    pub fn init(data: &'a mut [u8], hdr: usize, usable: usize, kind: PageKind) -> Result<Self> {
        let mut page = Self::new(data, hdr, usable)?;
        let end = (page.hdr + INTERIOR_HEADER_SIZE).min(page.usable);
        page.data[page.hdr..end].fill(0);
        page.data[page.hdr + FLAGS_OFFSET] = kind.flags();
        page.set_content_start(usable);
        Ok(page)
    }

    pub fn as_view(&self) -> PageView<'_> {
        PageView {
            data: self.data,
            hdr: self.hdr,
            usable: self.usable,
        }
    }

    pub fn kind(&self) -> Result<PageKind> {
        self.as_view().kind()
    }

    pub fn cell_count(&self) -> usize {
        self.as_view().cell_count()
    }

    pub fn free_space(&self) -> Result<usize> {
        self.as_view().free_space()
    }

    pub fn total_free(&self) -> Result<usize> {
        self.as_view().total_free()
    }

    pub fn full(&self, cell_size: usize) -> bool {
        self.as_view().full(cell_size)
    }

    pub fn right_child(&self) -> u32 {
        self.as_view().right_child()
    }

    pub fn set_right_child(&mut self, pgno: u32) {
        write_u32(self.data, self.hdr + RIGHT_CHILD_OFFSET, pgno);
    }

    fn set_cell_count(&mut self, count: usize) {
        write_u16(self.data, self.hdr + CELL_COUNT_OFFSET, count as u16);
    }

    fn set_content_start(&mut self, off: usize) {
        // 65536 wraps to 0 in the 16-bit field; content_start() undoes it.
        write_u16(self.data, self.hdr + CONTENT_START_OFFSET, off as u16);
    }

    fn set_first_freeblock(&mut self, off: usize) {
        write_u16(self.data, self.hdr + FREEBLOCK_OFFSET, off as u16);
    }

    fn set_frag_bytes(&mut self, frag: usize) {
        self.data[self.hdr + FRAG_BYTES_OFFSET] = frag as u8;
    }

    fn slot_offset(&self, index: usize) -> Result<usize> {
        Ok(self.hdr + self.kind()?.header_size() + index * CELL_POINTER_SIZE)
    }

    /// First-fit allocation from the freeblock list. Returns the offset of
    /// the carved region, or `None` when no block fits.
    fn alloc_from_freeblocks(&mut self, len: usize) -> Result<Option<usize>> {
        let view = self.as_view();
        let cells_start = view.cells_start()?;
        drop(view);

        // prev == None means the list head pointer in the page header.
        let mut prev: Option<usize> = None;
        let mut off = self.as_view().first_freeblock();
        let mut remaining = self.usable / MIN_FREEBLOCK_SIZE + 1;

        while off != 0 {
            ensure!(remaining > 0, "freeblock chain cycle detected at {}", off);
            remaining -= 1;
            ensure!(
                off + MIN_FREEBLOCK_SIZE <= self.usable && off >= cells_start,
                "freeblock offset {} out of range",
                off
            );

            let next = read_u16(self.data, off) as usize;
            let size = read_u16(self.data, off + 2) as usize;
            ensure!(
                size >= MIN_FREEBLOCK_SIZE && off + size <= self.usable,
                "freeblock at {} has invalid size {}",
                off,
                size
            );

            if size >= len {
                let remainder = size - len;
                if remainder >= MIN_FREEBLOCK_SIZE {
                    // Keep the tail of the block as a smaller freeblock.
                    let rest = off + len;
                    write_u16(self.data, rest, next as u16);
                    write_u16(self.data, rest + 2, remainder as u16);
                    self.relink_freeblock(prev, rest);
                    return Ok(Some(off));
                }

                let frag = self.as_view().frag_bytes();
                if frag + remainder <= u8::MAX as usize {
                    self.relink_freeblock(prev, next);
                    self.set_frag_bytes(frag + remainder);
                    return Ok(Some(off));
                }
                // Fragment counter would overflow; leave this block alone.
            }

            prev = Some(off);
            off = next;
        }

        Ok(None)
    }

    fn relink_freeblock(&mut self, prev: Option<usize>, next: usize) {
        match prev {
            Some(p) => write_u16(self.data, p, next as u16),
            None => self.set_first_freeblock(next),
        }
    }

    /// Inserts `bytes` as cell `index`, shifting later cell pointers down.
    ///
    /// Allocation tries the freeblock list first, then the unallocated gap.
    /// Fails without mutating when no contiguous run fits; the caller is
    /// expected to check [`PageView::full`] and to [`PageMut::defragment`]
    /// when `total_free` would fit but `free_space` is too scattered.
    pub fn insert_cell(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        let cell_count = self.cell_count();
        ensure!(
            index <= cell_count,
            "insert index {} out of bounds (cell count {})",
            index,
            cell_count
        );
        ensure!(
            len >= MIN_FREEBLOCK_SIZE,
            "cell of {} bytes is below the minimum cell size",
            len
        );

        let gap = self.as_view().gap()?;
        ensure!(
            gap >= CELL_POINTER_SIZE,
            "no room for a cell pointer (defragment first)"
        );

        let off = match self.alloc_from_freeblocks(len)? {
            Some(off) => off,
            None => {
                let content = self.as_view().content_start();
                let ptr_end = self.as_view().pointer_array_end()?;
                ensure!(
                    content >= len && content - len >= ptr_end + CELL_POINTER_SIZE,
                    "insufficient contiguous space for {} byte cell (defragment first)",
                    len
                );
                let off = content - len;
                self.set_content_start(off);
                off
            }
        };

        self.data[off..off + len].copy_from_slice(bytes);

        let slot = self.slot_offset(index)?;
        let ptr_end = self.slot_offset(cell_count)?;
        self.data.copy_within(slot..ptr_end, slot + CELL_POINTER_SIZE);
        write_u16(self.data, slot, off as u16);
        self.set_cell_count(cell_count + 1);

        Ok(())
    }

    /// Mutable access to the body of cell `index`, for in-place rewrites
    /// that do not change the cell's size.
    pub fn cell_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let view = self.as_view();
        let off = view.cell_offset(index)?;
        let len = view.cell_len_at(off)?;
        Ok(&mut self.data[off..off + len])
    }

    /// Removes cell `index`, returning its body to the freeblock list.
    pub fn delete_cell(&mut self, index: usize) -> Result<()> {
        let cell_count = self.cell_count();
        ensure!(
            index < cell_count,
            "delete index {} out of bounds (cell count {})",
            index,
            cell_count
        );

        let view = self.as_view();
        let off = view.cell_offset(index)?;
        let len = view.cell_len_at(off)?;
        drop(view);

        let slot = self.slot_offset(index)?;
        let ptr_end = self.slot_offset(cell_count)?;
        self.data
            .copy_within(slot + CELL_POINTER_SIZE..ptr_end, slot);
        self.set_cell_count(cell_count - 1);

        // Cell bodies are always >= MIN_FREEBLOCK_SIZE, so the freed region
        // can carry a freeblock header.
        let head = self.as_view().first_freeblock();
        write_u16(self.data, off, head as u16);
        write_u16(self.data, off + 2, len as u16);
        self.set_first_freeblock(off);

        Ok(())
    }

    /// Rewrites all live cells contiguously at the high end of usable space
    /// in cell-pointer-array order, empties the freeblock list, and resets
    /// the fragmented-bytes counter. Idempotent.
    pub fn defragment(&mut self) -> Result<()> {
        let cell_count = self.cell_count();

        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(cell_count);
        {
            let view = self.as_view();
            for i in 0..cell_count {
                bodies.push(view.cell_bytes(i)?.to_vec());
            }
        }

        let mut top = self.usable;
        for (i, body) in bodies.iter().enumerate() {
            top -= body.len();
            self.data[top..top + body.len()].copy_from_slice(body);
            let slot = self.slot_offset(i)?;
            write_u16(self.data, slot, top as u16);
        }

        let ptr_end = self.slot_offset(cell_count)?;
        self.data[ptr_end..top].fill(0);

        self.set_content_start(top);
        self.set_first_freeblock(0);
        self.set_frag_bytes(0);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::INTERIOR_CELL_SIZE;

    const USABLE: usize = 512;

    fn leaf_cell(key: u32, values: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAYLOAD_HEADER_SIZE + 4 * values.len());
        bytes.extend_from_slice(&key.to_le_bytes());
        bytes.extend_from_slice(&(values.len() as u16).to_le_bytes());
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn interior_cell(key: u32, child: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INTERIOR_CELL_SIZE);
        bytes.extend_from_slice(&key.to_le_bytes());
        bytes.extend_from_slice(&child.to_le_bytes());
        bytes
    }

    #[test]
    fn init_leaf_has_empty_content_area() {
        let mut buf = vec![0u8; USABLE];
        let page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        let view = page.as_view();
        assert_eq!(view.kind().unwrap(), PageKind::Leaf);
        assert_eq!(view.cell_count(), 0);
        assert_eq!(view.content_start(), USABLE);
        assert_eq!(view.first_freeblock(), 0);
        assert_eq!(view.free_space().unwrap(), USABLE - LEAF_HEADER_SIZE);
    }

    #[test]
    fn init_interior_reserves_larger_header() {
        let mut buf = vec![0u8; USABLE];
        let page = PageMut::init(&mut buf, 0, USABLE, PageKind::Interior).unwrap();
        assert_eq!(
            page.as_view().free_space().unwrap(),
            USABLE - INTERIOR_HEADER_SIZE
        );
    }

    #[test]
    fn insert_and_read_cells_in_slot_order() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        page.insert_cell(0, &leaf_cell(30, &[3])).unwrap();
        page.insert_cell(0, &leaf_cell(10, &[1])).unwrap();
        page.insert_cell(1, &leaf_cell(20, &[2, 22])).unwrap();

        let view = page.as_view();
        assert_eq!(view.cell_count(), 3);
        assert_eq!(view.cell_key(0).unwrap(), 10);
        assert_eq!(view.cell_key(1).unwrap(), 20);
        assert_eq!(view.cell_key(2).unwrap(), 30);
        assert_eq!(view.cell_bytes(1).unwrap(), leaf_cell(20, &[2, 22]));
        view.validate_cells(7).unwrap();
    }

    #[test]
    fn delete_links_body_into_freeblock_list() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        page.insert_cell(0, &leaf_cell(1, &[11])).unwrap();
        page.insert_cell(1, &leaf_cell(2, &[22])).unwrap();
        let before = page.free_space().unwrap();

        page.delete_cell(0).unwrap();

        let view = page.as_view();
        assert_eq!(view.cell_count(), 1);
        assert_eq!(view.cell_key(0).unwrap(), 2);
        assert_ne!(view.first_freeblock(), 0);
        assert_eq!(view.free_space().unwrap(), before + 10 + CELL_POINTER_SIZE);
    }

    #[test]
    fn freeblock_reused_first_fit() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        page.insert_cell(0, &leaf_cell(1, &[1])).unwrap();
        page.insert_cell(1, &leaf_cell(2, &[2])).unwrap();
        page.delete_cell(0).unwrap();
        let gap_before = page.as_view().gap().unwrap();

        // Same-size cell lands exactly in the freed block; the gap is
        // consumed only by the new pointer entry.
        page.insert_cell(0, &leaf_cell(3, &[3])).unwrap();
        assert_eq!(page.as_view().first_freeblock(), 0);
        assert_eq!(page.as_view().gap().unwrap(), gap_before - CELL_POINTER_SIZE);
    }

    #[test]
    fn four_byte_remainder_stays_on_freeblock_list() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        page.insert_cell(0, &leaf_cell(1, &[1, 2])).unwrap(); // 14 bytes
        page.insert_cell(1, &leaf_cell(9, &[9])).unwrap();
        page.delete_cell(0).unwrap();

        // A 10-byte cell carves the 14-byte block, leaving a 4-byte
        // remainder that is big enough to stay a freeblock.
        page.insert_cell(0, &leaf_cell(5, &[5])).unwrap();
        let view = page.as_view();
        assert_eq!(view.frag_bytes(), 0);
        assert_ne!(view.first_freeblock(), 0);
        assert_eq!(view.freeblock_bytes().unwrap(), 4);
    }

    #[test]
    fn small_remainder_becomes_fragmented_bytes() {
        let mut buf = vec![0u8; USABLE];
        let freeblock_off;
        {
            let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();
            page.insert_cell(0, &leaf_cell(1, &[1, 2])).unwrap(); // 14 bytes
            page.insert_cell(1, &leaf_cell(9, &[9])).unwrap();
            page.delete_cell(0).unwrap();
            freeblock_off = page.as_view().first_freeblock();
        }

        // Payload cell sizes are all even multiples-of-four plus six, so an
        // odd-sized block only appears through external damage or a future
        // cell format; shrink the block by hand to force a 3-byte remainder.
        write_u16(&mut buf, freeblock_off + 2, 13);

        let mut page = PageMut::new(&mut buf, 0, USABLE).unwrap();
        page.insert_cell(0, &leaf_cell(5, &[5])).unwrap(); // 10 bytes

        let view = page.as_view();
        assert_eq!(view.first_freeblock(), 0);
        assert_eq!(view.frag_bytes(), 3);

        page.defragment().unwrap();
        assert_eq!(page.as_view().frag_bytes(), 0);
    }

    #[test]
    fn defragment_collapses_freeblocks_and_fragments() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        for (i, key) in [10u32, 20, 30, 40].iter().enumerate() {
            page.insert_cell(i, &leaf_cell(*key, &[*key])).unwrap();
        }
        page.delete_cell(1).unwrap();
        page.delete_cell(1).unwrap();

        let total_before = page.total_free().unwrap();
        let keys_before: Vec<u32> = {
            let view = page.as_view();
            (0..view.cell_count())
                .map(|i| view.cell_key(i).unwrap())
                .collect()
        };

        page.defragment().unwrap();

        let view = page.as_view();
        assert_eq!(view.first_freeblock(), 0);
        assert_eq!(view.frag_bytes(), 0);
        assert_eq!(view.free_space().unwrap(), total_before);
        assert_eq!(view.gap().unwrap(), total_before);
        let keys_after: Vec<u32> = (0..view.cell_count())
            .map(|i| view.cell_key(i).unwrap())
            .collect();
        assert_eq!(keys_before, keys_after);
    }

    #[test]
    fn defragment_is_idempotent() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        for (i, key) in [5u32, 6, 7].iter().enumerate() {
            page.insert_cell(i, &leaf_cell(*key, &[1, 2, 3])).unwrap();
        }
        page.delete_cell(0).unwrap();

        page.defragment().unwrap();
        let image: Vec<u8> = page.as_view().raw().to_vec();
        let free = page.free_space().unwrap();
        let count = page.cell_count();

        page.defragment().unwrap();
        assert_eq!(page.as_view().raw(), &image[..]);
        assert_eq!(page.free_space().unwrap(), free);
        assert_eq!(page.cell_count(), count);
    }

    #[test]
    fn insert_refuses_scattered_space_without_defrag() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();

        // Fill the page with 10-byte cells until the gap runs dry.
        let mut i = 0u32;
        loop {
            let cell = leaf_cell(i, &[i]);
            if page.as_view().gap().unwrap() < cell.len() + CELL_POINTER_SIZE {
                break;
            }
            page.insert_cell(i as usize, &cell).unwrap();
            i += 1;
        }

        // Free two non-adjacent cells: 20 scattered bytes, none contiguous
        // enough for an 18-byte payload.
        page.delete_cell(0).unwrap();
        page.delete_cell(2).unwrap();

        let big = leaf_cell(999, &[1, 2, 3]); // 18 bytes
        assert!(!page.full(big.len()));
        assert!(page.insert_cell(0, &big).is_err());

        page.defragment().unwrap();
        page.insert_cell(0, &big).unwrap();
    }

    #[test]
    fn interior_cells_are_fixed_size() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Interior).unwrap();

        page.insert_cell(0, &interior_cell(100, 2)).unwrap();
        page.insert_cell(1, &interior_cell(200, 3)).unwrap();
        page.set_right_child(4);

        let view = page.as_view();
        assert_eq!(view.cell_bytes(0).unwrap().len(), INTERIOR_CELL_SIZE);
        assert_eq!(view.cell_key(1).unwrap(), 200);
        assert_eq!(view.right_child(), 4);
    }

    #[test]
    fn page_one_header_offset() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 100, USABLE, PageKind::Leaf).unwrap();
        page.insert_cell(0, &leaf_cell(1, &[1])).unwrap();

        let view = PageView::new(&buf, 100, USABLE).unwrap();
        assert_eq!(view.cell_count(), 1);
        assert_eq!(
            view.free_space().unwrap(),
            USABLE - 100 - LEAF_HEADER_SIZE - CELL_POINTER_SIZE - 10
        );
        view.validate(1).unwrap();
    }

    #[test]
    fn validate_rejects_bad_flags() {
        let mut buf = vec![0u8; USABLE];
        buf[0] = 0x03; // interior | leaf is not a valid combination

        let view = PageView::new(&buf, 0, USABLE).unwrap();
        let err = view.validate(9).unwrap_err();
        let wren = err.downcast_ref::<crate::error::WrenError>().unwrap();
        assert!(matches!(
            wren,
            crate::error::WrenError::Corruption { pgno: 9, .. }
        ));
    }

    #[test]
    fn validate_rejects_overlapping_cells() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();
        page.insert_cell(0, &leaf_cell(1, &[1])).unwrap();
        page.insert_cell(1, &leaf_cell(2, &[2])).unwrap();

        // Point both slots at the same body.
        let first = {
            let view = page.as_view();
            view.cell_offset(0).unwrap()
        };
        let slot1 = LEAF_HEADER_SIZE + CELL_POINTER_SIZE;
        buf[slot1..slot1 + 2].copy_from_slice(&(first as u16).to_le_bytes());

        let view = PageView::new(&buf, 0, USABLE).unwrap();
        assert!(view.validate_cells(3).is_err());
    }

    #[test]
    fn round_trip_is_stable() {
        let mut buf = vec![0u8; USABLE];
        let mut page = PageMut::init(&mut buf, 0, USABLE, PageKind::Leaf).unwrap();
        for (i, key) in [3u32, 9, 27].iter().enumerate() {
            page.insert_cell(i, &leaf_cell(*key, &[*key, key * 2])).unwrap();
        }

        // Decoding and re-reading every field mutates nothing.
        let before = buf.clone();
        let view = PageView::new(&buf, 0, USABLE).unwrap();
        for i in 0..view.cell_count() {
            view.cell_bytes(i).unwrap();
        }
        view.free_space().unwrap();
        assert_eq!(buf, before);
    }
}
