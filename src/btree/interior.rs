//! # Interior Nodes
//!
//! An interior page holds separator cells `(key, child)` in strict
//! key-ascending slot order plus one rightmost child in the page header.
//! The subtree behind `child` holds keys strictly below `key`; the
//! rightmost child holds everything at or above the last separator.
//!
//! Navigation is a binary search for the smallest slot whose key is
//! strictly greater than the target — equal keys descend to the right,
//! matching separators that are the first key of their right sibling.

use eyre::{ensure, Result};
use zerocopy::IntoBytes;

use crate::btree::cell::{InteriorCell, Key};
use crate::config::{CELL_POINTER_SIZE, INTERIOR_CELL_SIZE};
use crate::storage::page::{PageKind, PageMut, PageView};

/// Which pointer of an interior page a descent followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPos {
    /// The child of cell `i`.
    Cell(usize),
    /// The rightmost child from the page header.
    Rightmost,
}

#[derive(Debug, Clone, Copy)]
pub struct InteriorView<'a> {
    page: PageView<'a>,
}

pub struct InteriorMut<'a> {
    page: PageMut<'a>,
}

/// Smallest slot with `slot key > key` (strict), or `cell_count` when
/// every separator is `<= key`.
fn upper_bound(page: &PageView<'_>, key: Key) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = page.cell_count();

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if page.cell_key(mid)? <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    Ok(lo)
}

impl<'a> InteriorView<'a> {
    pub fn new(page: PageView<'a>) -> Result<Self> {
        let kind = page.kind()?;
        ensure!(
            kind == PageKind::Interior,
            "expected interior page, got {:?}",
            kind
        );
        Ok(Self { page })
    }

    pub fn cell_count(&self) -> usize {
        self.page.cell_count()
    }

    pub fn right_child(&self) -> u32 {
        self.page.right_child()
    }

    pub fn cell_at(&self, slot: usize) -> Result<InteriorCell> {
        Ok(*InteriorCell::from_bytes(self.page.cell_bytes(slot)?)?)
    }

    pub fn key_at(&self, slot: usize) -> Result<Key> {
        self.page.cell_key(slot)
    }

    /// Child page a search for `key` descends into, and where that
    /// pointer lives.
    pub fn find_child(&self, key: Key) -> Result<(u32, ChildPos)> {
        let slot = upper_bound(&self.page, key)?;
        if slot < self.cell_count() {
            Ok((self.cell_at(slot)?.child(), ChildPos::Cell(slot)))
        } else {
            Ok((self.right_child(), ChildPos::Rightmost))
        }
    }
}

impl<'a> InteriorMut<'a> {
    pub fn new(page: PageMut<'a>) -> Result<Self> {
        let kind = page.kind()?;
        ensure!(
            kind == PageKind::Interior,
            "expected interior page, got {:?}",
            kind
        );
        Ok(Self { page })
    }

    pub fn init(data: &'a mut [u8], hdr: usize, usable: usize, right_child: u32) -> Result<Self> {
        let mut page = PageMut::init(data, hdr, usable, PageKind::Interior)?;
        page.set_right_child(right_child);
        Ok(Self { page })
    }

    pub fn cell_count(&self) -> usize {
        self.page.cell_count()
    }

    pub fn right_child(&self) -> u32 {
        self.page.right_child()
    }

    pub fn set_right_child(&mut self, pgno: u32) {
        self.page.set_right_child(pgno);
    }

    pub fn cell_at(&self, slot: usize) -> Result<InteriorCell> {
        Ok(*InteriorCell::from_bytes(self.page.as_view().cell_bytes(slot)?)?)
    }

    pub fn find_child(&self, key: Key) -> Result<(u32, ChildPos)> {
        let view = self.page.as_view();
        let slot = upper_bound(&view, key)?;
        if slot < view.cell_count() {
            let cell = InteriorCell::from_bytes(view.cell_bytes(slot)?)?;
            Ok((cell.child(), ChildPos::Cell(slot)))
        } else {
            Ok((view.right_child(), ChildPos::Rightmost))
        }
    }

    /// True when one more separator cell fits, counting defragmentable
    /// space.
    pub fn fits(&self) -> bool {
        !self.page.full(INTERIOR_CELL_SIZE)
    }

    /// Inserts `(key, child)` as slot `slot`, defragmenting once if free
    /// space is scattered.
    pub fn insert_separator(&mut self, slot: usize, key: Key, child: u32) -> Result<()> {
        ensure!(
            !self.page.full(INTERIOR_CELL_SIZE),
            "interior page full: {} free",
            self.page.total_free()? + CELL_POINTER_SIZE
        );
        let cell = InteriorCell::new(key, child);
        match self.page.insert_cell(slot, cell.as_bytes()) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.page.defragment()?;
                self.page.insert_cell(slot, cell.as_bytes())
            }
        }
    }

    /// Repoints the child of an existing cell without moving it.
    pub fn set_cell_child(&mut self, slot: usize, child: u32) -> Result<()> {
        let bytes = self.page.cell_bytes_mut(slot)?;
        bytes[4..8].copy_from_slice(&child.to_le_bytes());
        Ok(())
    }
}
