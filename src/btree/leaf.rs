//! # Leaf Nodes
//!
//! A leaf page holds payload cells — one posting list per key — in strict
//! key-ascending slot order. Lookup is a binary search over the
//! cell-pointer array for the smallest slot whose key is `>= target`; the
//! key sits in the first four bytes of every cell, so the search never
//! decodes a full payload.
//!
//! Leaves have no sibling chain. Range traversal, when it is needed at
//! all, goes through the parent; the structures here only answer point
//! queries and slot-level mutation for the tree above.

use eyre::{bail, ensure, Result};

use crate::btree::cell::{Key, Payload};
use crate::config::CELL_POINTER_SIZE;
use crate::storage::page::{PageKind, PageMut, PageView};

/// Outcome of a slot search: the exact slot, or the slot a new cell for
/// the key would occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct LeafView<'a> {
    page: PageView<'a>,
}

pub struct LeafMut<'a> {
    page: PageMut<'a>,
}

fn search_slots(page: &PageView<'_>, key: Key) -> Result<SearchResult> {
    let count = page.cell_count();
    let mut lo = 0usize;
    let mut hi = count;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if page.cell_key(mid)? < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    if lo < count && page.cell_key(lo)? == key {
        Ok(SearchResult::Found(lo))
    } else {
        Ok(SearchResult::NotFound(lo))
    }
}

impl<'a> LeafView<'a> {
    pub fn new(page: PageView<'a>) -> Result<Self> {
        let kind = page.kind()?;
        ensure!(
            kind == PageKind::Leaf,
            "expected leaf page, got {:?}",
            kind
        );
        Ok(Self { page })
    }

    pub fn cell_count(&self) -> usize {
        self.page.cell_count()
    }

    /// Smallest slot with `slot key >= key`; found iff equal.
    pub fn search(&self, key: Key) -> Result<SearchResult> {
        search_slots(&self.page, key)
    }

    pub fn payload_at(&self, slot: usize) -> Result<Payload> {
        Payload::decode(self.page.cell_bytes(slot)?)
    }

    pub fn key_at(&self, slot: usize) -> Result<Key> {
        self.page.cell_key(slot)
    }
}

impl<'a> LeafMut<'a> {
    pub fn new(page: PageMut<'a>) -> Result<Self> {
        let kind = page.kind()?;
        ensure!(
            kind == PageKind::Leaf,
            "expected leaf page, got {:?}",
            kind
        );
        Ok(Self { page })
    }

    pub fn init(data: &'a mut [u8], hdr: usize, usable: usize) -> Result<Self> {
        Ok(Self {
            page: PageMut::init(data, hdr, usable, PageKind::Leaf)?,
        })
    }

    pub fn cell_count(&self) -> usize {
        self.page.cell_count()
    }

    pub fn search(&self, key: Key) -> Result<SearchResult> {
        search_slots(&self.page.as_view(), key)
    }

    pub fn payload_at(&self, slot: usize) -> Result<Payload> {
        Payload::decode(self.page.as_view().cell_bytes(slot)?)
    }

    /// True when a new cell of `payload`'s size fits, counting space that
    /// a defragment could reclaim.
    pub fn fits(&self, payload: &Payload) -> bool {
        !self.page.full(payload.byte_size())
    }

    /// True when the cell in `slot` can be replaced by `payload` without
    /// splitting: the freed body counts toward the space the replacement
    /// needs.
    pub fn fits_replacement(&self, slot: usize, payload: &Payload) -> Result<bool> {
        let view = self.page.as_view();
        let old_len = view.cell_len_at(view.cell_offset(slot)?)?;
        Ok(view.total_free()? + old_len >= payload.byte_size())
    }

    /// Inserts `payload` as slot `slot`, defragmenting once if the free
    /// space is there but scattered.
    pub fn insert_payload(&mut self, slot: usize, payload: &Payload) -> Result<()> {
        let bytes = payload.encode();
        if self.page.full(bytes.len()) {
            bail!(
                "leaf page full: {} byte payload, {} free",
                bytes.len() + CELL_POINTER_SIZE,
                self.page.total_free()?
            );
        }
        match self.page.insert_cell(slot, &bytes) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.page.defragment()?;
                self.page.insert_cell(slot, &bytes)
            }
        }
    }

    /// Replaces the payload in `slot`. The caller has checked
    /// [`LeafMut::fits_replacement`]; a grown posting list that no longer
    /// fits goes through a split instead.
    pub fn replace_payload(&mut self, slot: usize, payload: &Payload) -> Result<()> {
        self.page.delete_cell(slot)?;
        let bytes = payload.encode();
        match self.page.insert_cell(slot, &bytes) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.page.defragment()?;
                self.page.insert_cell(slot, &bytes)
            }
        }
    }
}
