//! # Cell Encodings
//!
//! Two cell shapes live in tree pages, both starting with the 4-byte
//! little-endian key so key comparisons never need to know the page kind:
//!
//! ```text
//! Interior cell (8 bytes):
//! +--------------------+--------------------+
//! |    key (4B LE)     |  child pgno (4B)   |
//! +--------------------+--------------------+
//!
//! Leaf payload cell (6 + 4·n bytes):
//! +------------+---------+----------+----------+-----+----------+
//! | key (4B)   | n (2B)  | id 0 (4B)| id 1     | ... | id n-1   |
//! +------------+---------+----------+----------+-----+----------+
//! ```
//!
//! A payload is the posting list for one key: every document id filed
//! under it, kept in insertion order. Appending an id that is already
//! present is a no-op at the tree level, so a `(key, id)` pair inserts
//! idempotently.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{INTERIOR_CELL_SIZE, PAYLOAD_ENTRY_SIZE, PAYLOAD_HEADER_SIZE};

/// Index key. Totally ordered, 32 bits.
pub type Key = u32;

/// Value filed under a key.
pub type DocId = u32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InteriorCell {
    key: U32,
    child: U32,
}

const _: () = assert!(std::mem::size_of::<InteriorCell>() == INTERIOR_CELL_SIZE);

impl InteriorCell {
    pub fn new(key: Key, child: u32) -> Self {
        Self {
            key: U32::new(key),
            child: U32::new(child),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= INTERIOR_CELL_SIZE,
            "buffer too small for InteriorCell: {}",
            bytes.len()
        );
        Self::ref_from_bytes(&bytes[..INTERIOR_CELL_SIZE])
            .map_err(|e| eyre::eyre!("failed to read InteriorCell: {:?}", e))
    }

    pub fn key(&self) -> Key {
        self.key.get()
    }

    pub fn child(&self) -> u32 {
        self.child.get()
    }
}

/// Posting list for one key in a leaf page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: Key,
    pub values: SmallVec<[DocId; 4]>,
}

impl Payload {
    pub fn new(key: Key, doc_id: DocId) -> Self {
        let mut values = SmallVec::new();
        values.push(doc_id);
        Self { key, values }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= PAYLOAD_HEADER_SIZE,
            "payload cell truncated: {} bytes",
            bytes.len()
        );
        let key = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let n = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        ensure!(
            bytes.len() == PAYLOAD_HEADER_SIZE + n * PAYLOAD_ENTRY_SIZE,
            "payload cell for key {} declares {} values but is {} bytes",
            key,
            n,
            bytes.len()
        );

        let mut values = SmallVec::with_capacity(n);
        for i in 0..n {
            let off = PAYLOAD_HEADER_SIZE + i * PAYLOAD_ENTRY_SIZE;
            values.push(u32::from_le_bytes([
                bytes[off],
                bytes[off + 1],
                bytes[off + 2],
                bytes[off + 3],
            ]));
        }

        Ok(Self { key, values })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_size());
        bytes.extend_from_slice(&self.key.to_le_bytes());
        bytes.extend_from_slice(&(self.values.len() as u16).to_le_bytes());
        for v in &self.values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn byte_size(&self) -> usize {
        PAYLOAD_HEADER_SIZE + self.values.len() * PAYLOAD_ENTRY_SIZE
    }

    pub fn contains(&self, doc_id: DocId) -> bool {
        self.values.contains(&doc_id)
    }

    pub fn push(&mut self, doc_id: DocId) {
        self.values.push(doc_id);
    }
}

/// Tagged cell for code that handles both page kinds, mirroring the two
/// page flags. The page-kind check becomes a pattern match.
#[derive(Debug, Clone)]
pub enum CellKind {
    Interior(InteriorCell),
    Leaf(Payload),
}

impl CellKind {
    pub fn byte_size(&self) -> usize {
        match self {
            CellKind::Interior(_) => INTERIOR_CELL_SIZE,
            CellKind::Leaf(payload) => payload.byte_size(),
        }
    }

    pub fn key(&self) -> Key {
        match self {
            CellKind::Interior(cell) => cell.key(),
            CellKind::Leaf(payload) => payload.key,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            CellKind::Interior(cell) => cell.as_bytes().to_vec(),
            CellKind::Leaf(payload) => payload.encode(),
        }
    }
}
