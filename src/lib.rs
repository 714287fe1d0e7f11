//! # wrendb - Embedded Single-File Document-Id Index
//!
//! wrendb is an embedded, single-file on-disk index: a B+tree keyed by
//! 32-bit integers over a fixed-size page cache with LRU eviction and
//! dirty-list tracking. Each key maps to a posting list of document ids.
//!
//! ## Quick Start
//!
//! ```ignore
//! use wrendb::{BPlusTree, CacheConfig, FilePager, PageCache};
//!
//! let pager = FilePager::create("index.wren", 4096)?;
//! let cache = PageCache::new(CacheConfig::with_page_size(4096))?;
//! let mut tree = BPlusTree::create(pager, cache)?;
//!
//! tree.insert(42, 7)?;
//! tree.insert(42, 9)?;
//! assert_eq!(tree.payload(42)?, Some(vec![7, 9]));
//!
//! tree.flush()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        B+Tree Engine (btree)         │
//! │   search / insert / split / flush    │
//! ├─────────────────────────────────────┤
//! │      Node Views (leaf, interior)     │
//! ├─────────────────────────────────────┤
//! │    Slotted Page Codec (storage)      │
//! ├─────────────────────────────────────┤
//! │  Page Cache: hash + LRU + dirty list │
//! ├─────────────────────────────────────┤
//! │   Pager trait (MemPager, FilePager)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! The tree addresses pages by number and never touches backing storage
//! directly: every access goes through the cache, and cache misses read
//! through the [`storage::Pager`] interface. Mutations dirty pages in the
//! cache; [`btree::BPlusTree::flush`] writes the dirty list back through
//! the Pager, newest first.
//!
//! ## On-Disk Format
//!
//! Little-endian throughout. Page sizes are powers of two from 512 to
//! 65536. Page 1 starts with a 100-byte file header (magic, page size,
//! usable size, root page number, page count); every page is a slotted
//! page with a growing-down cell-pointer array and a growing-up cell
//! heap. See [`storage::page`] for the byte layout.
//!
//! ## Concurrency Model
//!
//! Single writer, cooperative. The cache's internal mutex guards its
//! bookkeeping; page buffers are guarded by pin counts. Pager I/O never
//! runs under the cache mutex. Readers may share a tree only under an
//! external lock; nothing here performs its own cross-thread write
//! coordination.
//!
//! ## Module Overview
//!
//! - [`btree`]: the tree engine and node views
//! - [`storage`]: slotted-page codec, page cache, file header, Pager
//! - [`config`]: layout and sizing constants
//! - [`error`]: the [`error::WrenError`] taxonomy

pub mod btree;
pub mod config;
pub mod error;
pub mod storage;

pub use btree::{BPlusTree, DocId, Key, Payload};
pub use error::WrenError;
pub use storage::{CacheConfig, CacheStats, FilePager, MemPager, PageCache, Pager};
