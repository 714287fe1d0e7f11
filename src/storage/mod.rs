//! # Storage Layer
//!
//! Everything below the tree: the slotted-page codec, the page cache, the
//! file header, and the Pager interface with its in-memory and
//! memory-mapped implementations.
//!
//! ## Module Organization
//!
//! - [`page`]: slotted-page byte layout — header, cell-pointer array,
//!   cell heap, freeblocks, defragmentation
//! - [`cache`]: the buffer pool — hash lookup, LRU recycling, dirty-list
//!   tracking, pin-based guards
//! - [`headers`]: the 100-byte file header on page 1
//! - [`pager`]: the consumed block-I/O trait plus [`MemPager`] and
//!   [`FilePager`]
//!
//! ## Data Flow
//!
//! ```text
//! BPlusTree ──fetch──▶ PageCache ──miss──▶ Pager::read_page
//!     │                    │
//!     │ mutate via guard   │ recycle clean LRU tail
//!     ▼                    ▼
//! mark dirty ──flush──▶ Pager::write_page
//! ```
//!
//! The cache is the only component that holds page buffers; the codec is
//! pure over byte slices and the Pager only ever sees whole pages.

pub mod cache;
pub mod headers;
pub mod page;
pub mod pager;

pub use cache::{CacheConfig, CacheStats, Fetched, PageCache, PageGuard};
pub use headers::FileHeader;
pub use page::{PageKind, PageMut, PageView};
pub use pager::{FilePager, MemPager, Pager};
