//! # Configuration Constants
//!
//! This module centralizes the layout and sizing constants for wrendb,
//! grouping interdependent values together so a change in one place cannot
//! silently invalidate another. Constants that depend on each other are
//! co-located and the relationships are enforced with compile-time
//! assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! FILE_HEADER_SIZE (100 bytes, page 1 only)
//!       │
//!       └─> page 1 usable region starts at FILE_HEADER_SIZE; every other
//!           page starts at offset 0
//!
//! MIN_PAGE_SIZE (512) / MAX_PAGE_SIZE (65536)
//!       │
//!       ├─> both powers of two; the file header stores the configured size
//!       │
//!       └─> cell-pointer entries are 2 bytes, so a content offset of 0 on
//!           a 65536-byte page is read as 65536 (the value cannot be
//!           represented in 16 bits)
//!
//! LEAF_HEADER_SIZE (8) / INTERIOR_HEADER_SIZE (12)
//!       │
//!       └─> the rightmost-child field occupies bytes 8..12 and exists only
//!           on interior pages; leaf cell pointers start at offset 8
//!
//! INTERIOR_CELL_SIZE (8) / PAYLOAD_HEADER_SIZE (6)
//!       │
//!       └─> MIN_FREEBLOCK_SIZE (4): every deleted cell body is at least 6
//!           bytes, so it can always hold a freeblock header
//!
//! MIN_HASH_SIZE (256) / BULK_MIN_PAGES (1024)
//!       │
//!       └─> the cache hash table never shrinks below MIN_HASH_SIZE slots
//!           and the bulk slab never holds fewer than BULK_MIN_PAGES buffers
//! ```

/// Size of the file header at the start of page 1.
pub const FILE_HEADER_SIZE: usize = 100;

/// Magic bytes identifying a wrendb index file.
pub const FILE_MAGIC: [u8; 4] = [0x42, 0x54, 0x52, 0x45];

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Page size used when the caller does not configure one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// On-disk page header size for leaf pages.
pub const LEAF_HEADER_SIZE: usize = 8;

/// On-disk page header size for interior pages (adds the rightmost child).
pub const INTERIOR_HEADER_SIZE: usize = 12;

/// Size of one cell-pointer array entry.
pub const CELL_POINTER_SIZE: usize = 2;

/// Smallest heap fragment that can be linked as a freeblock. Remainders
/// below this are tracked in the header's fragmented-bytes counter instead.
pub const MIN_FREEBLOCK_SIZE: usize = 4;

/// Byte size of an interior cell: key (4) + child page number (4).
pub const INTERIOR_CELL_SIZE: usize = 8;

/// Fixed prefix of a leaf payload cell: key (4) + value count (2).
pub const PAYLOAD_HEADER_SIZE: usize = 6;

/// Byte size of one payload value (a document id).
pub const PAYLOAD_ENTRY_SIZE: usize = 4;

/// Minimum number of slots in the cache hash table.
pub const MIN_HASH_SIZE: usize = 256;

/// Minimum number of page buffers carved out of the cache's bulk slab.
pub const BULK_MIN_PAGES: usize = 1024;

/// Default cache capacity in pages when the caller does not configure one.
pub const DEFAULT_CACHE_PAGES: usize = 256;

const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_HASH_SIZE.is_power_of_two());
const _: () = assert!(FILE_HEADER_SIZE + INTERIOR_HEADER_SIZE + CELL_POINTER_SIZE < MIN_PAGE_SIZE);
const _: () = assert!(PAYLOAD_HEADER_SIZE >= MIN_FREEBLOCK_SIZE);
const _: () = assert!(INTERIOR_CELL_SIZE >= MIN_FREEBLOCK_SIZE);
