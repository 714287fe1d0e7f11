//! # Error Taxonomy
//!
//! All fallible operations in wrendb return [`eyre::Result`] with message
//! context attached at each layer. Failures that callers need to react to
//! programmatically are raised as [`WrenError`] variants inside the report,
//! so they survive wrapping and can be recovered with
//! `report.downcast_ref::<WrenError>()`.
//!
//! ## Recovery policy
//!
//! - [`WrenError::Corruption`] and [`WrenError::Invariant`] are fatal to the
//!   enclosing tree operation. The affected cache entry is poisoned (its
//!   dirty flag is cleared so the bad bytes are never written back) and the
//!   caller is expected to tear the tree down.
//! - [`WrenError::CacheFull`] and [`WrenError::AllocFailure`] are
//!   recoverable: flushing the tree cleans dirty pages and makes them
//!   evictable again.
//! - [`WrenError::Io`] propagates unchanged from the Pager.
//! - A search miss is not an error at all; the tree API returns `Option`.
//!   [`WrenError::PageNotFound`] covers the distinct case of a Pager read
//!   for a page that does not exist in backing storage.

use std::io;
use thiserror::Error;

/// Typed failures surfaced by the page cache, page codec, and tree engine.
#[derive(Debug, Error)]
pub enum WrenError {
    /// On-disk bytes violated a layout invariant during decode.
    #[error("corrupted page {pgno}: {reason}")]
    Corruption {
        /// Page whose image failed validation.
        pgno: u32,
        /// What was violated.
        reason: String,
    },

    /// Every cache entry is pinned or dirty; nothing can be recycled.
    #[error("page cache full: no evictable page")]
    CacheFull,

    /// The allocator refused a cache entry allocation.
    #[error("page cache allocation failure")]
    AllocFailure,

    /// I/O failure surfaced from the Pager.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A Pager read referenced a page that does not exist.
    #[error("page {pgno} not found in backing storage")]
    PageNotFound {
        /// The missing page number.
        pgno: u32,
    },

    /// Backing storage cannot grow any further.
    #[error("no space left for page allocation")]
    NoSpace,

    /// An internal invariant failed; this is a bug, not bad input.
    #[error("internal invariant violated: {reason}")]
    Invariant {
        /// Which invariant broke.
        reason: String,
    },

    /// A single payload cell outgrew what one page can hold.
    #[error("payload for key {key} exceeds page capacity ({size} > {max} bytes)")]
    PayloadTooLarge {
        /// Key whose value list overflowed.
        key: u32,
        /// Encoded cell size.
        size: usize,
        /// Largest cell a page can carry.
        max: usize,
    },
}

impl WrenError {
    /// Builds a [`WrenError::Corruption`] for `pgno` with a formatted reason.
    pub fn corruption(pgno: u32, reason: impl Into<String>) -> Self {
        WrenError::Corruption {
            pgno,
            reason: reason.into(),
        }
    }

    /// True for failures the caller can clear by flushing dirty pages.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WrenError::CacheFull | WrenError::AllocFailure)
    }
}
