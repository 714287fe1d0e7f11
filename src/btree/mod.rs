//! # B+Tree Index
//!
//! A persistent B+tree keyed by 32-bit integers, mapping each key to a
//! posting list of document ids. Nodes are slotted pages (see
//! [`crate::storage::page`]); all access runs through the page cache.
//!
//! ## Node Types
//!
//! - **Leaf pages** hold payload cells: `key | count | doc ids`. One cell
//!   per key, cells in key order via the cell-pointer array.
//! - **Interior pages** hold separator cells `key | child pgno` plus a
//!   rightmost child in the header. The subtree behind a cell's child
//!   holds keys strictly below the cell's key.
//!
//! ## Navigation
//!
//! ```text
//! leaf lookup:     smallest slot with key >= target  (found iff equal)
//! interior lookup: smallest slot with key >  target  (strict),
//!                  rightmost child when none
//! ```
//!
//! Separators are the first key of their right sibling, so an equal key
//! always descends rightward and lands on the leaf that holds it.
//!
//! ## Module Organization
//!
//! - [`cell`]: cell encodings (interior cells, leaf payloads)
//! - [`leaf`] / [`interior`]: typed views over slotted pages
//! - [`tree`]: the engine — search, insert with split propagation, root
//!   growth, flush

pub mod cell;
pub mod interior;
pub mod leaf;
pub mod tree;

pub use cell::{CellKind, DocId, InteriorCell, Key, Payload};
pub use interior::{ChildPos, InteriorMut, InteriorView};
pub use leaf::{LeafMut, LeafView, SearchResult};
pub use tree::BPlusTree;
