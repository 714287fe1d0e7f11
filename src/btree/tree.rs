//! # B+Tree Engine
//!
//! The tree maps 32-bit keys to posting lists of document ids, one payload
//! cell per key, all payloads in leaves, separators and child pointers in
//! interior pages. Every page access goes through the page cache; a miss
//! is filled from the Pager and decode-validated before the tree looks at
//! it.
//!
//! ## Page 1
//!
//! Page 1 opens with the 100-byte file header (magic, page size, usable
//! size, root page number, total page count); its page header and cells
//! follow. The tree starts life as an empty leaf root on page 1 and the
//! root moves to a freshly allocated page each time it splits, with the
//! file header tracking the current root.
//!
//! ## Insert Algorithm
//!
//! ```text
//! 1. Descend from the root, recording the spine of interior pages.
//!    Each visited page is pinned while its child is fetched, then
//!    unpinned; only the current page stays pinned.
//! 2. At the leaf, either a new payload cell is prepared or the key's
//!    existing posting list grows by one id (a duplicate (key, id) pair
//!    is a no-op).
//! 3. If the change fits — counting space a defragment can reclaim — it
//!    is applied in place and the page is marked dirty.
//! 4. Otherwise the leaf splits at the median slot: the upper half moves
//!    to a new page, the separator is the right page's first key, and
//!    (separator, left) is inserted into the parent, repointing the slot
//!    that covered the old page at the new right sibling.
//! 5. Splits propagate up the spine. An interior split pushes the median
//!    key up without keeping it on either half.
//! 6. A root split allocates a new interior root holding one cell
//!    (separator, old root) and the new right sibling as rightmost
//!    child. This is the only place the tree grows taller.
//! ```
//!
//! All mutations land in the cache as dirty pages; nothing reaches the
//! Pager until [`BPlusTree::flush`], which writes the dirty list
//! newest-first and then cleans it. A failed operation can therefore be
//! abandoned by tearing the tree down without flushing.

use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;
use tracing::debug;

use crate::btree::cell::{CellKind, DocId, InteriorCell, Key, Payload};
use crate::btree::interior::{ChildPos, InteriorMut, InteriorView};
use crate::btree::leaf::{LeafMut, LeafView, SearchResult};
use crate::config::{CELL_POINTER_SIZE, FILE_HEADER_SIZE, LEAF_HEADER_SIZE};
use crate::error::WrenError;
use crate::storage::page::{PageKind, PageMut, PageView};
use crate::storage::{FileHeader, PageCache, PageGuard, Pager};

/// Upper bound on tree height, used to break descent on corrupted child
/// pointers that form a cycle.
const MAX_DEPTH: usize = 64;

/// In-memory handle to one decoded page during an operation: the backing
/// page number plus the parent it was reached through. The parent link is
/// how split propagation walks upward; it is operation-local state, not
/// the on-disk rightmost-child field.
#[derive(Debug, Clone, Copy)]
struct MemPage {
    pgno: u32,
    parent_pgno: Option<u32>,
}

/// Pending mutation of a leaf, decided before any byte changes.
enum LeafChange {
    /// New payload cell at this slot.
    Insert(usize, Payload),
    /// Grown posting list replacing the cell at this slot.
    Replace(usize, Payload),
}

impl LeafChange {
    fn payload(&self) -> &Payload {
        match self {
            LeafChange::Insert(_, p) | LeafChange::Replace(_, p) => p,
        }
    }
}

enum InteriorInsert {
    Done,
    Split { sep: Key, new_page: u32 },
}

/// A B+tree over a Pager, keyed by u32, storing document-id posting
/// lists. Single writer; see the crate docs for the concurrency model.
pub struct BPlusTree<P: Pager> {
    pager: P,
    cache: PageCache,
    root_pgno: u32,
    page_size: usize,
    usable_size: usize,
}

impl<P: Pager> BPlusTree<P> {
    /// Creates a fresh index: file header plus an empty leaf root, both on
    /// page 1, dirty in the cache until the first flush.
    pub fn create(mut pager: P, cache: PageCache) -> Result<Self> {
        ensure!(
            cache.page_size() == pager.page_size(),
            "cache page size {} disagrees with pager page size {}",
            cache.page_size(),
            pager.page_size()
        );

        let page_size = pager.page_size();
        if pager.page_count() == 0 {
            let pgno = pager.allocate_page()?;
            ensure!(pgno == 1, "first allocated page is {}, expected 1", pgno);
        }

        let tree = Self {
            pager,
            cache,
            root_pgno: 1,
            page_size,
            usable_size: page_size,
        };

        {
            let fetched = tree.cache.fetch(1)?;
            let mut guard = fetched.guard;
            let data = guard.data_mut();
            FileHeader::new(
                page_size as u32,
                page_size as u32,
                1,
                tree.pager.page_count(),
            )
            .write_to(data)?;
            LeafMut::init(data, FILE_HEADER_SIZE, page_size)?;
        }

        debug!(page_size, "created index");
        Ok(tree)
    }

    /// Opens an existing index, validating the file header on page 1.
    pub fn open(pager: P, cache: PageCache) -> Result<Self> {
        ensure!(
            cache.page_size() == pager.page_size(),
            "cache page size {} disagrees with pager page size {}",
            cache.page_size(),
            pager.page_size()
        );

        let page_size = pager.page_size();
        let mut tree = Self {
            pager,
            cache,
            root_pgno: 1,
            page_size,
            usable_size: page_size,
        };

        let (root_pgno, usable_size) = {
            let fetched = tree.cache.fetch(1)?;
            let mut guard = fetched.guard;
            if fetched.fresh {
                if let Err(err) = tree.pager.read_page(1, guard.fill_buf()) {
                    tree.cache.discard(1);
                    return Err(err).wrap_err("reading index header page");
                }
            }
            let header = FileHeader::from_bytes(guard.data())?;
            header.validate().wrap_err("validating index file header")?;
            ensure!(
                header.page_size() as usize == page_size,
                "pager page size {} disagrees with file header {}",
                page_size,
                header.page_size()
            );
            ensure!(
                header.page_count() == tree.pager.page_count(),
                "file header claims {} pages, backing storage has {}",
                header.page_count(),
                tree.pager.page_count()
            );
            (header.root_pgno(), header.usable_size() as usize)
        };

        tree.root_pgno = root_pgno;
        tree.usable_size = usable_size;
        debug!(root_pgno, "opened index");
        Ok(tree)
    }

    pub fn root_pgno(&self) -> u32 {
        self.root_pgno
    }

    /// Tree height: 1 for a lone leaf root, growing only at root splits.
    pub fn depth(&self) -> Result<usize> {
        let mut depth = 1usize;
        let mut pgno = self.root_pgno;
        loop {
            ensure!(depth <= MAX_DEPTH, "tree deeper than {}", MAX_DEPTH);
            let guard = self.fetch_page(pgno)?;
            let view = self.view(guard.data(), pgno)?;
            match view.kind()? {
                PageKind::Leaf => return Ok(depth),
                PageKind::Interior => {
                    let interior = InteriorView::new(view)?;
                    let next = if interior.cell_count() > 0 {
                        interior.cell_at(0)?.child()
                    } else {
                        interior.right_child()
                    };
                    depth += 1;
                    pgno = next;
                }
                kind => {
                    return Err(WrenError::corruption(
                        pgno,
                        format!("unexpected {:?} page measuring depth", kind),
                    )
                    .into())
                }
            }
        }
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn pager(&self) -> &P {
        &self.pager
    }

    /// Locates `key`. `Some((pgno, slot))` names the leaf page and cell
    /// slot holding its posting list; a miss is a normal `None`, not an
    /// error.
    pub fn search(&self, key: Key) -> Result<Option<(u32, usize)>> {
        let (leaf, result, _) = self.locate(key)?;
        Ok(match result {
            SearchResult::Found(slot) => Some((leaf.pgno, slot)),
            SearchResult::NotFound(_) => None,
        })
    }

    /// The posting list for `key`, if present.
    pub fn payload(&self, key: Key) -> Result<Option<Vec<DocId>>> {
        let (leaf, result, _) = self.locate(key)?;
        let slot = match result {
            SearchResult::Found(slot) => slot,
            SearchResult::NotFound(_) => return Ok(None),
        };

        let guard = self.fetch_page(leaf.pgno)?;
        let view = self.view(guard.data(), leaf.pgno)?;
        let payload = LeafView::new(view)?.payload_at(slot)?;
        Ok(Some(payload.values.to_vec()))
    }

    /// Files `doc_id` under `key`. Inserting a `(key, doc_id)` pair that
    /// is already present is a no-op.
    pub fn insert(&mut self, key: Key, doc_id: DocId) -> Result<()> {
        let (leaf, result, mut spine) = self.locate(key)?;

        // Decide the leaf mutation and whether it fits in place, without
        // touching any byte yet.
        let (change, fits) = {
            let guard = self.fetch_page(leaf.pgno)?;
            let view = self.view(guard.data(), leaf.pgno)?;
            let leaf_view = LeafView::new(view)?;

            match result {
                SearchResult::Found(slot) => {
                    let mut payload = leaf_view.payload_at(slot)?;
                    if payload.contains(doc_id) {
                        return Ok(());
                    }
                    payload.push(doc_id);
                    let old_len = view.cell_len_at(view.cell_offset(slot)?)?;
                    let fits = view.total_free()? + old_len >= payload.byte_size();
                    (LeafChange::Replace(slot, payload), fits)
                }
                SearchResult::NotFound(slot) => {
                    let payload = Payload::new(key, doc_id);
                    let fits = !view.full(payload.byte_size());
                    (LeafChange::Insert(slot, payload), fits)
                }
            }
        };

        if fits {
            let mut guard = self.fetch_page(leaf.pgno)?;
            let hdr = Self::hdr_offset(leaf.pgno);
            let usable = self.usable_size;
            let mut leaf_mut = LeafMut::new(PageMut::new(guard.data_mut(), hdr, usable)?)?;
            match &change {
                LeafChange::Insert(slot, payload) => leaf_mut.insert_payload(*slot, payload)?,
                LeafChange::Replace(slot, payload) => leaf_mut.replace_payload(*slot, payload)?,
            }
            return Ok(());
        }

        // Split path: the leaf overflows, the separator climbs the spine.
        // Reserve cache capacity for the worst case first — every touched
        // page may need a re-fetch, turns dirty, or is a fresh install —
        // so propagation can never stall with a half-committed split.
        self.cache
            .ensure_spare(3 * spine.len() + 6)
            .wrap_err("reserving cache capacity for page split")?;

        let (mut sep, mut right) = self.split_leaf(leaf.pgno, change)?;
        let mut left = leaf.pgno;
        let mut child = leaf;

        loop {
            match spine.pop() {
                Some(parent) => {
                    if child.parent_pgno != Some(parent.pgno) {
                        return Err(WrenError::Invariant {
                            reason: format!(
                                "split spine broken: page {} recorded parent {:?}, spine has {}",
                                child.pgno, child.parent_pgno, parent.pgno
                            ),
                        }
                        .into());
                    }
                    match self.insert_into_interior(parent.pgno, sep, left, right)? {
                        InteriorInsert::Done => return Ok(()),
                        InteriorInsert::Split { sep: up, new_page } => {
                            sep = up;
                            left = parent.pgno;
                            right = new_page;
                            child = parent;
                        }
                    }
                }
                None => {
                    ensure!(
                        left == self.root_pgno,
                        "split propagation ran past the root"
                    );
                    return self.grow_root(sep, left, right);
                }
            }
        }
    }

    /// Writes every dirty page through the Pager in dirty-list order
    /// (newest first), then cleans the whole list.
    pub fn flush(&mut self) -> Result<()> {
        let cache = &self.cache;
        let pager = &mut self.pager;
        let pages = cache.flush_dirty(|pgno, data| {
            pager
                .write_page(pgno, data)
                .wrap_err_with(|| format!("writing page {}", pgno))
        })?;
        debug!(pages, "flushed index");
        Ok(())
    }

    /// Full tree walk verifying the structural invariants: per-page cell
    /// validity, strict key ascent, the interior key-range invariant, and
    /// uniform leaf depth. Returns every key in order.
    pub fn check_invariants(&self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        let mut leaf_depth = None;
        self.walk_subtree(self.root_pgno, None, None, 0, &mut leaf_depth, &mut keys)?;

        for pair in keys.windows(2) {
            ensure!(
                pair[0] < pair[1],
                "in-order walk produced {} before {}",
                pair[0],
                pair[1]
            );
        }
        Ok(keys)
    }

    fn hdr_offset(pgno: u32) -> usize {
        if pgno == 1 {
            FILE_HEADER_SIZE
        } else {
            0
        }
    }

    fn view<'b>(&self, data: &'b [u8], pgno: u32) -> Result<PageView<'b>> {
        PageView::new(data, Self::hdr_offset(pgno), self.usable_size)
    }

    /// Cache-or-Pager page access: a miss reads through the Pager into
    /// the pinned buffer (cache mutex released) and decode-validates the
    /// image before the tree sees it.
    fn fetch_page(&self, pgno: u32) -> Result<PageGuard<'_>> {
        let fetched = self
            .cache
            .fetch(pgno)
            .wrap_err_with(|| format!("fetching page {}", pgno))?;
        let mut guard = fetched.guard;

        if fetched.fresh {
            if let Err(err) = self.pager.read_page(pgno, guard.fill_buf()) {
                self.cache.discard(pgno);
                return Err(err).wrap_err_with(|| format!("loading page {}", pgno));
            }
            let view = self.view(guard.data(), pgno)?;
            if let Err(err) = view.validate(pgno) {
                self.cache.poison(pgno);
                return Err(err);
            }
        }

        Ok(guard)
    }

    /// Pins the cache entry for a page the Pager just allocated. The page
    /// number has never been seen, so this is always a miss with a zeroed
    /// buffer.
    fn new_page_guard(&self, pgno: u32) -> Result<PageGuard<'_>> {
        let fetched = self.cache.fetch(pgno)?;
        if !fetched.fresh {
            return Err(WrenError::Invariant {
                reason: format!("freshly allocated page {} was already cached", pgno),
            }
            .into());
        }
        Ok(fetched.guard)
    }

    /// Allocates a page from the Pager and keeps the file header's page
    /// count current.
    fn allocate_page(&mut self) -> Result<u32> {
        let pgno = self.pager.allocate_page().wrap_err("allocating tree page")?;
        let page_count = self.pager.page_count();

        let mut guard = self.fetch_page(1)?;
        let header = FileHeader::from_bytes_mut(guard.data_mut())?;
        header.set_page_count(page_count);

        Ok(pgno)
    }

    /// Descends to the leaf responsible for `key`, pinning each page only
    /// while its child is fetched. Returns the leaf handle, the slot
    /// search result, and the spine of interior pages (root first), each
    /// carrying the parent it was reached through.
    fn locate(&self, key: Key) -> Result<(MemPage, SearchResult, SmallVec<[MemPage; 8]>)> {
        let mut spine: SmallVec<[MemPage; 8]> = SmallVec::new();
        let mut pgno = self.root_pgno;
        let mut parent_pgno: Option<u32> = None;
        let mut guard = self.fetch_page(pgno)?;

        loop {
            let child = {
                let view = self.view(guard.data(), pgno)?;
                match view.kind()? {
                    PageKind::Leaf => {
                        let result = LeafView::new(view)?.search(key)?;
                        return Ok((MemPage { pgno, parent_pgno }, result, spine));
                    }
                    PageKind::Interior => {
                        let (child, _) = InteriorView::new(view)?.find_child(key)?;
                        if child == 0 || child == pgno || spine.len() >= MAX_DEPTH {
                            self.cache.poison(pgno);
                            return Err(WrenError::corruption(
                                pgno,
                                format!("child pointer {} forms a cycle or is invalid", child),
                            )
                            .into());
                        }
                        child
                    }
                    kind => {
                        self.cache.poison(pgno);
                        return Err(WrenError::corruption(
                            pgno,
                            format!("unexpected {:?} page in tree descent", kind),
                        )
                        .into())
                    }
                }
            };

            spine.push(MemPage { pgno, parent_pgno });

            // Pin the child before releasing the parent, so the page under
            // us can never be recycled mid-descent.
            let child_guard = self.fetch_page(child)?;
            guard = child_guard;
            parent_pgno = Some(pgno);
            pgno = child;
        }
    }

    /// Largest payload cell any leaf can carry; page 1's file header makes
    /// it the tightest page, so the bound is safe everywhere.
    fn max_leaf_cell(&self) -> usize {
        self.usable_size - FILE_HEADER_SIZE - LEAF_HEADER_SIZE - CELL_POINTER_SIZE
    }

    /// Splits the leaf at `pgno` while applying `change`, returning the
    /// separator and the new right sibling. The left half keeps the
    /// original page number, so parent pointers to it stay valid until
    /// propagation repoints the covering slot.
    fn split_leaf(&mut self, pgno: u32, change: LeafChange) -> Result<(Key, u32)> {
        if change.payload().byte_size() > self.max_leaf_cell() {
            let payload = change.payload();
            return Err(WrenError::PayloadTooLarge {
                key: payload.key,
                size: payload.byte_size(),
                max: self.max_leaf_cell(),
            }
            .into());
        }

        let mut payloads: Vec<Payload> = {
            let guard = self.fetch_page(pgno)?;
            let leaf = LeafView::new(self.view(guard.data(), pgno)?)?;
            (0..leaf.cell_count())
                .map(|i| leaf.payload_at(i))
                .collect::<Result<_>>()?
        };

        match change {
            LeafChange::Insert(slot, payload) => payloads.insert(slot, payload),
            LeafChange::Replace(slot, payload) => payloads[slot] = payload,
        }
        ensure!(
            payloads.len() >= 2,
            "leaf split of page {} with {} cells",
            pgno,
            payloads.len()
        );

        let mid = payloads.len() / 2;
        let sep = payloads[mid].key;
        let right_pgno = self.allocate_page()?;
        let usable = self.usable_size;

        {
            let mut guard = self.new_page_guard(right_pgno)?;
            let mut right = LeafMut::init(guard.data_mut(), 0, usable)?;
            for (i, payload) in payloads[mid..].iter().enumerate() {
                right.insert_payload(i, payload)?;
            }
        }

        {
            let mut guard = self.fetch_page(pgno)?;
            let hdr = Self::hdr_offset(pgno);
            let mut left = LeafMut::init(guard.data_mut(), hdr, usable)?;
            for (i, payload) in payloads[..mid].iter().enumerate() {
                left.insert_payload(i, payload)?;
            }
        }

        debug!(left = pgno, right = right_pgno, sep, "split leaf");
        Ok((sep, right_pgno))
    }

    /// Inserts the separator for a completed child split into the parent:
    /// `(sep, left)` lands in the slot that covered the old page, and
    /// that slot's successor (or the rightmost pointer) moves to `right`.
    fn insert_into_interior(
        &mut self,
        parent_pgno: u32,
        sep: Key,
        left: u32,
        right: u32,
    ) -> Result<InteriorInsert> {
        let (pos, fits) = {
            let guard = self.fetch_page(parent_pgno)?;
            let view = self.view(guard.data(), parent_pgno)?;
            let interior = InteriorView::new(view)?;

            let (covered, pos) = interior.find_child(sep)?;
            if covered != left {
                return Err(WrenError::Invariant {
                    reason: format!(
                        "parent {} routes separator {} to page {}, expected split page {}",
                        parent_pgno, sep, covered, left
                    ),
                }
                .into());
            }
            let pending = CellKind::Interior(InteriorCell::new(sep, left));
            (pos, !view.full(pending.byte_size()))
        };

        if fits {
            let mut guard = self.fetch_page(parent_pgno)?;
            let hdr = Self::hdr_offset(parent_pgno);
            let usable = self.usable_size;
            let mut interior = InteriorMut::new(PageMut::new(guard.data_mut(), hdr, usable)?)?;
            match pos {
                ChildPos::Cell(slot) => {
                    interior.insert_separator(slot, sep, left)?;
                    interior.set_cell_child(slot + 1, right)?;
                }
                ChildPos::Rightmost => {
                    let count = interior.cell_count();
                    interior.insert_separator(count, sep, left)?;
                    interior.set_right_child(right);
                }
            }
            return Ok(InteriorInsert::Done);
        }

        let (sep_up, new_page) = self.split_interior(parent_pgno, sep, left, right)?;
        Ok(InteriorInsert::Split { sep: sep_up, new_page })
    }

    /// Splits the interior page at `pgno` while inserting the pending
    /// `(sep, left, right)` separator. The median key moves up and is
    /// stored on neither half; the left half keeps the original page
    /// number with the median's child as its rightmost pointer, the right
    /// half inherits the original rightmost child.
    fn split_interior(
        &mut self,
        pgno: u32,
        sep: Key,
        left: u32,
        right: u32,
    ) -> Result<(Key, u32)> {
        let (mut keys, mut children) = {
            let guard = self.fetch_page(pgno)?;
            let interior = InteriorView::new(self.view(guard.data(), pgno)?)?;
            let count = interior.cell_count();

            let mut keys: Vec<Key> = Vec::with_capacity(count + 1);
            let mut children: Vec<u32> = Vec::with_capacity(count + 2);
            for i in 0..count {
                let cell = interior.cell_at(i)?;
                keys.push(cell.key());
                children.push(cell.child());
            }
            children.push(interior.right_child());
            (keys, children)
        };

        let slot = keys.partition_point(|&k| k <= sep);
        ensure!(
            children[slot] == left,
            "interior split of page {} lost its pending child",
            pgno
        );
        keys.insert(slot, sep);
        children.insert(slot, left);
        children[slot + 1] = right;

        let mid = keys.len() / 2;
        let sep_up = keys[mid];
        let median_child = children[mid];
        let inherited_rightmost = children[children.len() - 1];
        let new_pgno = self.allocate_page()?;
        let usable = self.usable_size;

        {
            let right_keys = &keys[mid + 1..];
            let right_children = &children[mid + 1..];
            let mut guard = self.new_page_guard(new_pgno)?;
            let mut node = InteriorMut::init(guard.data_mut(), 0, usable, inherited_rightmost)?;
            for (i, (&k, &c)) in right_keys.iter().zip(right_children.iter()).enumerate() {
                node.insert_separator(i, k, c)?;
            }
        }

        {
            let mut guard = self.fetch_page(pgno)?;
            let hdr = Self::hdr_offset(pgno);
            let mut node = InteriorMut::init(guard.data_mut(), hdr, usable, median_child)?;
            for i in 0..mid {
                node.insert_separator(i, keys[i], children[i])?;
            }
        }

        debug!(left = pgno, right = new_pgno, sep = sep_up, "split interior");
        Ok((sep_up, new_pgno))
    }

    /// Root growth: the old root split into `left` (its original page)
    /// and `right`; a new interior root takes one cell `(sep, left)` and
    /// `right` as rightmost child. The only place tree height increases.
    fn grow_root(&mut self, sep: Key, left: u32, right: u32) -> Result<()> {
        let new_root = self.allocate_page()?;
        let usable = self.usable_size;

        {
            let mut guard = self.new_page_guard(new_root)?;
            let mut root = InteriorMut::init(guard.data_mut(), 0, usable, right)?;
            root.insert_separator(0, sep, left)?;
        }

        self.root_pgno = new_root;
        {
            let mut guard = self.fetch_page(1)?;
            let header = FileHeader::from_bytes_mut(guard.data_mut())?;
            header.set_root_pgno(new_root);
        }

        debug!(new_root, sep, "grew tree root");
        Ok(())
    }

    fn walk_subtree(
        &self,
        pgno: u32,
        lo: Option<Key>,
        hi: Option<Key>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        out: &mut Vec<Key>,
    ) -> Result<()> {
        ensure!(
            depth < MAX_DEPTH,
            "tree walk exceeded depth {}; child pointers form a cycle",
            MAX_DEPTH
        );

        enum Node {
            Leaf(Vec<Key>),
            Interior(Vec<InteriorCell>, u32),
        }

        // Materialize under the guard, recurse after dropping it, so the
        // walk pins one page at a time.
        let node = {
            let guard = self.fetch_page(pgno)?;
            let view = self.view(guard.data(), pgno)?;
            if let Err(err) = view.validate_cells(pgno) {
                self.cache.poison(pgno);
                return Err(err);
            }

            match view.kind()? {
                PageKind::Leaf => {
                    let leaf = LeafView::new(view)?;
                    let keys = (0..leaf.cell_count())
                        .map(|i| leaf.key_at(i))
                        .collect::<Result<_>>()?;
                    Node::Leaf(keys)
                }
                PageKind::Interior => {
                    let interior = InteriorView::new(view)?;
                    ensure!(
                        interior.cell_count() >= 1,
                        "interior page {} has no separator cells",
                        pgno
                    );
                    let cells = (0..interior.cell_count())
                        .map(|i| interior.cell_at(i))
                        .collect::<Result<_>>()?;
                    Node::Interior(cells, interior.right_child())
                }
                kind => {
                    return Err(WrenError::corruption(
                        pgno,
                        format!("unexpected {:?} page in tree walk", kind),
                    )
                    .into())
                }
            }
        };

        match node {
            Node::Leaf(keys) => {
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) => ensure!(
                        depth == expected,
                        "leaf {} at depth {}, expected {}",
                        pgno,
                        depth,
                        expected
                    ),
                }
                let mut prev: Option<Key> = None;
                for key in keys {
                    ensure!(
                        prev.map_or(true, |p| p < key),
                        "leaf {} keys not strictly ascending at {}",
                        pgno,
                        key
                    );
                    ensure!(
                        lo.map_or(true, |l| key >= l),
                        "leaf {} key {} below subtree bound {:?}",
                        pgno,
                        key,
                        lo
                    );
                    ensure!(
                        hi.map_or(true, |h| key < h),
                        "leaf {} key {} at or above subtree bound {:?}",
                        pgno,
                        key,
                        hi
                    );
                    prev = Some(key);
                    out.push(key);
                }
            }
            Node::Interior(cells, right_child) => {
                let mut child_lo = lo;
                let mut prev: Option<Key> = None;
                for cell in &cells {
                    ensure!(
                        prev.map_or(true, |p| p < cell.key()),
                        "interior {} separators not strictly ascending at {}",
                        pgno,
                        cell.key()
                    );
                    prev = Some(cell.key());
                    self.walk_subtree(
                        cell.child(),
                        child_lo,
                        Some(cell.key()),
                        depth + 1,
                        leaf_depth,
                        out,
                    )?;
                    child_lo = Some(cell.key());
                }
                self.walk_subtree(right_child, child_lo, hi, depth + 1, leaf_depth, out)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CacheConfig, MemPager};

    fn small_tree() -> BPlusTree<MemPager> {
        let pager = MemPager::new(512).unwrap();
        let cache = PageCache::new(CacheConfig::with_page_size(512)).unwrap();
        BPlusTree::create(pager, cache).unwrap()
    }

    #[test]
    fn empty_tree_search_returns_none() {
        let tree = small_tree();
        assert!(tree.search(42).unwrap().is_none());
        assert!(tree.payload(42).unwrap().is_none());
    }

    #[test]
    fn insert_then_search_single_key() {
        let mut tree = small_tree();
        tree.insert(42, 7).unwrap();

        let (pgno, slot) = tree.search(42).unwrap().expect("key present");
        assert_eq!(pgno, 1);
        assert_eq!(slot, 0);
        assert_eq!(tree.payload(42).unwrap().unwrap(), vec![7]);
    }

    #[test]
    fn duplicate_key_appends_to_posting_list() {
        let mut tree = small_tree();
        tree.insert(42, 7).unwrap();
        tree.insert(42, 9).unwrap();

        assert_eq!(tree.payload(42).unwrap().unwrap(), vec![7, 9]);
    }

    #[test]
    fn duplicate_pair_is_a_noop() {
        let mut tree = small_tree();
        tree.insert(42, 7).unwrap();
        tree.insert(42, 7).unwrap();

        assert_eq!(tree.payload(42).unwrap().unwrap(), vec![7]);
    }

    #[test]
    fn keys_stay_sorted_across_random_inserts() {
        let mut tree = small_tree();

        // Deterministic shuffle of 1..=60 via a small LCG.
        let mut keys: Vec<u32> = (1..=60).collect();
        let mut state = 0x2545F491u32;
        for i in (1..keys.len()).rev() {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            keys.swap(i, (state as usize) % (i + 1));
        }

        for &key in &keys {
            tree.insert(key, key * 10).unwrap();
        }

        let walked = tree.check_invariants().unwrap();
        assert_eq!(walked, (1..=60).collect::<Vec<u32>>());
        for key in 1..=60 {
            assert_eq!(tree.payload(key).unwrap().unwrap(), vec![key * 10]);
        }
    }

    #[test]
    fn root_leaf_split_creates_two_leaves() {
        let mut tree = small_tree();

        // Page 1's leaf area is 512 - 100 - 8 bytes; 12 bytes per entry
        // (cell + pointer) overflows it within ~34 inserts.
        let mut key = 1u32;
        while tree.root_pgno() == 1 {
            tree.insert(key, key).unwrap();
            key += 1;
            assert!(key < 200, "root never split");
        }

        let walked = tree.check_invariants().unwrap();
        assert_eq!(walked, (1..key).collect::<Vec<u32>>());

        // The new root is interior with exactly one separator; the
        // separator equals the right leaf's first key.
        let guard = tree.fetch_page(tree.root_pgno()).unwrap();
        let view = tree.view(guard.data(), tree.root_pgno()).unwrap();
        let root = InteriorView::new(view).unwrap();
        assert_eq!(root.cell_count(), 1);

        let sep = root.cell_at(0).unwrap().key();
        let right_pgno = root.right_child();
        drop(guard);

        let guard = tree.fetch_page(right_pgno).unwrap();
        let right = LeafView::new(tree.view(guard.data(), right_pgno).unwrap()).unwrap();
        assert_eq!(right.key_at(0).unwrap(), sep);
    }

    #[test]
    fn growing_posting_list_splits_leaf_when_full() {
        let mut tree = small_tree();

        // A handful of keys, then fatten one posting list until the root
        // leaf must split around it.
        for key in 1..=10u32 {
            tree.insert(key, 1).unwrap();
        }
        for doc in 2..=80u32 {
            tree.insert(5, doc).unwrap();
        }

        let values = tree.payload(5).unwrap().unwrap();
        assert_eq!(values, (1..=80).collect::<Vec<u32>>());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn flush_persists_through_mem_pager() {
        let mut tree = small_tree();
        for key in 1..=50u32 {
            tree.insert(key, key + 1000).unwrap();
        }
        tree.flush().unwrap();
        assert!(tree.cache().dirty_pages().is_empty());

        // A second flush has nothing to write.
        tree.flush().unwrap();
    }

    #[test]
    fn oversized_posting_list_is_rejected() {
        let mut tree = small_tree();

        // One key, capacity for (512 - 100 - 8 - 2 - 6) / 4 = 99 ids on
        // the tightest page. Somewhere past that the tree must refuse
        // rather than split a single cell.
        let mut hit_limit = false;
        for doc in 1..=200u32 {
            match tree.insert(7, doc) {
                Ok(()) => {}
                Err(err) => {
                    assert!(matches!(
                        err.downcast_ref::<WrenError>(),
                        Some(WrenError::PayloadTooLarge { key: 7, .. })
                    ));
                    hit_limit = true;
                    break;
                }
            }
        }
        assert!(hit_limit, "payload grew without bound");
        tree.check_invariants().unwrap();
    }
}
