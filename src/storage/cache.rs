//! # Page Cache
//!
//! An in-memory buffer pool keyed by page number. Every page the tree
//! touches lives in exactly one cache entry while resident; the tree never
//! sees Pager bytes directly.
//!
//! ## Structure
//!
//! Each resident entry participates in up to three intrusive structures at
//! once:
//!
//! - the **hash table**: open-chained buckets of `page_no mod nHash`,
//!   walked via `hash_next`. `nHash` is a power of two, at least 256, and
//!   doubles whenever the entry count reaches it at fetch time.
//! - the **LRU list**: doubly linked, holding exactly the unpinned
//!   entries, most recent at the head. Recycling takes the tail.
//! - the **dirty list**: doubly linked, holding exactly the entries with
//!   the `DIRTY` flag, newest first. Flush walks it head to tail.
//!
//! The original design threads raw pointers through the entries for these
//! lists. Here the cache owns one arena (`Vec<PgHdr>`) and every linkage
//! field is an `Option` of an arena index, which keeps eviction a local
//! operation and removes the aliasing hazards of mutual pointers. Guards
//! carry the entry's generation counter and re-validate it on access, so a
//! recycled slot can never be confused with the page it used to hold.
//!
//! ## Buffers
//!
//! Page buffers are carved out of one bulk slab allocated up front
//! (`max(nInitPage, 1024)` buffers); unused slab entries wait on a free
//! list. If the configured capacity exceeds the slab, additional entries
//! are heap-allocated on demand and flagged non-local; the slab is freed
//! as a single allocation at teardown, non-local buffers individually.
//!
//! ## Fetch
//!
//! 1. Hash lookup. A hit is unlinked from the LRU list (if unpinned),
//!    pinned, and returned.
//! 2. If `nPage >= nHash`, the hash table doubles.
//! 3. If the cache is at capacity, the LRU tail is recycled. A dirty tail
//!    fails the fetch with `CacheFull` — the writer must flush first;
//!    fetch never writes back silently.
//! 4. Otherwise an entry is popped from the free list or heap-allocated.
//! 5. The entry is installed: buffer zeroed, pin count 1, flags `CLEAN`,
//!    linked at the head of its bucket.
//!
//! ## Pinning and mutation
//!
//! `pin_count > 0` keeps an entry out of the LRU list and therefore out of
//! recycling. [`PageGuard`] pins on fetch and unpins on drop; dropping to
//! zero re-inserts at the LRU head. `PageGuard::data_mut` marks the entry
//! dirty; `PageGuard::fill_buf` does not and exists solely so a cache miss
//! can be populated from the Pager. Pager I/O always runs with the cache
//! mutex released and the entry pinned.

use eyre::Result;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{
    BULK_MIN_PAGES, DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_HASH_SIZE,
    MIN_PAGE_SIZE,
};
use crate::error::WrenError;

pub const PGHDR_CLEAN: u8 = 0x01;
pub const PGHDR_DIRTY: u8 = 0x02;
pub const PGHDR_NEED_SYNC: u8 = 0x04;
pub const PGHDR_WRITEABLE: u8 = 0x08;

type EntryIndex = usize;

/// Runtime sizing for a [`PageCache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Size of every page buffer in bytes. Power of two, 512..=65536.
    pub page_size: usize,
    /// Maximum number of resident pages before recycling kicks in.
    pub n_max: usize,
    /// Requested bulk-slab size in pages; the slab never holds fewer than
    /// [`BULK_MIN_PAGES`] buffers.
    pub n_init: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            n_max: DEFAULT_CACHE_PAGES,
            n_init: 0,
        }
    }
}

impl CacheConfig {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }
}

/// Counters exposed by [`PageCache::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub recycles: u64,
    pub resizes: u64,
}

enum PageBuf {
    /// Byte offset into the bulk slab.
    Slab(usize),
    /// Individually allocated, non-local entry.
    Heap(Box<[u8]>),
}

struct PgHdr {
    pgno: u32,
    pin_count: u32,
    flags: u8,
    generation: u32,
    buf: PageBuf,
    hash_next: Option<EntryIndex>,
    lru_prev: Option<EntryIndex>,
    lru_next: Option<EntryIndex>,
    dirty_prev: Option<EntryIndex>,
    dirty_next: Option<EntryIndex>,
    free_next: Option<EntryIndex>,
}

impl PgHdr {
    fn is_dirty(&self) -> bool {
        self.flags & PGHDR_DIRTY != 0
    }
}

enum DirtyListOp {
    Remove,
    Add,
    MoveToFront,
}

struct CacheInner {
    sz_page: usize,
    n_max: usize,
    n_page: usize,
    n_hash: usize,
    i_max_key: u32,
    ap_hash: Vec<Option<EntryIndex>>,
    free_head: Option<EntryIndex>,
    lru_head: Option<EntryIndex>,
    lru_tail: Option<EntryIndex>,
    dirty_head: Option<EntryIndex>,
    dirty_tail: Option<EntryIndex>,
    arena: Vec<PgHdr>,
    slab: Box<[u8]>,
    stats: CacheStats,
}

/// The page cache. One instance per open tree; pages cannot migrate
/// between caches. A single mutex guards every field of the cache and
/// every linkage field of every entry; the page buffers themselves are
/// guarded by pin counts and the single-writer discipline of the caller.
pub struct PageCache {
    inner: Mutex<CacheInner>,
    sz_page: usize,
}

/// A pinned page. Dropping the guard unpins the entry; an entry whose pin
/// count returns to zero becomes the most recent end of the LRU list.
pub struct PageGuard<'a> {
    cache: &'a PageCache,
    idx: EntryIndex,
    pgno: u32,
    generation: u32,
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("idx", &self.idx)
            .field("pgno", &self.pgno)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Result of [`PageCache::fetch`]: the pinned guard plus whether the
/// buffer is freshly installed (and must be filled from the Pager).
#[derive(Debug)]
pub struct Fetched<'a> {
    pub guard: PageGuard<'a>,
    pub fresh: bool,
}

impl PageCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        eyre::ensure!(
            config.page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&config.page_size),
            "unsupported page size {}",
            config.page_size
        );
        eyre::ensure!(config.n_max >= 1, "cache capacity must be at least one page");

        let n_slab = config.n_init.max(BULK_MIN_PAGES);
        let slab_bytes = n_slab * config.page_size;

        let mut slab: Vec<u8> = Vec::new();
        slab.try_reserve_exact(slab_bytes)
            .map_err(|_| WrenError::AllocFailure)?;
        slab.resize(slab_bytes, 0);

        let mut arena = Vec::with_capacity(n_slab);
        let mut free_head = None;
        for i in 0..n_slab {
            arena.push(PgHdr {
                pgno: 0,
                pin_count: 0,
                flags: 0,
                generation: 0,
                buf: PageBuf::Slab(i * config.page_size),
                hash_next: None,
                lru_prev: None,
                lru_next: None,
                dirty_prev: None,
                dirty_next: None,
                free_next: free_head,
            });
            free_head = Some(i);
        }

        Ok(Self {
            sz_page: config.page_size,
            inner: Mutex::new(CacheInner {
                sz_page: config.page_size,
                n_max: config.n_max,
                n_page: 0,
                n_hash: MIN_HASH_SIZE,
                i_max_key: 0,
                ap_hash: vec![None; MIN_HASH_SIZE],
                free_head,
                lru_head: None,
                lru_tail: None,
                dirty_head: None,
                dirty_tail: None,
                arena,
                slab: slab.into_boxed_slice(),
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.sz_page
    }

    /// Looks up or installs the entry for `pgno`, pinned. See the module
    /// docs for the five fetch steps.
    pub fn fetch(&self, pgno: u32) -> Result<Fetched<'_>> {
        let mut inner = self.inner.lock();

        if let Some(idx) = inner.lookup(pgno) {
            if inner.arena[idx].pin_count == 0 {
                inner.lru_unlink(idx);
            }
            inner.arena[idx].pin_count += 1;
            inner.stats.hits += 1;
            let generation = inner.arena[idx].generation;
            trace!(pgno, "page cache hit");
            return Ok(Fetched {
                guard: PageGuard {
                    cache: self,
                    idx,
                    pgno,
                    generation,
                },
                fresh: false,
            });
        }

        if inner.n_page >= inner.n_hash {
            inner.resize_hash();
        }

        let idx = if inner.n_page + 1 > inner.n_max {
            let tail = match inner.lru_tail {
                Some(tail) => tail,
                None => return Err(WrenError::CacheFull.into()),
            };
            if inner.arena[tail].is_dirty() {
                return Err(WrenError::CacheFull.into());
            }
            debug!(
                evicted = inner.arena[tail].pgno,
                wanted = pgno,
                "recycling LRU tail"
            );
            inner.lru_unlink(tail);
            inner.hash_remove(tail);
            inner.stats.recycles += 1;
            tail
        } else if let Some(free) = inner.free_head {
            inner.free_head = inner.arena[free].free_next;
            inner.arena[free].free_next = None;
            free
        } else {
            let mut buf: Vec<u8> = Vec::new();
            buf.try_reserve_exact(inner.sz_page)
                .map_err(|_| WrenError::AllocFailure)?;
            buf.resize(inner.sz_page, 0);
            inner.arena.push(PgHdr {
                pgno: 0,
                pin_count: 0,
                flags: 0,
                generation: 0,
                buf: PageBuf::Heap(buf.into_boxed_slice()),
                hash_next: None,
                lru_prev: None,
                lru_next: None,
                dirty_prev: None,
                dirty_next: None,
                free_next: None,
            });
            inner.arena.len() - 1
        };

        inner.zero_buffer(idx);

        let entry = &mut inner.arena[idx];
        entry.pgno = pgno;
        entry.pin_count = 1;
        entry.flags = PGHDR_CLEAN;
        entry.generation = entry.generation.wrapping_add(1);
        entry.lru_prev = None;
        entry.lru_next = None;
        entry.dirty_prev = None;
        entry.dirty_next = None;
        let generation = entry.generation;

        let h = (pgno as usize) & (inner.n_hash - 1);
        inner.arena[idx].hash_next = inner.ap_hash[h];
        inner.ap_hash[h] = Some(idx);
        inner.n_page += 1;
        if pgno > inner.i_max_key {
            inner.i_max_key = pgno;
        }
        inner.stats.misses += 1;

        Ok(Fetched {
            guard: PageGuard {
                cache: self,
                idx,
                pgno,
                generation,
            },
            fresh: true,
        })
    }

    /// Flips the entry for `pgno` back to `CLEAN` and removes it from the
    /// dirty list. No-op for clean or absent pages.
    pub fn make_clean(&self, pgno: u32) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.lookup(pgno) {
            inner.make_clean_entry(idx);
        }
    }

    /// Drains the dirty list from the head, cleaning every entry.
    pub fn make_clean_all(&self) {
        let mut inner = self.inner.lock();
        while let Some(idx) = inner.dirty_head {
            inner.make_clean_entry(idx);
        }
    }

    /// Poisons the entry after a corruption: the dirty flag is cleared so
    /// the bad bytes can never be written back, pins are left in place.
    pub fn poison(&self, pgno: u32) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.lookup(pgno) {
            inner.make_clean_entry(idx);
            debug!(pgno, "cache entry poisoned");
        }
    }

    /// Throws the entry for `pgno` out of the cache after a failed load:
    /// the buffer holds no valid image, so a later fetch must not hit it.
    /// A pinned entry is unhashed immediately and returns to the free list
    /// once its last guard drops.
    pub fn discard(&self, pgno: u32) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.lookup(pgno) {
            inner.make_clean_entry(idx);
            inner.hash_remove(idx);
            if inner.arena[idx].pin_count == 0 {
                inner.lru_unlink(idx);
                inner.free_push(idx);
            } else {
                // Sentinel checked by unpin; page 0 is never a valid number.
                inner.arena[idx].pgno = 0;
            }
            debug!(pgno, "cache entry discarded");
        }
    }

    /// Page numbers currently dirty, newest first. This is the flush order.
    pub fn dirty_pages(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut cur = inner.dirty_head;
        while let Some(idx) = cur {
            out.push(inner.arena[idx].pgno);
            cur = inner.arena[idx].dirty_next;
        }
        out
    }

    /// Writes every dirty page through `write_fn` in dirty-list order,
    /// then cleans the whole list. The cache mutex is not held while
    /// `write_fn` runs; each page is pinned for the duration of its write.
    pub fn flush_dirty<F>(&self, mut write_fn: F) -> Result<usize>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        let order = self.dirty_pages();
        for &pgno in &order {
            let fetched = self.fetch(pgno)?;
            debug_assert!(!fetched.fresh, "dirty page {} left the cache", pgno);
            write_fn(pgno, fetched.guard.data())?;
        }
        self.make_clean_all();
        debug!(pages = order.len(), "flushed dirty pages");
        Ok(order.len())
    }

    /// Fails with `CacheFull` unless `needed` fetches are guaranteed to
    /// succeed: unused capacity plus the run of clean entries at the LRU
    /// tail. Recycling consumes strictly from the tail, so clean entries
    /// behind a dirty one do not count. Writers call this before a
    /// multi-page mutation so the whole mutation either proceeds or fails
    /// before any byte changes.
    pub fn ensure_spare(&self, needed: usize) -> Result<()> {
        let inner = self.inner.lock();

        let mut spare = inner.n_max - inner.n_page;
        let mut cur = inner.lru_tail;
        while spare < needed {
            match cur {
                Some(idx) if !inner.arena[idx].is_dirty() => {
                    spare += 1;
                    cur = inner.arena[idx].lru_prev;
                }
                _ => return Err(WrenError::CacheFull.into()),
            }
        }
        Ok(())
    }

    /// True when `pgno` is resident. Does not pin and does not touch the
    /// LRU list or the hit counters.
    pub fn contains(&self, pgno: u32) -> bool {
        self.inner.lock().lookup(pgno).is_some()
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().n_page
    }

    pub fn hash_size(&self) -> usize {
        self.inner.lock().n_hash
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().n_max
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Verifies the structural invariants that must hold between public
    /// operations: hash residency, dirty-list/flag agreement, and
    /// LRU/pin-count agreement. Debugging aid; cheap enough for tests to
    /// call after every step.
    pub fn check_consistency(&self) -> Result<()> {
        let inner = self.inner.lock();

        let mut resident = 0usize;
        for h in 0..inner.n_hash {
            let mut cur = inner.ap_hash[h];
            while let Some(idx) = cur {
                let entry = &inner.arena[idx];
                let home = (entry.pgno as usize) & (inner.n_hash - 1);
                eyre::ensure!(
                    home == h,
                    "page {} chained in bucket {} but hashes to {}",
                    entry.pgno,
                    h,
                    home
                );
                resident += 1;
                cur = entry.hash_next;
            }
        }
        eyre::ensure!(
            resident == inner.n_page,
            "hash table holds {} entries but nPage is {}",
            resident,
            inner.n_page
        );
        eyre::ensure!(
            inner.n_page <= inner.n_max,
            "nPage {} exceeds nMax {}",
            inner.n_page,
            inner.n_max
        );

        let mut dirty_listed = 0usize;
        let mut cur = inner.dirty_head;
        let mut prev = None;
        while let Some(idx) = cur {
            eyre::ensure!(
                inner.arena[idx].is_dirty(),
                "clean page {} on the dirty list",
                inner.arena[idx].pgno
            );
            eyre::ensure!(
                inner.arena[idx].dirty_prev == prev,
                "dirty list back-link broken at page {}",
                inner.arena[idx].pgno
            );
            dirty_listed += 1;
            prev = cur;
            cur = inner.arena[idx].dirty_next;
        }
        eyre::ensure!(
            inner.dirty_tail == prev,
            "dirty tail does not terminate the dirty list"
        );

        let mut lru_listed = 0usize;
        let mut cur = inner.lru_head;
        let mut prev = None;
        while let Some(idx) = cur {
            eyre::ensure!(
                inner.arena[idx].pin_count == 0,
                "pinned page {} on the LRU list",
                inner.arena[idx].pgno
            );
            eyre::ensure!(
                inner.arena[idx].lru_prev == prev,
                "LRU back-link broken at page {}",
                inner.arena[idx].pgno
            );
            lru_listed += 1;
            prev = cur;
            cur = inner.arena[idx].lru_next;
        }
        eyre::ensure!(
            inner.lru_tail == prev,
            "LRU tail does not terminate the LRU list"
        );

        let mut dirty_flagged = 0usize;
        let mut unpinned = 0usize;
        for h in 0..inner.n_hash {
            let mut cur = inner.ap_hash[h];
            while let Some(idx) = cur {
                let entry = &inner.arena[idx];
                if entry.is_dirty() {
                    dirty_flagged += 1;
                }
                if entry.pin_count == 0 {
                    unpinned += 1;
                }
                cur = entry.hash_next;
            }
        }
        eyre::ensure!(
            dirty_flagged == dirty_listed,
            "{} DIRTY entries but {} on the dirty list",
            dirty_flagged,
            dirty_listed
        );
        eyre::ensure!(
            unpinned == lru_listed,
            "{} unpinned entries but {} on the LRU list",
            unpinned,
            lru_listed
        );

        Ok(())
    }

    fn unpin(&self, idx: EntryIndex, generation: u32) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.arena[idx];
        debug_assert_eq!(entry.generation, generation, "unpin through stale guard");
        debug_assert!(entry.pin_count > 0, "unpin of unpinned entry");
        entry.pin_count -= 1;
        if entry.pin_count == 0 {
            if entry.pgno == 0 {
                // Discarded while pinned; the slot goes straight back to
                // the free list instead of the LRU.
                inner.free_push(idx);
            } else {
                inner.lru_push_head(idx);
            }
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.dirty_head.is_some() {
            debug!("page cache dropped with unflushed dirty pages");
        }
        // The slab is one allocation and the non-local buffers are owned
        // boxes; both are released by the normal drops below this point.
    }
}

impl CacheInner {
    fn lookup(&self, pgno: u32) -> Option<EntryIndex> {
        let h = (pgno as usize) & (self.n_hash - 1);
        let mut cur = self.ap_hash[h];
        while let Some(idx) = cur {
            if self.arena[idx].pgno == pgno {
                return Some(idx);
            }
            cur = self.arena[idx].hash_next;
        }
        None
    }

    fn resize_hash(&mut self) {
        let n_new = (self.n_hash * 2).max(MIN_HASH_SIZE);
        let mut ap_new: Vec<Option<EntryIndex>> = vec![None; n_new];

        for h in 0..self.n_hash {
            let mut cur = self.ap_hash[h];
            while let Some(idx) = cur {
                cur = self.arena[idx].hash_next;
                let new_h = (self.arena[idx].pgno as usize) & (n_new - 1);
                self.arena[idx].hash_next = ap_new[new_h];
                ap_new[new_h] = Some(idx);
            }
        }

        debug!(from = self.n_hash, to = n_new, "resized cache hash table");
        self.ap_hash = ap_new;
        self.n_hash = n_new;
        self.stats.resizes += 1;
    }

    fn hash_remove(&mut self, idx: EntryIndex) {
        let pgno = self.arena[idx].pgno;
        let h = (pgno as usize) & (self.n_hash - 1);

        let mut cur = self.ap_hash[h];
        let mut prev: Option<EntryIndex> = None;
        while let Some(i) = cur {
            if i == idx {
                let next = self.arena[i].hash_next;
                match prev {
                    Some(p) => self.arena[p].hash_next = next,
                    None => self.ap_hash[h] = next,
                }
                self.arena[idx].hash_next = None;
                self.n_page -= 1;
                return;
            }
            prev = cur;
            cur = self.arena[i].hash_next;
        }
        debug_assert!(false, "hash_remove of unhashed entry {}", pgno);
    }

    fn free_push(&mut self, idx: EntryIndex) {
        self.arena[idx].free_next = self.free_head;
        self.free_head = Some(idx);
    }

    fn lru_push_head(&mut self, idx: EntryIndex) {
        self.arena[idx].lru_prev = None;
        self.arena[idx].lru_next = self.lru_head;
        match self.lru_head {
            Some(head) => self.arena[head].lru_prev = Some(idx),
            None => self.lru_tail = Some(idx),
        }
        self.lru_head = Some(idx);
    }

    fn lru_unlink(&mut self, idx: EntryIndex) {
        let (prev, next) = (self.arena[idx].lru_prev, self.arena[idx].lru_next);
        match prev {
            Some(p) => self.arena[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.arena[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
        self.arena[idx].lru_prev = None;
        self.arena[idx].lru_next = None;
    }

    fn manage_dirty_list(&mut self, idx: EntryIndex, op: DirtyListOp) {
        match op {
            DirtyListOp::Remove => {
                let (prev, next) = (self.arena[idx].dirty_prev, self.arena[idx].dirty_next);
                match prev {
                    Some(p) => self.arena[p].dirty_next = next,
                    None => self.dirty_head = next,
                }
                match next {
                    Some(n) => self.arena[n].dirty_prev = prev,
                    None => self.dirty_tail = prev,
                }
                self.arena[idx].dirty_prev = None;
                self.arena[idx].dirty_next = None;
            }
            DirtyListOp::Add => {
                self.arena[idx].dirty_prev = None;
                self.arena[idx].dirty_next = self.dirty_head;
                match self.dirty_head {
                    Some(head) => self.arena[head].dirty_prev = Some(idx),
                    None => self.dirty_tail = Some(idx),
                }
                self.dirty_head = Some(idx);
            }
            DirtyListOp::MoveToFront => {
                self.manage_dirty_list(idx, DirtyListOp::Remove);
                self.manage_dirty_list(idx, DirtyListOp::Add);
            }
        }
    }

    fn make_dirty_entry(&mut self, idx: EntryIndex) {
        if self.arena[idx].flags & PGHDR_CLEAN != 0 {
            self.arena[idx].flags &= !PGHDR_CLEAN;
            self.arena[idx].flags |= PGHDR_DIRTY;
            self.manage_dirty_list(idx, DirtyListOp::Add);
        }
    }

    /// Dirty for a fresh mutation: a clean entry flips and joins the list
    /// at the head; an already-dirty entry moves back to the front so the
    /// newest write flushes first.
    fn touch_dirty_entry(&mut self, idx: EntryIndex) {
        if self.arena[idx].flags & PGHDR_CLEAN != 0 {
            self.make_dirty_entry(idx);
        } else if self.arena[idx].is_dirty() && self.dirty_head != Some(idx) {
            self.manage_dirty_list(idx, DirtyListOp::MoveToFront);
        }
    }

    fn make_clean_entry(&mut self, idx: EntryIndex) {
        if self.arena[idx].is_dirty() {
            self.manage_dirty_list(idx, DirtyListOp::Remove);
            self.arena[idx].flags &= !(PGHDR_DIRTY | PGHDR_NEED_SYNC | PGHDR_WRITEABLE);
            self.arena[idx].flags |= PGHDR_CLEAN;
        }
    }

    fn zero_buffer(&mut self, idx: EntryIndex) {
        match &mut self.arena[idx].buf {
            PageBuf::Slab(off) => {
                let off = *off;
                let sz = self.sz_page;
                self.slab[off..off + sz].fill(0);
            }
            PageBuf::Heap(buf) => buf.fill(0),
        }
    }

    fn buffer_ptr(&self, idx: EntryIndex) -> *const u8 {
        match &self.arena[idx].buf {
            // SAFETY of the arithmetic: slab offsets are assigned as
            // i * sz_page for i < n_slab, so off + sz_page never exceeds
            // the slab allocation.
            PageBuf::Slab(off) => unsafe { self.slab.as_ptr().add(*off) },
            PageBuf::Heap(buf) => buf.as_ptr(),
        }
    }
}

impl PageGuard<'_> {
    pub fn pgno(&self) -> u32 {
        self.pgno
    }

    /// Read access to the page buffer.
    pub fn data(&self) -> &[u8] {
        let inner = self.cache.inner.lock();
        let entry = &inner.arena[self.idx];
        assert_eq!(entry.generation, self.generation, "stale page guard");
        debug_assert!(entry.pin_count > 0);
        let ptr = inner.buffer_ptr(self.idx);
        // SAFETY: the buffer lives in the cache's bulk slab or in an owned
        // box; neither moves for the life of the cache, and a pinned entry
        // is never recycled, so the memory stays valid and keeps meaning
        // this page for as long as the guard (and thus the pin) exists.
        // Concurrent writers are excluded by the single-writer discipline
        // of the layer above; the cache mutex only guards linkage.
        unsafe { std::slice::from_raw_parts(ptr, self.cache.sz_page) }
    }

    /// Write access to the page buffer. Marks the entry dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let mut inner = self.cache.inner.lock();
        let entry = &inner.arena[self.idx];
        assert_eq!(entry.generation, self.generation, "stale page guard");
        debug_assert!(entry.pin_count > 0);
        inner.touch_dirty_entry(self.idx);
        let ptr = inner.buffer_ptr(self.idx) as *mut u8;
        // SAFETY: as in `data`, plus exclusivity: this method takes
        // `&mut self`, and the single-writer discipline means no other
        // guard mutates or reads this page concurrently.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.cache.sz_page) }
    }

    /// Write access for populating a freshly fetched buffer from the
    /// Pager. Does not mark the entry dirty: the bytes match disk.
    pub fn fill_buf(&mut self) -> &mut [u8] {
        let inner = self.cache.inner.lock();
        let entry = &inner.arena[self.idx];
        assert_eq!(entry.generation, self.generation, "stale page guard");
        debug_assert!(entry.pin_count > 0);
        let ptr = inner.buffer_ptr(self.idx) as *mut u8;
        // SAFETY: identical to `data_mut`; the only difference is the
        // dirty flag, which stays clear because the caller is loading the
        // on-disk image, not diverging from it.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.cache.sz_page) }
    }

    /// Marks the page dirty without handing out the buffer.
    pub fn mark_dirty(&self) {
        let mut inner = self.cache.inner.lock();
        debug_assert_eq!(inner.arena[self.idx].generation, self.generation);
        inner.make_dirty_entry(self.idx);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.idx, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(n_max: usize) -> PageCache {
        PageCache::new(CacheConfig {
            page_size: 512,
            n_max,
            n_init: 0,
        })
        .unwrap()
    }

    #[test]
    fn fetch_miss_then_hit() {
        let cache = small_cache(8);

        let fetched = cache.fetch(3).unwrap();
        assert!(fetched.fresh);
        assert!(fetched.guard.data().iter().all(|&b| b == 0));
        drop(fetched);

        let fetched = cache.fetch(3).unwrap();
        assert!(!fetched.fresh);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn written_bytes_survive_unpin() {
        let cache = small_cache(8);

        let mut fetched = cache.fetch(1).unwrap();
        fetched.guard.fill_buf()[0] = 0xAB;
        drop(fetched);

        let fetched = cache.fetch(1).unwrap();
        assert_eq!(fetched.guard.data()[0], 0xAB);
    }

    #[test]
    fn lru_recycles_oldest_unpinned() {
        let cache = small_cache(4);

        for pgno in 1..=4u32 {
            let fetched = cache.fetch(pgno).unwrap();
            assert!(fetched.fresh);
        }
        cache.check_consistency().unwrap();

        // Page 1 is the LRU tail; fetching page 5 recycles it.
        let fetched = cache.fetch(5).unwrap();
        assert!(fetched.fresh);
        drop(fetched);

        assert!(!cache.contains(1));
        assert!(cache.contains(5));
        assert_eq!(cache.stats().recycles, 1);
        cache.check_consistency().unwrap();

        // Page 1 comes back as a fresh miss.
        let fetched = cache.fetch(1).unwrap();
        assert!(fetched.fresh);
    }

    #[test]
    fn recently_used_page_survives_recycling() {
        let cache = small_cache(4);
        for pgno in 1..=4u32 {
            cache.fetch(pgno).unwrap();
        }

        // Touch page 1 so page 2 becomes the tail.
        cache.fetch(1).unwrap();
        cache.fetch(5).unwrap();

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn all_pinned_fails_with_cache_full() {
        let cache = small_cache(2);

        let _a = cache.fetch(1).unwrap();
        let _b = cache.fetch(2).unwrap();

        let err = cache.fetch(3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WrenError>(),
            Some(WrenError::CacheFull)
        ));
    }

    #[test]
    fn dirty_tail_fails_with_cache_full() {
        let cache = small_cache(1);

        let mut fetched = cache.fetch(1).unwrap();
        fetched.guard.data_mut()[0] = 1;
        drop(fetched);

        // Page 1 is unpinned but dirty: recycling must refuse rather than
        // write back behind the Pager's back.
        let err = cache.fetch(2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WrenError>(),
            Some(WrenError::CacheFull)
        ));

        cache.make_clean_all();
        assert!(cache.fetch(2).is_ok());
    }

    #[test]
    fn dirty_list_is_newest_first() {
        let cache = small_cache(8);

        for pgno in [10u32, 20, 30] {
            let mut fetched = cache.fetch(pgno).unwrap();
            fetched.guard.data_mut()[0] = pgno as u8;
        }

        assert_eq!(cache.dirty_pages(), vec![30, 20, 10]);
        cache.check_consistency().unwrap();

        cache.make_clean(20);
        assert_eq!(cache.dirty_pages(), vec![30, 10]);
        cache.check_consistency().unwrap();

        cache.make_clean_all();
        assert!(cache.dirty_pages().is_empty());
        cache.check_consistency().unwrap();
    }

    #[test]
    fn marking_dirty_twice_keeps_one_list_entry() {
        let cache = small_cache(4);
        let mut fetched = cache.fetch(7).unwrap();
        fetched.guard.data_mut()[0] = 1;
        fetched.guard.data_mut()[1] = 2;
        fetched.guard.mark_dirty();
        drop(fetched);

        assert_eq!(cache.dirty_pages(), vec![7]);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn hash_resize_keeps_entries_reachable() {
        let cache = PageCache::new(CacheConfig {
            page_size: 512,
            n_max: 400,
            n_init: 0,
        })
        .unwrap();

        assert_eq!(cache.hash_size(), 256);

        for pgno in 1..=256u32 {
            cache.fetch(pgno).unwrap();
        }
        assert_eq!(cache.hash_size(), 256);

        // nPage == nHash, so the next fetch doubles the table first.
        cache.fetch(257).unwrap();
        assert_eq!(cache.hash_size(), 512);
        assert_eq!(cache.stats().resizes, 1);

        for pgno in 1..=257u32 {
            assert!(cache.contains(pgno), "page {} lost in resize", pgno);
        }
        cache.check_consistency().unwrap();
    }

    #[test]
    fn flush_writes_in_dirty_order_then_cleans() {
        let cache = small_cache(8);
        for pgno in [4u32, 2, 9] {
            let mut fetched = cache.fetch(pgno).unwrap();
            fetched.guard.data_mut()[0] = pgno as u8;
        }

        let mut written = Vec::new();
        let count = cache
            .flush_dirty(|pgno, data| {
                assert_eq!(data[0], pgno as u8);
                written.push(pgno);
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(written, vec![9, 2, 4]);
        assert!(cache.dirty_pages().is_empty());
        cache.check_consistency().unwrap();
    }

    #[test]
    fn poison_clears_dirty_but_keeps_pin() {
        let cache = small_cache(4);
        let mut fetched = cache.fetch(6).unwrap();
        fetched.guard.data_mut()[0] = 0xEE;

        cache.poison(6);
        assert!(cache.dirty_pages().is_empty());

        // Still pinned: not on the LRU list, so a capacity-1-style sweep
        // could never recycle it.
        drop(fetched);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn rejects_bad_page_sizes() {
        assert!(PageCache::new(CacheConfig::with_page_size(100)).is_err());
        assert!(PageCache::new(CacheConfig::with_page_size(1 << 20)).is_err());
        assert!(PageCache::new(CacheConfig::with_page_size(4096)).is_ok());
    }
}
