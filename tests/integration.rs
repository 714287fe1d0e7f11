//! End-to-end tests over the public API: tree growth across page splits,
//! cache eviction observed through a recording Pager, recovery from a
//! full cache, and persistence through the file-backed Pager.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use eyre::Result;
use tempfile::tempdir;
use wrendb::storage::{CacheConfig, MemPager, PageCache, Pager};
use wrendb::{BPlusTree, FilePager, WrenError};

const PAGE_SIZE: usize = 512;

fn small_tree() -> BPlusTree<MemPager> {
    let pager = MemPager::new(PAGE_SIZE).unwrap();
    let cache = PageCache::new(CacheConfig::with_page_size(PAGE_SIZE)).unwrap();
    BPlusTree::create(pager, cache).unwrap()
}

/// Deterministic shuffle so failures reproduce.
fn shuffled(n: u32) -> Vec<u32> {
    let mut keys: Vec<u32> = (1..=n).collect();
    let mut state = 0x9E3779B9u32;
    for i in (1..keys.len()).rev() {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        keys.swap(i, (state as usize) % (i + 1));
    }
    keys
}

#[test]
fn empty_tree_then_first_key() {
    let mut tree = small_tree();

    assert!(tree.search(42).unwrap().is_none());

    tree.insert(42, 7).unwrap();
    assert!(tree.search(42).unwrap().is_some());
    assert_eq!(tree.payload(42).unwrap().unwrap(), vec![7]);

    tree.insert(42, 9).unwrap();
    assert_eq!(tree.payload(42).unwrap().unwrap(), vec![7, 9]);
}

#[test]
fn root_split_keeps_every_key_searchable() {
    let mut tree = small_tree();

    let mut key = 1u32;
    while tree.depth().unwrap() == 1 {
        tree.insert(key, key).unwrap();
        key += 1;
        assert!(key < 500, "root leaf never split");
    }

    assert_eq!(tree.depth().unwrap(), 2);
    for k in 1..key {
        assert!(tree.search(k).unwrap().is_some(), "key {} lost in split", k);
    }
    tree.check_invariants().unwrap();
}

#[test]
fn cascading_splits_reach_depth_three() {
    let mut tree = small_tree();
    let n = 2000u32;

    for key in 1..=n {
        tree.insert(key, key + 7).unwrap();
    }

    assert_eq!(tree.depth().unwrap(), 3);

    let walked = tree.check_invariants().unwrap();
    assert_eq!(walked, (1..=n).collect::<Vec<u32>>());

    for key in 1..=n {
        assert_eq!(tree.payload(key).unwrap().unwrap(), vec![key + 7]);
    }
}

#[test]
fn random_insert_order_matches_model() {
    let mut tree = small_tree();
    let mut model: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    // Keys collide on purpose (mod 97) so posting lists grow.
    for (i, key) in shuffled(600).iter().map(|k| k % 97 + 1).enumerate() {
        let doc = i as u32;
        tree.insert(key, doc).unwrap();
        model.entry(key).or_default().push(doc);
    }

    let walked = tree.check_invariants().unwrap();
    assert_eq!(walked, model.keys().copied().collect::<Vec<u32>>());

    for (key, docs) in &model {
        assert_eq!(tree.payload(*key).unwrap().unwrap(), *docs);
    }
    assert!(tree.search(98).unwrap().is_none());
}

/// Pager wrapper counting reads per page, for observing cache behavior.
struct RecordingPager {
    inner: MemPager,
    reads: Arc<Mutex<BTreeMap<u32, usize>>>,
}

impl RecordingPager {
    fn new(inner: MemPager) -> (Self, Arc<Mutex<BTreeMap<u32, usize>>>) {
        let reads = Arc::new(Mutex::new(BTreeMap::new()));
        (
            Self {
                inner,
                reads: Arc::clone(&reads),
            },
            reads,
        )
    }
}

impl Pager for RecordingPager {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn page_count(&self) -> u32 {
        self.inner.page_count()
    }

    fn read_page(&self, pgno: u32, buf: &mut [u8]) -> Result<()> {
        *self.reads.lock().unwrap().entry(pgno).or_insert(0) += 1;
        self.inner.read_page(pgno, buf)
    }

    fn write_page(&mut self, pgno: u32, buf: &[u8]) -> Result<()> {
        self.inner.write_page(pgno, buf)
    }

    fn allocate_page(&mut self) -> Result<u32> {
        self.inner.allocate_page()
    }
}

#[test]
fn eviction_rereads_through_the_pager() {
    // Five pages of backing storage, a cache with room for four.
    let mut mem = MemPager::new(PAGE_SIZE).unwrap();
    for _ in 0..5 {
        let pgno = mem.allocate_page().unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = pgno as u8;
        mem.write_page(pgno, &page).unwrap();
    }
    let (pager, reads) = RecordingPager::new(mem);

    let cache = PageCache::new(CacheConfig {
        page_size: PAGE_SIZE,
        n_max: 4,
        n_init: 0,
    })
    .unwrap();

    let mut touch = |pgno: u32| {
        let mut fetched = cache.fetch(pgno).unwrap();
        if fetched.fresh {
            pager.read_page(pgno, fetched.guard.fill_buf()).unwrap();
        }
        assert_eq!(fetched.guard.data()[0], pgno as u8);
    };

    for pgno in 1..=5 {
        touch(pgno);
    }

    // Page 1 was the LRU tail when page 5 arrived.
    assert!(!cache.contains(1));
    assert!(cache.contains(5));
    cache.check_consistency().unwrap();

    touch(1);
    let reads = reads.lock().unwrap();
    assert_eq!(reads[&1], 2, "evicted page must re-read through the Pager");
    assert_eq!(reads[&5], 1);
}

#[test]
fn cache_full_recovers_after_flush() {
    let pager = MemPager::new(PAGE_SIZE).unwrap();
    let cache = PageCache::new(CacheConfig {
        page_size: PAGE_SIZE,
        n_max: 16,
        n_init: 0,
    })
    .unwrap();
    let mut tree = BPlusTree::create(pager, cache).unwrap();

    let mut flushes = 0usize;
    let mut key = 1u32;
    while key <= 1000 {
        match tree.insert(key, key) {
            Ok(()) => key += 1,
            Err(err) => {
                let wren = err
                    .downcast_ref::<WrenError>()
                    .unwrap_or_else(|| panic!("unexpected failure at key {}: {:?}", key, err));
                assert!(
                    wren.is_recoverable(),
                    "unrecoverable error at key {}: {}",
                    key,
                    wren
                );
                tree.flush().unwrap();
                flushes += 1;
                assert!(flushes < 10_000, "flush did not unblock inserts");
            }
        }
    }

    assert!(flushes > 0, "a 16-page cache never filled with dirty pages");
    tree.flush().unwrap();

    let walked = tree.check_invariants().unwrap();
    assert_eq!(walked, (1..=1000).collect::<Vec<u32>>());
}

#[test]
fn file_backed_tree_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.wren");
    let n = 800u32;

    {
        let pager = FilePager::create(&path, PAGE_SIZE).unwrap();
        let cache = PageCache::new(CacheConfig::with_page_size(PAGE_SIZE)).unwrap();
        let mut tree = BPlusTree::create(pager, cache).unwrap();

        for key in shuffled(n) {
            tree.insert(key, key * 2).unwrap();
        }
        tree.flush().unwrap();
        tree.pager().sync().unwrap();
    }

    let pager = FilePager::open(&path).unwrap();
    let cache = PageCache::new(CacheConfig::with_page_size(PAGE_SIZE)).unwrap();
    let tree = BPlusTree::open(pager, cache).unwrap();

    let walked = tree.check_invariants().unwrap();
    assert_eq!(walked, (1..=n).collect::<Vec<u32>>());
    for key in 1..=n {
        assert_eq!(tree.payload(key).unwrap().unwrap(), vec![key * 2]);
    }
    assert!(tree.search(n + 1).unwrap().is_none());
}

#[test]
fn reopen_rejects_foreign_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.wren");
    std::fs::write(&path, vec![0xAAu8; PAGE_SIZE]).unwrap();

    // The mapping opens, but the header declares a bogus page size.
    assert!(FilePager::open(&path).is_err());
}
