//! Fuzz testing for the slotted-page decoder.
//!
//! Feeds arbitrary bytes to the page codec's validating reads to ensure
//! malformed images fail with errors rather than panics or out-of-bounds
//! access: header decode, freeblock-chain walking (including cycles),
//! cell-pointer validation, and payload decoding.

#![no_main]

use libfuzzer_sys::fuzz_target;

use wrendb::btree::Payload;
use wrendb::storage::PageView;

const PAGE_SIZE: usize = 512;

fuzz_target!(|data: &[u8]| {
    let mut page = [0u8; PAGE_SIZE];
    let len = data.len().min(PAGE_SIZE);
    page[..len].copy_from_slice(&data[..len]);

    for hdr in [0usize, 100] {
        let Ok(view) = PageView::new(&page, hdr, PAGE_SIZE) else {
            continue;
        };

        let _ = view.validate(1);
        let _ = view.validate_cells(1);
        let _ = view.free_space();
        let _ = view.total_free();

        for i in 0..view.cell_count().min(64) {
            let _ = view.cell_key(i);
            if let Ok(bytes) = view.cell_bytes(i) {
                let _ = Payload::decode(bytes);
            }
        }
    }
});
