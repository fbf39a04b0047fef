//! Block cache and direct-link invariants: after arbitrary translations
//! and invalidations, every link site in a live block targets either the
//! current entry point of a live block or the miss stub.

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use relay_jit::block::{BlockLimits, CodeSource};
use relay_jit::link::{read_slot, LinkArena};
use relay_jit::{BlockCache, ExecMem, HelperTable, Translator};

struct BufSource {
    base: u64,
    bytes: Vec<u8>,
}

impl CodeSource for BufSource {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        let Some(off) = addr.checked_sub(self.base) else {
            return 0;
        };
        let off = off as usize;
        if off >= self.bytes.len() {
            return 0;
        }
        let n = buf.len().min(self.bytes.len() - off);
        buf[..n].copy_from_slice(&self.bytes[off..off + n]);
        n
    }

    fn is_writable_page(&self, _addr: u64) -> bool {
        false
    }

    fn bridge_wrapper(&self, _addr: u64) -> Option<u64> {
        None
    }
}

struct Harness {
    cache: BlockCache,
    exec: ExecMem,
    links: LinkArena,
    translator: Translator,
    source: BufSource,
}

const MISS: u64 = 0;

impl Harness {
    /// Guest layout at 0x40_0000:
    ///   A: jmp B
    ///   B: jmp A      (a two-block cycle)
    ///   C: ret
    fn new() -> Self {
        let mut bytes = vec![0x90u8; 0x40];
        bytes[0x00] = 0xEB; // A: jmp +0x0E -> 0x10
        bytes[0x01] = 0x0E;
        bytes[0x10] = 0xEB; // B: jmp -0x12 -> 0x00
        bytes[0x11] = 0xEE;
        bytes[0x20] = 0xC3; // C: ret
        let exec = ExecMem::new(1 << 20);
        // A fabricated miss stub value keeps assertions readable.
        let cache = BlockCache::new(MISS);
        Self {
            cache,
            exec,
            links: LinkArena::new(),
            translator: Translator::new(BlockLimits::default(), HelperTable::default()),
            source: BufSource {
                base: 0x40_0000,
                bytes,
            },
        }
    }

    fn translate(&mut self, entry: u64) -> std::sync::Arc<relay_jit::TranslatedBlock> {
        let block = self
            .translator
            .translate(
                &self.source,
                entry,
                self.cache.map_root(),
                self.cache.miss_stub(),
                &mut self.exec,
                &mut self.links,
                self.cache.next_id(),
            )
            .expect("translation succeeds");
        self.cache.install(block, &mut self.exec)
    }

    /// Property 3: every outgoing link of every live block points at the
    /// current entry of a live block or at the miss stub.
    fn assert_no_dangling_links(&self) {
        let mut live_entries: HashMap<u64, u64> = HashMap::new();
        for entry in [0x40_0000u64, 0x40_0010, 0x40_0020] {
            if let Some(block) = self.cache.current(entry) {
                live_entries.insert(entry, block.host_entry);
            }
        }
        for entry in [0x40_0000u64, 0x40_0010, 0x40_0020] {
            let Some(block) = self.cache.current(entry) else {
                continue;
            };
            for &(slot, target) in &block.links_out {
                let bound = read_slot(slot);
                if bound == MISS {
                    continue;
                }
                assert_eq!(
                    Some(&bound),
                    live_entries.get(&target),
                    "link site {slot:#x} of block {entry:#x} dangles"
                );
            }
        }
    }
}

#[test]
fn install_binds_pending_links_in_both_directions() {
    let mut h = Harness::new();
    let a = h.translate(0x40_0000);
    // A's link to B is pending on the miss stub until B exists.
    assert_eq!(read_slot(a.links_out[0].0), MISS);
    h.assert_no_dangling_links();

    let b = h.translate(0x40_0010);
    // Installing B resolves A's site forward and binds B's backward link
    // to A, which already exists.
    assert_eq!(read_slot(a.links_out[0].0), b.host_entry);
    assert_eq!(read_slot(b.links_out[0].0), a.host_entry);
    h.assert_no_dangling_links();
}

#[test]
fn invalidation_rewrites_predecessors_to_miss() {
    let mut h = Harness::new();
    let a = h.translate(0x40_0000);
    let b = h.translate(0x40_0010);
    assert_eq!(read_slot(a.links_out[0].0), b.host_entry);

    assert!(h.cache.invalidate_entry(0x40_0010));
    assert_eq!(read_slot(a.links_out[0].0), MISS);
    assert!(b.is_retired());
    // The cache slot for B resolves back to the miss stub.
    assert_eq!(h.cache.published_entry(0x40_0010), MISS);
    h.assert_no_dangling_links();

    // Retranslating B re-binds the waiting site to the new entry.
    let b2 = h.translate(0x40_0010);
    assert_ne!(b2.host_entry, b.host_entry);
    assert_eq!(read_slot(a.links_out[0].0), b2.host_entry);
    h.assert_no_dangling_links();
}

#[test]
fn cyclic_links_tear_down_cleanly() {
    let mut h = Harness::new();
    let _a = h.translate(0x40_0000);
    let _b = h.translate(0x40_0010);
    h.assert_no_dangling_links();

    // Kill both sides of the A<->B cycle in either order.
    h.cache.invalidate_entry(0x40_0000);
    h.assert_no_dangling_links();
    h.cache.invalidate_entry(0x40_0010);
    h.assert_no_dangling_links();
}

#[test]
fn superseded_block_stays_alive_while_pinned() {
    let mut h = Harness::new();
    let b = h.translate(0x40_0010);
    b.pin();
    h.cache.invalidate_entry(0x40_0010);

    // Purge must not free a pinned block.
    assert_eq!(h.cache.purge(&mut h.exec), 0);
    b.unpin();
    assert_eq!(h.cache.purge(&mut h.exec), 1);
}

#[test]
fn publication_resolves_through_page_table() {
    let mut h = Harness::new();
    assert_eq!(h.cache.published_entry(0x40_0020), MISS);
    let c = h.translate(0x40_0020);
    assert_eq!(h.cache.published_entry(0x40_0020), c.host_entry);
    // Neighbouring addresses keep missing.
    assert_eq!(h.cache.published_entry(0x40_0021), MISS);
}

#[test]
fn fresh_blocks_after_invalidation_count_as_new_translations() {
    let mut h = Harness::new();
    h.translate(0x40_0020);
    h.cache.invalidate_entry(0x40_0020);
    h.translate(0x40_0020);
    let stats = h.cache.stats();
    assert_eq!(stats.blocks_translated_total, 2);
    assert_eq!(stats.blocks_invalidated_total, 1);
}
