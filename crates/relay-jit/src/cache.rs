//! Block cache: the three-level address map generated code walks inline,
//! plus the block registry with direct-link resolution and invalidation.
//!
//! Readers (the inline lookup and the dispatcher fast path) never lock;
//! leaf slots are published with release stores after the block's code is
//! written and instruction-cache flushed. Mutators (translator, SMC
//! invalidator, purge scan) serialize on the owning lock in the runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::compile::TranslatedBlock;
use crate::link;

const LEVEL_BITS: u32 = 16;
const LEVEL_SLOTS: usize = 1 << LEVEL_BITS;

fn new_table(init: u64) -> Box<[AtomicU64]> {
    (0..LEVEL_SLOTS).map(|_| AtomicU64::new(init)).collect()
}

/// Three-level `[47:32]/[31:16]/[15:0]` page table from guest address to
/// host code pointer. Absent levels resolve through shared default tables
/// whose every slot is the miss stub, so the inline walk needs no bounds
/// or null checks.
pub struct AddressMap {
    root: Box<[AtomicU64]>,
    default_l2: Box<[AtomicU64]>,
    default_l3: Box<[AtomicU64]>,
    /// Owned live tables (kept alive for the map's lifetime; entries in
    /// `root`/L2 point into these allocations).
    l2_tables: Vec<Box<[AtomicU64]>>,
    l3_tables: Vec<Box<[AtomicU64]>>,
    miss: u64,
}

impl AddressMap {
    pub fn new(miss: u64) -> Self {
        let default_l3 = new_table(miss);
        let default_l2 = new_table(default_l3.as_ptr() as u64);
        let root = new_table(default_l2.as_ptr() as u64);
        Self {
            root,
            default_l2,
            default_l3,
            l2_tables: Vec::new(),
            l3_tables: Vec::new(),
            miss,
        }
    }

    pub fn root_addr(&self) -> u64 {
        self.root.as_ptr() as u64
    }

    pub fn miss_stub(&self) -> u64 {
        self.miss
    }

    pub(crate) fn indices(guest: u64) -> (usize, usize, usize) {
        (
            ((guest >> 32) & 0xFFFF) as usize,
            ((guest >> 16) & 0xFFFF) as usize,
            (guest & 0xFFFF) as usize,
        )
    }

    /// Lock-free walk, same shape the generated inline lookup uses.
    pub fn get(&self, guest: u64) -> u64 {
        let (i1, i2, i3) = Self::indices(guest);
        let l2 = self.root[i1].load(Ordering::Acquire) as *const AtomicU64;
        let l2 = unsafe { std::slice::from_raw_parts(l2, LEVEL_SLOTS) };
        let l3 = l2[i2].load(Ordering::Acquire) as *const AtomicU64;
        let l3 = unsafe { std::slice::from_raw_parts(l3, LEVEL_SLOTS) };
        l3[i3].load(Ordering::Acquire)
    }

    /// Publish `entry` for `guest`, materializing levels on demand.
    /// Callers hold the cache lock; readers are unaffected by the
    /// intermediate table installs (they only add miss-filled tables).
    pub fn set(&mut self, guest: u64, entry: u64) {
        let (i1, i2, i3) = Self::indices(guest);
        let mut l2_addr = self.root[i1].load(Ordering::Acquire);
        if l2_addr == self.default_l2.as_ptr() as u64 {
            let table = new_table(self.default_l3.as_ptr() as u64);
            l2_addr = table.as_ptr() as u64;
            self.l2_tables.push(table);
            self.root[i1].store(l2_addr, Ordering::Release);
        }
        let l2 = unsafe { std::slice::from_raw_parts(l2_addr as *const AtomicU64, LEVEL_SLOTS) };
        let mut l3_addr = l2[i2].load(Ordering::Acquire);
        if l3_addr == self.default_l3.as_ptr() as u64 {
            let table = new_table(self.miss);
            l3_addr = table.as_ptr() as u64;
            self.l3_tables.push(table);
            l2[i2].store(l3_addr, Ordering::Release);
        }
        let l3 = unsafe { std::slice::from_raw_parts(l3_addr as *const AtomicU64, LEVEL_SLOTS) };
        l3[i3].store(entry, Ordering::Release);
    }

    /// Reset `guest` to the miss stub.
    pub fn clear(&mut self, guest: u64) {
        let (i1, i2, i3) = Self::indices(guest);
        let l2_addr = self.root[i1].load(Ordering::Acquire);
        if l2_addr == self.default_l2.as_ptr() as u64 {
            return;
        }
        let l2 = unsafe { std::slice::from_raw_parts(l2_addr as *const AtomicU64, LEVEL_SLOTS) };
        let l3_addr = l2[i2].load(Ordering::Acquire);
        if l3_addr == self.default_l3.as_ptr() as u64 {
            return;
        }
        let l3 = unsafe { std::slice::from_raw_parts(l3_addr as *const AtomicU64, LEVEL_SLOTS) };
        l3[i3].store(self.miss, Ordering::Release);
    }
}

/// Lock-free three-level walk from a raw root address, identical to the
/// inline sequence generated code performs. Used by the dispatcher fast
/// path, which must not take the cache lock.
///
/// # Safety
/// `root` must be the root address of a live [`AddressMap`].
pub unsafe fn walk_raw(root: u64, guest: u64) -> u64 {
    let (i1, i2, i3) = AddressMap::indices(guest);
    let l1 = root as *const AtomicU64;
    let l2 = (*l1.add(i1)).load(Ordering::Acquire) as *const AtomicU64;
    let l3 = (*l2.add(i2)).load(Ordering::Acquire) as *const AtomicU64;
    (*l3.add(i3)).load(Ordering::Acquire)
}

/// Counters in the style of the runtime's `_total` stats.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks_translated_total: u64,
    pub blocks_invalidated_total: u64,
    pub blocks_purged_total: u64,
}

pub struct BlockCache {
    map: AddressMap,
    blocks: Vec<Option<Arc<TranslatedBlock>>>,
    by_entry: HashMap<u64, u32>,
    /// Direct-link sites waiting for a block at the keyed guest address.
    pending_links: HashMap<u64, Vec<u64>>,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(miss_stub: u64) -> Self {
        Self {
            map: AddressMap::new(miss_stub),
            blocks: Vec::new(),
            by_entry: HashMap::new(),
            pending_links: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn map_root(&self) -> u64 {
        self.map.root_addr()
    }

    pub fn miss_stub(&self) -> u64 {
        self.map.miss_stub()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Lock-free read of the published entry point for `guest`.
    pub fn published_entry(&self, guest: u64) -> u64 {
        self.map.get(guest)
    }

    pub fn current(&self, entry: u64) -> Option<Arc<TranslatedBlock>> {
        let idx = *self.by_entry.get(&entry)?;
        self.blocks[idx as usize].clone()
    }

    pub fn by_id(&self, id: u32) -> Option<Arc<TranslatedBlock>> {
        self.blocks.get(id as usize)?.clone()
    }

    /// Reserve the id the next installed block will get (the arena wants
    /// it before the payload is committed).
    pub fn next_id(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Install a fully written, icache-flushed block: supersede any
    /// previous block at the same entry, patch the metadata header,
    /// publish the leaf slot, and resolve direct links in both
    /// directions.
    pub fn install(
        &mut self,
        block: TranslatedBlock,
        exec: &mut crate::arena::ExecMem,
    ) -> Arc<TranslatedBlock> {
        let entry = block.entry;
        if self.by_entry.contains_key(&entry) {
            self.invalidate_entry(entry);
        }

        let id = self.blocks.len() as u32;
        let block = Arc::new(block);
        // Header first: once the leaf slot is published, a lock-free
        // reader may chase it immediately.
        exec.patch_u64(
            block.region,
            block.region_offset,
            Arc::as_ptr(&block) as u64,
        );
        self.blocks.push(Some(block.clone()));
        self.by_entry.insert(entry, id);
        self.stats.blocks_translated_total += 1;

        // Outgoing links: bind to current targets or queue on the target
        // address.
        for &(slot, target) in &block.links_out {
            match self.current(target) {
                Some(target_block) if target_block.publishable() => {
                    link::patch_slot(slot, target_block.host_entry);
                    target_block.preds.lock().unwrap().push(slot);
                }
                _ => {
                    self.pending_links.entry(target).or_default().push(slot);
                }
            }
        }

        // Dispatcher-only blocks never enter the inline lookup.
        if block.publishable() {
            // Incoming links recorded before this block existed.
            if let Some(slots) = self.pending_links.remove(&entry) {
                let mut preds = block.preds.lock().unwrap();
                for slot in slots {
                    link::patch_slot(slot, block.host_entry);
                    preds.push(slot);
                }
            }
            self.map.set(entry, block.host_entry);
        }
        block
    }

    /// Unpublish the current block at `entry`: clear its leaf slot,
    /// repoint every predecessor link site at the miss stub, and mark the
    /// block pending-free. Threads already inside keep running its
    /// (still-mapped) code until they exit.
    pub fn invalidate_entry(&mut self, entry: u64) -> bool {
        let Some(&idx) = self.by_entry.get(&entry) else {
            return false;
        };
        let Some(block) = self.blocks[idx as usize].clone() else {
            return false;
        };
        self.map.clear(entry);
        self.by_entry.remove(&entry);
        let miss = self.map.miss_stub();
        let mut preds = block.preds.lock().unwrap();
        for &slot in preds.iter() {
            link::patch_slot(slot, miss);
            // The site still wants this guest address; requeue it for a
            // future retranslation.
            self.pending_links.entry(entry).or_default().push(slot);
        }
        preds.clear();
        drop(preds);
        block.retire();
        self.stats.blocks_invalidated_total += 1;
        true
    }

    /// Invalidate every current block whose guest range intersects
    /// `[lo, hi)`. Returns how many were invalidated.
    pub fn invalidate_range(&mut self, lo: u64, hi: u64) -> usize {
        let entries: Vec<u64> = self
            .by_entry
            .iter()
            .filter_map(|(&entry, &idx)| {
                let block = self.blocks[idx as usize].as_ref()?;
                (block.entry < hi && block.end() > lo).then_some(entry)
            })
            .collect();
        for entry in &entries {
            self.invalidate_entry(*entry);
        }
        entries.len()
    }

    /// Drop retired blocks no thread holds, and tell the arena which code
    /// regions that frees.
    pub fn purge(&mut self, exec: &mut crate::arena::ExecMem) -> usize {
        let mut dead = vec![false; self.blocks.len()];
        for (id, slot) in self.blocks.iter().enumerate() {
            if let Some(block) = slot {
                if block.is_retired() && block.in_use() == 0 {
                    dead[id] = true;
                }
            }
        }
        // A region is reclaimable only when every block in it is dead or
        // already freed.
        let freed_regions = exec.purge(|id| {
            self.blocks
                .get(id as usize)
                .map(|slot| slot.is_none() || dead[id as usize])
                .unwrap_or(true)
        });
        let mut freed = 0;
        for (id, is_dead) in dead.iter().enumerate() {
            if *is_dead {
                self.blocks[id] = None;
                freed += 1;
            }
        }
        self.stats.blocks_purged_total += freed as u64;
        let _ = freed_regions;
        freed
    }

    /// Reset every block's `in_use` pin. Only valid in a fork child,
    /// where the counting threads no longer exist; stale counts would pin
    /// their blocks forever.
    pub fn reset_in_use(&self) {
        for block in self.blocks.iter().flatten() {
            block.force_unpin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tables_resolve_to_miss() {
        let map = AddressMap::new(0x1234);
        assert_eq!(map.get(0), 0x1234);
        assert_eq!(map.get(0xFFFF_FFFF_FFFF), 0x1234);
    }

    #[test]
    fn set_then_get_round_trips_and_clear_restores_miss() {
        let mut map = AddressMap::new(0x1234);
        map.set(0x5555_0000_1000, 0xCAFE);
        assert_eq!(map.get(0x5555_0000_1000), 0xCAFE);
        // Neighbours stay on the miss stub.
        assert_eq!(map.get(0x5555_0000_1001), 0x1234);
        assert_eq!(map.get(0x5554_0000_1000), 0x1234);
        map.clear(0x5555_0000_1000);
        assert_eq!(map.get(0x5555_0000_1000), 0x1234);
    }

    #[test]
    fn lookup_matches_inline_walk_indexing() {
        // The inline sequence extracts [47:32], [31:16], [15:0]; the two
        // walks must agree on every boundary bit pattern.
        let mut map = AddressMap::new(0);
        for addr in [0x0000_0001_0000u64, 0xFFFF_FFFF_FFFF, 0x1234_5678_9ABC] {
            map.set(addr, addr ^ 1);
            assert_eq!(map.get(addr), addr ^ 1);
        }
    }
}
