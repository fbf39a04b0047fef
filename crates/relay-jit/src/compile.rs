//! The translator driver: runs discovery, analysis, sizing, and emission
//! over one guest entry point and produces an installed-ready
//! [`TranslatedBlock`].
//!
//! Pass 2 and pass 3 execute the *same* expansion code against different
//! sinks, so the sizing result is the emission layout by construction.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::arena::{ExecMem, ExecMemError};
use crate::block::{discover, BlockEnd, BlockIr, BlockLimits, CodeSource};
use crate::link::LinkArena;
use crate::liveness::analyze;
use crate::lower::{BlockLayout, HelperTable, LowerCtx};
use crate::sink::{EmitSink, SizeSink};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(transparent)]
    ExecMem(#[from] ExecMemError),
}

/// Sidecar row: guest-instruction offset within the block mapped to the
/// host offset of its expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarEntry {
    pub guest_off: u32,
    pub host_off: u32,
}

pub struct TranslatedBlock {
    pub id: u32,
    /// Guest start address.
    pub entry: u64,
    /// Guest bytes covered (inclusive range is `entry..entry+guest_len`).
    pub guest_len: u32,
    /// Post-prolog host entry point (execution view). The eight bytes
    /// before it are the metadata header: a pointer back to this block,
    /// patched in at install time so lock-free readers can pin it.
    pub host_entry: u64,
    pub payload_len: u32,
    /// Arena coordinates of the payload (header included).
    pub region: usize,
    pub region_offset: usize,
    /// Monotonic per-instruction offsets, covering exactly the block's
    /// guest byte range; consumed for precise fault dispatch.
    pub sidecar: Vec<SidecarEntry>,
    /// FNV-1a over the source guest bytes at translation time.
    pub hash: u64,
    /// Source pages were observed writable: execute only through the
    /// dispatcher, re-verifying the hash on each entry.
    pub always_verify: bool,
    /// Set when the block ends at an instruction the emitter cannot
    /// expand; the dispatcher routes that address through the fallback.
    pub fallback_rip: Option<u64>,
    /// Outgoing direct-link sites: `(slot address, guest target)`.
    pub links_out: Vec<(u64, u64)>,
    /// Link sites in other blocks currently bound to this block's entry.
    pub preds: Mutex<Vec<u64>>,
    in_use: AtomicU32,
    retired: AtomicBool,
}

impl TranslatedBlock {
    pub fn end(&self) -> u64 {
        self.entry + self.guest_len as u64
    }

    pub fn covers(&self, addr: u64) -> bool {
        addr >= self.entry && addr < self.end()
    }

    /// Whether this block may be published for inline entry. Verified-on-
    /// entry blocks and empty fallback shims execute only through the
    /// dispatcher — an inline entry would bypass the hash check (or, for
    /// a shim, loop without ever reaching the fallback).
    pub fn publishable(&self) -> bool {
        !self.always_verify && !(self.guest_len == 0 && self.fallback_rip.is_some())
    }

    /// Pin against purge for the duration of one dispatcher entry.
    pub fn pin(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Drop all pins. Fork-child use only: the pinning threads do not
    /// exist on this side of the fork.
    pub fn force_unpin(&self) {
        self.in_use.store(0, Ordering::Release);
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Guest PC for a faulting host PC inside this block's code.
    pub fn guest_pc_for_host(&self, host_pc: u64) -> Option<u64> {
        if host_pc < self.host_entry || host_pc >= self.host_entry + self.payload_len as u64 {
            return None;
        }
        let off = (host_pc - self.host_entry) as u32;
        let idx = match self.sidecar.binary_search_by_key(&off, |e| e.host_off) {
            Ok(i) => i,
            Err(0) => return Some(self.entry),
            Err(i) => i - 1,
        };
        Some(self.entry + self.sidecar[idx].guest_off as u64)
    }
}

/// FNV-1a over the block's source bytes; cheap enough to re-run on every
/// entry of an `always_verify` block.
pub fn hash_guest_range<S: CodeSource>(source: &S, start: u64, len: u32) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut buf = [0u8; 64];
    let mut addr = start;
    let mut remaining = len as usize;
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        let got = source.read(addr, &mut buf[..chunk]);
        if got == 0 {
            break;
        }
        for &b in &buf[..got] {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        addr += got as u64;
        remaining -= got;
    }
    hash
}

pub struct Translator {
    pub limits: BlockLimits,
    pub helpers: HelperTable,
}

impl Translator {
    pub fn new(limits: BlockLimits, helpers: HelperTable) -> Self {
        Self { limits, helpers }
    }

    /// Compile the block at `entry`. The caller (runtime) holds the cache
    /// lock and provides the block id the cache will assign on install.
    #[allow(clippy::too_many_arguments)]
    pub fn translate<S: CodeSource>(
        &self,
        source: &S,
        entry: u64,
        map_root: u64,
        epilog: u64,
        exec: &mut ExecMem,
        links: &mut LinkArena,
        id: u32,
    ) -> Result<TranslatedBlock, TranslateError> {
        // Pass 0: discovery. Pass 1: analysis.
        let ir = discover(source, entry, self.limits);
        let analysis = analyze(&ir);

        // Pass 2: sizing; records each instruction's host offset, which
        // becomes both the branch layout and the sidecar.
        let mut size_sink = SizeSink::new();
        let mut host_off = vec![0u32; ir.insts.len()];
        let link_targets;
        {
            let mut ctx = LowerCtx::new(
                &mut size_sink,
                &ir,
                &analysis,
                &self.helpers,
                None,
                &[],
                map_root,
                epilog,
            );
            ctx.lower_block(|idx, off| host_off[idx] = off as u32);
            link_targets = ctx.links.clone();
        }
        let layout = BlockLayout {
            host_off: host_off.clone(),
            code_bytes: size_sink.code_bytes() as u32,
        };

        // Direct-link slots come from the always-writable sidecar arena,
        // initialized to the miss stub.
        let slots_base = if link_targets.is_empty() {
            0
        } else {
            links.alloc(link_targets.len(), epilog)
        };
        let slot_addrs: Vec<u64> = (0..link_targets.len())
            .map(|i| slots_base + i as u64 * 8)
            .collect();

        // Pass 3: emission into the sized reservation, behind the 8-byte
        // metadata header slot.
        let alloc = exec.alloc(8 + size_sink.payload_bytes())?;
        let mut emit_sink = EmitSink::new(size_sink.code_bytes());
        {
            let mut ctx = LowerCtx::new(
                &mut emit_sink,
                &ir,
                &analysis,
                &self.helpers,
                Some(&layout),
                &slot_addrs,
                map_root,
                epilog,
            );
            ctx.lower_block(|_, _| {});
            debug_assert_eq!(ctx.links, link_targets);
        }
        let payload = emit_sink.finish();
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.extend_from_slice(&[0u8; 8]);
        framed.extend_from_slice(&payload);
        exec.commit(&alloc, &framed, id);

        let sidecar = ir
            .insts
            .iter()
            .zip(&host_off)
            .map(|(inst, &off)| SidecarEntry {
                guest_off: (inst.di.rip - entry) as u32,
                host_off: off,
            })
            .collect();

        let fallback_rip = match ir.end {
            BlockEnd::Unsupported { rip } => Some(rip),
            _ => None,
        };

        tracing::trace!(
            entry = format_args!("{entry:#x}"),
            guest_len = ir.guest_len,
            host_len = payload.len(),
            insts = ir.insts.len(),
            links = link_targets.len(),
            always_verify = ir.writable_source,
            "translated block"
        );

        Ok(TranslatedBlock {
            id,
            entry,
            guest_len: ir.guest_len,
            host_entry: alloc.exec + 8,
            payload_len: payload.len() as u32,
            region: alloc.region,
            region_offset: alloc.offset,
            sidecar,
            hash: hash_guest_range(source, entry, ir.guest_len),
            always_verify: ir.writable_source,
            fallback_rip,
            links_out: slot_addrs.into_iter().zip(link_targets).collect(),
            preds: Mutex::new(Vec::new()),
            in_use: AtomicU32::new(0),
            retired: AtomicBool::new(false),
        })
    }
}

/// Size the block at `entry` without allocating or emitting; exposed for
/// tests asserting sizing/emission agreement.
pub fn size_only<S: CodeSource>(
    source: &S,
    entry: u64,
    limits: BlockLimits,
    helpers: &HelperTable,
) -> (BlockIr, usize, usize) {
    let ir = discover(source, entry, limits);
    let analysis = analyze(&ir);
    let mut sink = SizeSink::new();
    let mut ctx = LowerCtx::new(&mut sink, &ir, &analysis, helpers, None, &[], 0, 0);
    ctx.lower_block(|_, _| {});
    let links = ctx.links.len();
    let payload = sink.payload_bytes();
    (ir, payload, links)
}
