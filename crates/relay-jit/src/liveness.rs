//! Pass 1: analysis.
//!
//! Walks the discovered block backward propagating status-flag liveness,
//! decides per instruction whether flags are skipped, recorded in the
//! deferred scratch, or consumed straight from host condition codes, builds
//! the intra-block label table, and assigns host SIMD cache slots.

use std::collections::HashMap;

use iced_x86::{Mnemonic, OpKind, Register};

use crate::a64::{Cc, Reg};
use crate::block::BlockIr;
use crate::decode::{DecodedInst, F_ALL};

/// What the emitter does about the flags an instruction defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStrategy {
    /// No consumer observes any defined flag: emit neither materialization
    /// nor the scratch write.
    Skip,
    /// Record the operation in the deferred-flags scratch.
    Defer,
}

/// Host SIMD registers available as block-local caches for guest XMM
/// registers. v16..v23 are caller-saved, so helper calls spill/reload them.
pub const SIMD_CACHE_REGS: [Reg; 8] = [16, 17, 18, 19, 20, 21, 22, 23];

#[derive(Debug, Clone)]
pub struct BlockAnalysis {
    /// Per-instruction flag strategy (parallel to `BlockIr::insts`).
    pub strategy: Vec<FlagStrategy>,
    /// For flag consumers whose producer is the immediately preceding
    /// instruction: the host condition code that stands in for the guest
    /// condition. The producer then emits the flag-setting host form.
    pub native_cc: Vec<Option<Cc>>,
    /// Producers that must emit the flag-setting host form for a native
    /// consumer.
    pub host_flags: Vec<bool>,
    /// Intra-block branch targets: guest address -> instruction index.
    pub labels: HashMap<u64, usize>,
    /// Guest XMM register -> host vector register cache slot.
    pub simd_map: HashMap<u8, Reg>,
}

/// Producer families whose host flag-setting forms cover guest conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeProducer {
    /// CMP/SUB: SUBS leaves exact x86 semantics (CF inverted).
    SubLike,
    /// ADD: ADDS carry matches x86 CF directly.
    AddLike,
    /// TEST/AND/OR/XOR: ANDS-style, C and V cleared.
    LogicLike,
}

fn native_producer(di: &DecodedInst) -> Option<NativeProducer> {
    // Host condition codes are produced by 32/64-bit flag-setting forms;
    // narrower operations reconstruct through the deferred record instead.
    if !matches!(crate::lower::op_bits(di), 32 | 64) {
        return None;
    }
    match di.instr.mnemonic() {
        Mnemonic::Cmp | Mnemonic::Sub | Mnemonic::Dec | Mnemonic::Neg => {
            Some(NativeProducer::SubLike)
        }
        Mnemonic::Add | Mnemonic::Inc => Some(NativeProducer::AddLike),
        Mnemonic::Test | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
            Some(NativeProducer::LogicLike)
        }
        _ => None,
    }
}

/// Map a guest condition code (`Jcc` low nibble) to the host condition that
/// reads the same decision off the producer's NZCV, if one exists.
fn host_cc(producer: NativeProducer, cond: u8) -> Option<Cc> {
    use NativeProducer::*;
    Some(match (producer, cond) {
        (SubLike, 0x0) => Cc::Vs,
        (SubLike, 0x1) => Cc::Vc,
        // x86 CF after CMP is the *borrow*, i.e. inverted A64 carry.
        (SubLike, 0x2) => Cc::Cc,
        (SubLike, 0x3) => Cc::Cs,
        (SubLike, 0x6) => Cc::Ls,
        (SubLike, 0x7) => Cc::Hi,
        (AddLike, 0x2) => Cc::Cs,
        (AddLike, 0x3) => Cc::Cc,
        (SubLike | AddLike, 0x4) | (LogicLike, 0x4) => Cc::Eq,
        (SubLike | AddLike, 0x5) | (LogicLike, 0x5) => Cc::Ne,
        (SubLike | AddLike, 0x8) | (LogicLike, 0x8) => Cc::Mi,
        (SubLike | AddLike, 0x9) | (LogicLike, 0x9) => Cc::Pl,
        (SubLike | AddLike, 0xC) => Cc::Lt,
        (SubLike | AddLike, 0xD) => Cc::Ge,
        (SubLike | AddLike, 0xE) => Cc::Le,
        (SubLike | AddLike, 0xF) => Cc::Gt,
        // With C and V cleared, signed conditions collapse onto N and Z.
        (LogicLike, 0xC) => Cc::Mi,
        (LogicLike, 0xD) => Cc::Pl,
        (LogicLike, 0xE) => Cc::Le,
        (LogicLike, 0xF) => Cc::Gt,
        _ => return None,
    })
}

/// The guest condition-code nibble of a Jcc/SETcc/CMOVcc, if any.
pub fn cond_nibble(di: &DecodedInst) -> Option<u8> {
    use iced_x86::ConditionCode;
    let cc = di.instr.condition_code();
    Some(match cc {
        ConditionCode::o => 0x0,
        ConditionCode::no => 0x1,
        ConditionCode::b => 0x2,
        ConditionCode::ae => 0x3,
        ConditionCode::e => 0x4,
        ConditionCode::ne => 0x5,
        ConditionCode::be => 0x6,
        ConditionCode::a => 0x7,
        ConditionCode::s => 0x8,
        ConditionCode::ns => 0x9,
        ConditionCode::p => 0xA,
        ConditionCode::np => 0xB,
        ConditionCode::l => 0xC,
        ConditionCode::ge => 0xD,
        ConditionCode::le => 0xE,
        ConditionCode::g => 0xF,
        ConditionCode::None => return None,
    })
}

pub fn analyze(ir: &BlockIr) -> BlockAnalysis {
    let n = ir.insts.len();
    let mut labels = HashMap::new();
    let by_rip: HashMap<u64, usize> = ir
        .insts
        .iter()
        .enumerate()
        .map(|(i, inst)| (inst.di.rip, i))
        .collect();

    for inst in &ir.insts {
        let di = &inst.di;
        if di.instr.is_jcc_short_or_near() {
            let target = di.instr.near_branch_target();
            if let Some(&idx) = by_rip.get(&target) {
                labels.insert(target, idx);
            }
        }
    }

    // Native host-flag pairs: a consumer whose producer is the previous
    // instruction, restricted to condition codes the producer's host form
    // expresses.
    let mut native_cc = vec![None; n];
    let mut host_flags = vec![false; n];
    for i in 1..n {
        let di = &ir.insts[i].di;
        let Some(cond) = cond_nibble(di) else {
            continue;
        };
        let prev = &ir.insts[i - 1].di;
        let Some(producer) = native_producer(prev) else {
            continue;
        };
        // The producer must define everything this consumer reads.
        if di.flag_uses() & !prev.flag_defs() != 0 {
            continue;
        }
        if let Some(cc) = host_cc(producer, cond) {
            native_cc[i] = Some(cc);
            host_flags[i - 1] = true;
        }
    }

    // Backward flag liveness. Conservative at every boundary: block exits
    // and intra-block branch edges treat all six bits as observed.
    let mut strategy = vec![FlagStrategy::Skip; n];
    let mut live = F_ALL;
    for i in (0..n).rev() {
        let di = &ir.insts[i].di;
        // A branch edge joins another path whose needs this single pass
        // does not track; behave as if everything is live across it.
        let is_intra_branch = di.instr.is_jcc_short_or_near()
            && labels.contains_key(&di.instr.near_branch_target());
        if is_intra_branch {
            live = F_ALL;
        }

        let defs = di.flag_defs();
        if defs != 0 {
            let observed = live & defs;
            strategy[i] = if observed == 0 {
                FlagStrategy::Skip
            } else {
                FlagStrategy::Defer
            };
            live &= !defs;
        }
        // A native consumer reads host NZCV, not the guest flags word, so
        // it does not force the producer into the deferred path by itself.
        if native_cc[i].is_none() {
            live |= di.flag_uses();
        }
    }

    // SIMD cache slots: first-use order, as many as there are host regs.
    let mut simd_map = HashMap::new();
    for inst in &ir.insts {
        let di = &inst.di;
        for op in 0..di.instr.op_count() {
            if di.instr.op_kind(op) != OpKind::Register {
                continue;
            }
            let reg = di.instr.op_register(op);
            if reg >= Register::XMM0 && reg <= Register::XMM15 {
                let idx = (reg as u32 - Register::XMM0 as u32) as u8;
                if simd_map.len() < SIMD_CACHE_REGS.len() {
                    let next = SIMD_CACHE_REGS[simd_map.len()];
                    simd_map.entry(idx).or_insert(next);
                }
            }
        }
    }

    BlockAnalysis {
        strategy,
        native_cc,
        host_flags,
        labels,
        simd_map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{discover, testutil::BufSource, BlockLimits};

    fn analyze_bytes(bytes: Vec<u8>) -> (BlockIr, BlockAnalysis) {
        let src = BufSource::new(0x1000, bytes);
        let ir = discover(&src, 0x1000, BlockLimits::default());
        let analysis = analyze(&ir);
        (ir, analysis)
    }

    #[test]
    fn overwritten_flags_are_skipped() {
        // add eax, 1 ; add eax, 2 ; ret
        // The first add's flags are dead: the second redefines all of them
        // before any consumer.
        let (_, a) = analyze_bytes(vec![0x83, 0xC0, 0x01, 0x83, 0xC0, 0x02, 0xC3]);
        assert_eq!(a.strategy[0], FlagStrategy::Skip);
        // The last producer must stay reconstructible at the block boundary.
        assert_eq!(a.strategy[1], FlagStrategy::Defer);
    }

    #[test]
    fn cmp_jcc_pair_goes_native() {
        // cmp eax, ebx ; jb +2 ; inc eax ; ret
        let (_, a) = analyze_bytes(vec![0x39, 0xD8, 0x72, 0x02, 0xFF, 0xC0, 0xC3]);
        assert_eq!(a.native_cc[1], Some(Cc::Cc));
        assert!(a.host_flags[0]);
        // The cmp still defers: its flags remain observable after the
        // branch (conservatively, across the branch edge).
        assert_eq!(a.strategy[0], FlagStrategy::Defer);
    }

    #[test]
    fn parity_condition_never_native() {
        // cmp eax, ebx ; jp +2 ; inc eax; ret
        let (_, a) = analyze_bytes(vec![0x39, 0xD8, 0x7A, 0x02, 0xFF, 0xC0, 0xC3]);
        assert_eq!(a.native_cc[1], None);
    }

    #[test]
    fn intra_block_backward_target_is_labelled() {
        // top: dec eax ; jnz top ; ret
        let (ir, a) = analyze_bytes(vec![0xFF, 0xC8, 0x75, 0xFC, 0xC3]);
        assert_eq!(a.labels.get(&0x1000), Some(&0));
        assert_eq!(ir.guest_len, 5);
    }

    #[test]
    fn simd_regs_get_cache_slots_in_first_use_order() {
        // movaps xmm1, xmm2 ; paddd xmm1, xmm3 ; ret
        let (_, a) = analyze_bytes(vec![
            0x0F, 0x28, 0xCA, // movaps xmm1, xmm2
            0x66, 0x0F, 0xFE, 0xCB, // paddd xmm1, xmm3
            0xC3,
        ]);
        assert_eq!(a.simd_map.get(&1), Some(&SIMD_CACHE_REGS[0]));
        assert_eq!(a.simd_map.get(&2), Some(&SIMD_CACHE_REGS[1]));
        assert_eq!(a.simd_map.get(&3), Some(&SIMD_CACHE_REGS[2]));
    }
}
