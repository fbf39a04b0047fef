//! SSE expansion: guest XMM registers map onto host vector registers with
//! matching lane widths. Registers picked by the analysis pass live in a
//! block-local host-register cache (preloaded at entry, spilled on every
//! exit and around host calls); the rest go through memory.

use iced_x86::{Mnemonic, OpKind};
use relay_cpu::state::offsets;

use crate::a64::{self, FloatOp};
use crate::lower::mem::xmm_index;
use crate::lower::{regs, LowerCtx};
use crate::sink::CodeSink;

use crate::lower::regs::{CPU, T1, T2};

/// Scratch vector registers (outside the cache set).
const VS0: a64::Reg = 0;
const VS1: a64::Reg = 1;
const VS2: a64::Reg = 2;

fn sorted_cache(ctx: &LowerCtx<impl CodeSink>) -> Vec<(u8, a64::Reg)> {
    let mut v: Vec<_> = ctx.analysis.simd_map.iter().map(|(&x, &r)| (x, r)).collect();
    v.sort_unstable();
    v
}

pub(crate) fn preload_cache<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    for (xmm, vreg) in sorted_cache(ctx) {
        ctx.sink
            .put(a64::ldst_q(true, vreg, CPU, offsets::xmm(xmm as usize) as u32));
    }
}

pub(crate) fn spill_cache<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    for (xmm, vreg) in sorted_cache(ctx) {
        ctx.sink
            .put(a64::ldst_q(false, vreg, CPU, offsets::xmm(xmm as usize) as u32));
    }
}

pub(crate) fn reload_cache<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    preload_cache(ctx);
}

pub(crate) fn spill_cache_bytes(ctx: &LowerCtx<impl CodeSink>) -> usize {
    ctx.analysis.simd_map.len() * 4
}

/// The host vector register holding guest XMM `idx`: its cache slot, or
/// `fallback` after loading from memory.
fn xmm_read<S: CodeSink>(ctx: &mut LowerCtx<S>, idx: u8, fallback: a64::Reg) -> a64::Reg {
    if let Some(&vreg) = ctx.analysis.simd_map.get(&idx) {
        return vreg;
    }
    ctx.sink
        .put(a64::ldst_q(true, fallback, CPU, offsets::xmm(idx as usize) as u32));
    fallback
}

/// Target vector register for writing guest XMM `idx`; [`xmm_writeback`]
/// commits it when the register is not cache-resident.
fn xmm_write_reg<S: CodeSink>(ctx: &LowerCtx<S>, idx: u8, fallback: a64::Reg) -> a64::Reg {
    *ctx.analysis.simd_map.get(&idx).unwrap_or(&fallback)
}

fn xmm_writeback<S: CodeSink>(ctx: &mut LowerCtx<S>, idx: u8, vreg: a64::Reg) {
    if !ctx.analysis.simd_map.contains_key(&idx) {
        ctx.sink
            .put(a64::ldst_q(false, vreg, CPU, offsets::xmm(idx as usize) as u32));
    }
}

/// Low lane of an XMM source as a scalar D/S value in `fallback` (or its
/// cache register, whose low lane is directly readable).
fn xmm_read_scalar<S: CodeSink>(
    ctx: &mut LowerCtx<S>,
    idx: u8,
    double: bool,
    fallback: a64::Reg,
) -> a64::Reg {
    if let Some(&vreg) = ctx.analysis.simd_map.get(&idx) {
        return vreg;
    }
    let bytes = if double { 8 } else { 4 };
    ctx.sink.put(a64::ldst_fp(
        true,
        bytes,
        fallback,
        CPU,
        offsets::xmm(idx as usize) as u32,
    ));
    fallback
}

pub(crate) fn is_supported_sse(di: &crate::decode::DecodedInst) -> bool {
    use Mnemonic::*;
    let m = di.instr.mnemonic();
    let sse = matches!(
        m,
        Movaps | Movups | Movapd | Movupd | Movdqa | Movdqu | Movd | Movq | Movss
            | Pxor | Pand | Por | Paddb | Paddw | Paddd | Paddq | Psubb | Psubw | Psubd | Psubq
            | Pcmpeqb | Pcmpeqw | Pcmpeqd
            | Xorps | Xorpd | Andps | Andpd | Orps | Orpd
            | Addss | Addsd | Subss | Subsd | Mulss | Mulsd | Divss | Divsd
            | Addps | Addpd | Subps | Subpd | Mulps | Mulpd | Divps | Divpd
            | Cvtsi2sd | Cvtsi2ss | Cvttsd2si | Cvttss2si | Cvtsd2ss | Cvtss2sd
            | Ucomisd | Ucomiss | Comisd | Comiss
    );
    if sse {
        return true;
    }
    // MOVSD the SSE move, as opposed to the string move.
    m == Movsd && di.instr.op_count() == 2
}

pub(crate) fn lower_sse<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    use Mnemonic::*;
    let m = ctx.di().instr.mnemonic();
    match m {
        Movaps | Movups | Movapd | Movupd | Movdqa | Movdqu => lower_mov128(ctx),
        Movsd | Movss => lower_mov_scalar(ctx, m == Movsd),
        Movd | Movq => lower_mov_gpr(ctx),
        Pxor | Xorps | Xorpd => lower_bitwise(ctx, a64::veor),
        Pand | Andps | Andpd => lower_bitwise(ctx, a64::vand),
        Por | Orps | Orpd => lower_bitwise(ctx, a64::vorr),
        Paddb => lower_int(ctx, 0, a64::vadd),
        Paddw => lower_int(ctx, 1, a64::vadd),
        Paddd => lower_int(ctx, 2, a64::vadd),
        Paddq => lower_int(ctx, 3, a64::vadd),
        Psubb => lower_int(ctx, 0, a64::vsub),
        Psubw => lower_int(ctx, 1, a64::vsub),
        Psubd => lower_int(ctx, 2, a64::vsub),
        Psubq => lower_int(ctx, 3, a64::vsub),
        Pcmpeqb => lower_int(ctx, 0, a64::vcmeq),
        Pcmpeqw => lower_int(ctx, 1, a64::vcmeq),
        Pcmpeqd => lower_int(ctx, 2, a64::vcmeq),
        Addss => lower_float_scalar(ctx, FloatOp::Add, false),
        Addsd => lower_float_scalar(ctx, FloatOp::Add, true),
        Subss => lower_float_scalar(ctx, FloatOp::Sub, false),
        Subsd => lower_float_scalar(ctx, FloatOp::Sub, true),
        Mulss => lower_float_scalar(ctx, FloatOp::Mul, false),
        Mulsd => lower_float_scalar(ctx, FloatOp::Mul, true),
        Divss => lower_float_scalar(ctx, FloatOp::Div, false),
        Divsd => lower_float_scalar(ctx, FloatOp::Div, true),
        Addps => lower_float_packed(ctx, FloatOp::Add, false),
        Addpd => lower_float_packed(ctx, FloatOp::Add, true),
        Subps => lower_float_packed(ctx, FloatOp::Sub, false),
        Subpd => lower_float_packed(ctx, FloatOp::Sub, true),
        Mulps => lower_float_packed(ctx, FloatOp::Mul, false),
        Mulpd => lower_float_packed(ctx, FloatOp::Mul, true),
        Divps => lower_float_packed(ctx, FloatOp::Div, false),
        Divpd => lower_float_packed(ctx, FloatOp::Div, true),
        Cvtsi2sd => lower_cvt_int_to_fp(ctx, true),
        Cvtsi2ss => lower_cvt_int_to_fp(ctx, false),
        Cvttsd2si => lower_cvt_fp_to_int(ctx, true),
        Cvttss2si => lower_cvt_fp_to_int(ctx, false),
        Cvtsd2ss => lower_cvt_fp_fp(ctx, false),
        Cvtss2sd => lower_cvt_fp_fp(ctx, true),
        Ucomisd | Comisd => lower_fp_compare(ctx, true),
        Ucomiss | Comiss => lower_fp_compare(ctx, false),
        _ => unreachable!("unsupported SSE instruction reached lowering"),
    }
}

fn lower_mov128<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    match (di.instr.op_kind(0), di.instr.op_kind(1)) {
        (OpKind::Register, OpKind::Register) => {
            let dst = xmm_index(di.instr.op0_register()).unwrap();
            let src = xmm_index(di.instr.op1_register()).unwrap();
            let s = xmm_read(ctx, src, VS0);
            let d = xmm_write_reg(ctx, dst, VS0);
            if d != s {
                ctx.sink.put(a64::vmov(d, s));
            }
            xmm_writeback(ctx, dst, d);
        }
        (OpKind::Register, OpKind::Memory) => {
            let dst = xmm_index(di.instr.op0_register()).unwrap();
            ctx.addr_into(T2);
            let d = xmm_write_reg(ctx, dst, VS0);
            ctx.sink.put(a64::ldst_q(true, d, T2, 0));
            xmm_writeback(ctx, dst, d);
        }
        (OpKind::Memory, OpKind::Register) => {
            let src = xmm_index(di.instr.op1_register()).unwrap();
            let s = xmm_read(ctx, src, VS0);
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_q(false, s, T2, 0));
        }
        _ => unreachable!(),
    }
}

/// MOVSD/MOVSS: load from memory zeroes the upper lanes, register moves
/// merge the low lane only, stores write the low lane.
fn lower_mov_scalar<S: CodeSink>(ctx: &mut LowerCtx<S>, double: bool) {
    let di = ctx.di();
    let bytes = if double { 8 } else { 4 };
    match (di.instr.op_kind(0), di.instr.op_kind(1)) {
        (OpKind::Register, OpKind::Memory) => {
            let dst = xmm_index(di.instr.op0_register()).unwrap();
            ctx.addr_into(T2);
            let d = xmm_write_reg(ctx, dst, VS0);
            // Scalar loads architecturally zero the rest of the register.
            ctx.sink.put(a64::ldst_fp(true, bytes, d, T2, 0));
            xmm_writeback(ctx, dst, d);
        }
        (OpKind::Memory, OpKind::Register) => {
            let src = xmm_index(di.instr.op1_register()).unwrap();
            let s = xmm_read_scalar(ctx, src, double, VS0);
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_fp(false, bytes, s, T2, 0));
        }
        (OpKind::Register, OpKind::Register) => {
            let dst = xmm_index(di.instr.op0_register()).unwrap();
            let src = xmm_index(di.instr.op1_register()).unwrap();
            let s = xmm_read(ctx, src, VS0);
            let d = xmm_write_reg(ctx, dst, VS1);
            if !ctx.analysis.simd_map.contains_key(&dst) {
                ctx.sink
                    .put(a64::ldst_q(true, d, CPU, offsets::xmm(dst as usize) as u32));
            }
            if double {
                ctx.sink.put(a64::ins_d0(d, s));
            } else {
                ctx.sink.put(a64::ins_s0(d, s));
            }
            xmm_writeback(ctx, dst, d);
        }
        _ => unreachable!(),
    }
}

/// MOVD/MOVQ between XMM, GPRs, and memory.
fn lower_mov_gpr<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let double = di.instr.mnemonic() == Mnemonic::Movq
        || di.instr.memory_size().size() == 8
        || matches!(di.instr.op_kind(1), OpKind::Register if relay_cpu::state::gpr_info(di.instr.op1_register()).map(|(_, b, _)| b) == Some(64));
    let bytes = if double { 8u32 } else { 4 };
    match (di.instr.op_kind(0), di.instr.op_kind(1)) {
        (OpKind::Register, OpKind::Register) => {
            let d0 = xmm_index(di.instr.op0_register());
            let d1 = xmm_index(di.instr.op1_register());
            match (d0, d1) {
                (Some(dst), None) => {
                    // movd/movq xmm, gpr zeroes the upper lanes.
                    ctx.read_gpr(di.instr.op1_register(), T1);
                    let d = xmm_write_reg(ctx, dst, VS0);
                    ctx.sink.put(a64::fmov_to_fp(double, d, T1));
                    xmm_writeback(ctx, dst, d);
                }
                (None, Some(src)) => {
                    let s = xmm_read_scalar(ctx, src, double, VS0);
                    ctx.sink.put(a64::fmov_from_fp(double, T1, s));
                    ctx.write_gpr(ctx.di().instr.op0_register(), T1);
                }
                (Some(dst), Some(src)) => {
                    // movq xmm, xmm: low 64 bits, upper zeroed.
                    let s = xmm_read(ctx, src, VS0);
                    let d = xmm_write_reg(ctx, dst, VS1);
                    ctx.sink.put(a64::fmov_d(d, s));
                    xmm_writeback(ctx, dst, d);
                }
                _ => unreachable!(),
            }
        }
        (OpKind::Register, OpKind::Memory) => {
            let dst = xmm_index(di.instr.op0_register()).unwrap();
            ctx.addr_into(T2);
            let d = xmm_write_reg(ctx, dst, VS0);
            ctx.sink.put(a64::ldst_fp(true, bytes, d, T2, 0));
            xmm_writeback(ctx, dst, d);
        }
        (OpKind::Memory, OpKind::Register) => {
            let src = xmm_index(di.instr.op1_register()).unwrap();
            let s = xmm_read_scalar(ctx, src, double, VS0);
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_fp(false, bytes, s, T2, 0));
        }
        _ => unreachable!(),
    }
}

/// Second (source) operand as a full vector register.
fn src_vector<S: CodeSink>(ctx: &mut LowerCtx<S>, fallback: a64::Reg) -> a64::Reg {
    let di = ctx.di();
    match di.instr.op_kind(1) {
        OpKind::Register => {
            let idx = xmm_index(di.instr.op1_register()).unwrap();
            xmm_read(ctx, idx, fallback)
        }
        OpKind::Memory => {
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_q(true, fallback, T2, 0));
            fallback
        }
        _ => unreachable!(),
    }
}

fn lower_bitwise<S: CodeSink>(ctx: &mut LowerCtx<S>, op: fn(a64::Reg, a64::Reg, a64::Reg) -> u32) {
    let dst = xmm_index(ctx.di().instr.op0_register()).unwrap();
    let s = src_vector(ctx, VS0);
    let d_in = xmm_read(ctx, dst, VS1);
    let d_out = xmm_write_reg(ctx, dst, VS1);
    ctx.sink.put(op(d_out, d_in, s));
    xmm_writeback(ctx, dst, d_out);
}

fn lower_int<S: CodeSink>(
    ctx: &mut LowerCtx<S>,
    esize: u32,
    op: fn(u32, a64::Reg, a64::Reg, a64::Reg) -> u32,
) {
    let dst = xmm_index(ctx.di().instr.op0_register()).unwrap();
    let s = src_vector(ctx, VS0);
    let d_in = xmm_read(ctx, dst, VS1);
    let d_out = xmm_write_reg(ctx, dst, VS1);
    ctx.sink.put(op(esize, d_out, d_in, s));
    xmm_writeback(ctx, dst, d_out);
}

fn lower_float_packed<S: CodeSink>(ctx: &mut LowerCtx<S>, op: FloatOp, double: bool) {
    let dst = xmm_index(ctx.di().instr.op0_register()).unwrap();
    let s = src_vector(ctx, VS0);
    let d_in = xmm_read(ctx, dst, VS1);
    let d_out = xmm_write_reg(ctx, dst, VS1);
    ctx.sink.put(a64::vfop(op, double, d_out, d_in, s));
    xmm_writeback(ctx, dst, d_out);
}

/// Scalar source operand (low lane or memory) into a D/S register.
fn src_scalar<S: CodeSink>(ctx: &mut LowerCtx<S>, double: bool, fallback: a64::Reg) -> a64::Reg {
    let di = ctx.di();
    match di.instr.op_kind(1) {
        OpKind::Register => {
            let idx = xmm_index(di.instr.op1_register()).unwrap();
            xmm_read_scalar(ctx, idx, double, fallback)
        }
        OpKind::Memory => {
            let bytes = if double { 8 } else { 4 };
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_fp(true, bytes, fallback, T2, 0));
            fallback
        }
        _ => unreachable!(),
    }
}

fn lower_float_scalar<S: CodeSink>(ctx: &mut LowerCtx<S>, op: FloatOp, double: bool) {
    let dst = xmm_index(ctx.di().instr.op0_register()).unwrap();
    let s = src_scalar(ctx, double, VS0);
    let d = xmm_read(ctx, dst, VS1);
    // Compute into scratch, then merge only the low lane back.
    ctx.sink.put(a64::fop_scalar(op, double, VS2, d, s));
    let d_out = xmm_write_reg(ctx, dst, VS1);
    if double {
        ctx.sink.put(a64::ins_d0(d_out, VS2));
    } else {
        ctx.sink.put(a64::ins_s0(d_out, VS2));
    }
    xmm_writeback(ctx, dst, d_out);
}

fn lower_cvt_int_to_fp<S: CodeSink>(ctx: &mut LowerCtx<S>, double: bool) {
    let di = ctx.di();
    let dst = xmm_index(di.instr.op0_register()).unwrap();
    let from_wide = match di.instr.op_kind(1) {
        OpKind::Register => {
            relay_cpu::state::gpr_info(di.instr.op1_register()).map(|(_, b, _)| b) == Some(64)
        }
        _ => di.instr.memory_size().size() == 8,
    };
    match di.instr.op_kind(1) {
        OpKind::Register => ctx.read_gpr(di.instr.op_register(1), T1),
        _ => {
            ctx.addr_into(T2);
            ctx.load_mem(T1, T2, if from_wide { 64 } else { 32 });
        }
    }
    ctx.sink.put(a64::scvtf(double, from_wide, VS2, T1));
    let d_out = xmm_write_reg(ctx, dst, VS1);
    if !ctx.analysis.simd_map.contains_key(&dst) {
        ctx.sink
            .put(a64::ldst_q(true, d_out, CPU, offsets::xmm(dst as usize) as u32));
    }
    if double {
        ctx.sink.put(a64::ins_d0(d_out, VS2));
    } else {
        ctx.sink.put(a64::ins_s0(d_out, VS2));
    }
    xmm_writeback(ctx, dst, d_out);
}

fn lower_cvt_fp_to_int<S: CodeSink>(ctx: &mut LowerCtx<S>, double: bool) {
    let di = ctx.di();
    let to_wide = relay_cpu::state::gpr_info(di.instr.op0_register()).map(|(_, b, _)| b) == Some(64);
    let s = src_scalar(ctx, double, VS0);
    ctx.sink.put(a64::fcvtzs(double, to_wide, T1, s));
    ctx.write_gpr(ctx.di().instr.op0_register(), T1);
}

fn lower_cvt_fp_fp<S: CodeSink>(ctx: &mut LowerCtx<S>, to_double: bool) {
    let dst = xmm_index(ctx.di().instr.op0_register()).unwrap();
    let s = src_scalar(ctx, !to_double, VS0);
    ctx.sink.put(a64::fcvt(to_double, VS2, s));
    let d_out = xmm_write_reg(ctx, dst, VS1);
    if !ctx.analysis.simd_map.contains_key(&dst) {
        ctx.sink
            .put(a64::ldst_q(true, d_out, CPU, offsets::xmm(dst as usize) as u32));
    }
    if to_double {
        ctx.sink.put(a64::ins_d0(d_out, VS2));
    } else {
        ctx.sink.put(a64::ins_s0(d_out, VS2));
    }
    xmm_writeback(ctx, dst, d_out);
}

/// UCOMIS/COMIS: the flag-producing compare goes through the runtime
/// helper, which writes ZF/PF/CF (clearing OF/AF/SF) into the flags word.
fn lower_fp_compare<S: CodeSink>(ctx: &mut LowerCtx<S>, double: bool) {
    let di = ctx.di();
    let a_idx = xmm_index(di.instr.op0_register()).unwrap();
    let a = xmm_read_scalar(ctx, a_idx, double, VS0);
    ctx.sink.put(a64::fmov_from_fp(double, T1, a));
    let b = src_scalar(ctx, double, VS0);
    ctx.sink.put(a64::fmov_from_fp(double, T2, b));
    let helper = ctx.helpers.fp_compare;
    // x1/x2 carry the operand bit patterns; x3 the width selector. The
    // helper overwrites all six status bits and clears the deferred tag.
    ctx.sink.mov_imm(regs::T3, double as u64);
    ctx.sink
        .put(a64::str_imm(regs::FLAGS, CPU, offsets::RFLAGS as u32));
    ctx.helper_call(helper, &[]);
    ctx.sink
        .put(a64::ldr_imm(regs::FLAGS, CPU, offsets::RFLAGS as u32));
    ctx.set_flags_synced();
}
