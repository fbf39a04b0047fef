//! Data movement expansion: MOV and its extending forms, LEA, XCHG, the
//! stack operations, and the REP string family.

use iced_x86::{Mnemonic, OpKind, Register};

use crate::a64;
use crate::lower::{imm_value, op_bits, regs, LowerCtx};
use crate::sink::CodeSink;

use crate::lower::regs::{T0, T1, T2};

fn src_bits(ctx: &LowerCtx<impl CodeSink>, op: u32) -> u32 {
    let di = ctx.di();
    match di.instr.op_kind(op) {
        OpKind::Register => relay_cpu::state::gpr_info(di.instr.op_register(op))
            .map(|(_, bits, _)| bits)
            .unwrap_or(64),
        OpKind::Memory => di.instr.memory_size().size() as u32 * 8,
        _ => 64,
    }
}

pub(crate) fn lower_mov<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let mnem = di.instr.mnemonic();
    let sign_extend = matches!(mnem, Mnemonic::Movsx | Mnemonic::Movsxd);

    // Source value into T0, zero-extended.
    match di.instr.op_kind(1) {
        OpKind::Register => ctx.read_gpr(di.instr.op_register(1), T0),
        OpKind::Memory => {
            let bits = src_bits(ctx, 1);
            ctx.addr_into(T2);
            if sign_extend && bits != 64 {
                ctx.sink.put(a64::ldrs_imm(bits / 8, T0, T2, 0));
            } else {
                ctx.load_mem(T0, T2, bits);
            }
        }
        _ => {
            let value = imm_value(di, 1);
            ctx.sink.mov_imm(T0, value);
        }
    }

    if sign_extend && di.instr.op_kind(1) == OpKind::Register {
        match src_bits(ctx, 1) {
            8 => ctx.sink.put(a64::sxtb(true, T0, T0)),
            16 => ctx.sink.put(a64::sxth(true, T0, T0)),
            32 => ctx.sink.put(a64::sxtw(T0, T0)),
            _ => {}
        }
    }

    let di = ctx.di();
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.write_gpr(di.instr.op0_register(), T0),
        OpKind::Memory => {
            let bits = di.instr.memory_size().size() as u32 * 8;
            ctx.addr_into(T2);
            ctx.store_mem(T0, T2, bits);
        }
        _ => unreachable!(),
    }
}

pub(crate) fn lower_lea<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    ctx.addr_into(T0);
    let reg = ctx.di().instr.op0_register();
    ctx.write_gpr(reg, T0);
}

pub(crate) fn lower_xchg<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    match (di.instr.op_kind(0), di.instr.op_kind(1)) {
        (OpKind::Register, OpKind::Register) => {
            let r0 = di.instr.op0_register();
            let r1 = di.instr.op1_register();
            ctx.read_gpr(r0, T0);
            ctx.read_gpr(r1, T1);
            ctx.write_gpr(r0, T1);
            ctx.write_gpr(r1, T0);
        }
        _ => {
            // Exactly one side is memory; iced normalizes it to operand 0.
            let bits = op_bits(di);
            let reg = di.instr.op1_register();
            ctx.addr_into(T2);
            ctx.load_mem(T1, T2, bits);
            ctx.read_gpr(reg, T0);
            ctx.store_mem(T0, T2, bits);
            ctx.write_gpr(reg, T1);
        }
    }
}

pub(crate) fn lower_push<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let bytes: i32 = if op_bits(di) == 16 { 2 } else { 8 };
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.read_gpr(di.instr.op0_register(), T0),
        OpKind::Memory => {
            ctx.addr_into(T2);
            ctx.load_mem(T0, T2, bytes as u32 * 8);
        }
        _ => {
            let value = imm_value(di, 0);
            ctx.sink.mov_imm(T0, value);
        }
    }
    let rsp = regs::guest(relay_cpu::state::RSP);
    // Staged through T0 so PUSH RSP stores the pre-decrement value.
    ctx.sink
        .put(a64::ldst_index(false, bytes as u32, T0, rsp, -bytes, true));
}

pub(crate) fn lower_pop<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let bytes: i32 = if op_bits(di) == 16 { 2 } else { 8 };
    let rsp = regs::guest(relay_cpu::state::RSP);
    ctx.sink
        .put(a64::ldst_index(true, bytes as u32, T0, rsp, bytes, false));
    let di = ctx.di();
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.write_gpr(di.instr.op0_register(), T0),
        OpKind::Memory => {
            // The address is computed after RSP has been incremented.
            ctx.addr_into(T2);
            ctx.store_mem(T0, T2, bytes as u32 * 8);
        }
        _ => unreachable!(),
    }
}

/// REP MOVS/STOS through the runtime helper, which honors DF and the
/// RCX count.
pub(crate) fn lower_rep_string<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let (width, is_stos) = match di.instr.mnemonic() {
        Mnemonic::Movsb => (1u64, 0u64),
        Mnemonic::Movsw => (2, 0),
        Mnemonic::Movsd => (4, 0),
        Mnemonic::Movsq => (8, 0),
        Mnemonic::Stosb => (1, 1),
        Mnemonic::Stosw => (2, 1),
        Mnemonic::Stosd => (4, 1),
        _ => (8, 1),
    };
    let packed = width | (is_stos << 8);
    let next = di.next_rip();
    ctx.spill_all(next);
    let helper = ctx.helpers.rep_string;
    ctx.call_helper_raw(helper, &[packed]);
    ctx.reload_all();
}

/// SSE register index for XMM0..XMM15, if the operand register is one.
pub(crate) fn xmm_index(reg: Register) -> Option<u8> {
    if reg >= Register::XMM0 && reg <= Register::XMM15 {
        Some((reg as u32 - Register::XMM0 as u32) as u8)
    } else {
        None
    }
}
