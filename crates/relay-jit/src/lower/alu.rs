//! Integer ALU expansion: binary/unary arithmetic, shifts and rotates,
//! multiply/divide, condition materialization (SETcc/CMOVcc), and the
//! direct flag-bit instructions.

use iced_x86::{Mnemonic, OpKind, Register};
use relay_cpu::state::offsets;
use relay_cpu::DefKind;

use crate::a64::{self, Cc};
use crate::liveness::cond_nibble;
use crate::lower::{imm_value, op_bits, regs, LowerCtx};
use crate::sink::CodeSink;

use crate::lower::regs::{CPU, FLAGS, T0, T1, T2, T3, T4};

/// Whether `wide` (64-bit) host forms are needed for an operand width.
fn wide(bits: u32) -> bool {
    bits == 64
}

/// Load operand `op` of the current instruction into `dst`, zero-extended.
/// Memory operands leave the address in `addr_scratch` for a later store.
fn load_operand<S: CodeSink>(ctx: &mut LowerCtx<S>, op: u32, dst: a64::Reg, addr_scratch: a64::Reg) {
    let di = ctx.di();
    match di.instr.op_kind(op) {
        OpKind::Register => ctx.read_gpr(di.instr.op_register(op), dst),
        OpKind::Memory => {
            let bits = di.instr.memory_size().size() as u32 * 8;
            ctx.addr_into(addr_scratch);
            ctx.load_mem(dst, addr_scratch, bits);
        }
        _ => {
            let value = imm_value(di, op);
            ctx.sink.mov_imm(dst, value);
        }
    }
}

/// Write `src` back to operand 0 (register or memory, any width). For
/// memory destinations the effective address must still be in `addr`.
fn write_dst<S: CodeSink>(ctx: &mut LowerCtx<S>, src: a64::Reg, addr: a64::Reg) {
    let di = ctx.di();
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.write_gpr(di.instr.op0_register(), src),
        OpKind::Memory => {
            let bits = di.instr.memory_size().size() as u32 * 8;
            ctx.store_mem(src, addr, bits);
        }
        _ => unreachable!("ALU destination is a register or memory"),
    }
}

pub(crate) fn lower_binary<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let mnem = di.instr.mnemonic();
    let bits = op_bits(di);
    let defer = ctx.analysis.strategy[ctx.idx] == crate::liveness::FlagStrategy::Defer;
    let host_flags = ctx.analysis.host_flags[ctx.idx];
    let writeback = !matches!(mnem, Mnemonic::Cmp | Mnemonic::Test);

    // Carry-consuming records read CF out of the flags word.
    if matches!(mnem, Mnemonic::Adc | Mnemonic::Sbb) {
        ctx.sync_flags_if_pending();
    }

    load_operand(ctx, 1, T1, T2);
    load_operand(ctx, 0, T0, T2);
    let w = wide(bits);

    let kind = match mnem {
        Mnemonic::Add => {
            if host_flags {
                ctx.sink.put(a64::adds_reg(w, T3, T0, T1));
            } else {
                ctx.sink.put(a64::add_reg(w, T3, T0, T1));
            }
            DefKind::Add
        }
        Mnemonic::Sub | Mnemonic::Cmp => {
            if host_flags {
                ctx.sink.put(a64::subs_reg(w, T3, T0, T1));
            } else {
                ctx.sink.put(a64::sub_reg(w, T3, T0, T1));
            }
            DefKind::Sub
        }
        Mnemonic::Adc => {
            // CF is bit 0 of the flags word.
            ctx.sink.put(a64::ubfx(true, T4, FLAGS, 0, 1));
            ctx.sink.put(a64::add_reg(w, T3, T0, T1));
            ctx.sink.put(a64::add_reg(w, T3, T3, T4));
            DefKind::Adc
        }
        Mnemonic::Sbb => {
            ctx.sink.put(a64::ubfx(true, T4, FLAGS, 0, 1));
            ctx.sink.put(a64::sub_reg(w, T3, T0, T1));
            ctx.sink.put(a64::sub_reg(w, T3, T3, T4));
            DefKind::Sbb
        }
        Mnemonic::And | Mnemonic::Test => {
            if host_flags {
                ctx.sink.put(a64::ands(w, T3, T0, T1));
            } else {
                ctx.sink.put(a64::and(w, T3, T0, T1));
            }
            DefKind::Logic
        }
        Mnemonic::Or => {
            ctx.sink.put(a64::orr(w, T3, T0, T1));
            if host_flags {
                ctx.sink.put(a64::tst(w, T3, T3));
            }
            DefKind::Logic
        }
        Mnemonic::Xor => {
            ctx.sink.put(a64::eor(w, T3, T0, T1));
            if host_flags {
                ctx.sink.put(a64::tst(w, T3, T3));
            }
            DefKind::Logic
        }
        _ => unreachable!(),
    };

    if defer {
        ctx.record_def(kind, bits, T0, T1, T3);
    }
    if writeback {
        write_dst(ctx, T3, T2);
    }
}

pub(crate) fn lower_unary<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let mnem = di.instr.mnemonic();
    let bits = op_bits(di);
    let w = wide(bits);
    let defer = ctx.analysis.strategy[ctx.idx] == crate::liveness::FlagStrategy::Defer;
    let host_flags = ctx.analysis.host_flags[ctx.idx];

    if defer && matches!(mnem, Mnemonic::Inc | Mnemonic::Dec) {
        // Inc/Dec reconstruction reads the preserved CF out of the flags
        // word, which must therefore be current.
        ctx.sync_flags_if_pending();
    }

    load_operand(ctx, 0, T0, T2);
    let kind = match mnem {
        Mnemonic::Not => {
            ctx.sink.put(a64::mvn(w, T3, T0));
            write_dst(ctx, T3, T2);
            return;
        }
        Mnemonic::Inc => {
            if host_flags {
                ctx.sink.put(a64::adds_imm(w, T3, T0, 1));
            } else {
                ctx.sink.put(a64::add_imm(w, T3, T0, 1));
            }
            DefKind::Inc
        }
        Mnemonic::Dec => {
            if host_flags {
                ctx.sink.put(a64::subs_imm(w, T3, T0, 1));
            } else {
                ctx.sink.put(a64::sub_imm(w, T3, T0, 1));
            }
            DefKind::Dec
        }
        Mnemonic::Neg => {
            if host_flags {
                ctx.sink.put(a64::subs_reg(w, T3, 31, T0));
            } else {
                ctx.sink.put(a64::neg(w, T3, T0));
            }
            DefKind::Neg
        }
        _ => unreachable!(),
    };
    if defer {
        ctx.record_def(kind, bits, T0, 31, T3);
    }
    write_dst(ctx, T3, T2);
}

pub(crate) fn lower_shift<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let mnem = di.instr.mnemonic();
    let bits = op_bits(di);
    let w = wide(bits);
    let count_mask: u64 = if bits == 64 { 63 } else { 31 };
    let defer = ctx.analysis.strategy[ctx.idx] == crate::liveness::FlagStrategy::Defer;

    // Shift records carry the runtime count; reconstruction leaves the
    // flags untouched when it is zero, so the previous flags word must be
    // current before the record replaces it.
    if defer {
        ctx.sync_flags_if_pending();
    }

    // Count into T1 (masked).
    match di.instr.op_kind(1) {
        OpKind::Register => {
            ctx.read_gpr(Register::CL, T1);
            ctx.sink.mov_imm(T4, count_mask);
            ctx.sink.put(a64::and(true, T1, T1, T4));
        }
        _ => {
            let c = imm_value(di, 1) & count_mask;
            ctx.sink.mov_imm(T1, c);
        }
    }

    load_operand(ctx, 0, T0, T2);
    match mnem {
        Mnemonic::Shl => {
            ctx.sink.put(a64::lslv(w, T3, T0, T1));
        }
        Mnemonic::Shr => {
            ctx.sink.put(a64::lsrv(w, T3, T0, T1));
        }
        Mnemonic::Sar => {
            match bits {
                8 => ctx.sink.put(a64::sxtb(true, T0, T0)),
                16 => ctx.sink.put(a64::sxth(true, T0, T0)),
                32 => ctx.sink.put(a64::sxtw(T0, T0)),
                _ => {}
            }
            ctx.sink.put(a64::asrv(true, T3, T0, T1));
        }
        Mnemonic::Rol => {
            // rol(x, n) == ror(x, bits - n)
            ctx.sink.mov_imm(T4, bits as u64);
            ctx.sink.put(a64::sub_reg(false, T4, T4, T1));
            ctx.sink.mov_imm(T3, count_mask);
            ctx.sink.put(a64::and(false, T4, T4, T3));
            ctx.sink.put(a64::rorv(w, T3, T0, T4));
        }
        Mnemonic::Ror => {
            ctx.sink.put(a64::rorv(w, T3, T0, T1));
        }
        _ => unreachable!(),
    }

    if defer {
        let kind = match mnem {
            Mnemonic::Shl => DefKind::Shl,
            Mnemonic::Shr => DefKind::Shr,
            Mnemonic::Sar => DefKind::Sar,
            Mnemonic::Rol => DefKind::Rol,
            _ => DefKind::Ror,
        };
        ctx.record_def(kind, bits, T0, T1, T3);
    }
    write_dst(ctx, T3, T2);
}

/// IMUL with two or three operands (the one-operand form shares
/// [`lower_muldiv`]).
pub(crate) fn lower_imul<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    if di.instr.op_count() == 1 {
        return lower_muldiv(ctx);
    }
    let bits = op_bits(di);
    let defer = ctx.analysis.strategy[ctx.idx] == crate::liveness::FlagStrategy::Defer;

    // Sources: 2-op form multiplies dst * src; 3-op form src * imm.
    if di.instr.op_count() == 3 {
        load_operand(ctx, 1, T0, T2);
        load_operand(ctx, 2, T1, T2);
    } else {
        load_operand(ctx, 0, T0, T2);
        load_operand(ctx, 1, T1, T2);
    }

    sign_extend(ctx, T0, bits);
    sign_extend(ctx, T1, bits);
    if bits == 64 {
        ctx.sink.put(a64::smulh(T4, T0, T1));
        ctx.sink.put(a64::mul(true, T3, T0, T1));
    } else {
        // The sign-extended product fits in 64 bits for every narrower
        // width; the untruncated upper part is an arithmetic shift away.
        ctx.sink.put(a64::mul(true, T3, T0, T1));
        ctx.sink.put(a64::asr_imm(true, T4, T3, bits));
    }
    if defer {
        ctx.record_def(DefKind::Imul, bits, T0, T4, T3);
    }
    ctx.write_gpr(ctx.di().instr.op0_register(), T3);
}

fn sign_extend<S: CodeSink>(ctx: &mut LowerCtx<S>, reg: a64::Reg, bits: u32) {
    match bits {
        8 => ctx.sink.put(a64::sxtb(true, reg, reg)),
        16 => ctx.sink.put(a64::sxth(true, reg, reg)),
        32 => ctx.sink.put(a64::sxtw(reg, reg)),
        _ => {}
    }
}

/// One-operand MUL/IMUL/DIV/IDIV: the RDX:RAX-pair forms.
pub(crate) fn lower_muldiv<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let mnem = di.instr.mnemonic();
    let bits = op_bits(di);
    let signed = matches!(mnem, Mnemonic::Imul | Mnemonic::Idiv);
    let defer = ctx.analysis.strategy[ctx.idx] == crate::liveness::FlagStrategy::Defer;

    load_operand(ctx, 0, T1, T2);

    match mnem {
        Mnemonic::Mul | Mnemonic::Imul => {
            match bits {
                64 => {
                    ctx.read_gpr(Register::RAX, T0);
                    if signed {
                        ctx.sink.put(a64::smulh(T4, T0, T1));
                    } else {
                        ctx.sink.put(a64::umulh(T4, T0, T1));
                    }
                    ctx.sink.put(a64::mul(true, T3, T0, T1));
                    ctx.write_gpr(Register::RAX, T3);
                    ctx.write_gpr(Register::RDX, T4);
                }
                32 => {
                    ctx.read_gpr(Register::EAX, T0);
                    if signed {
                        sign_extend(ctx, T0, 32);
                        sign_extend(ctx, T1, 32);
                    }
                    ctx.sink.put(a64::mul(true, T3, T0, T1));
                    ctx.sink.put(a64::lsr_imm(true, T4, T3, 32));
                    ctx.write_gpr(Register::EAX, T3);
                    ctx.write_gpr(Register::EDX, T4);
                }
                16 => {
                    ctx.read_gpr(Register::AX, T0);
                    if signed {
                        sign_extend(ctx, T0, 16);
                        sign_extend(ctx, T1, 16);
                    }
                    ctx.sink.put(a64::mul(true, T3, T0, T1));
                    ctx.sink.put(a64::lsr_imm(true, T4, T3, 16));
                    ctx.write_gpr(Register::AX, T3);
                    ctx.write_gpr(Register::DX, T4);
                }
                _ => {
                    ctx.read_gpr(Register::AL, T0);
                    if signed {
                        sign_extend(ctx, T0, 8);
                        sign_extend(ctx, T1, 8);
                    }
                    ctx.sink.put(a64::mul(true, T3, T0, T1));
                    ctx.sink.put(a64::lsr_imm(true, T4, T3, 8));
                    // One-byte multiply lands entirely in AX.
                    ctx.write_gpr(Register::AX, T3);
                }
            }
            if defer {
                let kind = if signed { DefKind::Imul } else { DefKind::Mul };
                // For signed narrow widths the record wants the arithmetic
                // (not logical) upper part; 64-bit already has SMULH in T4.
                if signed && bits != 64 {
                    ctx.sink.put(a64::asr_imm(true, T4, T3, bits));
                }
                ctx.record_def(kind, bits, T0, T4, T3);
            }
        }
        _ => {
            // Division through the runtime helper: 128/64 math, #DE
            // detection, and the per-width RAX/RDX writeback rules live
            // there.
            ctx.sink.mov_imm(T4, di.rip);
            ctx.sink
                .put(a64::str_imm(T4, CPU, offsets::RIP as u32));
            ctx.sink.put(a64::mov_reg(true, T2, T1));
            ctx.read_gpr(Register::RAX, T3);
            ctx.read_gpr(Register::RDX, T4);
            let packed = (bits as u64) | ((signed as u64) << 8);
            ctx.helper_call(ctx.helpers.div, &[packed]);
            // Reload the pair the helper wrote.
            ctx.sink
                .put(a64::ldr_imm(regs::guest(0), CPU, offsets::gpr(0) as u32));
            ctx.sink
                .put(a64::ldr_imm(regs::guest(2), CPU, offsets::gpr(2) as u32));
            // Non-zero status: #DE was raised, leave through the epilog.
            ctx.sink.ldr_lit64(regs::LK0, ctx.epilog);
            ctx.sink.put(a64::cbz(true, T0, 8));
            ctx.sink.put(a64::br(regs::LK0));
        }
    }
}

pub(crate) fn lower_setcc<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    cond_into(ctx, T0);
    let di = ctx.di();
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.write_gpr(di.instr.op0_register(), T0),
        _ => {
            ctx.addr_into(T2);
            ctx.store_mem(T0, T2, 8);
        }
    }
}

pub(crate) fn lower_cmovcc<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let bits = op_bits(di);
    cond_into(ctx, T0);
    load_operand(ctx, 1, T1, T2);
    ctx.read_gpr(di.instr.op0_register(), T3);
    ctx.sink.put(a64::cmp_imm(true, T0, 0));
    ctx.sink.put(a64::csel(wide(bits), T3, T1, T3, Cc::Ne));
    ctx.write_gpr(ctx.di().instr.op0_register(), T3);
}

/// Evaluate the current instruction's condition into `dst` (0 or 1),
/// either off host NZCV (native pairs) or through the flags helper.
fn cond_into<S: CodeSink>(ctx: &mut LowerCtx<S>, dst: a64::Reg) {
    if let Some(cc) = ctx.analysis.native_cc[ctx.idx] {
        ctx.sink.put(a64::cset(true, dst, cc));
        return;
    }
    let cond = cond_nibble(ctx.di()).expect("conditional instruction") as u64;
    ctx.flags_helper_call(ctx.helpers.test_cond, &[cond]);
    if dst != T0 {
        ctx.sink.put(a64::mov_reg(true, dst, T0));
    }
}

pub(crate) fn lower_sign_extend_ax<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let rax = regs::guest(0);
    let rdx = regs::guest(2);
    match ctx.di().instr.mnemonic() {
        Mnemonic::Cdqe => ctx.sink.put(a64::sxtw(rax, rax)),
        Mnemonic::Cwde => ctx.sink.put(a64::sxth(false, rax, rax)),
        Mnemonic::Cdq => ctx.sink.put(a64::asr_imm(false, rdx, rax, 31)),
        _ => ctx.sink.put(a64::asr_imm(true, rdx, rax, 63)),
    }
}

pub(crate) fn lower_flag_bit<S: CodeSink>(ctx: &mut LowerCtx<S>, mask: u64, set: bool) {
    ctx.sync_flags_if_pending();
    ctx.sink.mov_imm(T4, if set { mask } else { !mask });
    if set {
        ctx.sink.put(a64::orr(true, FLAGS, FLAGS, T4));
    } else {
        ctx.sink.put(a64::and(true, FLAGS, FLAGS, T4));
    }
}

pub(crate) fn lower_pushf<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    ctx.sync_flags_if_pending();
    let rsp = regs::guest(relay_cpu::state::RSP);
    ctx.sink
        .put(a64::ldst_index(false, 8, FLAGS, rsp, -8, true));
}

pub(crate) fn lower_popf<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let rsp = regs::guest(relay_cpu::state::RSP);
    ctx.sink.put(a64::ldst_index(true, 8, FLAGS, rsp, 8, false));
    ctx.sink.mov_imm(T4, relay_cpu::flags::FLAG_RESERVED1);
    ctx.sink.put(a64::orr(true, FLAGS, FLAGS, T4));
    ctx.clear_pending_tag();
}

/// SLDT/STR in user mode: store a null system selector.
pub(crate) fn lower_store_system_selector<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    ctx.sink.mov_imm(T0, 0);
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.write_gpr(di.instr.op0_register(), T0),
        _ => {
            ctx.addr_into(T2);
            ctx.store_mem(T0, T2, 16);
        }
    }
}

/// VERR/VERW in user mode: no descriptor table access is allowed, so the
/// selector is never verifiable; clear ZF.
pub(crate) fn lower_verify_selector<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    ctx.sync_flags_if_pending();
    ctx.sink.mov_imm(T4, !relay_cpu::flags::FLAG_ZF);
    ctx.sink.put(a64::and(true, FLAGS, FLAGS, T4));
}
