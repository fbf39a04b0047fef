//! x87 expansion. The host has no 80-bit stack machine, so every x87
//! operation calls a runtime helper operating on the GuestCpu stack model;
//! the expansion only marshals memory operands and stack indices.

use iced_x86::{Mnemonic, OpKind, Register};
use relay_cpu::fpu::{X87Const, X87Op, X87Trans};
use relay_cpu::state::offsets;

use crate::a64;
use crate::lower::regs::{CPU, T0, T1, T2};
use crate::lower::LowerCtx;
use crate::sink::CodeSink;

pub(crate) fn is_x87(m: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        m,
        Fld | Fld1 | Fldz | Fldpi | Fldl2e | Fldl2t | Fldln2 | Fldlg2
            | Fst | Fstp | Fild | Fist | Fistp
            | Fadd | Faddp | Fsub | Fsubp | Fsubr | Fsubrp
            | Fmul | Fmulp | Fdiv | Fdivp | Fdivr | Fdivrp
            | Fchs | Fabs | Fsqrt | Fsin | Fcos | F2xm1 | Fyl2x | Fpatan
            | Fcom | Fcomp | Fcompp | Fucom | Fucomp | Fucompp
            | Fcomi | Fcomip | Fucomi | Fucomip
            | Fxch | Fnstsw | Fnstcw | Fldcw
    )
}

/// Memory-form FCOM would need an extra helper; everything else in the
/// [`is_x87`] set is expanded.
pub(crate) fn is_supported_x87(di: &crate::decode::DecodedInst) -> bool {
    let m = di.instr.mnemonic();
    if !is_x87(m) {
        return false;
    }
    if matches!(
        m,
        Mnemonic::Fcom | Mnemonic::Fcomp | Mnemonic::Fucom | Mnemonic::Fucomp
    ) && di.instr.op_count() > 0
        && di.instr.op_kind(0) == OpKind::Memory
    {
        return false;
    }
    true
}

/// st(i) index of a register operand, defaulting to 0.
fn sti(di: &crate::decode::DecodedInst, op: u32) -> u64 {
    if op >= di.instr.op_count() {
        return 0;
    }
    let reg = di.instr.op_register(op);
    if reg >= Register::ST0 && reg <= Register::ST7 {
        (reg as u32 - Register::ST0 as u32) as u64
    } else {
        0
    }
}

fn mem_bytes(di: &crate::decode::DecodedInst) -> u32 {
    di.instr.memory_size().size() as u32
}

/// Load the memory operand's raw bits into x1 ahead of a helper call.
fn mem_bits_into_arg<S: CodeSink>(ctx: &mut LowerCtx<S>, bytes: u32) {
    ctx.addr_into(T2);
    ctx.sink.put(a64::ldst_imm(true, bytes, T1, T2, 0));
}

pub(crate) fn lower_x87<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    use Mnemonic::*;
    let di = ctx.di();
    let m = di.instr.mnemonic();
    match m {
        Fld => {
            if di.instr.op_kind(0) == OpKind::Register {
                let helper = ctx.helpers.x87_fld_sti;
                ctx.helper_call(helper, &[sti(di, 0)]);
            } else {
                let bytes = mem_bytes(di);
                mem_bits_into_arg(ctx, bytes);
                let helper = if bytes == 8 {
                    ctx.helpers.x87_load_f64
                } else {
                    ctx.helpers.x87_load_f32
                };
                ctx.helper_call(helper, &[]);
            }
        }
        Fld1 => load_const(ctx, X87Const::One),
        Fldz => load_const(ctx, X87Const::Zero),
        Fldpi => load_const(ctx, X87Const::Pi),
        Fldl2e => load_const(ctx, X87Const::Log2E),
        Fldl2t => load_const(ctx, X87Const::Log2T),
        Fldln2 => load_const(ctx, X87Const::Ln2),
        Fldlg2 => load_const(ctx, X87Const::Lg2),
        Fild => {
            let bytes = mem_bytes(di);
            mem_bits_into_arg(ctx, bytes);
            let helper = if bytes == 8 {
                ctx.helpers.x87_load_i64
            } else {
                ctx.helpers.x87_load_i32
            };
            ctx.helper_call(helper, &[]);
        }
        Fst | Fstp => {
            let pop = (m == Fstp) as u64;
            if di.instr.op_kind(0) == OpKind::Register {
                let helper = ctx.helpers.x87_fst_sti;
                ctx.helper_call(helper, &[sti(di, 0) | (pop << 8)]);
            } else {
                let bytes = mem_bytes(di);
                let helper = if bytes == 8 {
                    ctx.helpers.x87_store_f64
                } else {
                    ctx.helpers.x87_store_f32
                };
                ctx.helper_call(helper, &[pop]);
                ctx.addr_into(T2);
                ctx.sink.put(a64::ldst_imm(false, bytes, T0, T2, 0));
            }
        }
        Fist | Fistp => {
            let pop = (m == Fistp) as u64;
            let bytes = mem_bytes(di);
            let helper = if bytes == 8 {
                ctx.helpers.x87_store_i64
            } else {
                ctx.helpers.x87_store_i32
            };
            ctx.helper_call(helper, &[pop]);
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_imm(false, bytes, T0, T2, 0));
        }
        Fadd | Faddp | Fsub | Fsubp | Fsubr | Fsubrp | Fmul | Fmulp | Fdiv | Fdivp | Fdivr
        | Fdivrp => lower_arith(ctx),
        Fchs => {
            let helper = ctx.helpers.x87_fchs;
            ctx.helper_call(helper, &[]);
        }
        Fabs => {
            let helper = ctx.helpers.x87_fabs;
            ctx.helper_call(helper, &[]);
        }
        Fsqrt => unary(ctx, X87Trans::Sqrt),
        Fsin => unary(ctx, X87Trans::Sin),
        Fcos => unary(ctx, X87Trans::Cos),
        F2xm1 => unary(ctx, X87Trans::F2xm1),
        Fyl2x => unary(ctx, X87Trans::Fyl2x),
        Fpatan => unary(ctx, X87Trans::Fpatan),
        Fcom | Fcomp | Fcompp | Fucom | Fucomp | Fucompp => {
            let pops = match m {
                Fcompp | Fucompp => 2u64,
                Fcomp | Fucomp => 1,
                _ => 0,
            };
            let idx = if di.instr.op_count() > 0 { sti(di, 0) } else { 1 };
            let helper = ctx.helpers.x87_compare;
            ctx.helper_call(helper, &[idx | (pops << 8)]);
        }
        Fcomi | Fcomip | Fucomi | Fucomip => {
            let pops = matches!(m, Fcomip | Fucomip) as u64;
            let idx = sti(di, 1).max(sti(di, 0));
            let helper = ctx.helpers.x87_compare;
            ctx.flags_helper_call(helper, &[idx | (pops << 8) | (1 << 16)]);
        }
        Fxch => {
            let idx = if di.instr.op_count() == 0 {
                1
            } else {
                sti(di, 0).max(sti(di, 1)).max(1)
            };
            let helper = ctx.helpers.x87_fxch;
            ctx.helper_call(helper, &[idx]);
        }
        Fnstsw => {
            ctx.sink.put(a64::ldr_imm(T0, CPU, offsets::X87_SW as u32));
            ctx.write_gpr(Register::AX, T0);
        }
        Fnstcw => {
            ctx.sink.put(a64::ldr_imm(T0, CPU, offsets::X87_CW as u32));
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_imm(false, 2, T0, T2, 0));
        }
        Fldcw => {
            ctx.addr_into(T2);
            ctx.sink.put(a64::ldst_imm(true, 2, T0, T2, 0));
            ctx.sink.put(a64::str_imm(T0, CPU, offsets::X87_CW as u32));
        }
        _ => unreachable!("non-x87 mnemonic in x87 lowering"),
    }
}

fn load_const<S: CodeSink>(ctx: &mut LowerCtx<S>, kind: X87Const) {
    let helper = ctx.helpers.x87_load_const;
    ctx.helper_call(helper, &[kind as u64]);
}

fn unary<S: CodeSink>(ctx: &mut LowerCtx<S>, kind: X87Trans) {
    let helper = ctx.helpers.x87_unary;
    ctx.helper_call(helper, &[kind as u64]);
}

const fn x87_pack(op: X87Op, sti: u64, dst_is_sti: bool, pop: bool) -> u64 {
    (op as u64) | (sti << 8) | ((dst_is_sti as u64) << 16) | ((pop as u64) << 17)
}

fn lower_arith<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    use Mnemonic::*;
    let di = ctx.di();
    let m = di.instr.mnemonic();
    let (op, pop) = match m {
        Fadd => (X87Op::Add, false),
        Faddp => (X87Op::Add, true),
        Fsub => (X87Op::Sub, false),
        Fsubp => (X87Op::Sub, true),
        Fsubr => (X87Op::SubR, false),
        Fsubrp => (X87Op::SubR, true),
        Fmul => (X87Op::Mul, false),
        Fmulp => (X87Op::Mul, true),
        Fdiv => (X87Op::Div, false),
        Fdivp => (X87Op::Div, true),
        Fdivr => (X87Op::DivR, false),
        _ => (X87Op::DivR, true),
    };

    if di.instr.op_count() > 0 && di.instr.op_kind(0) == OpKind::Memory {
        // FADD m32/m64: st0 = st0 op mem. Helper takes (cpu, op, bits) in
        // x0..x2; the f32 form is widened in place first.
        let bytes = mem_bytes(di);
        ctx.addr_into(T2);
        ctx.sink.put(a64::ldst_imm(true, bytes, T2, T2, 0));
        if bytes == 4 {
            ctx.sink.put(a64::fmov_to_fp(false, 0, T2));
            ctx.sink.put(a64::fcvt(true, 0, 0));
            ctx.sink.put(a64::fmov_from_fp(true, T2, 0));
        }
        let helper = ctx.helpers.x87_arith_mem;
        ctx.sink.mov_imm(T1, op as u64);
        ctx.helper_call(helper, &[]);
        return;
    }

    // Register forms: FADD st0, st(i) / FADD st(i), st0 / FADDP st(i).
    let dst_is_sti = di.instr.op_count() > 0
        && di.instr.op_kind(0) == OpKind::Register
        && sti(di, 0) != 0;
    let idx = if di.instr.op_count() == 0 {
        1 // no-operand *P forms act on st(1)
    } else {
        sti(di, 0).max(sti(di, 1))
    };
    let helper = ctx.helpers.x87_arith;
    ctx.helper_call(helper, &[x87_pack(op, idx, dst_is_sti || pop, pop)]);
}
