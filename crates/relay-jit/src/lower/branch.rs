//! Control-transfer expansion: conditional branches, the inline
//! block-cache lookup, direct-link sites, and the guest↔host boundaries
//! (syscall, bridge) that spill and reload full state.

use iced_x86::OpKind;
use relay_cpu::state::offsets;

use crate::a64::{self, Cc};
use crate::block::BlockEnd;
use crate::liveness::cond_nibble;
use crate::lower::{regs, simd, LowerCtx};
use crate::sink::CodeSink;

use crate::lower::regs::{CPU, LK0, LK1, T0, T1};

/// Emit the inline lookup: publish `rip_reg` as the guest RIP, walk the
/// three-level table, and branch to whatever the leaf holds (a block's
/// post-prolog entry or the miss stub).
fn emit_inline_lookup<S: CodeSink>(ctx: &mut LowerCtx<S>, rip_reg: a64::Reg) {
    ctx.sink
        .put(a64::str_imm(rip_reg, CPU, offsets::RIP as u32));
    ctx.sink.ldr_lit64(LK0, ctx.map_root);
    ctx.sink.put(a64::ubfx(true, T1, rip_reg, 32, 16));
    ctx.sink.put(a64::ldst_reg(true, 8, LK0, LK0, T1, true));
    ctx.sink.put(a64::ubfx(true, T1, rip_reg, 16, 16));
    ctx.sink.put(a64::ldst_reg(true, 8, LK0, LK0, T1, true));
    ctx.sink.put(a64::ubfx(true, T1, rip_reg, 0, 16));
    ctx.sink.put(a64::ldst_reg(true, 8, LK0, LK0, T1, true));
    ctx.sink.put(a64::br(LK0));
}

/// Emit a direct-link site for a statically known target: publish the RIP,
/// then branch through this site's patchable link slot. Registers the
/// target in `ctx.links` (site order is the slot order).
fn emit_direct_link<S: CodeSink>(ctx: &mut LowerCtx<S>, target: u64) {
    let site = ctx.links.len();
    ctx.links.push(target);
    let slot_addr = ctx.slot_addrs.get(site).copied().unwrap_or(0);
    ctx.sink.mov_imm(T0, target);
    ctx.sink.put(a64::str_imm(T0, CPU, offsets::RIP as u32));
    ctx.sink.ldr_lit64(LK1, slot_addr);
    ctx.sink.put(a64::ldr_imm(LK0, LK1, 0));
    ctx.sink.put(a64::br(LK0));
}

/// Host-code size of [`emit_direct_link`] for a given target, used to
/// compute skip distances.
fn direct_link_bytes(target: u64) -> i64 {
    4 * (a64::mov_imm_len(target) + 4) as i64
}

fn exit_to_epilog<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    ctx.sink.ldr_lit64(LK0, ctx.epilog);
    ctx.sink.put(a64::br(LK0));
}

pub(crate) fn lower_jcc<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let di = ctx.di();
    let target = di.instr.near_branch_target();

    if let Some(&label_idx) = ctx.analysis.labels.get(&target) {
        // Intra-block branch: resolves to a host branch via the pass-1
        // label table and the pass-2 offsets.
        if let Some(cc) = ctx.analysis.native_cc[ctx.idx] {
            let delta = ctx.host_off(label_idx) - ctx.sink.offset() as i64;
            ctx.sink.put(a64::b_cond(cc, delta));
        } else {
            let cond = cond_nibble(di).expect("jcc") as u64;
            ctx.flags_helper_call(ctx.helpers.test_cond, &[cond]);
            let delta = ctx.host_off(label_idx) - ctx.sink.offset() as i64;
            ctx.sink.put(a64::cbnz(true, T0, delta));
        }
        return;
    }

    // Taken path leaves the block: skip over a spill + direct-link
    // sequence when the condition is false.
    let spill_bytes = simd::spill_cache_bytes(ctx) as i64;
    if let Some(cc) = ctx.analysis.native_cc[ctx.idx] {
        let skip = 4 + spill_bytes + direct_link_bytes(target);
        ctx.sink.put(a64::b_cond(cc.invert(), skip));
    } else {
        let cond = cond_nibble(di).expect("jcc") as u64;
        ctx.flags_helper_call(ctx.helpers.test_cond, &[cond]);
        let skip = 4 + spill_bytes + direct_link_bytes(target);
        ctx.sink.put(a64::cbz(true, T0, skip));
    }
    simd::spill_cache(ctx);
    emit_direct_link(ctx, target);
}

/// Lowering for the block's terminal transfer.
pub(crate) fn lower_block_end<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let end = ctx.ir.end;
    let rsp = regs::guest(relay_cpu::state::RSP);
    match end {
        BlockEnd::Ret => {
            ctx.sink.put(a64::ldst_index(true, 8, T0, rsp, 8, false));
            // RET imm16 releases additional stack bytes.
            let di = &ctx.ir.insts[ctx.ir.insts.len() - 1].di;
            if di.instr.op_count() > 0 {
                let extra = di.instr.immediate16() as u64;
                if extra > 0 {
                    ctx.sink.mov_imm(T1, extra);
                    ctx.sink.put(a64::add_reg(true, rsp, rsp, T1));
                }
            }
            simd::spill_cache(ctx);
            emit_inline_lookup(ctx, T0);
        }
        BlockEnd::IndirectJmp => {
            indirect_target_into(ctx, T0);
            simd::spill_cache(ctx);
            emit_inline_lookup(ctx, T0);
        }
        BlockEnd::IndirectCall => {
            indirect_target_into(ctx, T0);
            ctx.sink.mov_imm(T1, ctx.ir.end_rip());
            ctx.sink.put(a64::ldst_index(false, 8, T1, rsp, -8, true));
            simd::spill_cache(ctx);
            emit_inline_lookup(ctx, T0);
        }
        BlockEnd::DirectCall { target, ret } => {
            ctx.sink.mov_imm(T1, ret);
            ctx.sink.put(a64::ldst_index(false, 8, T1, rsp, -8, true));
            simd::spill_cache(ctx);
            emit_direct_link(ctx, target);
        }
        BlockEnd::DirectJmp { target } => {
            simd::spill_cache(ctx);
            emit_direct_link(ctx, target);
        }
        BlockEnd::Bridge { wrapper } => {
            // The whole block is one wrapper invocation: run it, then
            // continue at whatever RIP the wrapper produced (normally the
            // popped return address, but wrappers may redirect).
            ctx.spill_all(ctx.ir.entry);
            ctx.call_helper_raw(ctx.helpers.bridge, &[wrapper]);
            ctx.reload_all();
            ctx.sink.ldr_lit64(LK0, ctx.epilog);
            ctx.sink
                .put(a64::ldst_imm(true, 4, T1, CPU, offsets::QUIT as u32));
            ctx.sink.put(a64::cbz(false, T1, 8));
            ctx.sink.put(a64::br(LK0));
            ctx.sink.put(a64::ldr_imm(T0, CPU, offsets::RIP as u32));
            simd::spill_cache(ctx);
            emit_inline_lookup(ctx, T0);
        }
        BlockEnd::Unsupported { rip } => {
            // Exit to the dispatcher, which routes one instruction through
            // the interpreter fallback.
            ctx.sink.mov_imm(T0, rip);
            ctx.sink.put(a64::str_imm(T0, CPU, offsets::RIP as u32));
            simd::spill_cache(ctx);
            exit_to_epilog(ctx);
        }
        BlockEnd::Limit { next } => {
            simd::spill_cache(ctx);
            emit_direct_link(ctx, next);
        }
        BlockEnd::WritablePage { rip } => {
            simd::spill_cache(ctx);
            emit_direct_link(ctx, rip);
        }
    }
}

fn indirect_target_into<S: CodeSink>(ctx: &mut LowerCtx<S>, dst: a64::Reg) {
    ctx.idx = ctx.ir.insts.len() - 1;
    let di = &ctx.ir.insts[ctx.ir.insts.len() - 1].di;
    match di.instr.op_kind(0) {
        OpKind::Register => ctx.read_gpr(di.instr.op0_register(), dst),
        OpKind::Memory => {
            ctx.addr_into(regs::T2);
            ctx.load_mem(dst, regs::T2, 64);
        }
        _ => unreachable!("indirect transfer operand"),
    }
}

/// Boundary out to the host and back, with the guest RIP compared against
/// the expected fall-through so wrappers may redirect control.
fn host_boundary<S: CodeSink>(ctx: &mut LowerCtx<S>, helper: u64, args: &[u64], expected_rip: u64) {
    ctx.spill_all(expected_rip);
    ctx.call_helper_raw(helper, args);
    ctx.reload_all();
    ctx.sink.ldr_lit64(LK0, ctx.epilog);
    // A quit request (exit, deferred fork) leaves through the epilog.
    ctx.sink
        .put(a64::ldst_imm(true, 4, T1, CPU, offsets::QUIT as u32));
    ctx.sink.put(a64::cbz(false, T1, 8));
    ctx.sink.put(a64::br(LK0));
    // If the boundary redirected the guest IP (longjmp-style), exit to the
    // dispatcher instead of continuing inline.
    ctx.sink.put(a64::ldr_imm(T0, CPU, offsets::RIP as u32));
    ctx.sink.mov_imm(T1, expected_rip);
    ctx.sink.put(a64::cmp_reg(true, T0, T1));
    ctx.sink.put(a64::b_cond(Cc::Eq, 8));
    ctx.sink.put(a64::br(LK0));
}

pub(crate) fn lower_syscall<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let next = ctx.di().next_rip();
    let helper = ctx.helpers.syscall;
    host_boundary(ctx, helper, &[], next);
}

pub(crate) fn lower_bridge_call<S: CodeSink>(ctx: &mut LowerCtx<S>, wrapper: u64) {
    let next = ctx.di().next_rip();
    let helper = ctx.helpers.bridge;
    host_boundary(ctx, helper, &[wrapper], next);
}

pub(crate) fn lower_cpuid<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let next = ctx.di().next_rip();
    ctx.spill_all(next);
    let helper = ctx.helpers.cpuid;
    ctx.call_helper_raw(helper, &[]);
    ctx.reload_all();
}

pub(crate) fn lower_rdtsc<S: CodeSink>(ctx: &mut LowerCtx<S>) {
    let next = ctx.di().next_rip();
    ctx.spill_all(next);
    let helper = ctx.helpers.rdtsc;
    ctx.call_helper_raw(helper, &[]);
    ctx.reload_all();
}
