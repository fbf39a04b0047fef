//! Passes 2 and 3: the per-instruction expansion from guest x86_64 to host
//! A64, shared between sizing and emission through the [`CodeSink`]
//! abstraction.
//!
//! Register map (fixed across all blocks so direct links can assume it):
//!
//! | host        | role                                   |
//! |-------------|----------------------------------------|
//! | x0..x7      | expansion scratch / host call args     |
//! | x8..x15     | guest R8..R15                          |
//! | x16, x17    | lookup / veneer scratch                |
//! | x19         | GuestCpu pointer                       |
//! | x20..x27    | guest RAX,RCX,RDX,RBX,RSP,RBP,RSI,RDI  |
//! | x28         | guest RFLAGS word                      |
//! | v0..v7      | SIMD scratch                           |
//! | v16..v23    | block-local guest XMM cache            |
//!
//! x8..x15 and the XMM cache are caller-saved, so every host call spills
//! and reloads them; x19..x28 survive calls on their own.

mod alu;
mod branch;
mod mem;
mod simd;
mod x87;

use iced_x86::{Mnemonic, OpKind, Register};
use relay_cpu::state::offsets;
use relay_cpu::Segment;

use crate::a64::{self, Reg};
use crate::block::{BlockIr, InstKind};
use crate::decode::DecodedInst;
use crate::liveness::BlockAnalysis;
use crate::sink::CodeSink;

/// Host register roles.
pub mod regs {
    use crate::a64::Reg;

    pub const CPU: Reg = 19;
    pub const FLAGS: Reg = 28;
    /// Expansion scratch, also the host call argument registers.
    pub const T0: Reg = 0;
    pub const T1: Reg = 1;
    pub const T2: Reg = 2;
    pub const T3: Reg = 3;
    pub const T4: Reg = 4;
    /// Lookup / veneer scratch (the A64 intra-procedure-call registers).
    pub const LK0: Reg = 16;
    pub const LK1: Reg = 17;

    /// Host register holding guest GPR `idx`.
    pub const fn guest(idx: usize) -> Reg {
        if idx < 8 {
            20 + idx as Reg
        } else {
            idx as Reg
        }
    }
}

/// Host entry points generated code calls out to. Filled in by the runtime;
/// the translator only embeds the addresses.
#[derive(Debug, Clone, Default)]
pub struct HelperTable {
    pub sync_flags: u64,
    pub test_cond: u64,
    /// `fn(cpu)` syscall boundary; state fully spilled around the call.
    pub syscall: u64,
    /// `fn(cpu, wrapper)` guest→host bridge thunk.
    pub bridge: u64,
    /// `fn(cpu, packed, divisor, lo, hi) -> status` division.
    pub div: u64,
    pub cpuid: u64,
    pub rdtsc: u64,
    /// `fn(cpu, packed)` REP MOVS/STOS families.
    pub rep_string: u64,
    /// `fn(cpu, a_bits, b_bits, packed)` UCOMIS/COMIS flag compare.
    pub fp_compare: u64,
    pub x87_load_f64: u64,
    pub x87_load_f32: u64,
    pub x87_load_i64: u64,
    pub x87_load_i32: u64,
    pub x87_load_const: u64,
    pub x87_store_f64: u64,
    pub x87_store_f32: u64,
    pub x87_store_i64: u64,
    pub x87_store_i32: u64,
    pub x87_arith: u64,
    pub x87_arith_mem: u64,
    pub x87_unary: u64,
    pub x87_fchs: u64,
    pub x87_fabs: u64,
    pub x87_compare: u64,
    pub x87_fld_sti: u64,
    pub x87_fst_sti: u64,
    pub x87_fxch: u64,
}

/// Pass-2 output consumed by pass 3: the host offset of each instruction's
/// expansion and the total code size. Doubles as the sidecar source.
#[derive(Debug, Clone, Default)]
pub struct BlockLayout {
    pub host_off: Vec<u32>,
    pub code_bytes: u32,
}

pub struct LowerCtx<'a, S: CodeSink> {
    pub sink: &'a mut S,
    pub ir: &'a BlockIr,
    pub analysis: &'a BlockAnalysis,
    pub helpers: &'a HelperTable,
    /// Pass-2 layout; `None` while sizing (branch words then carry dummy
    /// offsets, their size does not depend on the value).
    pub layout: Option<&'a BlockLayout>,
    /// Link-slot addresses for this block, in site order; empty in sizing.
    pub slot_addrs: &'a [u64],
    /// Direct-link targets in site order, rebuilt identically by each pass.
    pub links: Vec<u64>,
    /// Address of the block cache's level-1 table.
    pub map_root: u64,
    /// The shared epilog (= miss stub).
    pub epilog: u64,
    pub idx: usize,
    /// Whether a deferred-flags record may be live in the scratch at this
    /// point of the linear walk; labels reset it conservatively.
    may_pending: bool,
}

impl<'a, S: CodeSink> LowerCtx<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: &'a mut S,
        ir: &'a BlockIr,
        analysis: &'a BlockAnalysis,
        helpers: &'a HelperTable,
        layout: Option<&'a BlockLayout>,
        slot_addrs: &'a [u64],
        map_root: u64,
        epilog: u64,
    ) -> Self {
        Self {
            sink,
            ir,
            analysis,
            helpers,
            layout,
            slot_addrs,
            links: Vec::new(),
            map_root,
            epilog,
            idx: 0,
            may_pending: true,
        }
    }

    pub(crate) fn di(&self) -> &'a DecodedInst {
        &self.ir.insts[self.idx].di
    }

    /// Host offset of instruction `idx`, or 0 while sizing.
    pub(crate) fn host_off(&self, idx: usize) -> i64 {
        match self.layout {
            Some(l) => l.host_off[idx] as i64,
            None => 0,
        }
    }

    // ---- Whole-block driver -------------------------------------------------

    /// Run the expansion over the whole block. In pass 2 the caller records
    /// `sink.offset()` per instruction to build the layout/sidecar.
    pub fn lower_block(&mut self, mut per_inst: impl FnMut(usize, usize)) {
        simd::preload_cache(self);
        for idx in 0..self.ir.insts.len() {
            self.idx = idx;
            if self.analysis.labels.contains_key(&self.di().rip) {
                // Merge point: another path may arrive with a pending
                // record.
                self.may_pending = true;
            }
            per_inst(idx, self.sink.offset());
            match self.ir.insts[idx].kind {
                InstKind::Plain => self.lower_inst(),
                InstKind::BridgeCall { wrapper } => branch::lower_bridge_call(self, wrapper),
            }
        }
        self.idx = self.ir.insts.len();
        branch::lower_block_end(self);
    }

    fn lower_inst(&mut self) {
        let di = self.di();
        match di.instr.mnemonic() {
            Mnemonic::Add
            | Mnemonic::Adc
            | Mnemonic::Sub
            | Mnemonic::Sbb
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test => alu::lower_binary(self),
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => alu::lower_unary(self),
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol | Mnemonic::Ror => {
                alu::lower_shift(self)
            }
            Mnemonic::Imul => alu::lower_imul(self),
            Mnemonic::Mul | Mnemonic::Div | Mnemonic::Idiv => alu::lower_muldiv(self),
            m if is_setcc(m) => alu::lower_setcc(self),
            m if is_cmovcc(m) => alu::lower_cmovcc(self),
            Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Movsxd => {
                mem::lower_mov(self)
            }
            Mnemonic::Lea => mem::lower_lea(self),
            Mnemonic::Xchg => mem::lower_xchg(self),
            Mnemonic::Push => mem::lower_push(self),
            Mnemonic::Pop => mem::lower_pop(self),
            Mnemonic::Movsb | Mnemonic::Movsw | Mnemonic::Movsd | Mnemonic::Movsq
            | Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq
                if di.instr.has_rep_prefix() =>
            {
                mem::lower_rep_string(self)
            }
            Mnemonic::Movsd if is_sse(di) => simd::lower_sse(self),
            Mnemonic::Nop | Mnemonic::Fnop | Mnemonic::Pause | Mnemonic::Wait => {}
            Mnemonic::Endbr64 => {}
            Mnemonic::Cdq | Mnemonic::Cqo | Mnemonic::Cdqe | Mnemonic::Cwde => {
                alu::lower_sign_extend_ax(self)
            }
            Mnemonic::Jmp | Mnemonic::Call | Mnemonic::Ret => {
                // Terminal transfers are handled by the block-end lowering.
            }
            m if is_jcc(m) => branch::lower_jcc(self),
            Mnemonic::Syscall => branch::lower_syscall(self),
            Mnemonic::Cpuid => branch::lower_cpuid(self),
            Mnemonic::Rdtsc => branch::lower_rdtsc(self),
            Mnemonic::Cld => alu::lower_flag_bit(self, relay_cpu::FLAG_DF, false),
            Mnemonic::Std => alu::lower_flag_bit(self, relay_cpu::FLAG_DF, true),
            Mnemonic::Clc => alu::lower_flag_bit(self, relay_cpu::FLAG_CF, false),
            Mnemonic::Stc => alu::lower_flag_bit(self, relay_cpu::FLAG_CF, true),
            Mnemonic::Pushfq => alu::lower_pushf(self),
            Mnemonic::Popfq => alu::lower_popf(self),
            Mnemonic::Sldt | Mnemonic::Str => alu::lower_store_system_selector(self),
            Mnemonic::Verr | Mnemonic::Verw => alu::lower_verify_selector(self),
            m if x87::is_x87(m) => x87::lower_x87(self),
            _ => simd::lower_sse(self),
        }
    }

    // ---- Flags plumbing -----------------------------------------------------

    /// Record a deferred-flags operation: scratch writes only, no
    /// materialization.
    pub(crate) fn record_def(
        &mut self,
        kind: relay_cpu::DefKind,
        width: u32,
        src1: Reg,
        src2: Reg,
        res: Reg,
    ) {
        self.sink
            .put(a64::str_imm(src1, regs::CPU, offsets::DEF_SRC1 as u32));
        self.sink
            .put(a64::str_imm(src2, regs::CPU, offsets::DEF_SRC2 as u32));
        self.sink
            .put(a64::str_imm(res, regs::CPU, offsets::DEF_RES as u32));
        let packed = relay_cpu::flags::pack(kind, width);
        self.sink.mov_imm(regs::T4, packed);
        self.sink
            .put(a64::str_imm(regs::T4, regs::CPU, offsets::DEF_OP as u32));
        self.may_pending = true;
    }

    /// Materialize pending flags into the flags register/word via the
    /// sync helper. After this, x28 and `cpu.rflags` agree and the scratch
    /// tag is clear.
    pub(crate) fn sync_flags(&mut self) {
        self.sink
            .put(a64::str_imm(regs::FLAGS, regs::CPU, offsets::RFLAGS as u32));
        self.helper_call(self.helpers.sync_flags, &[]);
        self.sink.put(a64::mov_reg(true, regs::FLAGS, regs::T0));
        self.may_pending = false;
    }

    /// Call a helper that reads (and syncs) the guest flags: the flags
    /// register is spilled before the call and reloaded after, and the
    /// pending record is known to be materialized on return. The helper's
    /// own return value stays in x0.
    pub(crate) fn flags_helper_call(&mut self, helper: u64, args: &[u64]) {
        self.sink
            .put(a64::str_imm(regs::FLAGS, regs::CPU, offsets::RFLAGS as u32));
        self.helper_call(helper, args);
        self.sink
            .put(a64::ldr_imm(regs::FLAGS, regs::CPU, offsets::RFLAGS as u32));
        self.may_pending = false;
    }

    pub(crate) fn sync_flags_if_pending(&mut self) {
        if self.may_pending {
            self.sync_flags();
        }
    }

    /// Note that a helper just materialized the flags word itself.
    pub(crate) fn set_flags_synced(&mut self) {
        self.may_pending = false;
    }

    pub(crate) fn clear_pending_tag(&mut self) {
        // Plain materialized update: drop any stale deferred record.
        self.sink
            .put(a64::str_imm(31, regs::CPU, offsets::DEF_OP as u32));
        self.may_pending = false;
    }

    // ---- Host calls ---------------------------------------------------------

    /// Call a host helper with `cpu` as the first argument and `args`
    /// pre-loaded by the caller into x1.. — spills the caller-saved guest
    /// registers (R8..R15 and the XMM cache) around the call. The helper's
    /// return value is left in x0 (T0).
    pub(crate) fn helper_call(&mut self, helper: u64, args: &[u64]) {
        self.spill_caller_saved();
        for (i, &value) in args.iter().enumerate() {
            self.sink.mov_imm(regs::T1 + i as Reg, value);
        }
        self.sink.put(a64::mov_reg(true, regs::T0, regs::CPU));
        self.sink.ldr_lit64(regs::LK1, helper);
        self.sink.put(a64::blr(regs::LK1));
        self.reload_caller_saved();
    }

    /// Call a host helper without the caller-saved spill dance: for use
    /// after [`Self::spill_all`], when every guest register is already in
    /// memory.
    pub(crate) fn call_helper_raw(&mut self, helper: u64, args: &[u64]) {
        for (i, &value) in args.iter().enumerate() {
            self.sink.mov_imm(regs::T1 + i as Reg, value);
        }
        self.sink.put(a64::mov_reg(true, regs::T0, regs::CPU));
        self.sink.ldr_lit64(regs::LK1, helper);
        self.sink.put(a64::blr(regs::LK1));
    }

    /// Spill *all* guest registers, RFLAGS, and the given guest RIP: the
    /// state a wrapper, syscall handler, or signal may observe.
    pub(crate) fn spill_all(&mut self, rip: u64) {
        for idx in 0..16 {
            self.sink.put(a64::str_imm(
                regs::guest(idx),
                regs::CPU,
                offsets::gpr(idx) as u32,
            ));
        }
        self.sink
            .put(a64::str_imm(regs::FLAGS, regs::CPU, offsets::RFLAGS as u32));
        self.sink.mov_imm(regs::T4, rip);
        self.sink
            .put(a64::str_imm(regs::T4, regs::CPU, offsets::RIP as u32));
        simd::spill_cache(self);
    }

    pub(crate) fn reload_all(&mut self) {
        for idx in 0..16 {
            self.sink.put(a64::ldr_imm(
                regs::guest(idx),
                regs::CPU,
                offsets::gpr(idx) as u32,
            ));
        }
        self.sink
            .put(a64::ldr_imm(regs::FLAGS, regs::CPU, offsets::RFLAGS as u32));
        simd::reload_cache(self);
    }

    fn spill_caller_saved(&mut self) {
        for idx in 8..16 {
            self.sink.put(a64::str_imm(
                regs::guest(idx),
                regs::CPU,
                offsets::gpr(idx) as u32,
            ));
        }
        simd::spill_cache(self);
    }

    fn reload_caller_saved(&mut self) {
        for idx in 8..16 {
            self.sink.put(a64::ldr_imm(
                regs::guest(idx),
                regs::CPU,
                offsets::gpr(idx) as u32,
            ));
        }
        simd::reload_cache(self);
    }

    // ---- Operand helpers ----------------------------------------------------

    /// Load a guest GPR operand (any width, zero-extended) into `dst`.
    pub(crate) fn read_gpr(&mut self, reg: Register, dst: Reg) {
        let (idx, bits, high8) = relay_cpu::state::gpr_info(reg).expect("gpr operand");
        let mapped = regs::guest(idx);
        match (bits, high8) {
            (64, _) => {
                if dst != mapped {
                    self.sink.put(a64::mov_reg(true, dst, mapped));
                }
            }
            (32, _) => self.sink.put(a64::mov_reg(false, dst, mapped)),
            (16, _) => self.sink.put(a64::ubfx(true, dst, mapped, 0, 16)),
            (8, false) => self.sink.put(a64::ubfx(true, dst, mapped, 0, 8)),
            (8, true) => self.sink.put(a64::ubfx(true, dst, mapped, 8, 8)),
            _ => unreachable!(),
        }
    }

    /// Write `src` into a guest GPR with architectural width semantics
    /// (32-bit writes zero the upper half, narrower writes merge).
    pub(crate) fn write_gpr(&mut self, reg: Register, src: Reg) {
        let (idx, bits, high8) = relay_cpu::state::gpr_info(reg).expect("gpr operand");
        let mapped = regs::guest(idx);
        match (bits, high8) {
            (64, _) => {
                if src != mapped {
                    self.sink.put(a64::mov_reg(true, mapped, src));
                }
            }
            (32, _) => self.sink.put(a64::mov_reg(false, mapped, src)),
            (16, _) => self.sink.put(a64::bfi(true, mapped, src, 0, 16)),
            (8, false) => self.sink.put(a64::bfi(true, mapped, src, 0, 8)),
            (8, true) => self.sink.put(a64::bfi(true, mapped, src, 8, 8)),
            _ => unreachable!(),
        }
    }

    /// Compute a memory operand's effective guest address into `dst`.
    /// Segment-based addresses add the FS/GS base from GuestCpu;
    /// RIP-relative operands materialize the guest-visible address.
    pub(crate) fn addr_into(&mut self, dst: Reg) {
        let di = self.di();
        let instr = &di.instr;
        if instr.is_ip_rel_memory_operand() {
            let target = instr.ip_rel_memory_address();
            self.sink.mov_imm(dst, target);
        } else {
            let disp = instr.memory_displacement64();
            let base = instr.memory_base();
            let index = instr.memory_index();
            if base == Register::None && index == Register::None {
                self.sink.mov_imm(dst, disp);
            } else if base != Register::None {
                let (bidx, _, _) = relay_cpu::state::gpr_info(base).expect("64-bit base");
                if disp != 0 {
                    self.sink.mov_imm(dst, disp);
                    self.sink
                        .put(a64::add_reg(true, dst, dst, regs::guest(bidx)));
                } else {
                    self.sink.put(a64::mov_reg(true, dst, regs::guest(bidx)));
                }
                if index != Register::None {
                    let (iidx, _, _) = relay_cpu::state::gpr_info(index).expect("64-bit index");
                    let shift = instr.memory_index_scale().trailing_zeros();
                    self.sink
                        .put(a64::add_shifted(true, dst, dst, regs::guest(iidx), shift));
                }
            } else {
                // index (+scale) + disp, no base
                let (iidx, _, _) = relay_cpu::state::gpr_info(index).expect("64-bit index");
                let shift = instr.memory_index_scale().trailing_zeros();
                self.sink.mov_imm(dst, disp);
                self.sink
                    .put(a64::add_shifted(true, dst, dst, regs::guest(iidx), shift));
            }
        }
        match instr.memory_segment() {
            Register::FS => {
                self.sink.put(a64::ldr_imm(
                    regs::LK0,
                    regs::CPU,
                    offsets::seg_base(Segment::FS) as u32,
                ));
                self.sink.put(a64::add_reg(true, dst, dst, regs::LK0));
            }
            Register::GS => {
                self.sink.put(a64::ldr_imm(
                    regs::LK0,
                    regs::CPU,
                    offsets::seg_base(Segment::GS) as u32,
                ));
                self.sink.put(a64::add_reg(true, dst, dst, regs::LK0));
            }
            _ => {}
        }
    }

    /// Load `bits` wide from `[addr]` into `dst`, zero-extended.
    pub(crate) fn load_mem(&mut self, dst: Reg, addr: Reg, bits: u32) {
        self.sink
            .put(a64::ldst_imm(true, bits / 8, dst, addr, 0));
    }

    pub(crate) fn store_mem(&mut self, src: Reg, addr: Reg, bits: u32) {
        self.sink
            .put(a64::ldst_imm(false, bits / 8, src, addr, 0));
    }
}

/// Immediate value of operand `op`, sign-extended per its encoding.
pub(crate) fn imm_value(di: &DecodedInst, op: u32) -> u64 {
    let instr = &di.instr;
    match instr.op_kind(op) {
        OpKind::Immediate8 => instr.immediate8() as u64,
        OpKind::Immediate16 => instr.immediate16() as u64,
        OpKind::Immediate32 => instr.immediate32() as u64,
        OpKind::Immediate64 => instr.immediate64(),
        OpKind::Immediate8to16 => instr.immediate8to16() as u16 as u64,
        OpKind::Immediate8to32 => instr.immediate8to32() as u32 as u64,
        OpKind::Immediate8to64 => instr.immediate8to64() as u64,
        OpKind::Immediate32to64 => instr.immediate32to64() as u64,
        _ => 0,
    }
}

/// Operand width in bits for an ALU-style instruction (taken from the
/// destination operand).
pub(crate) fn op_bits(di: &DecodedInst) -> u32 {
    let instr = &di.instr;
    match instr.op_kind(0) {
        OpKind::Register => relay_cpu::state::gpr_info(instr.op0_register())
            .map(|(_, bits, _)| bits)
            .unwrap_or(64),
        OpKind::Memory => instr.memory_size().size() as u32 * 8,
        _ => 64,
    }
}

pub(crate) fn is_jcc(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Jo
            | Mnemonic::Jno
            | Mnemonic::Jb
            | Mnemonic::Jae
            | Mnemonic::Je
            | Mnemonic::Jne
            | Mnemonic::Jbe
            | Mnemonic::Ja
            | Mnemonic::Js
            | Mnemonic::Jns
            | Mnemonic::Jp
            | Mnemonic::Jnp
            | Mnemonic::Jl
            | Mnemonic::Jge
            | Mnemonic::Jle
            | Mnemonic::Jg
    )
}

pub(crate) fn is_setcc(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Seto
            | Mnemonic::Setno
            | Mnemonic::Setb
            | Mnemonic::Setae
            | Mnemonic::Sete
            | Mnemonic::Setne
            | Mnemonic::Setbe
            | Mnemonic::Seta
            | Mnemonic::Sets
            | Mnemonic::Setns
            | Mnemonic::Setp
            | Mnemonic::Setnp
            | Mnemonic::Setl
            | Mnemonic::Setge
            | Mnemonic::Setle
            | Mnemonic::Setg
    )
}

pub(crate) fn is_cmovcc(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovb
            | Mnemonic::Cmovae
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovbe
            | Mnemonic::Cmova
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovl
            | Mnemonic::Cmovge
            | Mnemonic::Cmovle
            | Mnemonic::Cmovg
    )
}

fn is_sse(di: &DecodedInst) -> bool {
    // MOVSD the SSE move (F2 0F 10/11) vs MOVSD the string move.
    di.instr.op_count() == 2
}

/// Whether the emitter can expand this instruction. Anything outside this
/// set terminates the block and is routed to the interpreter fallback.
pub fn is_supported(di: &DecodedInst) -> bool {
    let instr = &di.instr;

    // 32-bit address-size overrides and non-GPR bases are not expanded.
    let base = instr.memory_base();
    if base != Register::None && base != Register::RIP {
        match relay_cpu::state::gpr_info(base) {
            Some((_, 64, _)) => {}
            _ => return false,
        }
    }
    let index = instr.memory_index();
    if index != Register::None && !matches!(relay_cpu::state::gpr_info(index), Some((_, 64, _))) {
        return false;
    }

    let m = instr.mnemonic();
    if is_jcc(m) || is_setcc(m) || is_cmovcc(m) || x87::is_supported_x87(di) || simd::is_supported_sse(di)
    {
        return true;
    }
    match m {
        Mnemonic::Add
        | Mnemonic::Adc
        | Mnemonic::Sub
        | Mnemonic::Sbb
        | Mnemonic::And
        | Mnemonic::Or
        | Mnemonic::Xor
        | Mnemonic::Cmp
        | Mnemonic::Test
        | Mnemonic::Inc
        | Mnemonic::Dec
        | Mnemonic::Neg
        | Mnemonic::Not
        | Mnemonic::Shl
        | Mnemonic::Shr
        | Mnemonic::Sar
        | Mnemonic::Imul
        | Mnemonic::Mul
        | Mnemonic::Div
        | Mnemonic::Idiv
        | Mnemonic::Mov
        | Mnemonic::Movzx
        | Mnemonic::Movsx
        | Mnemonic::Movsxd
        | Mnemonic::Lea
        | Mnemonic::Xchg
        | Mnemonic::Push
        | Mnemonic::Pop
        | Mnemonic::Nop
        | Mnemonic::Fnop
        | Mnemonic::Pause
        | Mnemonic::Wait
        | Mnemonic::Endbr64
        | Mnemonic::Cdq
        | Mnemonic::Cqo
        | Mnemonic::Cdqe
        | Mnemonic::Cwde
        | Mnemonic::Jmp
        | Mnemonic::Call
        | Mnemonic::Ret
        | Mnemonic::Syscall
        | Mnemonic::Cpuid
        | Mnemonic::Rdtsc
        | Mnemonic::Cld
        | Mnemonic::Std
        | Mnemonic::Clc
        | Mnemonic::Stc
        | Mnemonic::Pushfq
        | Mnemonic::Popfq
        | Mnemonic::Sldt
        | Mnemonic::Str
        | Mnemonic::Verr
        | Mnemonic::Verw => true,
        // Narrow rotates would need byte/word replication; leave them to
        // the fallback.
        Mnemonic::Rol | Mnemonic::Ror => op_bits(di) >= 32,
        Mnemonic::Movsb | Mnemonic::Movsw | Mnemonic::Movsd | Mnemonic::Movsq
        | Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq => {
            instr.has_rep_prefix()
        }
        _ => false,
    }
}
