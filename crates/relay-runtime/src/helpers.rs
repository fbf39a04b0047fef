//! Host entry points the translator embeds into generated code, plus the
//! assembly of the [`HelperTable`].

use relay_cpu::flags::{FLAG_CF, FLAG_DF, FLAG_PF, FLAG_RESERVED1, FLAG_ZF, STATUS_MASK};
use relay_cpu::state::{RAX, RBX, RCX, RDI, RDX, RSI};
use relay_cpu::{fpu, GuestCpu};
use relay_jit::HelperTable;

use crate::bridge;
use crate::context::EngineContext;
use crate::thread;

unsafe fn engine_of(cpu: &GuestCpu) -> &'static EngineContext {
    &*(cpu.context as *const EngineContext)
}

/// Syscall boundary thunk: state is fully spilled around this call.
unsafe extern "C" fn syscall_thunk(cpu: *mut GuestCpu) {
    let cpu = &mut *cpu;
    let ctx = engine_of(cpu);
    ctx.dispatch_syscall(cpu);
}

/// Division helper: the 128/64 forms, #DE detection, and the per-width
/// RAX/RDX writeback rules. Returns nonzero when #DE was raised (the
/// generated code then exits to the dispatcher, which delivers SIGFPE).
unsafe extern "C" fn div_thunk(
    cpu: *mut GuestCpu,
    packed: u64,
    divisor: u64,
    lo: u64,
    hi: u64,
) -> u64 {
    let cpu = &mut *cpu;
    let width = (packed & 0xFF) as u32;
    let signed = packed & (1 << 8) != 0;

    fn raise_de() -> u64 {
        thread::CURRENT_SLOT_RAW.with(|slot| {
            let slot = slot.get();
            if !slot.is_null() {
                unsafe { &*slot }
                    .pending_signal
                    .store(libc::SIGFPE as u32, std::sync::atomic::Ordering::Release);
            }
        });
        1
    }

    // Compute in 128 bits for every width; the dividend is AX for the
    // byte form and the RDX:RAX-style pair otherwise.
    let mask: u64 = relay_cpu::state::mask_bits(width);
    let d_raw = divisor & mask;
    if d_raw == 0 {
        return raise_de();
    }
    let (q, r) = if signed {
        let dividend: i128 = if width == 8 {
            (lo & 0xFFFF) as u16 as i16 as i128
        } else {
            let raw = (((hi & mask) as u128) << width) | ((lo & mask) as u128);
            match width {
                16 => raw as u32 as i32 as i128,
                32 => raw as u64 as i64 as i128,
                _ => raw as i128,
            }
        };
        let d: i128 = match width {
            8 => d_raw as u8 as i8 as i128,
            16 => d_raw as u16 as i16 as i128,
            32 => d_raw as u32 as i32 as i128,
            _ => d_raw as i64 as i128,
        };
        let q = dividend.wrapping_div(d);
        let min = -(1i128 << (width - 1));
        let max = (1i128 << (width - 1)) - 1;
        if q < min || q > max {
            return raise_de();
        }
        (q as u64 & mask, (dividend.wrapping_rem(d)) as u64 & mask)
    } else {
        let dividend: u128 = if width == 8 {
            (lo & 0xFFFF) as u128
        } else {
            (((hi & mask) as u128) << width) | ((lo & mask) as u128)
        };
        let q = dividend / d_raw as u128;
        if q > mask as u128 {
            return raise_de();
        }
        (q as u64, (dividend % d_raw as u128) as u64)
    };

    if width == 8 {
        // Quotient in AL, remainder in AH.
        cpu.gpr[RAX] = (cpu.gpr[RAX] & !0xFFFF) | (r << 8) | q;
    } else {
        match width {
            16 => {
                cpu.gpr[RAX] = (cpu.gpr[RAX] & !0xFFFF) | q;
                cpu.gpr[RDX] = (cpu.gpr[RDX] & !0xFFFF) | r;
            }
            // 32-bit results zero the upper halves.
            _ => {
                cpu.gpr[RAX] = q;
                cpu.gpr[RDX] = r;
            }
        }
    }
    0
}

unsafe extern "C" fn cpuid_thunk(cpu: *mut GuestCpu) {
    let cpu = &mut *cpu;
    let leaf = cpu.gpr[RAX] as u32;
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32) = match leaf {
        0 => (1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69), // "GenuineIntel"
        1 => {
            // FPU, TSC, CX8, CMOV, MMX, FXSR, SSE, SSE2.
            let features = (1 << 0) | (1 << 4) | (1 << 8) | (1 << 15) | (1 << 23)
                | (1 << 24)
                | (1 << 25)
                | (1 << 26);
            (0x0003_06A9, 0, 0, features)
        }
        _ => (0, 0, 0, 0),
    };
    cpu.gpr[RAX] = eax as u64;
    cpu.gpr[RBX] = ebx as u64;
    cpu.gpr[RCX] = ecx as u64;
    cpu.gpr[RDX] = edx as u64;
}

unsafe extern "C" fn rdtsc_thunk(cpu: *mut GuestCpu) {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let ns = EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let cpu = &mut *cpu;
    cpu.gpr[RAX] = ns & 0xFFFF_FFFF;
    cpu.gpr[RDX] = ns >> 32;
}

/// REP MOVS/STOS: honors DF and the RCX count. `packed`: element width in
/// bits 0..8, bit 8 selects STOS.
unsafe extern "C" fn rep_string_thunk(cpu: *mut GuestCpu, packed: u64) {
    let cpu = &mut *cpu;
    let width = (packed & 0xFF) as usize;
    let is_stos = packed & (1 << 8) != 0;
    let backward = cpu.rflags & FLAG_DF != 0;
    let delta = if backward {
        -(width as i64)
    } else {
        width as i64
    };

    while cpu.gpr[RCX] != 0 {
        let dst = cpu.gpr[RDI] as *mut u8;
        if is_stos {
            let value = cpu.gpr[RAX].to_le_bytes();
            std::ptr::copy_nonoverlapping(value.as_ptr(), dst, width);
        } else {
            let src = cpu.gpr[RSI] as *const u8;
            std::ptr::copy(src, dst, width);
            cpu.gpr[RSI] = cpu.gpr[RSI].wrapping_add(delta as u64);
        }
        cpu.gpr[RDI] = cpu.gpr[RDI].wrapping_add(delta as u64);
        cpu.gpr[RCX] -= 1;
    }
}

/// UCOMIS/COMIS flag compare: writes ZF/PF/CF per the architectural
/// table, clears OF/AF/SF, and drops any pending deferred record.
unsafe extern "C" fn fp_compare_thunk(cpu: *mut GuestCpu, a_bits: u64, b_bits: u64, double: u64) {
    let cpu = &mut *cpu;
    let (a, b) = if double != 0 {
        (f64::from_bits(a_bits), f64::from_bits(b_bits))
    } else {
        (
            f32::from_bits(a_bits as u32) as f64,
            f32::from_bits(b_bits as u32) as f64,
        )
    };
    let mut flags = (cpu.rflags & !STATUS_MASK) | FLAG_RESERVED1;
    if a.is_nan() || b.is_nan() {
        flags |= FLAG_ZF | FLAG_PF | FLAG_CF;
    } else if a < b {
        flags |= FLAG_CF;
    } else if a == b {
        flags |= FLAG_ZF;
    }
    cpu.rflags = flags;
    cpu.def_op = 0;
}

/// Assemble the table of host entry points baked into generated code.
pub fn build_helper_table() -> HelperTable {
    HelperTable {
        sync_flags: relay_cpu::flags::sync_flags as usize as u64,
        test_cond: relay_cpu::flags::test_cond as usize as u64,
        syscall: syscall_thunk as usize as u64,
        bridge: bridge::bridge_thunk as usize as u64,
        div: div_thunk as usize as u64,
        cpuid: cpuid_thunk as usize as u64,
        rdtsc: rdtsc_thunk as usize as u64,
        rep_string: rep_string_thunk as usize as u64,
        fp_compare: fp_compare_thunk as usize as u64,
        x87_load_f64: fpu::x87_load_f64 as usize as u64,
        x87_load_f32: fpu::x87_load_f32 as usize as u64,
        x87_load_i64: fpu::x87_load_i64 as usize as u64,
        x87_load_i32: fpu::x87_load_i32 as usize as u64,
        x87_load_const: fpu::x87_load_const as usize as u64,
        x87_store_f64: fpu::x87_store_f64 as usize as u64,
        x87_store_f32: fpu::x87_store_f32 as usize as u64,
        x87_store_i64: fpu::x87_store_i64 as usize as u64,
        x87_store_i32: fpu::x87_store_i32 as usize as u64,
        x87_arith: fpu::x87_arith as usize as u64,
        x87_arith_mem: fpu::x87_arith_mem as usize as u64,
        x87_unary: fpu::x87_unary as usize as u64,
        x87_fchs: fpu::x87_fchs as usize as u64,
        x87_fabs: fpu::x87_fabs as usize as u64,
        x87_compare: fpu::x87_compare as usize as u64,
        x87_fld_sti: fpu::x87_fld_sti as usize as u64,
        x87_fst_sti: fpu::x87_fst_sti as usize as u64,
        x87_fxch: fpu::x87_fxch as usize as u64,
    }
}
