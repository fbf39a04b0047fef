//! Prolog and epilog trampolines, generated into the arena at startup by
//! the same emitter the translator uses.
//!
//! The prolog is `extern "C" fn(cpu, entry)`: it saves host callee-saved
//! state, loads the guest register file into the fixed map, caches the
//! host stack pointer, and jumps to the block entry. The epilog reverses
//! it and is also the shared miss stub: any lookup that does not resolve
//! lands here and returns to the dispatcher. After the epilog runs,
//! GuestCpu is the sole source of truth for guest state.

use relay_cpu::state::offsets;
use relay_cpu::GuestCpu;

use crate::a64;
use crate::arena::{ExecMem, ExecMemError};
use crate::lower::regs;

/// Host frame bytes the prolog reserves for callee-saved registers.
const FRAME: i32 = 96;

/// Entry signature of the generated prolog.
pub type EnterFn = unsafe extern "C" fn(*mut GuestCpu, *const u8);

#[derive(Debug, Clone, Copy)]
pub struct Trampolines {
    pub prolog: u64,
    /// Epilog address, doubling as the block-cache miss stub.
    pub epilog: u64,
}

impl Trampolines {
    pub fn enter(&self) -> EnterFn {
        unsafe { std::mem::transmute::<u64, EnterFn>(self.prolog) }
    }
}

fn emit_words(exec: &mut ExecMem, words: &[u32], id: u32) -> Result<u64, ExecMemError> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    let alloc = exec.alloc(bytes.len())?;
    exec.commit(&alloc, &bytes, id);
    Ok(alloc.exec)
}

/// Generate both trampolines. `id` tags their arena registrations so the
/// reverse lookup never attributes a fault inside them to a guest block.
pub fn generate(exec: &mut ExecMem, id: u32) -> Result<Trampolines, ExecMemError> {
    let mut prolog = Vec::new();
    prolog.push(a64::stp_pre(29, 30, a64::SP, -FRAME));
    prolog.push(a64::add_imm(true, 29, a64::SP, 0));
    prolog.push(a64::stp(19, 20, a64::SP, 16));
    prolog.push(a64::stp(21, 22, a64::SP, 32));
    prolog.push(a64::stp(23, 24, a64::SP, 48));
    prolog.push(a64::stp(25, 26, a64::SP, 64));
    prolog.push(a64::stp(27, 28, a64::SP, 80));
    prolog.push(a64::mov_reg(true, regs::CPU, 0));
    // Cache the host SP so every exit path can restore it.
    prolog.push(a64::add_imm(true, regs::LK0, a64::SP, 0));
    prolog.push(a64::str_imm(regs::LK0, regs::CPU, offsets::HOST_SP as u32));
    for idx in 0..16 {
        prolog.push(a64::ldr_imm(
            regs::guest(idx),
            regs::CPU,
            offsets::gpr(idx) as u32,
        ));
    }
    prolog.push(a64::ldr_imm(
        regs::FLAGS,
        regs::CPU,
        offsets::RFLAGS as u32,
    ));
    prolog.push(a64::br(1));

    let mut epilog = Vec::new();
    for idx in 0..16 {
        epilog.push(a64::str_imm(
            regs::guest(idx),
            regs::CPU,
            offsets::gpr(idx) as u32,
        ));
    }
    epilog.push(a64::str_imm(
        regs::FLAGS,
        regs::CPU,
        offsets::RFLAGS as u32,
    ));
    // Generated code never moves the host SP (helpers balance their own
    // frames), so the epilog unwinds from SP itself. That keeps nested
    // prolog/epilog pairs — wrappers calling back into guest code —
    // reentrant; `host_sp` stays the prolog-cached diagnostic value.
    epilog.push(a64::ldp(19, 20, a64::SP, 16));
    epilog.push(a64::ldp(21, 22, a64::SP, 32));
    epilog.push(a64::ldp(23, 24, a64::SP, 48));
    epilog.push(a64::ldp(25, 26, a64::SP, 64));
    epilog.push(a64::ldp(27, 28, a64::SP, 80));
    epilog.push(a64::ldp_post(29, 30, a64::SP, FRAME));
    epilog.push(a64::ret());

    Ok(Trampolines {
        prolog: emit_words(exec, &prolog, id)?,
        epilog: emit_words(exec, &epilog, id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampolines_are_emitted_and_distinct() {
        let mut exec = ExecMem::new(1 << 20);
        let t = generate(&mut exec, u32::MAX).unwrap();
        assert_ne!(t.prolog, 0);
        assert_ne!(t.epilog, 0);
        assert_ne!(t.prolog, t.epilog);
        // The prolog ends with `br x1`, the epilog with `ret`.
        unsafe {
            // 16 GPR spills + flags + 5 ldp + frame pop.
            let ret_idx = 16 + 1 + 5 + 1;
            assert_eq!(*(t.epilog as *const u32).add(ret_idx), a64::ret());
            let prolog_words = ((t.epilog - t.prolog) / 4) as usize;
            assert_eq!(*(t.prolog as *const u32).add(prolog_words - 1), a64::br(1));
        }
    }
}
