//! Host fault handling.
//!
//! One process-wide handler covers SIGSEGV/SIGBUS/SIGILL/SIGFPE:
//!
//! - A write fault on an SMC-protected page is swallowed: the page is
//!   unprotected, intersecting blocks are invalidated, and the write
//!   retries. The guest never observes it.
//! - A fault inside translated code is a guest fault: the faulting host
//!   PC maps to the guest PC through the arena's reverse lookup and the
//!   block sidecar, the pending signal latches on the thread slot, and
//!   the host PC is redirected to the epilog — which spills the live
//!   guest registers and returns to the dispatcher for delivery.
//! - Anything else is not ours: restore the default disposition and
//!   re-raise.

use std::sync::atomic::Ordering;
use std::sync::Once;

use crate::context::EngineContext;
use crate::thread::{CURRENT_CPU, CURRENT_CTX, CURRENT_SLOT_RAW};

static INSTALL: Once = Once::new();

pub fn install_handlers() {
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    });
}

unsafe fn raise_default(sig: libc::c_int) -> ! {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(sig, &action, std::ptr::null_mut());
    libc::raise(sig);
    libc::_exit(128 + sig);
}

unsafe extern "C" fn fault_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uctx: *mut libc::c_void,
) {
    let ctx_ptr = CURRENT_CTX.with(|c| c.get());
    if ctx_ptr.is_null() {
        raise_default(sig);
    }
    let ctx = &*ctx_ptr;

    // Write faults may be the SMC trap. Taking the cache lock here is
    // sound because translated code never holds it; a contended acquire
    // just waits out the mutator on another thread.
    if sig == libc::SIGSEGV || sig == libc::SIGBUS {
        let fault_addr = (*info).si_addr() as u64;
        let mut jit = ctx.jit();
        let crate::context::JitState { cache, smc, .. } = &mut *jit;
        if smc.note_write_fault(cache, fault_addr).is_some() {
            ctx.stats().smc_faults_total.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    // Guest fault: only meaningful if it happened inside translated code.
    let cpu_ptr = CURRENT_CPU.with(|c| c.get());
    let slot_ptr = CURRENT_SLOT_RAW.with(|c| c.get());
    if cpu_ptr.is_null() || slot_ptr.is_null() {
        raise_default(sig);
    }

    let host_pc = host_pc_of(uctx);
    let guest_pc = {
        let jit = ctx.jit();
        jit.exec
            .find_block(host_pc)
            .and_then(|id| jit.cache.by_id(id))
            .and_then(|block| block.guest_pc_for_host(host_pc))
    };
    let Some(guest_pc) = guest_pc else {
        raise_default(sig);
    };

    // Latch the signal; park the guest IP at the faulting instruction and
    // leave through the epilog, which spills the still-live host register
    // file into GuestCpu before the dispatcher can observe it.
    (*cpu_ptr).rip = guest_pc;
    (*slot_ptr)
        .pending_signal
        .store(sig as u32, Ordering::Release);
    redirect_to_epilog(uctx, ctx);
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn host_pc_of(uctx: *mut libc::c_void) -> u64 {
    let uc = uctx as *mut libc::ucontext_t;
    (*uc).uc_mcontext.pc
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
unsafe fn host_pc_of(_uctx: *mut libc::c_void) -> u64 {
    0
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn redirect_to_epilog(uctx: *mut libc::c_void, ctx: &EngineContext) {
    let uc = uctx as *mut libc::ucontext_t;
    (*uc).uc_mcontext.pc = ctx.epilog();
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
unsafe fn redirect_to_epilog(_uctx: *mut libc::c_void, _ctx: &EngineContext) {
    // No translated code can run on this host; nothing to redirect.
    libc::abort();
}
