//! The per-thread dispatcher loop: select (or build) the block covering
//! the current guest IP, enter it through the prolog, and act on the
//! control fields the epilog returns with.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use relay_cpu::GuestCpu;
use relay_jit::cache::walk_raw;
use relay_jit::{ExecMemError, TranslateError, TranslatedBlock};

use crate::bridge;
use crate::context::EngineContext;
use crate::fork;
use crate::thread::{self, ThreadSlot};

/// Run guest code until `quit` is set or control returns through the exit
/// sentinel. On return, GuestCpu holds the final architectural state (for
/// a quitting guest, the exit status is in RDI per the syscall contract).
pub fn run(ctx: &EngineContext, cpu: &mut GuestCpu) {
    let slot = thread::ensure_slot(ctx);
    cpu.context = ctx as *const EngineContext as u64;

    // Nested runs (host→guest calls, cleanup routines) keep the outer
    // bindings; restore them on the way out.
    let prev_ctx = thread::CURRENT_CTX.with(|c| c.replace(ctx as *const EngineContext));
    let prev_cpu = thread::CURRENT_CPU.with(|c| c.replace(cpu as *mut GuestCpu));

    loop {
        let pending = slot.pending_signal.swap(0, Ordering::AcqRel);
        if pending != 0 {
            deliver_guest_signal(ctx, cpu, pending);
        }

        if let Some(handle) = thread::current_handle() {
            if handle.cancel_requested() && !handle.in_cleanup() {
                thread::run_cleanup_stack(ctx, cpu, &handle);
                cpu.quit = 1;
            }
        }

        if cpu.fork_request != 0 {
            fork::run_fork_protocol(ctx, cpu);
            continue;
        }
        if cpu.quit != 0 {
            break;
        }
        if cpu.rip == ctx.exit_sentinel() {
            break;
        }

        ctx.stats().dispatch_loops_total.fetch_add(1, Ordering::Relaxed);

        // Recompiler disabled: everything goes to the fallback contract.
        if !ctx.config.dynarec {
            fallback_step(ctx, cpu);
            continue;
        }

        // Fast path: lock-free walk to a published entry. The in_lookup
        // window lets the purge scan wait out the gap between reading the
        // leaf and pinning the block.
        slot.in_lookup.store(true, Ordering::SeqCst);
        let entry = unsafe { walk_raw(ctx.map_root(), cpu.rip) };
        if entry != ctx.miss_stub() {
            let block = unsafe { block_from_entry(entry) };
            block.pin();
            slot.in_lookup.store(false, Ordering::SeqCst);
            execute(ctx, &slot, cpu, entry);
            block.unpin();
            continue;
        }
        slot.in_lookup.store(false, Ordering::SeqCst);

        // Miss: find or build under the cache lock.
        ctx.stats().block_misses_total.fetch_add(1, Ordering::Relaxed);
        let block = match resolve_block(ctx, cpu.rip) {
            Ok(block) => block,
            Err(_) => {
                // Second-chance failure: interpret this block.
                fallback_step(ctx, cpu);
                continue;
            }
        };

        if block.guest_len == 0 && block.fallback_rip == Some(cpu.rip) {
            fallback_step(ctx, cpu);
            continue;
        }

        block.pin();
        execute(ctx, &slot, cpu, block.host_entry);
        block.unpin();
    }

    thread::CURRENT_CTX.with(|c| c.set(prev_ctx));
    thread::CURRENT_CPU.with(|c| c.set(prev_cpu));
}

/// Block metadata from a published post-prolog entry: the word before the
/// code is the header the cache patched at install time.
unsafe fn block_from_entry<'a>(entry: u64) -> &'a TranslatedBlock {
    let header = ((entry - 8) as *const u64).read();
    &*(header as *const TranslatedBlock)
}

fn resolve_block(ctx: &EngineContext, rip: u64) -> Result<Arc<TranslatedBlock>, TranslateError> {
    let mut jit = ctx.jit();

    // An unpublished current block (always_verify) re-hashes its source
    // bytes on every dispatcher entry and retranslates on mismatch.
    if let Some(block) = jit.cache.current(rip) {
        if !block.always_verify {
            return Ok(block);
        }
        if jit.verify_hash(&block) {
            return Ok(block);
        }
        jit.cache.invalidate_entry(rip);
    }

    match jit.translate_and_install(rip) {
        Ok(block) => Ok(block),
        Err(TranslateError::ExecMem(ExecMemError::Exhausted)) => {
            // Forced purge, then one retry.
            drop(jit);
            ctx.purge(thread::ensure_slot(ctx).as_ref());
            let mut jit = ctx.jit();
            jit.translate_and_install(rip)
        }
        Err(e) => Err(e),
    }
}

fn execute(ctx: &EngineContext, slot: &ThreadSlot, cpu: &mut GuestCpu, entry: u64) {
    if !cfg!(target_arch = "aarch64") {
        ctx.fatal("translated execution requested on a non-AArch64 host");
    }
    slot.in_translated.store(true, Ordering::SeqCst);
    unsafe {
        (ctx.trampolines().enter())(cpu as *mut GuestCpu, entry as *const u8);
    }
    slot.in_translated.store(false, Ordering::SeqCst);
}

/// Route exactly one guest instruction through the interpreter fallback.
fn fallback_step(ctx: &EngineContext, cpu: &mut GuestCpu) {
    ctx.stats()
        .fallback_steps_total
        .fetch_add(1, Ordering::Relaxed);
    match ctx.fallback() {
        Some(fallback) => fallback.step(ctx, cpu),
        None => ctx.fatal(&format!(
            "untranslatable instruction at {:#x} and no interpreter fallback is wired",
            cpu.rip
        )),
    }
}

fn deliver_guest_signal(ctx: &EngineContext, cpu: &mut GuestCpu, sig: u32) {
    ctx.stats()
        .guest_signals_total
        .fetch_add(1, Ordering::Relaxed);
    let handler = ctx.guest_signal_handler(sig);
    if handler == 0 {
        ctx.fatal(&format!(
            "guest fault (signal {sig}) at {:#x} with no guest handler registered",
            cpu.rip
        ));
    }
    tracing::debug!(sig, rip = format_args!("{:#x}", cpu.rip), "delivering guest signal");
    bridge::call_guest(ctx, cpu, handler, &[sig as u64]);
}
