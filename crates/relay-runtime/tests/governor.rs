//! Governor and cache-coherence tests that need no translated execution:
//! concurrent atfork registration, the deferred-fork protocol, SMC
//! bookkeeping over real process memory, and the lock-free read path.

use pretty_assertions::assert_eq;
use relay_cpu::state::RAX;
use relay_cpu::{GuestCpu, FORK_PLAIN};
use relay_runtime::context::JitState;
use relay_runtime::{fork, AtForkRecord, EngineContext};

/// Page-aligned buffer so SMC page bookkeeping has clean boundaries.
struct GuestCode {
    ptr: *mut u8,
    len: usize,
}

impl GuestCode {
    fn new(bytes: &[u8]) -> Self {
        let len = 4096;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        } as *mut u8;
        assert!(!ptr.is_null());
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Self { ptr, len }
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }
}

impl Drop for GuestCode {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut _, self.len) };
    }
}

#[test]
fn concurrent_atfork_registration_loses_nothing() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 16;
    let ctx = EngineContext::for_tests();

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let ctx = ctx.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..PER_THREAD {
                fork::register_atfork(
                    &ctx,
                    AtForkRecord {
                        prepare: 0,
                        parent: 0,
                        child: 0,
                        owner: t * PER_THREAD + i + 1,
                    },
                );
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let records = ctx.atfork().lock().clone();
    assert_eq!(records.len(), (THREADS * PER_THREAD) as usize);
    // No duplicates, no lost entries.
    let mut owners: Vec<u64> = records.iter().map(|r| r.owner).collect();
    owners.sort_unstable();
    owners.dedup();
    assert_eq!(owners.len(), (THREADS * PER_THREAD) as usize);
}

#[test]
fn atfork_owner_unregistration_is_selective() {
    let ctx = EngineContext::for_tests();
    for owner in [1u64, 2, 1, 3, 1] {
        fork::register_atfork(
            &ctx,
            AtForkRecord {
                prepare: 0,
                parent: 0,
                child: 0,
                owner,
            },
        );
    }
    fork::unregister_atfork_owner(&ctx, 1);
    let owners: Vec<u64> = ctx.atfork().lock().iter().map(|r| r.owner).collect();
    assert_eq!(owners, vec![2, 3]);
}

#[test]
fn deferred_fork_returns_zero_in_child_and_pid_in_parent() {
    let ctx = EngineContext::for_tests();
    let mut cpu = GuestCpu::new();
    cpu.fork_request = FORK_PLAIN;
    cpu.quit = 1;
    let parent_pid = std::process::id();

    fork::run_fork_protocol(&ctx, &mut cpu);

    if std::process::id() != parent_pid {
        // Child side: the fork result register is zero and the request
        // flags are cleared. Report through the exit status.
        let ok = cpu.gpr[RAX] == 0 && cpu.fork_request == 0 && cpu.quit == 0;
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }

    let child = cpu.gpr[RAX] as i32;
    assert!(child > 0, "parent sees the child pid");
    assert_eq!(cpu.fork_request, 0);
    assert_eq!(cpu.quit, 0);
    let mut status = 0;
    unsafe { libc::waitpid(child, &mut status, 0) };
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0, "child-side invariants held");
}

#[test]
fn translation_protects_pages_and_write_fault_invalidates() {
    // mov eax, 7; ret
    let code = GuestCode::new(&[0xB8, 7, 0, 0, 0, 0xC3]);
    let ctx = EngineContext::for_tests();
    let rip = code.addr();

    let block = ctx
        .jit()
        .translate_and_install(rip)
        .expect("translates");
    assert!(!block.always_verify);
    {
        let jit = ctx.jit();
        assert!(jit.cache.current(rip).is_some());
        assert_eq!(jit.cache.published_entry(rip), block.host_entry);
        assert!(!jit.smc.is_writable(rip));
    }

    // Simulated guest write to the code page.
    {
        let mut jit = ctx.jit();
        let JitState { cache, smc, .. } = &mut *jit;
        assert_eq!(smc.note_write_fault(cache, rip + 2), Some(1));
    }
    {
        let jit = ctx.jit();
        assert!(jit.cache.current(rip).is_none());
        assert_eq!(jit.cache.published_entry(rip), ctx.miss_stub());
        assert_eq!(jit.cache.stats().blocks_invalidated_total, 1);
        assert!(jit.smc.is_writable(rip));
    }

    // Retranslation of the now-writable page verifies on entry and stays
    // out of the inline lookup table.
    let block2 = ctx
        .jit()
        .translate_and_install(rip)
        .expect("retranslates");
    assert!(block2.always_verify);
    assert_eq!(ctx.jit().cache.published_entry(rip), ctx.miss_stub());
}

#[test]
fn hash_verification_detects_source_changes() {
    let code = GuestCode::new(&[0xB8, 1, 0, 0, 0, 0xC3]);
    let ctx = EngineContext::for_tests();
    let rip = code.addr();

    // Dirty the page first so the block is translated always-verify.
    {
        let mut jit = ctx.jit();
        let JitState { cache, smc, .. } = &mut *jit;
        smc.protect_range(rip, rip + 1);
        smc.note_write_fault(cache, rip);
    }
    let block = ctx.jit().translate_and_install(rip).unwrap();
    assert!(block.always_verify);
    assert!(ctx.jit().verify_hash(&block));

    // Rewriting the immediate (return value 1 -> 2) must fail the check.
    unsafe { (rip as *mut u8).add(1).write(2) };
    assert!(!ctx.jit().verify_hash(&block));
}

#[test]
fn cache_read_path_blocks_on_no_lock() {
    let ctx = EngineContext::for_tests();
    let code = GuestCode::new(&[0xC3]);
    let rip = code.addr();
    ctx.jit().translate_and_install(rip).unwrap();

    // Hold the cache (writer) lock while a reader thread walks the table
    // N times; the reads must complete without it.
    let guard = ctx.jit();
    let reader = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            let mut hits = 0;
            for _ in 0..10_000 {
                if unsafe { relay_jit::cache::walk_raw(ctx.map_root(), rip) } != ctx.miss_stub() {
                    hits += 1;
                }
            }
            hits
        })
    };
    let (tx, rx) = std::sync::mpsc::channel();
    let waiter = std::thread::spawn(move || {
        tx.send(reader.join().unwrap()).unwrap();
    });
    let hits = rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("read path must not wait on the cache lock");
    assert_eq!(hits, 10_000);
    drop(guard);
    waiter.join().unwrap();
}

#[test]
fn purge_reclaims_unpinned_invalidated_blocks() {
    let ctx = EngineContext::for_tests();
    let code = GuestCode::new(&[0xB8, 1, 0, 0, 0, 0xC3]);
    let rip = code.addr();
    let block = ctx.jit().translate_and_install(rip).unwrap();

    block.pin();
    ctx.jit().cache.invalidate_entry(rip);
    let slot = relay_runtime::thread::ThreadSlot::default();
    // Pinned: the purge scan must leave it alone.
    assert_eq!(ctx.purge(&slot), 0);
    block.unpin();
    assert_eq!(ctx.purge(&slot), 1);
    assert_eq!(ctx.jit().cache.stats().blocks_purged_total, 1);
}

#[test]
fn fork_child_resets_in_use_pins() {
    let ctx = EngineContext::for_tests();
    let code = GuestCode::new(&[0xC3]);
    let rip = code.addr();
    let block = ctx.jit().translate_and_install(rip).unwrap();

    // A (parent) thread is pinned inside the block at fork time.
    block.pin();
    let parent_pid = std::process::id();
    let mut cpu = GuestCpu::new();
    cpu.fork_request = FORK_PLAIN;
    cpu.quit = 1;
    fork::run_fork_protocol(&ctx, &mut cpu);

    if std::process::id() != parent_pid {
        // The pinning thread does not exist here; a stale count would pin
        // the block forever.
        let ok = block.in_use() == 0;
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }
    assert_eq!(block.in_use(), 1, "parent pin survives");
    block.unpin();
    let mut status = 0;
    unsafe { libc::waitpid(cpu.gpr[RAX] as i32, &mut status, 0) };
    assert_eq!(libc::WEXITSTATUS(status), 0);
}
