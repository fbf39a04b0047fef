//! Guest threads: per-thread dispatcher slots, thread handles with the
//! cancellation-cleanup stack, and guest thread spawning.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use relay_cpu::state::{RBP, RDI, RSP};
use relay_cpu::{GuestCpu, Segment};

use crate::bridge;
use crate::context::EngineContext;
use crate::dispatcher;

/// The value a joined canceled thread yields (`PTHREAD_CANCELED`).
pub const CANCELED: u64 = u64::MAX;

/// Per-thread dispatcher state observed lock-free by the purge scan and
/// the signal handler.
#[derive(Debug, Default)]
pub struct ThreadSlot {
    /// Between the lock-free cache read and the block pin.
    pub in_lookup: AtomicBool,
    /// Inside translated code (between prolog and epilog return).
    pub in_translated: AtomicBool,
    /// Guest-visible signal captured by the host fault handler, delivered
    /// by the dispatcher at the next iteration. Zero is none.
    pub pending_signal: AtomicU32,
}

/// One registered cancellation-cleanup routine (guest function + arg).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupRecord {
    pub routine: u64,
    pub arg: u64,
}

/// Wraps a guest thread's identity: entry, argument, the LIFO cleanup
/// stack, and the host-level self identifier.
#[derive(Debug)]
pub struct ThreadHandle {
    pub entry: u64,
    pub arg: u64,
    cancel: AtomicBool,
    in_cleanup: AtomicBool,
    cleanup: Mutex<Vec<CleanupRecord>>,
    host_id: AtomicU64,
}

impl ThreadHandle {
    pub fn new(entry: u64, arg: u64) -> Self {
        Self {
            entry,
            arg,
            cancel: AtomicBool::new(false),
            in_cleanup: AtomicBool::new(false),
            cleanup: Mutex::new(Vec::new()),
            host_id: AtomicU64::new(0),
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// The cleanup walk is running: nested dispatcher entries (the
    /// cleanup routines themselves) must not re-trigger cancellation.
    pub fn in_cleanup(&self) -> bool {
        self.in_cleanup.load(Ordering::Acquire)
    }

    pub fn host_id(&self) -> u64 {
        self.host_id.load(Ordering::Acquire)
    }

    pub fn push_cleanup(&self, record: CleanupRecord) {
        self.cleanup.lock().unwrap().push(record);
    }

    /// Pop the most recently pushed record (LIFO).
    pub fn pop_cleanup(&self) -> Option<CleanupRecord> {
        self.cleanup.lock().unwrap().pop()
    }

    pub fn cleanup_depth(&self) -> usize {
        self.cleanup.lock().unwrap().len()
    }
}

thread_local! {
    pub(crate) static CURRENT_CTX: Cell<*const EngineContext> =
        const { Cell::new(std::ptr::null()) };
    pub(crate) static CURRENT_CPU: Cell<*mut GuestCpu> =
        const { Cell::new(std::ptr::null_mut()) };
    pub(crate) static CURRENT_SLOT_RAW: Cell<*const ThreadSlot> =
        const { Cell::new(std::ptr::null()) };
    static CURRENT_SLOT: RefCell<Option<Arc<ThreadSlot>>> = const { RefCell::new(None) };
    pub(crate) static CURRENT_HANDLE: RefCell<Option<Arc<ThreadHandle>>> =
        const { RefCell::new(None) };
}

/// The guest thread handle bound to the calling host thread, if any.
pub fn current_handle() -> Option<Arc<ThreadHandle>> {
    CURRENT_HANDLE.with(|h| h.borrow().clone())
}

/// The calling thread's slot, registered with the context on first use.
/// Registration is idempotent per thread; the child of a fork (whose
/// registry was reset) simply re-registers.
pub fn ensure_slot(ctx: &EngineContext) -> Arc<ThreadSlot> {
    let slot = CURRENT_SLOT.with(|s| {
        let mut s = s.borrow_mut();
        if s.is_none() {
            *s = Some(Arc::new(ThreadSlot::default()));
        }
        s.clone().expect("slot just ensured")
    });
    CURRENT_SLOT_RAW.with(|c| c.set(Arc::as_ptr(&slot)));
    ctx.register_slot(&slot);
    slot
}

pub struct GuestThread {
    pub handle: Arc<ThreadHandle>,
    join: JoinHandle<u64>,
}

impl GuestThread {
    /// Join the host thread; yields the guest return value, or
    /// [`CANCELED`] if the thread was cancelled.
    pub fn join(self) -> u64 {
        self.join.join().expect("guest thread panicked")
    }
}

/// Spawn a guest thread: allocate its stack and TLS block, seed a
/// GuestCpu from the parent's segment bases, push the exit-bridge frame,
/// and run the dispatcher on a new host thread.
pub fn spawn_guest_thread(
    ctx: &Arc<EngineContext>,
    entry: u64,
    arg: u64,
    stack_size: usize,
    parent: &GuestCpu,
) -> GuestThread {
    let handle = Arc::new(ThreadHandle::new(entry, arg));
    let ctx = ctx.clone();
    let thread_handle = handle.clone();
    let parent_gs = parent.seg_base(Segment::GS);
    let join = std::thread::spawn(move || {
        run_guest_thread(ctx, thread_handle, stack_size, parent_gs)
    });
    GuestThread { handle, join }
}

fn run_guest_thread(
    ctx: Arc<EngineContext>,
    handle: Arc<ThreadHandle>,
    stack_size: usize,
    parent_gs: u64,
) -> u64 {
    handle
        .host_id
        .store(unsafe { libc::pthread_self() as u64 }, Ordering::Release);
    CURRENT_HANDLE.with(|h| *h.borrow_mut() = Some(handle.clone()));

    let tls = ctx.allocate_tls();
    let stack_size = stack_size.max(64 * 1024);
    let layout = Layout::from_size_align(stack_size, 16).expect("stack layout");
    let stack = unsafe { alloc_zeroed(layout) };
    assert!(!stack.is_null(), "guest stack allocation failed");

    let mut cpu = GuestCpu::new();
    cpu.tls = tls.tcb;
    cpu.set_seg_base(Segment::FS, tls.tcb);
    cpu.set_seg_base(Segment::GS, parent_gs);

    // Synthetic frame: zeroed frame pointer, exit-bridge return address.
    let mut rsp = stack as u64 + stack_size as u64;
    rsp &= !0xF;
    cpu.gpr[RBP] = 0;
    rsp -= 8;
    unsafe { (rsp as *mut u64).write(0) };
    rsp -= 8;
    unsafe { (rsp as *mut u64).write(ctx.exit_sentinel()) };
    cpu.gpr[RSP] = rsp;
    cpu.gpr[RDI] = handle.arg;
    cpu.rip = handle.entry;

    dispatcher::run(&ctx, &mut cpu);

    let result = if handle.cancel_requested() {
        CANCELED
    } else {
        cpu.gpr[relay_cpu::state::RAX]
    };

    CURRENT_HANDLE.with(|h| *h.borrow_mut() = None);
    ctx.unregister_current_slot();
    unsafe { dealloc(stack, layout) };
    drop(tls);
    result
}

/// Run the thread's cleanup stack LIFO; each record re-enters the
/// dispatcher for the guest-level cleanup routine.
pub(crate) fn run_cleanup_stack(ctx: &EngineContext, cpu: &mut GuestCpu, handle: &ThreadHandle) {
    handle.in_cleanup.store(true, Ordering::Release);
    while let Some(record) = handle.pop_cleanup() {
        bridge::call_guest(ctx, cpu, record.routine, &[record.arg]);
    }
    handle.in_cleanup.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_stack_is_lifo() {
        let handle = ThreadHandle::new(0, 0);
        for i in 0..5 {
            handle.push_cleanup(CleanupRecord {
                routine: i,
                arg: i * 10,
            });
        }
        let mut order = Vec::new();
        while let Some(rec) = handle.pop_cleanup() {
            order.push(rec.routine);
        }
        assert_eq!(order, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn cancel_flag_latches() {
        let handle = ThreadHandle::new(0, 0);
        assert!(!handle.cancel_requested());
        handle.request_cancel();
        assert!(handle.cancel_requested());
        handle.request_cancel();
        assert!(handle.cancel_requested());
    }
}
