//! The process-wide engine context: one long-lived owner for the block
//! cache, executable arenas, trampolines, bridge region, atfork list, TLS
//! template, and stats. Every subsystem takes it by reference; the only
//! ambient state is the per-thread bindings the signal handler needs.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use relay_cpu::GuestCpu;
use relay_jit::block::{BlockLimits, CodeSource};
use relay_jit::link::LinkArena;
use relay_jit::{
    BlockCache, ExecMem, TranslateError, TranslatedBlock, Translator, Trampolines,
};

use crate::bridge::{BridgeRegion, WrapperFn};
use crate::fallback::FallbackInterpreter;
use crate::fork::AtForkRecord;
use crate::helpers;
use crate::locks::{ForkLock, ForkLockGuard};
use crate::signals;
use crate::smc::SmcPages;
use crate::syscall::{PassthroughSyscalls, SyscallDispatch};
use crate::thread::ThreadSlot;
use crate::tls::{TlsBlock, TlsTemplate};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recompiler on/off (`RELAY64_DYNAREC`); off means fallback-only.
    pub dynarec: bool,
    pub block_limits: BlockLimits,
    pub region_size: usize,
    pub max_regions: usize,
    /// Write-protect guest code pages (the SMC trap path). Off for
    /// bookkeeping-only tests.
    pub smc_protection: bool,
    pub bridge_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dynarec: true,
            block_limits: BlockLimits::default(),
            region_size: relay_jit::arena::DEFAULT_REGION_SIZE,
            max_regions: relay_jit::arena::DEFAULT_MAX_REGIONS,
            smc_protection: cfg!(target_arch = "aarch64"),
            bridge_capacity: 4096,
        }
    }
}

/// Everything the cache lock protects: the block cache, arenas, link
/// slots, translator, SMC page registry, and the bridge region the
/// translator consults during discovery.
pub struct JitState {
    pub cache: BlockCache,
    pub exec: ExecMem,
    pub links: LinkArena,
    pub translator: Translator,
    pub smc: SmcPages,
    pub bridges: BridgeRegion,
}

impl JitState {
    /// Re-hash an `always_verify` block's source bytes against its
    /// translation-time hash.
    pub fn verify_hash(&self, block: &TranslatedBlock) -> bool {
        let source = ProcessSource {
            smc: &self.smc,
            bridges: &self.bridges,
        };
        relay_jit::compile::hash_guest_range(&source, block.entry, block.guest_len) == block.hash
    }

    /// Translate the block at `rip` and install it: publish the leaf
    /// slot, resolve links, and write-protect the source pages.
    pub fn translate_and_install(&mut self, rip: u64) -> Result<Arc<TranslatedBlock>, TranslateError> {
        let JitState {
            cache,
            exec,
            links,
            translator,
            smc,
            bridges,
        } = self;
        let block = {
            let source = ProcessSource { smc, bridges };
            translator.translate(
                &source,
                rip,
                cache.map_root(),
                cache.miss_stub(),
                exec,
                links,
                cache.next_id(),
            )?
        };
        if !block.always_verify && block.guest_len > 0 {
            smc.protect_range(block.entry, block.end());
        }
        Ok(cache.install(block, exec))
    }
}

/// Translation-time view of guest memory. Guest addresses are host
/// addresses; writability and bridge queries go to the SMC registry and
/// the bridge region.
pub struct ProcessSource<'a> {
    pub smc: &'a SmcPages,
    pub bridges: &'a BridgeRegion,
}

impl CodeSource for ProcessSource<'_> {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        buf.len()
    }

    fn is_writable_page(&self, addr: u64) -> bool {
        self.smc.is_writable(addr)
    }

    fn bridge_wrapper(&self, addr: u64) -> Option<u64> {
        self.bridges.wrapper_at(addr)
    }
}

/// Aggregate engine counters, in the `_total` style of the cache stats.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub dispatch_loops_total: AtomicU64,
    pub block_misses_total: AtomicU64,
    pub fallback_steps_total: AtomicU64,
    pub smc_faults_total: AtomicU64,
    pub guest_signals_total: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub dispatch_loops_total: u64,
    pub block_misses_total: u64,
    pub fallback_steps_total: u64,
    pub smc_faults_total: u64,
    pub guest_signals_total: u64,
    pub blocks_translated_total: u64,
    pub blocks_invalidated_total: u64,
    pub blocks_purged_total: u64,
}

/// A loaded guest image's mapped range (loader interface).
#[derive(Debug, Clone)]
pub struct ImageRange {
    pub name: String,
    pub base: u64,
    pub len: u64,
}

pub struct EngineContext {
    pub config: EngineConfig,
    jit: ForkLock<JitState>,
    trampolines: Trampolines,
    map_root: u64,
    miss_stub: u64,
    exit_sentinel: u64,
    atfork: ForkLock<Vec<AtForkRecord>>,
    tls: ForkLock<TlsTemplate>,
    threads: ForkLock<Vec<Arc<ThreadSlot>>>,
    images: ForkLock<Vec<ImageRange>>,
    guest_signal_handlers: ForkLock<[u64; 65]>,
    syscalls: Box<dyn SyscallDispatch>,
    fallback: Option<Box<dyn FallbackInterpreter>>,
    stats: EngineStats,
    last_pty_master: AtomicI32,
}

pub struct EngineBuilder {
    config: EngineConfig,
    syscalls: Box<dyn SyscallDispatch>,
    fallback: Option<Box<dyn FallbackInterpreter>>,
    tls: TlsTemplate,
}

impl EngineBuilder {
    pub fn syscalls(mut self, syscalls: Box<dyn SyscallDispatch>) -> Self {
        self.syscalls = syscalls;
        self
    }

    pub fn fallback(mut self, fallback: Box<dyn FallbackInterpreter>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn tls_template(mut self, tls: TlsTemplate) -> Self {
        self.tls = tls;
        self
    }

    pub fn build(self) -> Arc<EngineContext> {
        let mut exec = ExecMem::with_max_regions(self.config.region_size, self.config.max_regions);
        // Trampolines are tagged with an out-of-band id so the reverse
        // lookup never attributes their PCs to a guest block.
        let trampolines =
            relay_jit::trampoline::generate(&mut exec, u32::MAX).expect("trampoline generation");
        let cache = BlockCache::new(trampolines.epilog);
        let translator = Translator::new(self.config.block_limits, helpers::build_helper_table());
        let bridges = BridgeRegion::new(self.config.bridge_capacity);
        let exit_sentinel = bridges.exit_sentinel();
        let map_root = cache.map_root();
        let miss_stub = cache.miss_stub();

        let ctx = Arc::new(EngineContext {
            jit: ForkLock::new(JitState {
                cache,
                exec,
                links: LinkArena::new(),
                translator,
                smc: SmcPages::new(self.config.smc_protection),
                bridges,
            }),
            trampolines,
            map_root,
            miss_stub,
            exit_sentinel,
            atfork: ForkLock::new(Vec::new()),
            tls: ForkLock::new(self.tls),
            threads: ForkLock::new(Vec::new()),
            images: ForkLock::new(Vec::new()),
            guest_signal_handlers: ForkLock::new([0; 65]),
            syscalls: self.syscalls,
            fallback: self.fallback,
            stats: EngineStats::default(),
            config: self.config,
            last_pty_master: AtomicI32::new(-1),
        });
        signals::install_handlers();
        ctx
    }
}

impl EngineContext {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            syscalls: Box::new(PassthroughSyscalls),
            fallback: None,
            tls: TlsTemplate::default(),
        }
    }

    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    /// Context with SMC protection and signal traps suitable for unit
    /// tests on any host.
    pub fn for_tests() -> Arc<Self> {
        Self::new(EngineConfig {
            smc_protection: false,
            ..Default::default()
        })
    }

    pub fn jit(&self) -> ForkLockGuard<'_, JitState> {
        self.jit.lock()
    }

    pub fn atfork(&self) -> &ForkLock<Vec<AtForkRecord>> {
        &self.atfork
    }

    pub fn trampolines(&self) -> &Trampolines {
        &self.trampolines
    }

    pub fn map_root(&self) -> u64 {
        self.map_root
    }

    pub fn miss_stub(&self) -> u64 {
        self.miss_stub
    }

    pub fn epilog(&self) -> u64 {
        self.trampolines.epilog
    }

    pub fn exit_sentinel(&self) -> u64 {
        self.exit_sentinel
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn fallback(&self) -> Option<&dyn FallbackInterpreter> {
        self.fallback.as_deref()
    }

    pub fn dispatch_syscall(&self, cpu: &mut GuestCpu) {
        self.syscalls.dispatch(self, cpu);
    }

    pub fn register_wrapper(&self, wrapper: WrapperFn) -> u64 {
        self.jit().bridges.register(wrapper)
    }

    pub fn register_image(&self, image: ImageRange) {
        self.images.lock().push(image);
    }

    pub fn register_guest_signal(&self, sig: u32, handler: u64) {
        if (sig as usize) < 65 {
            self.guest_signal_handlers.lock()[sig as usize] = handler;
        }
    }

    pub fn guest_signal_handler(&self, sig: u32) -> u64 {
        *self
            .guest_signal_handlers
            .lock()
            .get(sig as usize)
            .unwrap_or(&0)
    }

    pub fn allocate_tls(&self) -> TlsBlock {
        self.tls.lock().allocate()
    }

    pub fn tls_template(&self) -> &ForkLock<TlsTemplate> {
        &self.tls
    }

    pub fn register_slot(&self, slot: &Arc<ThreadSlot>) {
        let mut threads = self.threads.lock();
        if !threads.iter().any(|s| Arc::ptr_eq(s, slot)) {
            threads.push(slot.clone());
        }
    }

    pub fn unregister_current_slot(&self) {
        crate::thread::CURRENT_SLOT_RAW.with(|raw| {
            let ptr = raw.get();
            if !ptr.is_null() {
                self.threads
                    .lock()
                    .retain(|s| !std::ptr::eq(Arc::as_ptr(s), ptr));
            }
        });
    }

    pub fn set_last_pty_master(&self, fd: i32) {
        self.last_pty_master.store(fd, Ordering::Release);
    }

    pub fn last_pty_master(&self) -> i32 {
        self.last_pty_master.load(Ordering::Acquire)
    }

    pub fn stats_snapshot(&self) -> EngineStatsSnapshot {
        let cache_stats = self.jit().cache.stats();
        EngineStatsSnapshot {
            dispatch_loops_total: self.stats.dispatch_loops_total.load(Ordering::Relaxed),
            block_misses_total: self.stats.block_misses_total.load(Ordering::Relaxed),
            fallback_steps_total: self.stats.fallback_steps_total.load(Ordering::Relaxed),
            smc_faults_total: self.stats.smc_faults_total.load(Ordering::Relaxed),
            guest_signals_total: self.stats.guest_signals_total.load(Ordering::Relaxed),
            blocks_translated_total: cache_stats.blocks_translated_total,
            blocks_invalidated_total: cache_stats.blocks_invalidated_total,
            blocks_purged_total: cache_stats.blocks_purged_total,
        }
    }

    /// The purge scan: wait out every thread's lookup window and
    /// translated-code residency, then reclaim retired blocks and their
    /// regions. This is the only path that frees executable memory.
    pub fn purge(&self, caller_slot: &ThreadSlot) -> usize {
        let mut jit = self.jit();
        let threads = self.threads.lock();
        for slot in threads.iter() {
            if std::ptr::eq(Arc::as_ptr(slot), caller_slot) {
                continue;
            }
            while slot.in_lookup.load(Ordering::SeqCst) || slot.in_translated.load(Ordering::SeqCst)
            {
                std::hint::spin_loop();
            }
        }
        drop(threads);
        let JitState { cache, exec, .. } = &mut *jit;
        cache.purge(exec)
    }

    /// Child-side fork repair: reinitialize every fork-owned lock and
    /// drop the dead threads' bookkeeping, including their `in_use` pins
    /// (stale counts would keep their blocks unpurgeable forever).
    pub fn reinit_after_fork(&self) {
        unsafe {
            self.jit.reinit_after_fork();
            self.atfork.reinit_after_fork();
            self.tls.reinit_after_fork();
            self.threads.reinit_after_fork();
            self.images.reinit_after_fork();
            self.guest_signal_handlers.reinit_after_fork();
        }
        self.jit().cache.reset_in_use();
        self.threads.lock().clear();
    }

    /// Invariant violation: abort with diagnostics. These are bugs, not
    /// runtime conditions.
    pub fn fatal(&self, msg: &str) -> ! {
        tracing::error!(target: "relay64", "{msg}");
        eprintln!("relay64: fatal: {msg}");
        std::process::abort();
    }
}
