//! End-to-end execution scenarios. These run guest x86_64 code through
//! the full translate-and-execute path and therefore require an AArch64
//! Linux host; the host-agnostic pipeline and governor properties live in
//! the other suites.
#![cfg(all(target_arch = "aarch64", target_os = "linux"))]

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relay_cpu::state::{RAX, RDI, RDX, RSP};
use relay_cpu::GuestCpu;
use relay_runtime::{dispatcher, thread, CleanupRecord, EngineConfig, EngineContext};

/// Guest code/data pages, mapped RW like a loaded text segment before the
/// SMC layer protects it.
struct GuestPage {
    base: *mut u8,
    len: usize,
}

impl GuestPage {
    fn new(len: usize) -> Self {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        } as *mut u8;
        assert!(!base.is_null());
        Self { base, len }
    }

    fn addr(&self, off: usize) -> u64 {
        self.base as u64 + off as u64
    }

    fn write(&self, off: usize, bytes: &[u8]) {
        assert!(off + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(off), bytes.len());
        }
    }

    fn read_u64(&self, off: usize) -> u64 {
        unsafe { ((self.base.add(off)) as *const u64).read() }
    }
}

impl Drop for GuestPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, self.len);
        }
    }
}

/// Run guest code at `entry` on a fresh GuestCpu with a private stack and
/// the exit sentinel as the top return address.
fn run_code(ctx: &Arc<EngineContext>, entry: u64) -> GuestCpu {
    let mut cpu = GuestCpu::new();
    let stack = vec![0u64; 16 * 1024];
    let mut rsp = stack.as_ptr() as u64 + (stack.len() * 8) as u64;
    rsp &= !0xF;
    rsp -= 8;
    unsafe { (rsp as *mut u64).write(ctx.exit_sentinel()) };
    cpu.gpr[RSP] = rsp;
    cpu.rip = entry;
    dispatcher::run(ctx, &mut cpu);
    cpu
}

fn imm64(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

#[test]
fn alu_stack_and_conditionals() {
    let page = GuestPage::new(4096);
    let mut code = vec![
        0xB8, 5, 0, 0, 0, // mov eax, 5
        0x83, 0xC0, 0x03, // add eax, 3
        0x50, // push rax
        0x59, // pop rcx
        0x48, 0x01, 0xC8, // add rax, rcx
        0x83, 0xF8, 0x10, // cmp eax, 16
        0x74, 0x03, // jz +3 (over the add below)
    ];
    code.extend_from_slice(&[0x83, 0xC0, 0x64]); // add eax, 100 (skipped)
    code.push(0xC3); // ret
    page.write(0, &code);

    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    assert_eq!(cpu.gpr[RAX], 16);
}

#[test]
fn setcc_reads_native_condition() {
    let page = GuestPage::new(4096);
    page.write(
        0,
        &[
            0x31, 0xC9, // xor ecx, ecx
            0xB8, 5, 0, 0, 0, // mov eax, 5
            0x83, 0xF8, 0x03, // cmp eax, 3
            0x0F, 0x97, 0xC1, // seta cl
            0x48, 0x89, 0xC8, // mov rax, rcx
            0xC3,
        ],
    );
    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    assert_eq!(cpu.gpr[RAX], 1);
}

#[test]
fn deferred_flags_survive_pushfq() {
    // INT32_MAX + 1 overflows: OF and SF must be reconstructible when
    // PUSHFQ materializes the flags word.
    let page = GuestPage::new(4096);
    page.write(
        0,
        &[
            0xB8, 0xFF, 0xFF, 0xFF, 0x7F, // mov eax, 0x7FFFFFFF
            0x83, 0xC0, 0x01, // add eax, 1
            0x9C, // pushfq
            0x58, // pop rax
            0xC3,
        ],
    );
    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    let flags = cpu.gpr[RAX];
    assert_ne!(flags & relay_cpu::FLAG_OF, 0);
    assert_ne!(flags & relay_cpu::FLAG_SF, 0);
    assert_eq!(flags & relay_cpu::FLAG_ZF, 0);
}

#[test]
fn division_fills_quotient_and_remainder() {
    let page = GuestPage::new(4096);
    page.write(
        0,
        &[
            0xB8, 100, 0, 0, 0, // mov eax, 100
            0x31, 0xD2, // xor edx, edx
            0xB9, 7, 0, 0, 0, // mov ecx, 7
            0xF7, 0xF1, // div ecx
            0xC3,
        ],
    );
    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    assert_eq!(cpu.gpr[RAX], 14);
    assert_eq!(cpu.gpr[RDX], 2);
}

#[test]
fn x87_add_round_trips_through_memory() {
    let page = GuestPage::new(4096);
    page.write(0x100, &1.5f64.to_bits().to_le_bytes());
    page.write(0x108, &2.25f64.to_bits().to_le_bytes());
    let mut code = Vec::new();
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(page.addr(0x100)));
    code.extend_from_slice(&[0xDD, 0x00]); // fld qword [rax]
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(page.addr(0x108)));
    code.extend_from_slice(&[0xDD, 0x00]); // fld qword [rax]
    code.extend_from_slice(&[0xDE, 0xC1]); // faddp st(1), st0
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(page.addr(0x110)));
    code.extend_from_slice(&[0xDD, 0x18]); // fstp qword [rax]
    code.push(0xC3);
    page.write(0, &code);

    let ctx = EngineContext::new(EngineConfig::default());
    run_code(&ctx, page.addr(0));
    assert_eq!(f64::from_bits(page.read_u64(0x110)), 3.75);
}

#[test]
fn sse_packed_add() {
    let page = GuestPage::new(4096);
    let a: [i32; 4] = [1, 2, 3, 4];
    let b: [i32; 4] = [10, 20, 30, 40];
    for (i, v) in a.iter().enumerate() {
        page.write(0x100 + i * 4, &v.to_le_bytes());
    }
    for (i, v) in b.iter().enumerate() {
        page.write(0x110 + i * 4, &v.to_le_bytes());
    }
    let mut code = Vec::new();
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(page.addr(0x100)));
    code.extend_from_slice(&[0x66, 0x0F, 0x6F, 0x00]); // movdqa xmm0, [rax]
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(page.addr(0x110)));
    code.extend_from_slice(&[0x66, 0x0F, 0xFE, 0x00]); // paddd xmm0, [rax]
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(page.addr(0x120)));
    code.extend_from_slice(&[0x66, 0x0F, 0x7F, 0x00]); // movdqa [rax], xmm0
    code.push(0xC3);
    page.write(0, &code);

    let ctx = EngineContext::new(EngineConfig::default());
    run_code(&ctx, page.addr(0));
    for i in 0..4 {
        let got = i32::from_le_bytes(
            (0..4)
                .map(|j| unsafe { page.base.add(0x120 + i * 4 + j).read() })
                .collect::<Vec<u8>>()
                .try_into()
                .unwrap(),
        );
        assert_eq!(got, a[i] + b[i]);
    }
}

#[test]
fn rep_movsb_copies_with_count() {
    let page = GuestPage::new(4096);
    let payload: Vec<u8> = (0..32u8).collect();
    page.write(0x100, &payload);
    let mut code = Vec::new();
    code.extend_from_slice(&[0x48, 0xBE]);
    code.extend_from_slice(&imm64(page.addr(0x100)));
    code.extend_from_slice(&[0x48, 0xBF]);
    code.extend_from_slice(&imm64(page.addr(0x200)));
    code.extend_from_slice(&[0xB9, 32, 0, 0, 0]); // mov ecx, 32
    code.extend_from_slice(&[0xF3, 0xA4]); // rep movsb
    code.push(0xC3);
    page.write(0, &code);

    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    assert_eq!(cpu.gpr[relay_cpu::state::RCX], 0);
    let copied: Vec<u8> = (0..32).map(|i| unsafe { page.base.add(0x200 + i).read() }).collect();
    assert_eq!(copied, payload);
}

/// S1: hello-world through the syscall boundary.
#[test]
fn s1_write_syscall_reaches_host_fd() {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

    let page = GuestPage::new(4096);
    let msg = b"relay64 says hello!\n";
    assert_eq!(msg.len(), 20);
    page.write(0x100, msg);

    let mut code = Vec::new();
    code.push(0xBF); // mov edi, fd
    code.extend_from_slice(&(fds[1] as u32).to_le_bytes());
    code.extend_from_slice(&[0x48, 0xBE]); // mov rsi, msg
    code.extend_from_slice(&imm64(page.addr(0x100)));
    code.extend_from_slice(&[0xBA, 20, 0, 0, 0]); // mov edx, 20
    code.extend_from_slice(&[0xB8, 1, 0, 0, 0]); // mov eax, 1 (write)
    code.extend_from_slice(&[0x0F, 0x05]); // syscall
    code.extend_from_slice(&[0xBF, 0, 0, 0, 0]); // mov edi, 0
    code.extend_from_slice(&[0xB8, 60, 0, 0, 0]); // mov eax, 60 (exit)
    code.extend_from_slice(&[0x0F, 0x05]);
    page.write(0, &code);

    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    assert_eq!(cpu.quit, 1);
    assert_eq!(cpu.gpr[RDI], 0, "guest exit status");

    let mut buf = [0u8; 20];
    let n = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut _, 20) };
    assert_eq!(n, 20);
    assert_eq!(&buf, msg.as_slice());
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

/// S2: direct links keep a hot call loop out of the dispatcher.
#[test]
fn s2_loop_reuses_translations() {
    let page = GuestPage::new(4096);
    page.write(
        0,
        &[
            0x31, 0xC0, // xor eax, eax
            0xB9, 0x40, 0x42, 0x0F, 0x00, // mov ecx, 1000000
            // loop:
            0xE8, 0x05, 0x00, 0x00, 0x00, // call f
            0xFF, 0xC9, // dec ecx
            0x75, 0xF7, // jnz loop
            0xC3, // ret
            // f:
            0x83, 0xC0, 0x01, // add eax, 1
            0xC3,
        ],
    );

    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    assert_eq!(cpu.gpr[RAX], 1_000_000);

    let stats = ctx.stats_snapshot();
    // The translator runs once per block; the miss counter must not scale
    // with the million iterations.
    assert!(
        stats.block_misses_total < 16,
        "dispatcher misses grew with iterations: {stats:?}"
    );
    assert!(stats.blocks_translated_total < 16);
}

/// S3: write-then-execute round trip with exactly one invalidation.
#[test]
fn s3_self_modifying_code_invalidates_and_reexecutes() {
    let page = GuestPage::new(8192);
    // f on its own page so the write invalidates exactly one block.
    page.write(0x1000, &[0xB8, 1, 0, 0, 0, 0xC3]); // f: mov eax, 1; ret

    let mut w = Vec::new();
    w.extend_from_slice(&[0x48, 0xB8]);
    w.extend_from_slice(&imm64(page.addr(0x1001)));
    w.extend_from_slice(&[0xC6, 0x00, 0x02]); // mov byte [rax], 2
    w.push(0xC3);
    page.write(0x80, &w);

    let mut main = Vec::new();
    main.extend_from_slice(&[0xE8, 0xFB, 0x0F, 0x00, 0x00]); // call f
    main.extend_from_slice(&[0x89, 0xC1]); // mov ecx, eax
    main.extend_from_slice(&[0xC1, 0xE1, 0x08]); // shl ecx, 8
    main.extend_from_slice(&[0xE8, 0x71, 0x00, 0x00, 0x00]); // call w
    main.extend_from_slice(&[0xE8, 0xEC, 0x0F, 0x00, 0x00]); // call f
    main.extend_from_slice(&[0x09, 0xC8]); // or eax, ecx
    main.push(0xC3);
    page.write(0, &main);

    let ctx = EngineContext::new(EngineConfig::default());
    let cpu = run_code(&ctx, page.addr(0));
    // First call saw 1, the re-executed code returns 2.
    assert_eq!(cpu.gpr[RAX], 0x0102);
    assert_eq!(ctx.stats_snapshot().blocks_invalidated_total, 1);
    assert!(ctx.stats_snapshot().smc_faults_total >= 1);
}

/// S4: two guest threads with thread-local counters.
#[test]
fn s4_threads_keep_tls_private() {
    let page = GuestPage::new(4096);
    page.write(
        0,
        &[
            0xB9, 0x40, 0x42, 0x0F, 0x00, // mov ecx, 1000000
            // loop:
            0x64, 0x48, 0xFF, 0x04, 0x25, 0xF8, 0xFF, 0xFF, 0xFF, // inc qword fs:[-8]
            0xFF, 0xC9, // dec ecx
            0x75, 0xF3, // jnz loop
            0x64, 0x48, 0x8B, 0x04, 0x25, 0xF8, 0xFF, 0xFF, 0xFF, // mov rax, fs:[-8]
            0xC3,
        ],
    );

    let mut template = relay_runtime::tls::TlsTemplate::default();
    template.add_module(&[0u8; 8], 8);
    let ctx = EngineContext::builder(EngineConfig::default())
        .tls_template(template)
        .build();

    let parent = GuestCpu::new();
    let t1 = relay_runtime::spawn_guest_thread(&ctx, page.addr(0), 0, 1 << 20, &parent);
    let t2 = relay_runtime::spawn_guest_thread(&ctx, page.addr(0), 0, 1 << 20, &parent);
    assert_eq!(t1.join(), 1_000_000);
    assert_eq!(t2.join(), 1_000_000);
}

/// S5 / property 6: fork diverges, child sees 0, parent sees the pid.
#[test]
fn s5_fork_parent_and_child_diverge() {
    let page = GuestPage::new(4096);
    page.write(
        0,
        &[
            0xB8, 57, 0, 0, 0, // mov eax, 57 (fork)
            0x0F, 0x05, // syscall
            0x85, 0xC0, // test eax, eax
            0x74, 0x01, // jz child
            0xC3, // parent: return pid
            // child:
            0xBF, 42, 0, 0, 0, // mov edi, 42
            0xB8, 60, 0, 0, 0, // mov eax, 60
            0x0F, 0x05, // syscall (exit 42)
        ],
    );

    let ctx = EngineContext::new(EngineConfig::default());
    let parent_pid = std::process::id();
    let cpu = run_code(&ctx, page.addr(0));
    if std::process::id() != parent_pid {
        // Forked child: its guest took the exit(42) path.
        unsafe { libc::_exit((cpu.gpr[RDI] & 0xFF) as i32) };
    }

    let child = cpu.gpr[RAX] as i32;
    assert!(child > 0);
    let mut status = 0;
    unsafe { libc::waitpid(child, &mut status, 0) };
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 42);
}

/// S6: cancellation runs the cleanup stack exactly once.
#[test]
fn s6_cancellation_runs_cleanup() {
    unsafe extern "C" fn wrap_push_cleanup(cpu: *mut GuestCpu) {
        let cpu = &mut *cpu;
        let handle = thread::current_handle().expect("guest thread");
        handle.push_cleanup(CleanupRecord {
            routine: cpu.gpr[RDI],
            arg: cpu.gpr[RSI],
        });
    }
    unsafe extern "C" fn wrap_sleep(_cpu: *mut GuestCpu) {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let page = GuestPage::new(4096);
    let ctx = EngineContext::new(EngineConfig::default());
    let push_stub = ctx.register_wrapper(wrap_push_cleanup);
    let sleep_stub = ctx.register_wrapper(wrap_sleep);

    // cleanup routine at 0x100: set the flag byte at 0x200.
    let mut cleanup = Vec::new();
    cleanup.extend_from_slice(&[0x48, 0xB8]);
    cleanup.extend_from_slice(&imm64(page.addr(0x200)));
    cleanup.extend_from_slice(&[0x80, 0x00, 0x01]); // add byte [rax], 1
    cleanup.push(0xC3);
    page.write(0x100, &cleanup);

    // thread fn: register the cleanup (RDI arrives as the thread arg),
    // then sleep forever through the bridge.
    let mut code = Vec::new();
    code.extend_from_slice(&[0x31, 0xF6]); // xor esi, esi
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(push_stub));
    code.extend_from_slice(&[0xFF, 0xD0]); // call rax
    // loop:
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&imm64(sleep_stub));
    code.extend_from_slice(&[0xFF, 0xD0]); // call rax
    code.extend_from_slice(&[0xEB, 0xF2]); // jmp loop
    page.write(0, &code);

    let parent = GuestCpu::new();
    let t = relay_runtime::spawn_guest_thread(&ctx, page.addr(0), page.addr(0x100), 1 << 20, &parent);
    std::thread::sleep(std::time::Duration::from_millis(20));
    t.handle.request_cancel();
    let status = t.join();
    assert_eq!(status, relay_runtime::CANCELED);
    // The cleanup ran exactly once.
    assert_eq!(unsafe { page.base.add(0x200).read() }, 1);
}
