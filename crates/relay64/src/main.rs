//! relay64: run x86_64 Linux programs on an AArch64 host by translating
//! guest code to native blocks on demand.

mod config;
mod image;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use relay_cpu::state::{RDI, RSI, RSP};
use relay_cpu::{GuestCpu, Segment};
use relay_runtime::{dispatcher, EngineContext};

#[derive(Parser, Debug)]
#[command(name = "relay64", about = "x86_64-on-AArch64 user-mode translator")]
struct Args {
    /// Guest image (raw x86_64 code; ELF loading is provided by the
    /// external loader).
    image: PathBuf,

    /// Entry offset into a raw image, in hex.
    #[arg(long, default_value = "0", value_parser = parse_hex)]
    raw_entry: u64,

    /// Guest stack size in bytes.
    #[arg(long, default_value_t = 8 << 20)]
    stack_size: usize,

    /// Arguments passed through to the guest.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn main() -> Result<()> {
    config::init_tracing();
    let args = Args::parse();

    let engine_config = config::engine_config_from_env();
    if !engine_config.dynarec {
        tracing::warn!("RELAY64_DYNAREC=0: recompiler disabled, fallback-only execution");
    }
    let ctx = EngineContext::new(engine_config);

    let image = image::LoadedImage::load_raw(&args.image, args.raw_entry)?;
    image.register(&ctx, &args.image.display().to_string());
    tracing::info!(
        base = format_args!("{:#x}", image.base()),
        entry = format_args!("{:#x}", image.entry),
        "guest image mapped"
    );

    let mut cpu = GuestCpu::new();
    let tls = ctx.allocate_tls();
    cpu.tls = tls.tcb;
    cpu.set_seg_base(Segment::FS, tls.tcb);

    // Guest stack with the SysV process-entry layout: argc, argv, NULL,
    // envp NULL, auxv AT_NULL.
    let stack = GuestStack::new(args.stack_size)?;
    let mut argv_ptrs: Vec<u64> = Vec::new();
    let mut strings = stack.top();
    let mut push_string = |s: &str| -> u64 {
        strings -= s.len() as u64 + 1;
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), strings as *mut u8, s.len());
            (strings as *mut u8).add(s.len()).write(0);
        }
        strings
    };
    argv_ptrs.push(push_string(&args.image.display().to_string()));
    for arg in &args.guest_args {
        argv_ptrs.push(push_string(arg));
    }

    let mut sp = strings & !0xF;
    let mut push = |v: u64| {
        sp -= 8;
        unsafe { (sp as *mut u64).write(v) };
    };
    push(0); // AT_NULL
    push(0);
    push(0); // envp terminator
    push(0); // argv terminator
    for &p in argv_ptrs.iter().rev() {
        push(p);
    }
    push(argv_ptrs.len() as u64); // argc
    cpu.gpr[RSP] = sp;
    cpu.gpr[RDI] = argv_ptrs.len() as u64;
    cpu.gpr[RSI] = sp + 8;
    cpu.rip = image.entry;

    dispatcher::run(&ctx, &mut cpu);

    let status = (cpu.gpr[RDI] & 0xFF) as i32;
    tracing::info!(status, stats = ?ctx.stats_snapshot(), "guest exited");
    std::process::exit(status);
}

struct GuestStack {
    base: *mut u8,
    len: usize,
}

impl GuestStack {
    fn new(len: usize) -> Result<Self> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        anyhow::ensure!(base != libc::MAP_FAILED, "mapping guest stack failed");
        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }

    fn top(&self) -> u64 {
        self.base as u64 + self.len as u64
    }
}

impl Drop for GuestStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, self.len);
        }
    }
}
