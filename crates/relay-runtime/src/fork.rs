//! The deferred-fork protocol.
//!
//! Guest code cannot fork from inside a translated block: live guest state
//! sits in host registers and the child would inherit the block cache's
//! tables and link sites mid-mutation. The fork wrapper therefore only
//! sets `quit` + `fork_request`; the dispatcher runs this protocol once
//! the thread is back on the host side with everything spilled.

use relay_cpu::state::RAX;
use relay_cpu::{GuestCpu, FORK_PTY, FORK_WAITED};

use crate::bridge;
use crate::context::EngineContext;

/// A `pthread_atfork`-style registration: guest function pointers plus an
/// owner tag so a library unload can drop its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtForkRecord {
    pub prepare: u64,
    pub parent: u64,
    pub child: u64,
    pub owner: u64,
}

pub fn register_atfork(ctx: &EngineContext, record: AtForkRecord) {
    ctx.atfork().lock().push(record);
}

pub fn unregister_atfork_owner(ctx: &EngineContext, owner: u64) {
    ctx.atfork().lock().retain(|r| r.owner != owner);
}

/// Run the fork the guest requested. Called by the dispatcher with the
/// thread fully outside translated code.
///
/// Prepare callbacks run in reverse registration order; parent and child
/// callbacks run in registration order (the POSIX `pthread_atfork`
/// contract). Both sides resume at the same guest IP with the fork result
/// in RAX.
pub fn run_fork_protocol(ctx: &EngineContext, cpu: &mut GuestCpu) {
    let kind = cpu.fork_request;
    cpu.fork_request = 0;
    cpu.quit = 0;

    // Snapshot under the lock; registrations racing the fork latch into
    // either the pre- or post-fork world, never a torn list.
    let records: Vec<AtForkRecord> = ctx.atfork().lock().clone();

    for record in records.iter().rev() {
        if record.prepare != 0 {
            bridge::call_guest(ctx, cpu, record.prepare, &[]);
        }
    }

    let mut pty_master: libc::c_int = -1;
    let pid = if kind == FORK_PTY {
        pty_fork(&mut pty_master)
    } else {
        unsafe { libc::fork() }
    };

    match pid {
        0 => {
            // Child: locks first — the callbacks may take them.
            ctx.reinit_after_fork();
            for record in &records {
                if record.child != 0 {
                    bridge::call_guest(ctx, cpu, record.child, &[]);
                }
            }
            cpu.gpr[RAX] = 0;
        }
        pid if pid > 0 => {
            for record in &records {
                if record.parent != 0 {
                    bridge::call_guest(ctx, cpu, record.parent, &[]);
                }
            }
            if pty_master >= 0 {
                ctx.set_last_pty_master(pty_master);
            }
            if kind == FORK_WAITED {
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
            }
            cpu.gpr[RAX] = pid as u64;
        }
        _ => {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EAGAIN);
            cpu.gpr[RAX] = -(errno as i64) as u64;
        }
    }
    tracing::debug!(kind, pid, "deferred fork completed");
}

/// Fork with a fresh pseudo-terminal as the child's controlling tty,
/// built from `posix_openpt` so no extra library is needed.
fn pty_fork(master_out: &mut libc::c_int) -> libc::pid_t {
    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        if master < 0 {
            return -1;
        }
        if libc::grantpt(master) != 0 || libc::unlockpt(master) != 0 {
            libc::close(master);
            return -1;
        }
        let slave_name = libc::ptsname(master);
        if slave_name.is_null() {
            libc::close(master);
            return -1;
        }
        let slave = libc::open(slave_name, libc::O_RDWR);
        if slave < 0 {
            libc::close(master);
            return -1;
        }

        let pid = libc::fork();
        if pid == 0 {
            libc::close(master);
            libc::setsid();
            libc::ioctl(slave, libc::TIOCSCTTY as _, 0);
            libc::dup2(slave, 0);
            libc::dup2(slave, 1);
            libc::dup2(slave, 2);
            if slave > 2 {
                libc::close(slave);
            }
        } else {
            libc::close(slave);
            *master_out = master;
        }
        pid
    }
}
