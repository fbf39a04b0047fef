//! The syscall boundary.
//!
//! The guest syscall-table translator proper is an external collaborator;
//! [`SyscallDispatch`] is the contract it plugs into. The in-tree
//! [`PassthroughSyscalls`] forwards the common Linux calls so end-to-end
//! scenarios run without the external table, and reroutes the calls the
//! core must own: `exit` becomes a `quit` request and `fork`/`vfork`
//! become deferred-fork requests handled by the governor once the thread
//! is back out of translated code.

use relay_cpu::state::{RAX, RDI, RDX, RSI, R10, R8, R9};
use relay_cpu::{GuestCpu, FORK_PLAIN, FORK_WAITED};

use crate::context::EngineContext;

pub trait SyscallDispatch: Send + Sync {
    /// Handle the syscall described by the (fully spilled) guest state:
    /// number in RAX, arguments in RDI/RSI/RDX/R10/R8/R9, result written
    /// to RAX.
    fn dispatch(&self, ctx: &EngineContext, cpu: &mut GuestCpu);
}

const SYS_EXIT: u64 = 60;
const SYS_EXIT_GROUP: u64 = 231;
const SYS_FORK: u64 = 57;
const SYS_VFORK: u64 = 58;

pub struct PassthroughSyscalls;

impl SyscallDispatch for PassthroughSyscalls {
    fn dispatch(&self, _ctx: &EngineContext, cpu: &mut GuestCpu) {
        let nr = cpu.gpr[RAX];
        match nr {
            SYS_EXIT | SYS_EXIT_GROUP => {
                // Leave the dispatcher loop; the exit status stays in RDI.
                cpu.quit = 1;
            }
            SYS_FORK => {
                cpu.fork_request = FORK_PLAIN;
                cpu.quit = 1;
            }
            SYS_VFORK => {
                cpu.fork_request = FORK_WAITED;
                cpu.quit = 1;
            }
            _ => {
                let ret = unsafe {
                    libc::syscall(
                        nr as libc::c_long,
                        cpu.gpr[RDI],
                        cpu.gpr[RSI],
                        cpu.gpr[RDX],
                        cpu.gpr[R10],
                        cpu.gpr[R8],
                        cpu.gpr[R9],
                    )
                };
                cpu.gpr[RAX] = if ret == -1 {
                    -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
                        as i64 as u64
                } else {
                    ret as u64
                };
            }
        }
        tracing::trace!(nr, rax = cpu.gpr[RAX], "guest syscall");
    }
}
