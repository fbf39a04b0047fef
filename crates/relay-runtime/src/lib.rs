//! The relay64 runtime substrate: the per-thread dispatcher, the
//! guest↔host boundary bridges, the syscall contract, self-modifying-code
//! detection, host fault handling, and the thread/fork/TLS governor — all
//! owned by one long-lived [`context::EngineContext`].

pub mod bridge;
pub mod context;
pub mod dispatcher;
pub mod fallback;
pub mod fork;
pub mod helpers;
pub mod locks;
pub mod signals;
pub mod smc;
pub mod syscall;
pub mod thread;
pub mod tls;

pub use bridge::{call_guest, WrapperFn};
pub use context::{EngineConfig, EngineContext, EngineStatsSnapshot, ImageRange};
pub use fallback::FallbackInterpreter;
pub use fork::{register_atfork, AtForkRecord};
pub use syscall::{PassthroughSyscalls, SyscallDispatch};
pub use thread::{spawn_guest_thread, CleanupRecord, GuestThread, ThreadHandle, CANCELED};
