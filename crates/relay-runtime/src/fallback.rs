//! The interpreter-fallback contract.
//!
//! The interpreter itself lives outside this crate; the recompiler only
//! requires that the two paths be interchangeable per instruction. The
//! dispatcher invokes the fallback for exactly one guest instruction when
//! a block terminates at something the emitter cannot expand, then
//! resumes translated execution.

use relay_cpu::GuestCpu;

use crate::context::EngineContext;

pub trait FallbackInterpreter: Send + Sync {
    /// Execute exactly one guest instruction at `cpu.rip`.
    ///
    /// Contract: on return, every architectural field of `GuestCpu`
    /// (registers, RIP, flags — materialized or reconstructible from the
    /// deferred scratch) must equal what the recompiled expansion of the
    /// same instruction would have produced.
    fn step(&self, ctx: &EngineContext, cpu: &mut GuestCpu);
}
