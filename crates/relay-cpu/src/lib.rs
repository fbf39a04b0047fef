//! Guest architectural state for relay64.
//!
//! The crate API is centered around [`state::GuestCpu`], the per-guest-thread
//! register file shared by:
//! - the translator (`relay-jit`), whose generated code addresses fields
//!   through the `state::offsets` constants
//! - the runtime (`relay-runtime`), which owns dispatch, bridges, and signals
//!
//! `GuestCpu` is `#[repr(C)]`: generated host code reads and writes it with
//! fixed offsets, so field order is ABI.

pub mod flags;
pub mod fpu;
pub mod state;

pub use flags::{DefKind, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
pub use state::{GuestCpu, Segment};

/// Fork request kinds carried in [`GuestCpu::fork_request`].
pub const FORK_NONE: u32 = 0;
pub const FORK_PLAIN: u32 = 1;
pub const FORK_PTY: u32 = 2;
pub const FORK_WAITED: u32 = 3;
