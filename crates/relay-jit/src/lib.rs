//! The relay64 translator: turns runs of guest x86_64 instructions into
//! A64 blocks on demand.
//!
//! The pipeline is four passes over one entry address:
//! - pass 0 (`block`): decode and classify a maximal straight-line run
//! - pass 1 (`liveness`): flag liveness, label table, SIMD cache slots
//! - pass 2 (`lower` + counting sink): exact host sizes per instruction
//! - pass 3 (`lower` + writing sink): emission, literal pool, publication
//!
//! Sizing and emission share their expansion code through the
//! [`sink::CodeSink`] abstraction, so they agree byte-exactly by
//! construction.

pub mod a64;
pub mod arena;
pub mod block;
pub mod cache;
pub mod compile;
pub mod decode;
pub mod link;
pub mod liveness;
pub mod lower;
pub mod sink;
pub mod trampoline;

pub use arena::{ExecMem, ExecMemError};
pub use block::{BlockEnd, BlockIr, BlockLimits, CodeSource};
pub use cache::{AddressMap, BlockCache, CacheStats};
pub use compile::{TranslateError, TranslatedBlock, Translator};
pub use lower::{regs, HelperTable};
pub use trampoline::{EnterFn, Trampolines};
