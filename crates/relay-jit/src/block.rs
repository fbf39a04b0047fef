//! Pass 0: block discovery.
//!
//! Decodes a maximal straight-line run of guest instructions starting at the
//! entry address. Discovery stops at the first unconditional transfer out of
//! the block, at an instruction the emitter cannot expand, at the configured
//! ceiling, or before an instruction whose source page is writable (so
//! self-modifying code can never silently extend a block).

use iced_x86::FlowControl;

use crate::decode::{decode_one, DecodedInst, MAX_INST_LEN};

/// Read-side view of guest memory used during translation.
///
/// In the real process guest addresses *are* host addresses; the trait
/// exists so discovery and the signal-free parts of the pipeline can be
/// exercised against plain buffers.
pub trait CodeSource {
    /// Copy up to `buf.len()` bytes at `addr`; returns the bytes available.
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize;

    /// Whether the page containing `addr` is currently writable by the
    /// guest (i.e. not under SMC write-protection and not read-only).
    fn is_writable_page(&self, addr: u64) -> bool;

    /// If `addr` is a bridge stub, the host wrapper pointer it carries.
    fn bridge_wrapper(&self, addr: u64) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_insts: usize,
    pub max_guest_bytes: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_insts: 64,
            max_guest_bytes: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    /// Expanded by the per-family lowering tables.
    Plain,
    /// A direct call whose target is a bridge stub: expands to the inline
    /// guest→host bridge sequence and falls through on the expected
    /// post-call IP.
    BridgeCall { wrapper: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    Ret,
    IndirectJmp,
    IndirectCall,
    DirectJmp { target: u64 },
    DirectCall { target: u64, ret: u64 },
    /// The entry address itself is a bridge stub.
    Bridge { wrapper: u64 },
    /// Exit to the interpreter fallback for the instruction at `rip`.
    Unsupported { rip: u64 },
    /// Size ceiling reached; continue at `next`.
    Limit { next: u64 },
    /// Stopped before an instruction on a writable page.
    WritablePage { rip: u64 },
}

impl BlockEnd {
    /// Whether this end reason links onward via the inline lookup (as
    /// opposed to exiting through the epilog).
    pub fn links_onward(&self) -> bool {
        !matches!(self, BlockEnd::Unsupported { .. })
    }
}

#[derive(Debug, Clone)]
pub struct BlockInst {
    pub di: DecodedInst,
    pub kind: InstKind,
}

#[derive(Debug, Clone)]
pub struct BlockIr {
    pub entry: u64,
    pub insts: Vec<BlockInst>,
    pub end: BlockEnd,
    /// Guest bytes covered, inclusive of the final instruction.
    pub guest_len: u32,
    /// Any source page was writable at translation time.
    pub writable_source: bool,
}

impl BlockIr {
    pub fn end_rip(&self) -> u64 {
        self.entry + self.guest_len as u64
    }
}

const PAGE_MASK: u64 = !0xFFF;

pub fn discover<S: CodeSource>(source: &S, entry: u64, limits: BlockLimits) -> BlockIr {
    if let Some(wrapper) = source.bridge_wrapper(entry) {
        return BlockIr {
            entry,
            insts: Vec::new(),
            end: BlockEnd::Bridge { wrapper },
            guest_len: 0,
            writable_source: false,
        };
    }

    let entry_page_writable = source.is_writable_page(entry);
    let mut insts = Vec::new();
    let mut rip = entry;
    let mut buf = [0u8; MAX_INST_LEN];

    let end = loop {
        if insts.len() >= limits.max_insts
            || (rip - entry) as usize >= limits.max_guest_bytes
        {
            break BlockEnd::Limit { next: rip };
        }

        // A block beginning on a writable page is confined to that page and
        // verified on entry; one beginning on a protected page must not
        // extend onto a writable one.
        if rip != entry {
            let crossed = rip & PAGE_MASK != entry & PAGE_MASK;
            if source.is_writable_page(rip) && (!entry_page_writable || crossed) {
                break BlockEnd::WritablePage { rip };
            }
        }

        let got = source.read(rip, &mut buf);
        let di = match decode_one(&buf[..got], rip) {
            Ok(di) => di,
            Err(_) => break BlockEnd::Unsupported { rip },
        };
        let next = di.next_rip();

        // SYSCALL transfers to the kernel, not to guest code; the
        // expansion spills, calls the syscall boundary, and continues, so
        // it stays inside the block.
        if di.instr.mnemonic() == iced_x86::Mnemonic::Syscall {
            insts.push(BlockInst {
                di,
                kind: InstKind::Plain,
            });
            rip = next;
            continue;
        }

        match di.instr.flow_control() {
            FlowControl::Next | FlowControl::ConditionalBranch => {
                if !crate::lower::is_supported(&di) {
                    break BlockEnd::Unsupported { rip };
                }
                insts.push(BlockInst {
                    di,
                    kind: InstKind::Plain,
                });
                rip = next;
            }
            FlowControl::Return => {
                insts.push(BlockInst {
                    di,
                    kind: InstKind::Plain,
                });
                rip = next;
                break BlockEnd::Ret;
            }
            FlowControl::UnconditionalBranch => {
                let target = di.instr.near_branch_target();
                if target == 0 {
                    break BlockEnd::Unsupported { rip };
                }
                insts.push(BlockInst {
                    di,
                    kind: InstKind::Plain,
                });
                rip = next;
                break BlockEnd::DirectJmp { target };
            }
            FlowControl::IndirectBranch => {
                insts.push(BlockInst {
                    di,
                    kind: InstKind::Plain,
                });
                rip = next;
                break BlockEnd::IndirectJmp;
            }
            FlowControl::Call => {
                let target = di.instr.near_branch_target();
                if target == 0 {
                    break BlockEnd::Unsupported { rip };
                }
                if let Some(wrapper) = source.bridge_wrapper(target) {
                    // Wrapper call: stays inside the block.
                    insts.push(BlockInst {
                        di,
                        kind: InstKind::BridgeCall { wrapper },
                    });
                    rip = next;
                    continue;
                }
                insts.push(BlockInst {
                    di,
                    kind: InstKind::Plain,
                });
                rip = next;
                break BlockEnd::DirectCall { target, ret: next };
            }
            FlowControl::IndirectCall => {
                insts.push(BlockInst {
                    di,
                    kind: InstKind::Plain,
                });
                rip = next;
                break BlockEnd::IndirectCall;
            }
            _ => break BlockEnd::Unsupported { rip },
        }
    };

    BlockIr {
        entry,
        guest_len: (rip - entry) as u32,
        insts,
        end,
        writable_source: entry_page_writable,
    }
}
