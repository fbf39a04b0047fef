//! Self-modifying-code detection.
//!
//! Pages a translated block reads are write-protected in the host's view.
//! A guest write to such a page faults; the handler invalidates every
//! block whose source range intersects the page, lifts the protection so
//! the write proceeds, and marks the page dirty — blocks compiled from a
//! dirty page carry `always_verify` and re-hash their source bytes on
//! each dispatcher entry.

use std::collections::HashMap;

use relay_jit::cache::BlockCache;

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Write-protected; a write will fault into the SMC path.
    Protected,
    /// Observed writable; future blocks from here verify on entry.
    Dirty,
}

#[derive(Debug, Default)]
pub struct SmcPages {
    pages: HashMap<u64, PageState>,
    /// Toggled off in tests and on hosts where the fault path cannot run.
    pub protection_enabled: bool,
}

impl SmcPages {
    pub fn new(protection_enabled: bool) -> Self {
        Self {
            pages: HashMap::new(),
            protection_enabled,
        }
    }

    pub fn state(&self, addr: u64) -> Option<PageState> {
        self.pages.get(&(addr & PAGE_MASK)).copied()
    }

    /// Whether the page holding `addr` has ever been observed writable.
    pub fn is_writable(&self, addr: u64) -> bool {
        matches!(self.state(addr), Some(PageState::Dirty))
    }

    /// Record (and protect) the source pages of a newly translated block.
    /// Dirty pages stay writable.
    pub fn protect_range(&mut self, start: u64, end: u64) {
        let mut page = start & PAGE_MASK;
        while page < end {
            if !self.pages.contains_key(&page) {
                self.pages.insert(page, PageState::Protected);
                if self.protection_enabled {
                    unsafe {
                        libc::mprotect(page as *mut _, PAGE_SIZE as usize, libc::PROT_READ);
                    }
                }
            }
            page += PAGE_SIZE;
        }
    }

    /// Handle a write fault at `addr`. If the page is under SMC
    /// protection: invalidate intersecting blocks, lift the protection,
    /// and report `true` (the faulting write must be retried). Otherwise
    /// the fault is the guest's own.
    pub fn note_write_fault(&mut self, cache: &mut BlockCache, addr: u64) -> Option<usize> {
        let page = addr & PAGE_MASK;
        match self.pages.get(&page) {
            Some(PageState::Protected) => {
                let invalidated = cache.invalidate_range(page, page + PAGE_SIZE);
                self.pages.insert(page, PageState::Dirty);
                if self.protection_enabled {
                    unsafe {
                        libc::mprotect(
                            page as *mut _,
                            PAGE_SIZE as usize,
                            libc::PROT_READ | libc::PROT_WRITE,
                        );
                    }
                }
                tracing::debug!(
                    page = format_args!("{page:#x}"),
                    invalidated,
                    "code page written; blocks invalidated"
                );
                Some(invalidated)
            }
            _ => None,
        }
    }

    /// Drop protection bookkeeping (used when tearing down a context so
    /// foreign pages regain their permissions).
    pub fn unprotect_all(&mut self) {
        if self.protection_enabled {
            for (&page, state) in &self.pages {
                if *state == PageState::Protected {
                    unsafe {
                        libc::mprotect(
                            page as *mut _,
                            PAGE_SIZE as usize,
                            libc::PROT_READ | libc::PROT_WRITE,
                        );
                    }
                }
            }
        }
        self.pages.clear();
    }
}
