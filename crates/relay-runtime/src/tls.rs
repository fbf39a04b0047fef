//! Guest thread-local storage.
//!
//! Each guest thread gets a block cut from the process-wide master
//! template: the `__thread` images live at negative offsets below the
//! thread-control block, the TCB header holds the self pointer, the DTV,
//! and the stack canary, and the FS base in GuestCpu points at the TCB so
//! segment-relative guest accesses resolve directly.

use std::alloc::{alloc_zeroed, dealloc, Layout};

/// Blocks are padded out to a 64 KiB boundary.
pub const TLS_ALIGN: usize = 64 * 1024;
/// Reserved thread-control-block bytes at offset zero.
pub const TCB_SIZE: usize = 0x100;
/// Stack-protector canary lives at this fixed TCB offset.
pub const CANARY_OFFSET: usize = 0x28;

/// Process-wide master template: the initial bytes of every `__thread`
/// area, plus per-module offsets for the dynamic thread vector.
#[derive(Debug, Default, Clone)]
pub struct TlsTemplate {
    /// Initialization image, laid out exactly as it sits below the TCB.
    pub image: Vec<u8>,
    /// Per-module offsets (from the TCB, negative direction) for DTV
    /// entries; module IDs are 1-based.
    pub module_offsets: Vec<usize>,
}

impl TlsTemplate {
    pub fn total_size(&self) -> usize {
        align_up(self.image.len(), 64) + TCB_SIZE
    }

    /// Append a module image to the template (loader interface). Returns
    /// the 1-based module id.
    ///
    /// Images pack downward from the TCB: byte `i` of the template sits at
    /// `tcb - image.len() + i`, so existing modules keep their TCB-relative
    /// positions when a new one is added below them.
    pub fn add_module(&mut self, image: &[u8], align: usize) -> usize {
        let offset = align_up(self.image.len() + image.len(), align.max(8));
        let old = std::mem::take(&mut self.image);
        let mut grown = vec![0u8; offset];
        grown[offset - old.len()..].copy_from_slice(&old);
        grown[..image.len()].copy_from_slice(image);
        self.image = grown;
        self.module_offsets.push(offset);
        self.module_offsets.len()
    }

    pub fn allocate(&self) -> TlsBlock {
        let tls_size = align_up(self.image.len(), 64);
        let total = align_up(tls_size + TCB_SIZE, TLS_ALIGN);
        let layout = Layout::from_size_align(total, TLS_ALIGN).expect("tls layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "guest TLS allocation failed");

        let tcb = unsafe { base.add(tls_size) } as u64;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.image.as_ptr(),
                (tcb as usize - self.image.len()) as *mut u8,
                self.image.len(),
            );
        }

        // Dynamic thread vector: generation counter, then one entry per
        // module pointing into this block's copy of its image.
        let mut dtv = vec![0u64; self.module_offsets.len() + 1];
        for (module, &off) in self.module_offsets.iter().enumerate() {
            dtv[module + 1] = tcb - off as u64;
        }
        let dtv = dtv.into_boxed_slice();

        unsafe {
            let header = tcb as *mut u64;
            header.write(tcb); // self pointer
            header.add(1).write(dtv.as_ptr() as u64);
            ((tcb as usize + CANARY_OFFSET) as *mut u64).write(canary_for(tcb));
        }

        TlsBlock {
            base,
            layout,
            tcb,
            _dtv: dtv,
        }
    }
}

fn canary_for(tcb: u64) -> u64 {
    // Cheap per-block value; guessing resistance is not load-bearing for
    // the translator itself.
    tcb.rotate_left(17) ^ 0xA5A5_5A5A_C3C3_3C3C
}

pub struct TlsBlock {
    base: *mut u8,
    layout: Layout,
    /// The TCB address; goes into `GuestCpu::tls` and the FS base.
    pub tcb: u64,
    _dtv: Box<[u64]>,
}

unsafe impl Send for TlsBlock {}

impl Drop for TlsBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_64k_aligned_with_header() {
        let mut template = TlsTemplate::default();
        let module = template.add_module(&[7u8; 32], 8);
        assert_eq!(module, 1);
        let block = template.allocate();
        assert_eq!(block.tcb % 64, 0);
        assert_eq!((block.base as usize) % TLS_ALIGN, 0);
        unsafe {
            assert_eq!(*(block.tcb as *const u64), block.tcb);
            let dtv = *(block.tcb as *const u64).add(1) as *const u64;
            let module1 = *dtv.add(1);
            // The module image sits below the TCB with its template bytes.
            assert!(module1 < block.tcb);
            assert_eq!(*(module1 as *const u8), 7);
            assert_ne!(*((block.tcb as usize + CANARY_OFFSET) as *const u64), 0);
        }
    }

    #[test]
    fn thread_vars_live_at_negative_offsets() {
        let mut template = TlsTemplate::default();
        template.add_module(&[1, 2, 3, 4, 5, 6, 7, 8], 8);
        let block = template.allocate();
        unsafe {
            let bytes = std::slice::from_raw_parts((block.tcb - 8) as *const u8, 8);
            assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
        }
    }
}
