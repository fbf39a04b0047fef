//! Flat raw-image loading.
//!
//! The ELF loader proper is an external collaborator; its contract toward
//! the core is only that guest code is mapped readable at its
//! guest-visible addresses before the dispatcher runs. This loader
//! satisfies that contract for raw x86_64 code images, which is enough to
//! drive the engine end-to-end from the command line.

use std::path::Path;

use anyhow::{Context, Result};
use relay_runtime::{EngineContext, ImageRange};

pub struct LoadedImage {
    base: *mut u8,
    len: usize,
    pub entry: u64,
}

impl LoadedImage {
    /// Map a raw image into anonymous memory and return its guest-visible
    /// placement. `entry_offset` is relative to the image start.
    pub fn load_raw(path: &Path, entry_offset: u64) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading guest image {}", path.display()))?;
        anyhow::ensure!(!bytes.is_empty(), "guest image is empty");
        anyhow::ensure!(
            entry_offset < bytes.len() as u64,
            "entry offset {entry_offset:#x} outside the image"
        );

        let len = (bytes.len() + 0xFFF) & !0xFFF;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        anyhow::ensure!(base != libc::MAP_FAILED, "mapping guest image failed");
        let base = base as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, bytes.len());
        }
        Ok(Self {
            base,
            len,
            entry: base as u64 + entry_offset,
        })
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn register(&self, ctx: &EngineContext, name: &str) {
        ctx.register_image(ImageRange {
            name: name.to_owned(),
            base: self.base(),
            len: self.len as u64,
        });
    }
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, self.len);
        }
    }
}
