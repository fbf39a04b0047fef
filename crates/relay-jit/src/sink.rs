//! Code sinks: the same per-instruction expansion code runs once against
//! [`SizeSink`] (pass 2) and once against [`EmitSink`] (pass 3). Sizing and
//! emission therefore cannot drift — any layout decision is made by the
//! shared expansion, and the sinks only count or write.

use crate::a64::{self, Reg};

pub trait CodeSink {
    /// Append one A64 instruction word.
    fn put(&mut self, word: u32);

    /// Byte offset of the next instruction from the block's code start.
    fn offset(&self) -> usize;

    /// Emit `LDR rt, <literal>` referencing a 64-bit constant in the
    /// block's trailing literal pool. `value` may legitimately differ
    /// between sizing and emission (link-slot addresses are only known at
    /// emission time); only the *count* of literals must agree, so the pool
    /// is never deduplicated.
    fn ldr_lit64(&mut self, rt: Reg, value: u64);

    /// Materialize an arbitrary 64-bit immediate with a MOVZ/MOVK chain.
    /// The chain length depends only on `value`, which must be identical in
    /// both passes (use [`CodeSink::ldr_lit64`] for emission-time values).
    fn mov_imm(&mut self, rd: Reg, value: u64) {
        let mut first = true;
        for i in 0..4 {
            let chunk = ((value >> (i * 16)) & 0xFFFF) as u16;
            if chunk == 0 {
                continue;
            }
            if first {
                self.put(a64::movz(true, rd, chunk, i * 16));
                first = false;
            } else {
                self.put(a64::movk(true, rd, chunk, i * 16));
            }
        }
        if first {
            self.put(a64::movz(true, rd, 0, 0));
        }
    }
}

/// Pass-2 sink: counts code bytes and literals, emits nothing.
#[derive(Debug, Default)]
pub struct SizeSink {
    words: usize,
    lits: usize,
}

impl SizeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code_bytes(&self) -> usize {
        self.words * 4
    }

    pub fn lit_count(&self) -> usize {
        self.lits
    }

    /// Total payload bytes: code, pool alignment padding, literal pool.
    pub fn payload_bytes(&self) -> usize {
        let code = self.code_bytes();
        if self.lits == 0 {
            code
        } else {
            align8(code) + self.lits * 8
        }
    }
}

impl CodeSink for SizeSink {
    fn put(&mut self, _word: u32) {
        self.words += 1;
    }

    fn offset(&self) -> usize {
        self.words * 4
    }

    fn ldr_lit64(&mut self, _rt: Reg, _value: u64) {
        self.words += 1;
        self.lits += 1;
    }
}

/// Pass-3 sink: writes code into a buffer, accumulating the literal pool
/// that is appended by [`EmitSink::finish`]. Constructed with the code size
/// pass 2 computed, which fixes every literal's offset up front.
#[derive(Debug)]
pub struct EmitSink {
    buf: Vec<u8>,
    code_bytes: usize,
    lits: Vec<u64>,
}

impl EmitSink {
    pub fn new(code_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(code_bytes),
            code_bytes,
            lits: Vec::new(),
        }
    }

    /// Append the literal pool and return the finished payload.
    ///
    /// Panics if emission and sizing disagree on the code size; that is a
    /// translator bug, not a runtime condition.
    pub fn finish(mut self) -> Vec<u8> {
        assert_eq!(
            self.buf.len(),
            self.code_bytes,
            "emission produced a different code size than the sizing pass"
        );
        if !self.lits.is_empty() {
            while self.buf.len() < align8(self.code_bytes) {
                self.buf.extend_from_slice(&a64::nop().to_le_bytes());
            }
            for lit in &self.lits {
                self.buf.extend_from_slice(&lit.to_le_bytes());
            }
        }
        self.buf
    }
}

impl CodeSink for EmitSink {
    fn put(&mut self, word: u32) {
        self.buf.extend_from_slice(&word.to_le_bytes());
    }

    fn offset(&self) -> usize {
        self.buf.len()
    }

    fn ldr_lit64(&mut self, rt: Reg, value: u64) {
        let lit_offset = align8(self.code_bytes) + self.lits.len() * 8;
        let delta = lit_offset as i64 - self.buf.len() as i64;
        self.lits.push(value);
        let word = a64::ldr_lit(rt, delta);
        self.buf.extend_from_slice(&word.to_le_bytes());
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand<S: CodeSink>(sink: &mut S) {
        sink.mov_imm(0, 0x1234_0000_5678);
        sink.ldr_lit64(16, 0xdead_beef);
        sink.put(a64::ret());
    }

    #[test]
    fn sizing_agrees_with_emission() {
        let mut size = SizeSink::new();
        expand(&mut size);

        let mut emit = EmitSink::new(size.code_bytes());
        expand(&mut emit);
        let payload = emit.finish();

        assert_eq!(size.payload_bytes(), payload.len());
        // Literal lands 8-aligned after the code.
        let lit_off = (size.code_bytes() + 7) & !7;
        assert_eq!(
            u64::from_le_bytes(payload[lit_off..lit_off + 8].try_into().unwrap()),
            0xdead_beef
        );
    }

    #[test]
    fn mov_imm_chain_length_tracks_value() {
        let mut size = SizeSink::new();
        size.mov_imm(3, 0);
        assert_eq!(size.code_bytes(), 4);

        let mut size = SizeSink::new();
        size.mov_imm(3, u64::MAX);
        assert_eq!(size.code_bytes(), 16);
        assert_eq!(size.code_bytes() / 4, a64::mov_imm_len(u64::MAX));
    }
}
