//! Guest instruction decoding, a thin wrapper over `iced_x86` that adds the
//! flag def/use sets the liveness pass consumes.

use iced_x86::{Decoder, DecoderOptions, Instruction, RflagsBits};
use thiserror::Error;

/// Architectural maximum x86 instruction length.
pub const MAX_INST_LEN: usize = 15;

/// Status-flag bit sets used by the analysis pass, one bit per guest flag.
pub const F_CF: u8 = 1 << 0;
pub const F_PF: u8 = 1 << 1;
pub const F_AF: u8 = 1 << 2;
pub const F_ZF: u8 = 1 << 3;
pub const F_SF: u8 = 1 << 4;
pub const F_OF: u8 = 1 << 5;
pub const F_ALL: u8 = 0x3F;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid instruction at {rip:#x}")]
    Invalid { rip: u64 },
}

#[derive(Debug, Clone)]
pub struct DecodedInst {
    pub instr: Instruction,
    pub rip: u64,
    pub len: u8,
}

impl DecodedInst {
    pub fn next_rip(&self) -> u64 {
        self.rip.wrapping_add(self.len as u64)
    }

    /// Guest flags this instruction may change (written, cleared, set, or
    /// left architecturally undefined — all of which kill earlier
    /// definitions).
    pub fn flag_defs(&self) -> u8 {
        map_rflags(self.instr.rflags_modified())
    }

    /// Guest flags this instruction observes.
    pub fn flag_uses(&self) -> u8 {
        map_rflags(self.instr.rflags_read())
    }
}

fn map_rflags(bits: u32) -> u8 {
    let mut out = 0;
    if bits & RflagsBits::CF != 0 {
        out |= F_CF;
    }
    if bits & RflagsBits::PF != 0 {
        out |= F_PF;
    }
    if bits & RflagsBits::AF != 0 {
        out |= F_AF;
    }
    if bits & RflagsBits::ZF != 0 {
        out |= F_ZF;
    }
    if bits & RflagsBits::SF != 0 {
        out |= F_SF;
    }
    if bits & RflagsBits::OF != 0 {
        out |= F_OF;
    }
    out
}

/// Decode one 64-bit-mode instruction from `bytes` (up to 15 bytes fetched
/// at `rip`).
pub fn decode_one(bytes: &[u8], rip: u64) -> Result<DecodedInst, DecodeError> {
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(DecodeError::Invalid { rip });
    }
    Ok(DecodedInst {
        len: instr.len() as u8,
        instr,
        rip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Mnemonic;

    #[test]
    fn decodes_simple_alu() {
        // add rax, rbx
        let di = decode_one(&[0x48, 0x01, 0xD8], 0x1000).unwrap();
        assert_eq!(di.instr.mnemonic(), Mnemonic::Add);
        assert_eq!(di.len, 3);
        assert_eq!(di.next_rip(), 0x1003);
        assert_eq!(di.flag_defs(), F_ALL);
        assert_eq!(di.flag_uses(), 0);
    }

    #[test]
    fn jcc_reads_flags() {
        // jz +0
        let di = decode_one(&[0x74, 0x00], 0x1000).unwrap();
        assert_eq!(di.flag_uses(), F_ZF);
        assert_eq!(di.flag_defs(), 0);
    }

    #[test]
    fn inc_does_not_define_carry() {
        // inc eax
        let di = decode_one(&[0xFF, 0xC0], 0x1000).unwrap();
        assert_eq!(di.flag_defs() & F_CF, 0);
        assert_ne!(di.flag_defs() & F_OF, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_one(&[0x06], 0).is_err());
    }
}
