//! REX prefix, ModR/M and SIB encoding helpers.

use crate::buffer::CodeBuffer;
use crate::error::{Error, Result};
use crate::operand::{Mem, Reg, RegClass};

/// A register's hardware encoding, rejecting operands that cannot reach an
/// encoder: virtual registers (the Compiler rewrites them before replay)
/// and non-GPR classes in GPR positions.
pub(super) fn gpr_enc(reg: Reg) -> Result<u8> {
    if reg.is_virtual() || reg.class() != RegClass::Gpr {
        return Err(Error::InvalidOperand);
    }
    Ok(reg.enc())
}

/// Emit a REX prefix if any of its payload bits are set (or if `w` demands
/// a 64-bit operand size).
pub(super) fn put_rex(buf: &mut CodeBuffer, w: bool, r: u8, x: u8, b: u8) {
    let rex = 0x40
        | (u8::from(w) << 3)
        | (((r >> 3) & 1) << 2)
        | (((x >> 3) & 1) << 1)
        | ((b >> 3) & 1);
    if rex != 0x40 {
        buf.put1(rex);
    }
}

/// Encode the ModR/M byte.
pub(super) fn modrm(m0d: u8, reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((reg_g & 7) << 3) | (rm_e & 7)
}

/// Encode the SIB byte (scale-index-base).
pub(super) fn sib(scale: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(scale < 4);
    ((scale & 3) << 6) | ((enc_index & 7) << 3) | (enc_base & 7)
}

/// Displacement classification for ModR/M memory forms.
#[derive(Clone, Copy)]
pub(super) enum Disp {
    None,
    Byte(i8),
    Dword(i32),
}

impl Disp {
    pub(super) fn classify(disp: i32, base_enc: u8) -> Disp {
        // rbp/r13 as base cannot use the no-displacement form; its slot in
        // the mod=00 space means rip-relative / absolute.
        if disp == 0 && (base_enc & 7) != 5 {
            Disp::None
        } else if let Ok(b) = i8::try_from(disp) {
            Disp::Byte(b)
        } else {
            Disp::Dword(disp)
        }
    }

    pub(super) fn m0d(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::Byte(_) => 0b01,
            Disp::Dword(_) => 0b10,
        }
    }

    #[allow(clippy::cast_sign_loss)]
    pub(super) fn emit(self, buf: &mut CodeBuffer) {
        match self {
            Disp::None => {}
            Disp::Byte(b) => buf.put1(b as u8),
            Disp::Dword(d) => buf.put4(d as u32),
        }
    }
}

/// Emit `[rex] opcode modrm (sib) (disp)` for a register-direct r/m operand.
pub(super) fn put_op_reg_reg(
    buf: &mut CodeBuffer,
    w: bool,
    opcode: &[u8],
    reg_g: u8,
    rm_e: u8,
) {
    put_rex(buf, w, reg_g, 0, rm_e);
    buf.put_bytes(opcode);
    buf.put1(modrm(0b11, reg_g, rm_e));
}

/// Emit `[rex] opcode modrm (sib) (disp)` for a memory r/m operand with a
/// base register (and optional index). Label-relative forms are handled by
/// the caller since they need patch-site bookkeeping.
pub(super) fn put_op_reg_mem(
    buf: &mut CodeBuffer,
    w: bool,
    opcode: &[u8],
    reg_g: u8,
    mem: &Mem,
) -> Result<()> {
    let base = mem.base.ok_or(Error::InvalidOperand)?;
    let base_enc = gpr_enc(base)?;
    match mem.index {
        None => {
            put_rex(buf, w, reg_g, 0, base_enc);
            buf.put_bytes(opcode);
            let disp = Disp::classify(mem.disp, base_enc);
            if (base_enc & 7) == 4 {
                // rsp/r12: the rm slot selects a SIB byte.
                buf.put1(modrm(disp.m0d(), reg_g, 0b100));
                buf.put1(sib(0, 0b100, base_enc));
            } else {
                buf.put1(modrm(disp.m0d(), reg_g, base_enc));
            }
            disp.emit(buf);
        }
        Some(index) => {
            let index_enc = gpr_enc(index)?;
            if (index_enc & 7) == 4 {
                // rsp cannot be an index.
                return Err(Error::InvalidOperand);
            }
            if mem.shift > 3 {
                return Err(Error::InvalidArgument);
            }
            put_rex(buf, w, reg_g, index_enc, base_enc);
            buf.put_bytes(opcode);
            let disp = Disp::classify(mem.disp, base_enc);
            buf.put1(modrm(disp.m0d(), reg_g, 0b100));
            buf.put1(sib(mem.shift, index_enc, base_enc));
            disp.emit(buf);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rex_is_elided_when_empty() {
        let mut buf = CodeBuffer::new();
        put_rex(&mut buf, false, 0, 0, 0);
        assert!(buf.is_empty());
        put_rex(&mut buf, true, 0, 0, 0);
        assert_eq!(buf.data(), &[0x48]);
    }

    #[test]
    fn rex_bits() {
        let mut buf = CodeBuffer::new();
        put_rex(&mut buf, true, 9, 10, 11);
        assert_eq!(buf.data(), &[0x4F]);
    }

    #[test]
    fn disp_classification() {
        assert!(matches!(Disp::classify(0, 0), Disp::None));
        assert!(matches!(Disp::classify(0, 5), Disp::Byte(0)));
        assert!(matches!(Disp::classify(0, 13), Disp::Byte(0)));
        assert!(matches!(Disp::classify(127, 0), Disp::Byte(127)));
        assert!(matches!(Disp::classify(128, 0), Disp::Dword(128)));
    }
}
