//! aarch64 backend: binary code emission for a pragmatic subset.

pub mod regs;

use super::{ArchFuncs, EncodeCtx};
use crate::buffer::CodeBuffer;
use crate::env::Arch;
use crate::error::{Error, Result};
use crate::inst::{Inst, InstId, ValidationFlags};
use crate::label::{Label, LabelUse};
use crate::operand::{Operand, Reg, RegClass, RegSize};

pub(crate) static FUNCS: ArchFuncs = ArchFuncs {
    arch: Arch::Aarch64,
    validate,
    encode,
    nop_fill,
};

const NOP: u32 = 0xD503_201F;

fn nop_fill(buf: &mut CodeBuffer, count: u32, _optimized: bool) -> Result<()> {
    if count % 4 != 0 {
        return Err(Error::InvalidArgument);
    }
    for _ in 0..count / 4 {
        buf.put4(NOP);
    }
    Ok(())
}

fn gpr(reg: Reg) -> Result<u32> {
    if reg.is_virtual() || reg.class() != RegClass::Gpr {
        return Err(Error::InvalidOperand);
    }
    let enc = u32::from(reg.enc());
    if enc > 31 {
        return Err(Error::InvalidOperand);
    }
    Ok(enc)
}

fn same_size(a: Reg, b: Reg) -> Result<()> {
    if a.size() == b.size() {
        Ok(())
    } else {
        Err(Error::OperandSizeMismatch)
    }
}

fn is64(reg: Reg) -> bool {
    reg.size() == RegSize::Size64
}

/// Three-register ALU form: `top11 << 21 | rm << 16 | rn << 5 | rd`.
fn enc_rrr(top11: u32, rd: u32, rn: u32, rm: u32) -> u32 {
    (top11 << 21) | (rm << 16) | (rn << 5) | rd
}

/// Add/sub immediate form: `top8 << 24 | imm12 << 10 | rn << 5 | rd`.
fn enc_rr_imm12(top8: u32, rd: u32, rn: u32, imm12: u32) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (top8 << 24) | (imm12 << 10) | (rn << 5) | rd
}

fn imm12(v: i64) -> Result<u32> {
    if (0..4096).contains(&v) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(v as u32)
    } else {
        Err(Error::InvalidOperand)
    }
}

fn imm16(v: i64) -> Result<u32> {
    if (0..65536).contains(&v) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(v as u32)
    } else {
        Err(Error::InvalidOperand)
    }
}

/// `b.cond` condition fields.
fn cond_bits(id: InstId) -> u32 {
    match id {
        InstId::Je => 0b0000,  // eq
        InstId::Jne => 0b0001, // ne
        InstId::Jge => 0b1010, // ge
        InstId::Jl => 0b1011,  // lt
        InstId::Jg => 0b1100,  // gt
        InstId::Jle => 0b1101, // le
        _ => unreachable!(),
    }
}

/// Emit one word that carries a label displacement field, recording the
/// patch site.
fn put_word_with_label(
    ctx: &mut EncodeCtx<'_>,
    word: u32,
    label: Label,
    encoding: LabelUse,
) -> Result<()> {
    let at = ctx.offset();
    ctx.buffer().put4(word);
    ctx.use_label(label, at, encoding)
}

/// Pick the `sf`-dependent opcode for a three-register ALU instruction.
fn alu_top11(id: InstId, is64: bool) -> u32 {
    let base = match id {
        InstId::Add => 0b0000_1011_000,
        InstId::Sub => 0b0100_1011_000,
        InstId::And => 0b0000_1010_000,
        InstId::Or => 0b0010_1010_000,
        InstId::Xor => 0b0100_1010_000,
        _ => unreachable!(),
    };
    if is64 {
        base | 0b1000_0000_000
    } else {
        base
    }
}

fn encode_alu(ctx: &mut EncodeCtx<'_>, inst: &Inst, ops: &[Operand]) -> Result<()> {
    match ops {
        [Operand::Reg(rd), Operand::Reg(rn), Operand::Reg(rm)] => {
            same_size(*rd, *rn)?;
            same_size(*rn, *rm)?;
            let word = enc_rrr(alu_top11(inst.id, is64(*rd)), gpr(*rd)?, gpr(*rn)?, gpr(*rm)?);
            ctx.buffer().put4(word);
            Ok(())
        }
        [Operand::Reg(rd), Operand::Reg(rn), Operand::Imm(v)]
            if matches!(inst.id, InstId::Add | InstId::Sub) =>
        {
            same_size(*rd, *rn)?;
            let top8 = match (inst.id, is64(*rd)) {
                (InstId::Add, true) => 0x91,
                (InstId::Add, false) => 0x11,
                (InstId::Sub, true) => 0xD1,
                (InstId::Sub, false) => 0x51,
                _ => unreachable!(),
            };
            let word = enc_rr_imm12(top8, gpr(*rd)?, gpr(*rn)?, imm12(*v)?);
            ctx.buffer().put4(word);
            Ok(())
        }
        _ => Err(Error::InvalidOperand),
    }
}

fn encode_ldst(ctx: &mut EncodeCtx<'_>, inst: &Inst, ops: &[Operand]) -> Result<()> {
    let load = inst.id == InstId::Ldr;
    match ops {
        // Literal loads: `ldr xt, label`.
        [Operand::Reg(rt), Operand::Label(label)] if load => {
            let opc: u32 = if is64(*rt) { 0x5800_0000 } else { 0x1800_0000 };
            put_word_with_label(ctx, opc | gpr(*rt)?, *label, LabelUse::A64Ldr19)
        }
        [Operand::Reg(rt), Operand::Mem(mem)] => match (mem.label, mem.base) {
            (Some(label), None) if load => {
                let opc: u32 = if is64(*rt) { 0x5800_0000 } else { 0x1800_0000 };
                put_word_with_label(ctx, opc | gpr(*rt)?, label, LabelUse::A64Ldr19)
            }
            (None, Some(base)) => {
                if mem.index.is_some() {
                    return Err(Error::InvalidOperand);
                }
                let scale: i32 = if is64(*rt) { 8 } else { 4 };
                if mem.disp < 0 || mem.disp % scale != 0 || mem.disp / scale >= 4096 {
                    return Err(Error::InvalidOperand);
                }
                #[allow(clippy::cast_sign_loss)]
                let imm = (mem.disp / scale) as u32;
                let opc: u32 = match (load, is64(*rt)) {
                    (true, true) => 0xF940_0000,
                    (true, false) => 0xB940_0000,
                    (false, true) => 0xF900_0000,
                    (false, false) => 0xB900_0000,
                };
                let word = opc | (imm << 10) | (gpr(base)? << 5) | gpr(*rt)?;
                ctx.buffer().put4(word);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        _ => Err(Error::InvalidOperand),
    }
}

fn encode(ctx: &mut EncodeCtx<'_>, inst: &Inst, ops: &[Operand]) -> Result<()> {
    if !inst.id.is_supported_on(Arch::Aarch64) {
        return Err(Error::InvalidInstruction);
    }

    match inst.id {
        InstId::Add | InstId::Sub | InstId::And | InstId::Or | InstId::Xor => {
            encode_alu(ctx, inst, ops)
        }
        InstId::Cmp => match ops {
            // subs zr, rn, rm
            [Operand::Reg(rn), Operand::Reg(rm)] => {
                same_size(*rn, *rm)?;
                let opc: u32 = if is64(*rn) { 0xEB00_0000 } else { 0x6B00_0000 };
                let word = opc | (gpr(*rm)? << 16) | (gpr(*rn)? << 5) | 31;
                ctx.buffer().put4(word);
                Ok(())
            }
            // subs zr, rn, #imm12
            [Operand::Reg(rn), Operand::Imm(v)] => {
                let opc: u32 = if is64(*rn) { 0xF100_0000 } else { 0x7100_0000 };
                let word = opc | (imm12(*v)? << 10) | (gpr(*rn)? << 5) | 31;
                ctx.buffer().put4(word);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Test => match ops {
            // ands zr, rn, rm
            [Operand::Reg(rn), Operand::Reg(rm)] => {
                same_size(*rn, *rm)?;
                let opc: u32 = if is64(*rn) { 0xEA00_0000 } else { 0x6A00_0000 };
                let word = opc | (gpr(*rm)? << 16) | (gpr(*rn)? << 5) | 31;
                ctx.buffer().put4(word);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Mov => match ops {
            // orr rd, zr, rm
            [Operand::Reg(rd), Operand::Reg(rm)] => {
                same_size(*rd, *rm)?;
                let opc: u32 = if is64(*rd) { 0xAA00_03E0 } else { 0x2A00_03E0 };
                let word = opc | (gpr(*rm)? << 16) | gpr(*rd)?;
                ctx.buffer().put4(word);
                Ok(())
            }
            // movz rd, #imm16
            [Operand::Reg(rd), Operand::Imm(v)] => {
                let opc: u32 = if is64(*rd) { 0xD280_0000 } else { 0x5280_0000 };
                let word = opc | (imm16(*v)? << 5) | gpr(*rd)?;
                ctx.buffer().put4(word);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Ldr | InstId::Str => encode_ldst(ctx, inst, ops),
        InstId::Adr => match ops {
            [Operand::Reg(rd), Operand::Label(label)] => {
                put_word_with_label(ctx, 0x1000_0000 | gpr(*rd)?, *label, LabelUse::A64Adr21)
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Jmp => match ops {
            [Operand::Label(label)] => {
                put_word_with_label(ctx, 0x1400_0000, *label, LabelUse::A64Branch26)
            }
            [Operand::Reg(rn)] => {
                ctx.buffer().put4(0xD61F_0000 | (gpr(*rn)? << 5));
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Call => match ops {
            [Operand::Label(label)] => {
                put_word_with_label(ctx, 0x9400_0000, *label, LabelUse::A64Branch26)
            }
            [Operand::Reg(rn)] => {
                ctx.buffer().put4(0xD63F_0000 | (gpr(*rn)? << 5));
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Je | InstId::Jne | InstId::Jl | InstId::Jle | InstId::Jg | InstId::Jge => {
            match ops {
                [Operand::Label(label)] => {
                    let word = 0x5400_0000 | cond_bits(inst.id);
                    put_word_with_label(ctx, word, *label, LabelUse::A64Cond19)
                }
                _ => Err(Error::InvalidOperand),
            }
        }
        InstId::Ret => match ops {
            [] => {
                ctx.buffer().put4(0xD65F_03C0);
                Ok(())
            }
            [Operand::Reg(rn)] => {
                ctx.buffer().put4(0xD65F_0000 | (gpr(*rn)? << 5));
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Nop => match ops {
            [] => {
                ctx.buffer().put4(NOP);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Brk => match ops {
            [] => {
                ctx.buffer().put4(0xD420_0000);
                Ok(())
            }
            [Operand::Imm(v)] => {
                ctx.buffer().put4(0xD420_0000 | (imm16(*v)? << 5));
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Udf => match ops {
            [] => {
                ctx.buffer().put4(0x0000_0000);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        _ => Err(Error::InvalidInstruction),
    }
}

/// Operand validation is not yet wired for aarch64; the encoder is the only
/// checker. Kept as an explicit entry point so diagnostics options behave
/// uniformly across architectures.
fn validate(_inst: &Inst, _ops: &[Operand], _flags: ValidationFlags) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_fill_words() {
        let mut buf = CodeBuffer::new();
        nop_fill(&mut buf, 8, true).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.read_u32_at(0), NOP);
        assert_eq!(buf.read_u32_at(4), NOP);
        assert_eq!(
            nop_fill(&mut buf, 2, true),
            Err(Error::InvalidArgument),
            "code padding must be word-sized"
        );
    }

    #[test]
    fn validate_is_permissive() {
        // aarch64 validation is a stub: it accepts anything and leaves
        // rejection to the encoder.
        let inst = Inst::new(InstId::Ldr);
        assert_eq!(validate(&inst, &[], ValidationFlags::empty()), Ok(()));
    }

    #[test]
    fn imm_ranges() {
        assert!(imm12(0).is_ok());
        assert!(imm12(4095).is_ok());
        assert_eq!(imm12(4096), Err(Error::InvalidOperand));
        assert_eq!(imm12(-1), Err(Error::InvalidOperand));
        assert!(imm16(65535).is_ok());
        assert_eq!(imm16(65536), Err(Error::InvalidOperand));
    }
}
