//! x64 backend: a pragmatic 64-bit-mode instruction subset.

mod rex;

pub mod regs;

use self::rex::{gpr_enc, modrm, put_op_reg_mem, put_op_reg_reg, put_rex};
use super::{ArchFuncs, EncodeCtx};
use crate::buffer::CodeBuffer;
use crate::env::Arch;
use crate::error::{Error, Result};
use crate::inst::{EncodingOptions, Inst, InstId, InstOptions, ValidationFlags};
use crate::label::{Label, LabelUse};
use crate::operand::{Mem, Operand, Reg, RegClass, RegSize};

pub(crate) static FUNCS: ArchFuncs = ArchFuncs {
    arch: Arch::X64,
    validate,
    encode,
    nop_fill,
};

/// Multi-byte NOP encodings, indexed by length - 1.
///
/// These are the `0F 1F` long-NOP forms recommended for alignment padding;
/// longer runs are emitted as a sequence of 9-byte NOPs plus one remainder.
static NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

fn nop_fill(buf: &mut CodeBuffer, count: u32, optimized: bool) -> Result<()> {
    if !optimized {
        buf.fill(0x90, count as usize);
        return Ok(());
    }
    let mut remaining = count as usize;
    while remaining > 0 {
        let len = remaining.min(NOPS.len());
        buf.put_bytes(NOPS[len - 1]);
        remaining -= len;
    }
    Ok(())
}

/// ModR/M `reg` extension digits for the `81/83` immediate-arith group.
fn arith_ext(id: InstId) -> u8 {
    match id {
        InstId::Add => 0,
        InstId::Or => 1,
        InstId::And => 4,
        InstId::Sub => 5,
        InstId::Xor => 6,
        InstId::Cmp => 7,
        _ => unreachable!(),
    }
}

/// `r/m, r` opcode for the arith group; the `r, r/m` form is `+ 2`.
fn arith_opcode(id: InstId) -> u8 {
    match id {
        InstId::Add => 0x01,
        InstId::Or => 0x09,
        InstId::And => 0x21,
        InstId::Sub => 0x29,
        InstId::Xor => 0x31,
        InstId::Cmp => 0x39,
        _ => unreachable!(),
    }
}

/// `0F 8x` condition nibbles.
fn cond_code(id: InstId) -> u8 {
    match id {
        InstId::Je => 0x84,
        InstId::Jne => 0x85,
        InstId::Jl => 0x8C,
        InstId::Jge => 0x8D,
        InstId::Jle => 0x8E,
        InstId::Jg => 0x8F,
        _ => unreachable!(),
    }
}

fn is_w(reg: Reg) -> bool {
    reg.size() == RegSize::Size64
}

fn same_size(a: Reg, b: Reg) -> Result<()> {
    if a.size() == b.size() {
        Ok(())
    } else {
        Err(Error::OperandSizeMismatch)
    }
}

fn imm32(v: i64) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::InvalidOperand)
}

/// Emit `[rex] opcode modrm` with a RIP-relative r/m slot referencing
/// `label`, recording the 32-bit displacement as a patch site.
fn op_reg_label(
    ctx: &mut EncodeCtx<'_>,
    w: bool,
    opcode: &[u8],
    reg_g: u8,
    label: Label,
) -> Result<()> {
    let buf = ctx.buffer();
    put_rex(buf, w, reg_g, 0, 0);
    buf.put_bytes(opcode);
    buf.put1(modrm(0b00, reg_g, 0b101));
    let at = ctx.offset();
    ctx.buffer().put4(0);
    ctx.use_label(label, at, LabelUse::Rel32)
}

fn encode_arith(ctx: &mut EncodeCtx<'_>, inst: &Inst, ops: &[Operand]) -> Result<()> {
    let id = inst.id;
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            same_size(*dst, *src)?;
            let (d, s) = (gpr_enc(*dst)?, gpr_enc(*src)?);
            put_op_reg_reg(ctx.buffer(), is_w(*dst), &[arith_opcode(id)], s, d);
            Ok(())
        }
        [Operand::Reg(dst), Operand::Imm(v)] => {
            let d = gpr_enc(*dst)?;
            let v = imm32(*v)?;
            let buf = ctx.buffer();
            put_rex(buf, is_w(*dst), 0, 0, d);
            if let Ok(b) = i8::try_from(v) {
                buf.put1(0x83);
                buf.put1(modrm(0b11, arith_ext(id), d));
                #[allow(clippy::cast_sign_loss)]
                buf.put1(b as u8);
            } else {
                buf.put1(0x81);
                buf.put1(modrm(0b11, arith_ext(id), d));
                #[allow(clippy::cast_sign_loss)]
                buf.put4(v as u32);
            }
            Ok(())
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            let d = gpr_enc(*dst)?;
            let opcode = arith_opcode(id) + 2;
            match mem.label {
                Some(label) => op_reg_label(ctx, is_w(*dst), &[opcode], d, label),
                None => put_op_reg_mem(ctx.buffer(), is_w(*dst), &[opcode], d, mem),
            }
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            let s = gpr_enc(*src)?;
            let opcode = arith_opcode(id);
            match mem.label {
                Some(label) => op_reg_label(ctx, is_w(*src), &[opcode], s, label),
                None => put_op_reg_mem(ctx.buffer(), is_w(*src), &[opcode], s, mem),
            }
        }
        _ => Err(Error::InvalidOperand),
    }
}

fn encode_mov(ctx: &mut EncodeCtx<'_>, ops: &[Operand]) -> Result<()> {
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            same_size(*dst, *src)?;
            let (d, s) = (gpr_enc(*dst)?, gpr_enc(*src)?);
            put_op_reg_reg(ctx.buffer(), is_w(*dst), &[0x89], s, d);
            Ok(())
        }
        [Operand::Reg(dst), Operand::Imm(v)] => {
            let d = gpr_enc(*dst)?;
            let buf = ctx.buffer();
            #[allow(clippy::cast_sign_loss)]
            match (dst.size(), i32::try_from(*v)) {
                (RegSize::Size64, Ok(v)) => {
                    // Sign-extended imm32 form.
                    put_rex(buf, true, 0, 0, d);
                    buf.put1(0xC7);
                    buf.put1(modrm(0b11, 0, d));
                    buf.put4(v as u32);
                }
                (RegSize::Size64, Err(_)) => {
                    // movabs.
                    put_rex(buf, true, 0, 0, d);
                    buf.put1(0xB8 | (d & 7));
                    buf.put8(*v as u64);
                }
                (RegSize::Size32, _) => {
                    let bits = match i32::try_from(*v) {
                        Ok(v) => v as u32,
                        Err(_) => u32::try_from(*v).map_err(|_| Error::InvalidOperand)?,
                    };
                    put_rex(buf, false, 0, 0, d);
                    buf.put1(0xB8 | (d & 7));
                    buf.put4(bits);
                }
            }
            Ok(())
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            let d = gpr_enc(*dst)?;
            match mem.label {
                Some(label) => op_reg_label(ctx, is_w(*dst), &[0x8B], d, label),
                None => put_op_reg_mem(ctx.buffer(), is_w(*dst), &[0x8B], d, mem),
            }
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            let s = gpr_enc(*src)?;
            match mem.label {
                Some(label) => op_reg_label(ctx, is_w(*src), &[0x89], s, label),
                None => put_op_reg_mem(ctx.buffer(), is_w(*src), &[0x89], s, mem),
            }
        }
        [Operand::Mem(mem), Operand::Imm(v)] => {
            if mem.label.is_some() {
                // An imm32 after the displacement would skew rip-relative
                // patch math; stage the address through a register instead.
                return Err(Error::InvalidOperand);
            }
            let v = imm32(*v)?;
            put_op_reg_mem(ctx.buffer(), true, &[0xC7], 0, mem)?;
            #[allow(clippy::cast_sign_loss)]
            ctx.buffer().put4(v as u32);
            Ok(())
        }
        _ => Err(Error::InvalidOperand),
    }
}

fn encode_branch(ctx: &mut EncodeCtx<'_>, inst: &Inst, ops: &[Operand]) -> Result<()> {
    match (inst.id, ops) {
        (InstId::Jmp, [Operand::Label(label)]) => {
            let short = inst.options.contains(InstOptions::SHORT_FORM)
                || (ctx.encoding_options.contains(EncodingOptions::OPTIMIZE_FOR_SIZE)
                    && ctx.label_bound_here(*label).is_some_and(|target| {
                        let disp = i64::from(target) - (i64::from(ctx.offset()) + 2);
                        LabelUse::Rel8.fits(disp)
                    }));
            if short {
                ctx.buffer().put1(0xEB);
                let at = ctx.offset();
                ctx.buffer().put1(0);
                ctx.use_label(*label, at, LabelUse::Rel8)
            } else {
                ctx.buffer().put1(0xE9);
                let at = ctx.offset();
                ctx.buffer().put4(0);
                ctx.use_label(*label, at, LabelUse::Rel32)
            }
        }
        (InstId::Jmp, [Operand::Reg(r)]) => {
            let e = gpr_enc(*r)?;
            let buf = ctx.buffer();
            put_rex(buf, false, 0, 0, e);
            buf.put1(0xFF);
            buf.put1(modrm(0b11, 4, e));
            Ok(())
        }
        (InstId::Call, [Operand::Label(label)]) => {
            ctx.buffer().put1(0xE8);
            let at = ctx.offset();
            ctx.buffer().put4(0);
            ctx.use_label(*label, at, LabelUse::Rel32)
        }
        (InstId::Call, [Operand::Reg(r)]) => {
            let e = gpr_enc(*r)?;
            let buf = ctx.buffer();
            put_rex(buf, false, 0, 0, e);
            buf.put1(0xFF);
            buf.put1(modrm(0b11, 2, e));
            Ok(())
        }
        (id, [Operand::Label(label)]) => {
            // Conditional branches. Branch hints are legacy segment
            // prefixes, encoded only when the holder opts in.
            if ctx.encoding_options.contains(EncodingOptions::PREDICTED_JUMPS) {
                if inst.options.contains(InstOptions::PREDICT_TAKEN) {
                    ctx.buffer().put1(0x3E);
                } else if inst.options.contains(InstOptions::PREDICT_NOT_TAKEN) {
                    ctx.buffer().put1(0x2E);
                }
            }
            let buf = ctx.buffer();
            buf.put1(0x0F);
            buf.put1(cond_code(id));
            let at = ctx.offset();
            ctx.buffer().put4(0);
            ctx.use_label(*label, at, LabelUse::Rel32)
        }
        _ => Err(Error::InvalidOperand),
    }
}

fn encode(ctx: &mut EncodeCtx<'_>, inst: &Inst, ops: &[Operand]) -> Result<()> {
    if !inst.id.is_supported_on(Arch::X64) {
        return Err(Error::InvalidInstruction);
    }

    {
        let buf = ctx.buffer();
        if inst.options.contains(InstOptions::LOCK) {
            buf.put1(0xF0);
        }
        if inst.options.contains(InstOptions::REP) {
            buf.put1(0xF3);
        }
        if inst.options.contains(InstOptions::REPNE) {
            buf.put1(0xF2);
        }
    }

    match inst.id {
        InstId::Add | InstId::Sub | InstId::And | InstId::Or | InstId::Xor | InstId::Cmp => {
            encode_arith(ctx, inst, ops)
        }
        InstId::Mov => encode_mov(ctx, ops),
        InstId::Jmp | InstId::Call | InstId::Je | InstId::Jne | InstId::Jl | InstId::Jle
        | InstId::Jg | InstId::Jge => encode_branch(ctx, inst, ops),
        InstId::Test => match ops {
            [Operand::Reg(dst), Operand::Reg(src)] => {
                same_size(*dst, *src)?;
                let (d, s) = (gpr_enc(*dst)?, gpr_enc(*src)?);
                put_op_reg_reg(ctx.buffer(), is_w(*dst), &[0x85], s, d);
                Ok(())
            }
            [Operand::Reg(dst), Operand::Imm(v)] => {
                let d = gpr_enc(*dst)?;
                let v = imm32(*v)?;
                let buf = ctx.buffer();
                put_rex(buf, is_w(*dst), 0, 0, d);
                buf.put1(0xF7);
                buf.put1(modrm(0b11, 0, d));
                #[allow(clippy::cast_sign_loss)]
                buf.put4(v as u32);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Lea => match ops {
            [Operand::Reg(dst), Operand::Mem(mem)] => {
                let d = gpr_enc(*dst)?;
                match mem.label {
                    Some(label) => op_reg_label(ctx, is_w(*dst), &[0x8D], d, label),
                    None => put_op_reg_mem(ctx.buffer(), is_w(*dst), &[0x8D], d, mem),
                }
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Inc | InstId::Dec => match ops {
            [Operand::Reg(r)] => {
                let e = gpr_enc(*r)?;
                let ext = u8::from(inst.id == InstId::Dec);
                let buf = ctx.buffer();
                put_rex(buf, is_w(*r), 0, 0, e);
                buf.put1(0xFF);
                buf.put1(modrm(0b11, ext, e));
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Push | InstId::Pop => match ops {
            [Operand::Reg(r)] => {
                if r.size() != RegSize::Size64 {
                    return Err(Error::InvalidOperand);
                }
                let e = gpr_enc(*r)?;
                let base = if inst.id == InstId::Push { 0x50 } else { 0x58 };
                let buf = ctx.buffer();
                put_rex(buf, false, 0, 0, e);
                buf.put1(base | (e & 7));
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Movs => match ops {
            [] => {
                ctx.buffer().put1(0xA4);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Ret => match ops {
            [] => {
                ctx.buffer().put1(0xC3);
                Ok(())
            }
            [Operand::Imm(v)] => {
                let v = u16::try_from(*v).map_err(|_| Error::InvalidOperand)?;
                let buf = ctx.buffer();
                buf.put1(0xC2);
                buf.put2(v);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Nop => match ops {
            [] => {
                ctx.buffer().put1(0x90);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Int3 => match ops {
            [] => {
                ctx.buffer().put1(0xCC);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Ud2 => match ops {
            [] => {
                let buf = ctx.buffer();
                buf.put1(0x0F);
                buf.put1(0x0B);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        _ => Err(Error::InvalidInstruction),
    }
}

// ---------------------------------------------------------------------
// Validation

fn check_reg(reg: Reg, flags: ValidationFlags) -> Result<()> {
    if reg.class() != RegClass::Gpr {
        return Err(Error::InvalidOperand);
    }
    if reg.is_virtual() && !flags.contains(ValidationFlags::VIRT_REGS) {
        return Err(Error::InvalidOperand);
    }
    Ok(())
}

fn check_mem(mem: &Mem, flags: ValidationFlags) -> Result<()> {
    if mem.label.is_some() {
        if mem.base.is_some() || mem.index.is_some() {
            return Err(Error::InvalidOperand);
        }
        return Ok(());
    }
    let base = mem.base.ok_or(Error::InvalidOperand)?;
    check_reg(base, flags)?;
    if base.size() != RegSize::Size64 {
        return Err(Error::InvalidOperand);
    }
    if let Some(index) = mem.index {
        check_reg(index, flags)?;
        if index.size() != RegSize::Size64 || mem.shift > 3 {
            return Err(Error::InvalidOperand);
        }
    }
    Ok(())
}

fn validate(inst: &Inst, ops: &[Operand], flags: ValidationFlags) -> Result<()> {
    if !inst.id.is_supported_on(Arch::X64) {
        return Err(Error::InvalidInstruction);
    }
    if let Some(extra) = inst.extra_reg {
        if extra.class() != RegClass::Mask {
            return Err(Error::InvalidOperand);
        }
    }
    // rep/repne only decorate string moves; lock needs a memory destination.
    if inst.options.intersects(InstOptions::REP | InstOptions::REPNE)
        && inst.id != InstId::Movs
    {
        return Err(Error::InvalidInstruction);
    }
    if inst.options.contains(InstOptions::LOCK)
        && !matches!(ops.first(), Some(Operand::Mem(_)))
    {
        return Err(Error::InvalidInstruction);
    }

    for op in ops {
        match op {
            Operand::None => return Err(Error::InvalidOperand),
            Operand::Reg(r) => check_reg(*r, flags)?,
            Operand::Mem(m) => check_mem(m, flags)?,
            Operand::Imm(_) | Operand::Label(_) => {}
        }
    }

    match inst.id {
        InstId::Add | InstId::Sub | InstId::And | InstId::Or | InstId::Xor | InstId::Cmp => {
            match ops {
                [Operand::Reg(a), Operand::Reg(b)] => {
                    if a.size() != b.size() {
                        return Err(Error::OperandSizeMismatch);
                    }
                    Ok(())
                }
                [Operand::Reg(_), Operand::Imm(v)] => {
                    imm32(*v).map(|_| ())
                }
                [Operand::Reg(_), Operand::Mem(_)] | [Operand::Mem(_), Operand::Reg(_)] => Ok(()),
                _ => Err(Error::InvalidOperand),
            }
        }
        InstId::Mov => match ops {
            [Operand::Reg(a), Operand::Reg(b)] => {
                if a.size() != b.size() {
                    return Err(Error::OperandSizeMismatch);
                }
                Ok(())
            }
            [Operand::Reg(_), Operand::Imm(_)]
            | [Operand::Reg(_), Operand::Mem(_)]
            | [Operand::Mem(_), Operand::Reg(_)] => Ok(()),
            [Operand::Mem(m), Operand::Imm(v)] if m.label.is_none() => imm32(*v).map(|_| ()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Test => match ops {
            [Operand::Reg(a), Operand::Reg(b)] => {
                if a.size() != b.size() {
                    return Err(Error::OperandSizeMismatch);
                }
                Ok(())
            }
            [Operand::Reg(_), Operand::Imm(v)] => imm32(*v).map(|_| ()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Lea => match ops {
            [Operand::Reg(_), Operand::Mem(_)] => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Inc | InstId::Dec => match ops {
            [Operand::Reg(_)] => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Push | InstId::Pop => match ops {
            [Operand::Reg(r)] if r.size() == RegSize::Size64 => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Jmp | InstId::Call => match ops {
            [Operand::Label(_) | Operand::Reg(_)] => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Je | InstId::Jne | InstId::Jl | InstId::Jle | InstId::Jg | InstId::Jge => {
            match ops {
                [Operand::Label(_)] => Ok(()),
                _ => Err(Error::InvalidOperand),
            }
        }
        InstId::Ret => match ops {
            [] => Ok(()),
            [Operand::Imm(v)] if u16::try_from(*v).is_ok() => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Movs | InstId::Nop | InstId::Int3 | InstId::Ud2 => {
            if ops.is_empty() {
                Ok(())
            } else {
                Err(Error::InvalidOperand)
            }
        }
        _ => Err(Error::InvalidInstruction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_fill_lengths() {
        for optimized in [false, true] {
            for len in 0..40u32 {
                let mut buf = CodeBuffer::new();
                nop_fill(&mut buf, len, optimized).unwrap();
                assert_eq!(buf.len(), len);
            }
        }
    }

    #[test]
    fn nop_fill_unoptimized_is_90s() {
        let mut buf = CodeBuffer::new();
        nop_fill(&mut buf, 5, false).unwrap();
        assert_eq!(buf.data(), &[0x90; 5]);
    }

    #[test]
    fn validate_rejects_size_mismatch() {
        let inst = Inst::new(InstId::Add);
        let ops = [Operand::Reg(Reg::gpr64(0)), Operand::Reg(Reg::gpr32(1))];
        assert_eq!(
            validate(&inst, &ops, ValidationFlags::empty()),
            Err(Error::OperandSizeMismatch)
        );
    }

    #[test]
    fn validate_rejects_virtual_regs_unless_allowed() {
        let inst = Inst::new(InstId::Inc);
        let ops = [Operand::Reg(Reg::gpr64(Reg::VIRT_BASE))];
        assert_eq!(
            validate(&inst, &ops, ValidationFlags::empty()),
            Err(Error::InvalidOperand)
        );
        assert_eq!(validate(&inst, &ops, ValidationFlags::VIRT_REGS), Ok(()));
    }

    #[test]
    fn validate_rejects_rep_on_non_string_inst() {
        let inst = Inst::with_options(InstId::Add, InstOptions::REP);
        let ops = [Operand::Reg(Reg::gpr64(0)), Operand::Reg(Reg::gpr64(1))];
        assert_eq!(
            validate(&inst, &ops, ValidationFlags::empty()),
            Err(Error::InvalidInstruction)
        );
    }

    #[test]
    fn validate_rejects_aarch64_only_ids() {
        let inst = Inst::new(InstId::Ldr);
        assert_eq!(
            validate(&inst, &[], ValidationFlags::empty()),
            Err(Error::InvalidInstruction)
        );
    }
}
