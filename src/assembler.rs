//! The direct-emission backend: encodes into the active section at once.

use crate::buffer::CodeOffset;
use crate::const_pool::ConstPool;
use crate::emitter::{AlignMode, Emitter, EmitterKind, EmitterState};
use crate::error::{Error, Result};
use crate::fmt::format_inst;
use crate::holder::CodeHolder;
use crate::inst::{EncodingOptions, Inst};
use crate::isa::EncodeCtx;
use crate::label::Label;
use crate::operand::Operand;
use crate::reloc::{RelocEntry, RelocKind, RelocTarget};
use crate::section::SectionId;

/// Emits machine code directly into a `CodeHolder` section.
///
/// Label operands referencing unbound labels reserve their displacement
/// bytes and link into the label's patch chain; binding the label patches
/// them. A failed encoding leaves the section buffer exactly as it was.
pub struct Assembler {
    state: EmitterState,
    section: SectionId,
}

impl Assembler {
    /// Create an assembler attached to `code`, targeting `.text`.
    pub fn new(code: &CodeHolder) -> Result<Self> {
        let mut asm = Self {
            state: EmitterState::new(EmitterKind::Assembler),
            section: SectionId::TEXT,
        };
        code.attach(&mut asm)?;
        Ok(asm)
    }

    /// The section instructions are currently emitted into.
    pub fn current_section(&self) -> SectionId {
        self.section
    }

    /// Current offset in the active section.
    pub fn offset(&self) -> CodeOffset {
        self.state
            .code()
            .map_or(0, |code| code.section_size(self.section).unwrap_or(0))
    }

    fn resolve_embed_size(&self, size: u8) -> Result<u8> {
        match size {
            0 => Ok(self
                .state
                .arch()
                .map_or(8, |arch| arch.pointer_width())),
            1 | 2 | 4 | 8 => Ok(size),
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl Emitter for Assembler {
    fn state(&self) -> &EmitterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        &mut self.state
    }

    fn emit_impl(&mut self, inst: &Inst, ops: &[Operand], comment: Option<&str>) -> Result<()> {
        let code = self.holder()?;
        let funcs = self.state.funcs().expect("attached emitter has arch funcs");
        {
            let mut inner = code.borrow_mut();
            inner.section_ok(self.section)?;
            let start = inner.sections[self.section.index()].buffer.len();
            let mut ctx = EncodeCtx {
                inner: &mut *inner,
                section: self.section,
                encoding_options: self.state.encoding_options,
            };
            if let Err(err) = (funcs.encode)(&mut ctx, inst, ops) {
                // No partial bytes survive a failed encoding.
                inner.sections[self.section.index()].buffer.truncate(start);
                return Err(err);
            }
        }
        if self.logging_enabled() {
            let arch = self.state.arch().unwrap();
            let line = format_inst(arch, inst, ops, comment);
            self.log_line(&line);
        }
        Ok(())
    }

    fn switch_section(&mut self, section: SectionId) -> Result<()> {
        let code = self.holder().map_err(|err| self.report_error(err, "section"))?;
        if let Err(err) = code.borrow().section_ok(section) {
            return Err(self.report_error(err, "section"));
        }
        self.section = section;
        if self.logging_enabled() {
            let name = code.sections()[section.index()].name().to_string();
            self.log_line(&format!(".section {name}"));
        }
        Ok(())
    }

    fn bind(&mut self, label: Label) -> Result<()> {
        let code = self.holder().map_err(|err| self.report_error(err, "bind"))?;
        let offset = code.section_size(self.section).unwrap_or(0);
        if let Err(err) = code.bind_label(label, self.section, offset) {
            return Err(self.report_error(err, "bind"));
        }
        if self.logging_enabled() {
            self.log_line(&format!("{label}:"));
        }
        Ok(())
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<()> {
        let result = (|| {
            let code = self.holder()?;
            if alignment == 0 || !alignment.is_power_of_two() {
                return Err(Error::InvalidArgument);
            }
            let funcs = self.state.funcs().expect("attached emitter has arch funcs");
            let mut inner = code.borrow_mut();
            inner.section_ok(self.section)?;
            let arch = inner.env.arch();
            let buffer = &mut inner.sections[self.section.index()].buffer;
            let pad = buffer.padding_for(alignment);
            if pad != 0 {
                match mode {
                    AlignMode::Code => {
                        let optimized = self
                            .state
                            .encoding_options
                            .contains(EncodingOptions::OPTIMIZED_ALIGN);
                        let start = buffer.len();
                        if let Err(err) = (funcs.nop_fill)(buffer, pad, optimized) {
                            buffer.truncate(start);
                            return Err(err);
                        }
                    }
                    AlignMode::Data => buffer.fill(arch.data_fill_byte(), pad as usize),
                    AlignMode::Zero => buffer.fill(0, pad as usize),
                }
            }
            Ok(())
        })();
        if let Err(err) = result {
            return Err(self.report_error(err, "align"));
        }
        if self.logging_enabled() {
            self.log_line(&format!(".align {alignment}"));
        }
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> Result<()> {
        let result = (|| {
            let code = self.holder()?;
            let mut inner = code.borrow_mut();
            inner.section_ok(self.section)?;
            inner.sections[self.section.index()].buffer.put_bytes(data);
            Ok(())
        })();
        if let Err(err) = result {
            return Err(self.report_error(err, "embed"));
        }
        if self.logging_enabled() {
            self.log_line(&format!(".embed {} bytes", data.len()));
        }
        Ok(())
    }

    fn embed_label(&mut self, label: Label, size: u8) -> Result<()> {
        let result = (|| {
            let code = self.holder()?;
            let size = self.resolve_embed_size(size)?;
            let mut inner = code.borrow_mut();
            inner.label_ok(label)?;
            inner.section_ok(self.section)?;
            let buffer = &mut inner.sections[self.section.index()].buffer;
            let at = buffer.len();
            buffer.fill(0, size as usize);
            inner.relocs.push(RelocEntry::absolute(self.section, at, label, 0, size));
            Ok(())
        })();
        if let Err(err) = result {
            return Err(self.report_error(err, "embed_label"));
        }
        if self.logging_enabled() {
            self.log_line(&format!(".embed {label}"));
        }
        Ok(())
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, size: u8) -> Result<()> {
        let result = (|| {
            let code = self.holder()?;
            let size = self.resolve_embed_size(size)?;
            let mut inner = code.borrow_mut();
            inner.label_ok(label)?;
            inner.label_ok(base)?;
            inner.section_ok(self.section)?;

            let target = &inner.labels[label.index()];
            let base_entry = &inner.labels[base.index()];
            let known = match (target.section, base_entry.section) {
                // Same-section deltas are layout-independent; compute now.
                (Some(ts), Some(bs)) if ts == bs => {
                    Some(i64::from(target.offset) - i64::from(base_entry.offset))
                }
                _ => None,
            };

            let buffer = &mut inner.sections[self.section.index()].buffer;
            let at = buffer.len();
            match known {
                Some(value) => {
                    let fits = match size {
                        1 => i8::try_from(value).is_ok(),
                        2 => i16::try_from(value).is_ok(),
                        4 => i32::try_from(value).is_ok(),
                        _ => true,
                    };
                    if !fits {
                        return Err(Error::RelocationOutOfRange);
                    }
                    #[allow(clippy::cast_sign_loss)]
                    let bytes = (value as u64).to_le_bytes();
                    buffer.put_bytes(&bytes[..size as usize]);
                }
                None => {
                    buffer.fill(0, size as usize);
                    inner.relocs.push(RelocEntry {
                        kind: RelocKind::Expr,
                        src_section: self.section,
                        src_offset: at,
                        target: RelocTarget::Label(label),
                        base: Some(base),
                        addend: 0,
                        size,
                        encoding: None,
                    });
                }
            }
            Ok(())
        })();
        if let Err(err) = result {
            return Err(self.report_error(err, "embed_label_delta"));
        }
        if self.logging_enabled() {
            self.log_line(&format!(".embed {label} - {base}"));
        }
        Ok(())
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<()> {
        let result = (|| {
            let code = self.holder()?;
            if !code.is_label_valid(label) {
                return Err(Error::InvalidLabel);
            }
            {
                let mut inner = code.borrow_mut();
                inner.section_ok(self.section)?;
                let buffer = &mut inner.sections[self.section.index()].buffer;
                let pad = buffer.padding_for(pool.alignment());
                buffer.fill(0, pad as usize);
            }
            let offset = code.section_size(self.section)?;
            code.bind_label(label, self.section, offset)?;
            let mut inner = code.borrow_mut();
            inner.sections[self.section.index()].buffer.put_bytes(pool.data());
            Ok(())
        })();
        if let Err(err) = result {
            return Err(self.report_error(err, "embed_const_pool"));
        }
        if self.logging_enabled() {
            self.log_line(&format!(".pool {label}, {} bytes", pool.len()));
        }
        Ok(())
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        if self.state.code().is_none() {
            return Err(self.report_error(Error::InvalidState, "comment"));
        }
        if self.comments_logged() {
            let line = format!("; {text}");
            self.log_line(&line);
        }
        Ok(())
    }

    /// Nothing is deferred, so there is nothing to materialize.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_attach(&mut self) {
        self.section = SectionId::TEXT;
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        if let Some(code) = self.state.code().cloned() {
            let _ = code.detach(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Arch, Environment};
    use crate::inst::{InstId, InstOptions};
    use crate::isa::x64::regs::*;
    use crate::operand::{Mem, Operand, Reg};

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }

    fn x64_holder() -> CodeHolder {
        CodeHolder::new(Environment::new(Arch::X64))
    }

    #[test]
    fn x64_binemit() {
        // (instruction, operands, expected bytes, expected listing text)
        let cases: Vec<(InstId, Vec<Operand>, &str, &str)> = vec![
            (InstId::Ret, vec![], "C3", "ret"),
            (InstId::Ret, vec![8.into()], "C20800", "ret 0x8"),
            (InstId::Nop, vec![], "90", "nop"),
            (InstId::Int3, vec![], "CC", "int3"),
            (InstId::Ud2, vec![], "0F0B", "ud2"),
            (InstId::Movs, vec![], "A4", "movs"),
            (InstId::Push, vec![rax().into()], "50", "push rax"),
            (InstId::Push, vec![r9().into()], "4151", "push r9"),
            (InstId::Pop, vec![rdi().into()], "5F", "pop rdi"),
            (InstId::Add, vec![rax().into(), rbx().into()], "4801D8", "add rax, rbx"),
            (InstId::Add, vec![eax().into(), ebx().into()], "01D8", "add eax, ebx"),
            (InstId::Add, vec![rax().into(), 1.into()], "4883C001", "add rax, 0x1"),
            (
                InstId::Add,
                vec![rax().into(), 0x1000.into()],
                "4881C000100000",
                "add rax, 0x1000",
            ),
            (InstId::Sub, vec![r10().into(), rcx().into()], "4929CA", "sub r10, rcx"),
            (InstId::Xor, vec![rax().into(), rax().into()], "4831C0", "xor rax, rax"),
            (InstId::Cmp, vec![rax().into(), rbx().into()], "4839D8", "cmp rax, rbx"),
            (InstId::Test, vec![rax().into(), rax().into()], "4885C0", "test rax, rax"),
            (InstId::Mov, vec![rax().into(), rbx().into()], "4889D8", "mov rax, rbx"),
            (
                InstId::Mov,
                vec![rax().into(), 42.into()],
                "48C7C02A000000",
                "mov rax, 0x2a",
            ),
            (
                InstId::Mov,
                vec![rax().into(), 0x1_0000_0000i64.into()],
                "48B80000000001000000",
                "mov rax, 0x100000000",
            ),
            (InstId::Mov, vec![eax().into(), 7.into()], "B807000000", "mov eax, 0x7"),
            (
                InstId::Mov,
                vec![rax().into(), Mem::base(rbx()).into()],
                "488B03",
                "mov rax, [rbx]",
            ),
            (
                InstId::Mov,
                vec![rax().into(), Mem::base_disp(rbx(), 8).into()],
                "488B4308",
                "mov rax, [rbx + 0x8]",
            ),
            (
                InstId::Mov,
                vec![rax().into(), Mem::base(rsp()).into()],
                "488B0424",
                "mov rax, [rsp]",
            ),
            (
                InstId::Mov,
                vec![rax().into(), Mem::base(rbp()).into()],
                "488B4500",
                "mov rax, [rbp]",
            ),
            (
                InstId::Mov,
                vec![rax().into(), Mem::base(r13()).into()],
                "498B4500",
                "mov rax, [r13]",
            ),
            (
                InstId::Mov,
                vec![Mem::base(rbx()).into(), rax().into()],
                "488903",
                "mov [rbx], rax",
            ),
            (
                InstId::Mov,
                vec![rax().into(), Mem::base_index(rbx(), rcx(), 2).into()],
                "488B048B",
                "mov rax, [rbx + rcx << 2]",
            ),
            (
                InstId::Lea,
                vec![rax().into(), Mem::base_disp(rbx(), 16).into()],
                "488D4310",
                "lea rax, [rbx + 0x10]",
            ),
            (InstId::Inc, vec![rax().into()], "48FFC0", "inc rax"),
            (InstId::Dec, vec![rcx().into()], "48FFC9", "dec rcx"),
            (InstId::Jmp, vec![r11().into()], "41FFE3", "jmp r11"),
            (InstId::Call, vec![rax().into()], "FFD0", "call rax"),
        ];

        for (id, ops, want_hex, want_text) in cases {
            let code = x64_holder();
            let mut asm = Assembler::new(&code).unwrap();
            asm.emit(id, &ops).unwrap();
            let bytes = code.section_data(SectionId::TEXT).unwrap();
            assert_eq!(hex(&bytes), want_hex, "bytes for `{want_text}`");
            let inst = Inst::new(id);
            assert_eq!(
                crate::fmt::format_inst(Arch::X64, &inst, &ops, None),
                want_text
            );
        }
    }

    #[test]
    fn x64_rep_prefix() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.set_inst_options(InstOptions::REP);
        asm.emit(InstId::Movs, &[]).unwrap();
        asm.emit(InstId::Movs, &[]).unwrap();
        assert_eq!(
            code.section_data(SectionId::TEXT).unwrap(),
            vec![0xF3, 0xA4, 0xA4],
            "the rep prefix decorates only the next instruction"
        );
    }

    #[test]
    fn x64_forward_jump_patch() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let target = asm.new_label().unwrap();
        asm.emit(InstId::Jmp, &[target.into()]).unwrap();
        asm.bind(target).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        assert_eq!(bytes, vec![0xE9, 0, 0, 0, 0, 0x90]);
        assert_eq!(code.label_link_count(target).unwrap(), 0);
    }

    #[test]
    fn x64_backward_jump() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let top = asm.new_label().unwrap();
        asm.bind(top).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.emit(InstId::Jmp, &[top.into()]).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        // disp = 0 - 6 = -6.
        assert_eq!(bytes, vec![0x90, 0xE9, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn x64_short_jump_forms() {
        // Explicit short form via inst options.
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let top = asm.new_label().unwrap();
        asm.bind(top).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.set_inst_options(InstOptions::SHORT_FORM);
        asm.emit(InstId::Jmp, &[top.into()]).unwrap();
        assert_eq!(code.section_data(SectionId::TEXT).unwrap(), vec![0x90, 0xEB, 0xFD]);

        // Automatic short form for bound labels under OPTIMIZE_FOR_SIZE.
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.set_encoding_options(EncodingOptions::OPTIMIZE_FOR_SIZE);
        let top = asm.new_label().unwrap();
        asm.bind(top).unwrap();
        asm.emit(InstId::Jmp, &[top.into()]).unwrap();
        assert_eq!(code.section_data(SectionId::TEXT).unwrap(), vec![0xEB, 0xFE]);
    }

    #[test]
    fn x64_predicted_jumps() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.set_encoding_options(EncodingOptions::PREDICTED_JUMPS);
        let target = asm.new_label().unwrap();
        asm.bind(target).unwrap();
        asm.set_inst_options(InstOptions::PREDICT_TAKEN);
        asm.emit(InstId::Je, &[target.into()]).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        assert_eq!(bytes[0], 0x3E, "ds-prefix branch hint");
        assert_eq!(&bytes[1..3], &[0x0F, 0x84]);
    }

    #[test]
    fn x64_rip_relative_load() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let lit = asm.new_label().unwrap();
        asm.emit(InstId::Mov, &[rax().into(), Mem::label(lit).into()]).unwrap();
        asm.emit(InstId::Ret, &[]).unwrap();
        asm.bind(lit).unwrap();
        asm.embed(&42u64.to_le_bytes()).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        // mov rax, [rip+disp32]: 48 8B 05 <disp>; disp = 8 - 7 = 1.
        assert_eq!(&bytes[..7], &[0x48, 0x8B, 0x05, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn failed_encoding_restores_buffer() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        // lock requires a memory destination only at validation time, but an
        // imm/imm operand pair fails in the encoder after the prefix byte
        // was already written.
        asm.set_inst_options(InstOptions::LOCK);
        let err = asm.emit(InstId::Add, &[Operand::Imm(1), Operand::Imm(2)]);
        assert_eq!(err, Err(Error::InvalidOperand));
        assert_eq!(code.section_size(SectionId::TEXT).unwrap(), 1);
    }

    #[test]
    fn transient_state_cleared_on_failure() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.set_inst_options(InstOptions::REP);
        asm.set_extra_reg(Reg::mask(1));
        asm.set_inline_comment("will fail");
        let _ = asm.emit(InstId::Ldr, &[]);
        assert_eq!(asm.inst_options(), InstOptions::empty());
        assert_eq!(asm.extra_reg(), None);
        assert_eq!(asm.inline_comment(), None);
    }

    #[test]
    fn align_modes() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.align(AlignMode::Data, 4).unwrap();
        assert_eq!(
            code.section_data(SectionId::TEXT).unwrap(),
            vec![0x90, 0xCC, 0xCC, 0xCC]
        );
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.align(AlignMode::Zero, 8).unwrap();
        assert_eq!(code.section_size(SectionId::TEXT).unwrap(), 8);
        assert_eq!(&code.section_data(SectionId::TEXT).unwrap()[5..], &[0, 0, 0]);
        assert_eq!(asm.align(AlignMode::Code, 3), Err(Error::InvalidArgument));
    }

    #[test]
    fn align_code_optimized() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        asm.set_encoding_options(EncodingOptions::OPTIMIZED_ALIGN);
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.align(AlignMode::Code, 8).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        assert_eq!(bytes.len(), 8);
        // One 7-byte long NOP rather than seven 0x90s.
        assert_eq!(&bytes[1..4], &[0x0F, 0x1F, 0x80]);
    }

    #[test]
    fn aarch64_binemit() {
        use crate::isa::aarch64::regs::*;

        let cases: Vec<(InstId, Vec<Operand>, &str)> = vec![
            (InstId::Ret, vec![], "C0035FD6"),
            (InstId::Nop, vec![], "1F2003D5"),
            (InstId::Add, vec![xreg(4).into(), xreg(5).into(), xreg(6).into()], "A400068B"),
            (InstId::Add, vec![wreg(1).into(), wreg(2).into(), wreg(3).into()], "4100030B"),
            (InstId::Sub, vec![xreg(4).into(), xreg(5).into(), xreg(6).into()], "A40006CB"),
            (InstId::Add, vec![xreg(1).into(), xreg(2).into(), 16.into()], "41400091"),
            (InstId::And, vec![xreg(0).into(), xreg(1).into(), xreg(2).into()], "2000028A"),
            (InstId::Or, vec![xreg(0).into(), xreg(1).into(), xreg(2).into()], "200002AA"),
            (InstId::Xor, vec![xreg(0).into(), xreg(1).into(), xreg(2).into()], "200002CA"),
            (InstId::Mov, vec![xreg(0).into(), xreg(1).into()], "E00301AA"),
            (InstId::Mov, vec![xreg(5).into(), 42.into()], "450580D2"),
            (InstId::Cmp, vec![xreg(0).into(), xreg(1).into()], "1F0001EB"),
            (InstId::Cmp, vec![xreg(0).into(), 7.into()], "1F1C00F1"),
            (InstId::Test, vec![xreg(0).into(), xreg(1).into()], "1F0001EA"),
            (
                InstId::Ldr,
                vec![xreg(0).into(), Mem::base_disp(xreg(1), 8).into()],
                "200440F9",
            ),
            (
                InstId::Str,
                vec![xreg(0).into(), Mem::base(xreg(1)).into()],
                "200000F9",
            ),
            (InstId::Jmp, vec![xreg(3).into()], "60001FD6"),
            (InstId::Call, vec![xreg(3).into()], "60003FD6"),
            (InstId::Ret, vec![xreg(1).into()], "20005FD6"),
            (InstId::Brk, vec![1.into()], "200020D4"),
            (InstId::Udf, vec![], "00000000"),
        ];

        for (id, ops, want_hex) in cases {
            let code = CodeHolder::new(Environment::new(Arch::Aarch64));
            let mut asm = Assembler::new(&code).unwrap();
            asm.emit(id, &ops).unwrap();
            let bytes = code.section_data(SectionId::TEXT).unwrap();
            assert_eq!(hex(&bytes), want_hex, "bytes for {id} {ops:?}");
        }
    }

    #[test]
    fn aarch64_branches_patch() {
        use crate::isa::aarch64::regs::*;

        let code = CodeHolder::new(Environment::new(Arch::Aarch64));
        let mut asm = Assembler::new(&code).unwrap();
        let out = asm.new_label().unwrap();
        asm.emit(InstId::Je, &[out.into()]).unwrap();
        asm.emit(InstId::Jmp, &[out.into()]).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.bind(out).unwrap();
        asm.emit(InstId::Ret, &[]).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        // b.eq +12.
        assert_eq!(&bytes[0..4], &0x5400_0060u32.to_le_bytes());
        // b +8.
        assert_eq!(&bytes[4..8], &0x1400_0002u32.to_le_bytes());

        // adr materializes a byte displacement.
        let code = CodeHolder::new(Environment::new(Arch::Aarch64));
        let mut asm = Assembler::new(&code).unwrap();
        let lit = asm.new_label().unwrap();
        asm.emit(InstId::Adr, &[xreg(0).into(), lit.into()]).unwrap();
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.bind(lit).unwrap();
        // disp = 8: immlo = 0, immhi = 2.
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        assert_eq!(&bytes[0..4], &(0x1000_0000u32 | (2 << 5)).to_le_bytes());
    }

    #[test]
    fn aarch64_literal_load() {
        use crate::isa::aarch64::regs::*;

        let code = CodeHolder::new(Environment::new(Arch::Aarch64));
        let mut asm = Assembler::new(&code).unwrap();
        let lit = asm.new_label().unwrap();
        asm.emit(InstId::Ldr, &[xreg(0).into(), lit.into()]).unwrap();
        asm.emit(InstId::Ret, &[]).unwrap();
        asm.bind(lit).unwrap();
        asm.embed(&7u64.to_le_bytes()).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        // ldr x0, +8: imm19 = 2.
        assert_eq!(&bytes[0..4], &(0x5800_0000u32 | (2 << 5)).to_le_bytes());
    }

    #[test]
    fn section_switching() {
        let code = x64_holder();
        let data = code
            .new_section(".data", crate::section::SectionFlags::WRITABLE, 8)
            .unwrap();
        let mut asm = Assembler::new(&code).unwrap();
        asm.emit(InstId::Ret, &[]).unwrap();
        asm.switch_section(data).unwrap();
        asm.embed(&[1, 2, 3]).unwrap();
        assert_eq!(asm.current_section(), data);
        assert_eq!(code.section_data(data).unwrap(), vec![1, 2, 3]);
        assert_eq!(code.section_data(SectionId::TEXT).unwrap(), vec![0xC3]);
        assert_eq!(
            asm.switch_section(SectionId::from_u32(9)),
            Err(Error::InvalidSection)
        );
    }

    #[test]
    fn embed_label_makes_absolute_reloc() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let label = asm.new_label().unwrap();
        asm.embed_label(label, 0).unwrap();
        assert_eq!(code.section_size(SectionId::TEXT).unwrap(), 8);
        let relocs = code.relocations();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].kind, RelocKind::Absolute);
        assert_eq!(relocs[0].size, 8);
        assert_eq!(relocs[0].target, RelocTarget::Label(label));
    }

    #[test]
    fn embed_label_delta_same_section_is_immediate() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let a = asm.new_label().unwrap();
        asm.bind(a).unwrap();
        asm.embed(&[0; 16]).unwrap();
        let b = asm.new_label().unwrap();
        asm.bind(b).unwrap();
        asm.embed_label_delta(b, a, 4).unwrap();
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        assert_eq!(&bytes[16..20], &16u32.to_le_bytes());
        assert!(code.relocations().is_empty());
    }

    #[test]
    fn const_pool_embedding() {
        let code = x64_holder();
        let mut asm = Assembler::new(&code).unwrap();
        let pool_label = asm.new_label().unwrap();
        let mut pool = ConstPool::new();
        pool.add_u64(0x1122_3344_5566_7788);
        asm.emit(InstId::Nop, &[]).unwrap();
        asm.embed_const_pool(pool_label, &pool).unwrap();
        let (section, offset) = code.label_bind_point(pool_label).unwrap();
        assert_eq!(section, SectionId::TEXT);
        assert_eq!(offset, 8, "pool start is aligned to the pool alignment");
        let bytes = code.section_data(SectionId::TEXT).unwrap();
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
