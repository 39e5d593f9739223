//! The deferred backend: records typed nodes, materialized by `finalize`.

use crate::assembler::Assembler;
use crate::const_pool::ConstPool;
use crate::emitter::{AlignMode, Emitter, EmitterFlags, EmitterKind, EmitterState};
use crate::error::{Error, Result};
use crate::holder::CodeHolder;
use crate::inst::Inst;
use crate::label::Label;
use crate::operand::Operand;
use crate::section::SectionId;
use smallvec::SmallVec;

/// One deferred operation.
///
/// Nodes carry no byte offsets; offsets do not exist until the list is
/// replayed through an Assembler at `finalize` time.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Inst {
        inst: Inst,
        ops: SmallVec<[Operand; 4]>,
        comment: Option<String>,
    },
    Label(Label),
    Align { mode: AlignMode, alignment: u32 },
    Embed(Vec<u8>),
    EmbedLabel { label: Label, size: u8 },
    EmbedLabelDelta { label: Label, base: Label, size: u8 },
    ConstPool { label: Label, alignment: u32, data: Vec<u8> },
    Section(SectionId),
    Comment(String),
    /// Compiler-only: marks the start of a function frame.
    FuncFrame,
    /// Compiler-only: pins virtual registers to the ABI argument registers.
    ArgsAssignment(SmallVec<[crate::operand::Reg; 4]>),
}

/// A node plus its monotonic position in the stream.
#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub pos: u32,
    pub node: Node,
}

/// Records instruction submissions as an in-memory node list instead of
/// encoding them; [`finalize`](Emitter::finalize) replays the list through a
/// transient [`Assembler`] attached to the same holder.
///
/// Deferral means encoding errors surface at `finalize`, not at `emit`;
/// enable `DiagnosticOptions::VALIDATE_INTERMEDIATE` to catch malformed
/// operands at record time.
pub struct Builder {
    state: EmitterState,
    pub(crate) nodes: Vec<NodeEntry>,
    next_pos: u32,
    current_section: SectionId,
}

impl Builder {
    /// Create a builder attached to `code`.
    pub fn new(code: &CodeHolder) -> Result<Self> {
        Self::with_kind(code, EmitterKind::Builder)
    }

    pub(crate) fn with_kind(code: &CodeHolder, kind: EmitterKind) -> Result<Self> {
        let mut builder = Self {
            state: EmitterState::new(kind),
            nodes: Vec::new(),
            next_pos: 0,
            current_section: SectionId::TEXT,
        };
        code.attach(&mut builder)?;
        Ok(builder)
    }

    /// Number of recorded nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The section subsequent nodes will target.
    pub fn current_section(&self) -> SectionId {
        self.current_section
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state.code().is_none() {
            return Err(Error::InvalidState);
        }
        if self.state.flags.contains(EmitterFlags::FINALIZED) {
            return Err(Error::AlreadyFinalized);
        }
        Ok(())
    }

    pub(crate) fn push_node(&mut self, node: Node) {
        let pos = self.next_pos;
        self.next_pos += 1;
        self.nodes.push(NodeEntry { pos, node });
    }

    /// Replay every node, in order, through a transient Assembler attached
    /// to the same holder. The builder's own logger and error handler ride
    /// along so replay diagnostics route exactly as direct emission would.
    pub(crate) fn replay(&mut self, code: &CodeHolder) -> Result<()> {
        let mut asm = Assembler::new(code)?;
        asm.set_encoding_options(self.state.encoding_options);
        asm.set_diagnostic_options(self.state.diagnostic_options);
        {
            let dst = asm.state_mut();
            dst.logger = self.state.logger.take();
            dst.error_handler = self.state.error_handler.take();
            dst.recompute_log_enabled();
        }

        let result = replay_nodes(&mut asm, &self.nodes);

        let src = asm.state_mut();
        self.state.logger = src.logger.take();
        self.state.error_handler = src.error_handler.take();
        self.state.recompute_log_enabled();
        drop(asm);
        result
    }
}

fn replay_nodes(asm: &mut Assembler, nodes: &[NodeEntry]) -> Result<()> {
    for entry in nodes {
        match &entry.node {
            Node::Inst { inst, ops, comment } => {
                if let Some(comment) = comment {
                    asm.set_inline_comment(comment);
                }
                asm.emit_inst(inst, ops)?;
            }
            Node::Label(label) => asm.bind(*label)?,
            Node::Align { mode, alignment } => asm.align(*mode, *alignment)?,
            Node::Embed(data) => asm.embed(data)?,
            Node::EmbedLabel { label, size } => asm.embed_label(*label, *size)?,
            Node::EmbedLabelDelta { label, base, size } => {
                asm.embed_label_delta(*label, *base, *size)?;
            }
            Node::ConstPool { label, alignment, data } => {
                asm.align(AlignMode::Zero, *alignment)?;
                asm.bind(*label)?;
                asm.embed(data)?;
            }
            Node::Section(id) => asm.switch_section(*id)?,
            Node::Comment(text) => asm.comment(text)?,
            // Frame markers carry no bytes of their own; prologue emission
            // belongs to the frame encoders layered above this crate.
            Node::FuncFrame | Node::ArgsAssignment(_) => {}
        }
    }
    Ok(())
}

impl Emitter for Builder {
    fn state(&self) -> &EmitterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        &mut self.state
    }

    fn emit_impl(&mut self, inst: &Inst, ops: &[Operand], comment: Option<&str>) -> Result<()> {
        // The inline comment is borrowed only until emit returns; the node
        // owns its copy.
        self.push_node(Node::Inst {
            inst: *inst,
            ops: SmallVec::from_slice(ops),
            comment: comment.map(str::to_string),
        });
        Ok(())
    }

    fn switch_section(&mut self, section: SectionId) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            self.holder()?.borrow().section_ok(section)?;
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "section"));
        }
        self.current_section = section;
        self.push_node(Node::Section(section));
        Ok(())
    }

    fn bind(&mut self, label: Label) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            if self.is_label_valid(label) {
                Ok(())
            } else {
                Err(Error::InvalidLabel)
            }
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "bind"));
        }
        self.push_node(Node::Label(label));
        Ok(())
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            if alignment == 0 || !alignment.is_power_of_two() {
                Err(Error::InvalidArgument)
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "align"));
        }
        self.push_node(Node::Align { mode, alignment });
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> Result<()> {
        if let Err(err) = self.ensure_open() {
            return Err(self.report_error(err, "embed"));
        }
        self.push_node(Node::Embed(data.to_vec()));
        Ok(())
    }

    fn embed_label(&mut self, label: Label, size: u8) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            if !self.is_label_valid(label) {
                return Err(Error::InvalidLabel);
            }
            if !matches!(size, 0 | 1 | 2 | 4 | 8) {
                return Err(Error::InvalidArgument);
            }
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "embed_label"));
        }
        self.push_node(Node::EmbedLabel { label, size });
        Ok(())
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, size: u8) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            if !self.is_label_valid(label) || !self.is_label_valid(base) {
                return Err(Error::InvalidLabel);
            }
            if !matches!(size, 0 | 1 | 2 | 4 | 8) {
                return Err(Error::InvalidArgument);
            }
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "embed_label_delta"));
        }
        self.push_node(Node::EmbedLabelDelta { label, base, size });
        Ok(())
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            if !self.is_label_valid(label) {
                return Err(Error::InvalidLabel);
            }
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "embed_const_pool"));
        }
        self.push_node(Node::ConstPool {
            label,
            alignment: pool.alignment(),
            data: pool.data().to_vec(),
        });
        Ok(())
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        if let Err(err) = self.ensure_open() {
            return Err(self.report_error(err, "comment"));
        }
        // Comments decorate the node they follow; a comment with no
        // preceding instruction becomes its own node.
        match self.nodes.last_mut() {
            Some(NodeEntry { node: Node::Inst { comment, .. }, .. }) if comment.is_none() => {
                *comment = Some(text.to_string());
            }
            _ => self.push_node(Node::Comment(text.to_string())),
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let code = match self.ensure_open().and_then(|()| self.holder()) {
            Ok(code) => code,
            Err(err) => return Err(self.report_error(err, "finalize")),
        };
        // Replay failures were already routed through the error handler by
        // the transient assembler; do not report them twice.
        self.replay(&code)?;
        self.state.flags.insert(EmitterFlags::FINALIZED);
        Ok(())
    }

    fn on_attach(&mut self) {
        self.current_section = SectionId::TEXT;
    }
}

impl Drop for Builder {
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

    fn x64_holder() -> CodeHolder {
        CodeHolder::new(Environment::new(Arch::X64))
    }

    #[test]
    fn nodes_are_positioned_monotonically() {
        let code = x64_holder();
        let mut b = Builder::new(&code).unwrap();
        b.emit(InstId::Nop, &[]).unwrap();
        let label = b.new_label().unwrap();
        b.bind(label).unwrap();
        b.emit(InstId::Ret, &[]).unwrap();
        let positions: Vec<u32> = b.nodes.iter().map(|n| n.pos).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        // Nothing hits the holder until finalize.
        assert_eq!(code.section_size(SectionId::TEXT).unwrap(), 0);
    }

    #[test]
    fn replay_equivalence_with_assembler() {
        let direct = x64_holder();
        let mut asm = Assembler::new(&direct).unwrap();
        let deferred = x64_holder();
        let mut b = Builder::new(&deferred).unwrap();

        let emit_all = |e: &mut dyn Emitter| -> Result<()> {
            let skip = e.new_label()?;
            e.emit(InstId::Push, &[rbp().into()])?;
            e.emit(InstId::Mov, &[rbp().into(), rsp().into()])?;
            e.emit(InstId::Cmp, &[rdi().into(), 0.into()])?;
            e.emit(InstId::Je, &[skip.into()])?;
            e.emit(InstId::Add, &[rax().into(), rdi().into()])?;
            e.bind(skip)?;
            e.set_inst_options(InstOptions::REP);
            e.emit(InstId::Movs, &[])?;
            e.align(AlignMode::Code, 8)?;
            e.emit(InstId::Pop, &[rbp().into()])?;
            e.emit(InstId::Ret, &[])?;
            Ok(())
        };

        emit_all(&mut asm).unwrap();
        emit_all(&mut b).unwrap();
        b.finalize().unwrap();

        assert_eq!(
            direct.section_data(SectionId::TEXT).unwrap(),
            deferred.section_data(SectionId::TEXT).unwrap()
        );
    }

    #[test]
    fn finalize_is_idempotent_in_failure() {
        let code = x64_holder();
        let mut b = Builder::new(&code).unwrap();
        b.emit(InstId::Nop, &[]).unwrap();
        b.finalize().unwrap();
        let size = code.section_size(SectionId::TEXT).unwrap();
        assert_eq!(b.finalize(), Err(Error::AlreadyFinalized));
        assert_eq!(code.section_size(SectionId::TEXT).unwrap(), size);
        assert_eq!(b.emit(InstId::Nop, &[]), Err(Error::AlreadyFinalized));
    }

    #[test]
    fn deferred_encoding_errors_surface_at_finalize() {
        let code = x64_holder();
        let mut b = Builder::new(&code).unwrap();
        // Recording succeeds without validation...
        b.emit(InstId::Ldr, &[rax().into()]).unwrap();
        // ...and the encoder rejects it during replay.
        assert_eq!(b.finalize(), Err(Error::InvalidInstruction));
        assert!(!b.is_finalized());
    }

    #[test]
    fn intermediate_validation_rejects_at_record_time() {
        use crate::inst::DiagnosticOptions;

        let code = x64_holder();
        let mut b = Builder::new(&code).unwrap();
        b.set_diagnostic_options(DiagnosticOptions::VALIDATE_INTERMEDIATE);
        assert_eq!(
            b.emit(InstId::Add, &[rax().into(), ebx().into()]),
            Err(Error::OperandSizeMismatch)
        );
        assert_eq!(b.node_count(), 0);
    }

    #[test]
    fn comment_attaches_to_previous_inst_node() {
        let code = x64_holder();
        let mut b = Builder::new(&code).unwrap();
        b.emit(InstId::Nop, &[]).unwrap();
        b.comment("padding").unwrap();
        assert_eq!(b.node_count(), 1);
        match &b.nodes[0].node {
            Node::Inst { comment, .. } => assert_eq!(comment.as_deref(), Some("padding")),
            node => panic!("unexpected node {node:?}"),
        }
        // A second comment cannot attach twice.
        b.comment("more").unwrap();
        assert_eq!(b.node_count(), 2);
    }

    #[test]
    fn section_switch_is_deferred() {
        let code = x64_holder();
        let data = code
            .new_section(".data", crate::section::SectionFlags::WRITABLE, 8)
            .unwrap();
        let mut b = Builder::new(&code).unwrap();
        b.emit(InstId::Ret, &[]).unwrap();
        b.switch_section(data).unwrap();
        b.embed(&[1, 2, 3]).unwrap();
        assert_eq!(code.section_size(data).unwrap(), 0);
        b.finalize().unwrap();
        assert_eq!(code.section_data(data).unwrap(), vec![1, 2, 3]);
    }
}
