//! The emitter front-end shared by Assembler, Builder, and Compiler.

use crate::const_pool::ConstPool;
use crate::env::Arch;
use crate::error::{Error, Result};
use crate::fmt::Logger;
use crate::holder::CodeHolder;
use crate::inst::{DiagnosticOptions, EncodingOptions, Inst, InstId, InstOptions, ValidationFlags};
use crate::isa::ArchFuncs;
use crate::label::{Label, LabelType};
use crate::operand::{Operand, Reg, MAX_OPERANDS};
use crate::section::SectionId;
use bitflags::bitflags;
use core::fmt;

/// Identifies one attached emitter within its `CodeHolder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmitterId(u32);

impl EmitterId {
    pub(crate) fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emitter{}", self.0)
    }
}

/// Which emitter variant is behind the [`Emitter`] trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterKind {
    /// Encodes directly into the active section.
    Assembler,
    /// Records a deferred instruction list, materialized by `finalize`.
    Builder,
    /// Builder plus virtual registers and an allocation pass.
    Compiler,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EmitterFlags: u32 {
        /// The emitter has its own logger (not inherited from the holder).
        const OWN_LOGGER = 1 << 0;
        /// The emitter has its own error handler.
        const OWN_ERROR_HANDLER = 1 << 1;
        /// `finalize()` completed; further emits fail.
        const FINALIZED = 1 << 2;
        /// Standalone comments are forwarded to the logger.
        const LOG_COMMENTS = 1 << 3;
    }
}

/// Receives every error an emitter reports, before it is returned to the
/// caller. Implementations may record, log, or escalate; whatever they do,
/// the original error is still returned from the failing operation.
pub trait ErrorHandler {
    fn handle_error(&mut self, error: Error, message: &str, origin: EmitterId);
}

/// How [`Emitter::align`] fills the padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    /// NOP sequences appropriate for the architecture.
    Code,
    /// The architecture's data filler (`0xCC` on x64, zero on aarch64).
    Data,
    /// Zero bytes.
    Zero,
}

/// State common to every emitter variant.
///
/// The `next_*` triple is the transient per-instruction state: it decorates
/// the next `emit` only and is cleared by the base emit routine no matter
/// how the dispatch went, so prefixes, masks, and inline comments cannot
/// leak across instructions.
pub struct EmitterState {
    kind: EmitterKind,
    code: Option<CodeHolder>,
    id: Option<EmitterId>,
    arch: Option<Arch>,
    funcs: Option<&'static ArchFuncs>,
    pub(crate) flags: EmitterFlags,
    pub(crate) encoding_options: EncodingOptions,
    pub(crate) diagnostic_options: DiagnosticOptions,
    pub(crate) validation_flags: ValidationFlags,
    pub(crate) forced_inst_options: InstOptions,
    pub(crate) next_inst_options: InstOptions,
    pub(crate) next_extra_reg: Option<Reg>,
    pub(crate) next_comment: Option<String>,
    pub(crate) logger: Option<Box<dyn Logger>>,
    pub(crate) error_handler: Option<Box<dyn ErrorHandler>>,
    synced_generation: u64,
    log_enabled: bool,
}

impl EmitterState {
    pub(crate) fn new(kind: EmitterKind) -> Self {
        Self {
            kind,
            code: None,
            id: None,
            arch: None,
            funcs: None,
            flags: EmitterFlags::LOG_COMMENTS,
            encoding_options: EncodingOptions::empty(),
            diagnostic_options: DiagnosticOptions::empty(),
            validation_flags: ValidationFlags::empty(),
            forced_inst_options: InstOptions::empty(),
            next_inst_options: InstOptions::empty(),
            next_extra_reg: None,
            next_comment: None,
            logger: None,
            error_handler: None,
            synced_generation: 0,
            log_enabled: false,
        }
    }

    pub fn kind(&self) -> EmitterKind {
        self.kind
    }

    pub(crate) fn code(&self) -> Option<&CodeHolder> {
        self.code.as_ref()
    }

    pub(crate) fn id(&self) -> Option<EmitterId> {
        self.id
    }

    pub(crate) fn arch(&self) -> Option<Arch> {
        self.arch
    }

    pub(crate) fn funcs(&self) -> Option<&'static ArchFuncs> {
        self.funcs
    }

    pub(crate) fn attach_to(&mut self, code: CodeHolder, id: EmitterId, arch: Arch) {
        self.synced_generation = code.settings_generation();
        self.log_enabled = self.logger.is_some() || code.has_logger();
        self.code = Some(code);
        self.id = Some(id);
        self.arch = Some(arch);
        self.funcs = Some(crate::isa::funcs_for(arch));
    }

    pub(crate) fn clear_attachment(&mut self) {
        self.code = None;
        self.id = None;
        self.arch = None;
        self.funcs = None;
        self.log_enabled = self.logger.is_some();
    }

    pub(crate) fn reset_transient(&mut self) {
        self.next_inst_options = InstOptions::empty();
        self.next_extra_reg = None;
        self.next_comment = None;
    }

    /// Refresh settings cached from the holder if its generation moved.
    pub(crate) fn sync_settings(&mut self) {
        if let Some(code) = &self.code {
            let generation = code.settings_generation();
            if generation != self.synced_generation {
                self.synced_generation = generation;
                self.log_enabled = self.logger.is_some() || code.has_logger();
            }
        }
    }

    pub(crate) fn log_enabled(&self) -> bool {
        self.log_enabled
    }

    pub(crate) fn recompute_log_enabled(&mut self) {
        self.log_enabled =
            self.logger.is_some() || self.code.as_ref().is_some_and(CodeHolder::has_logger);
    }
}

/// The polymorphic emitter front-end.
///
/// The three variants share this surface: instruction submission with
/// transient per-instruction state, label and section management, data
/// embedding, alignment, commenting, error routing, and finalization. The
/// provided [`emit`](Emitter::emit) is the template method: it merges the
/// transient options into the instruction, optionally validates, dispatches
/// to the variant hook, and unconditionally clears the transient state.
pub trait Emitter {
    fn state(&self) -> &EmitterState;
    fn state_mut(&mut self) -> &mut EmitterState;

    /// Variant hook: consume one fully-merged instruction.
    #[doc(hidden)]
    fn emit_impl(&mut self, inst: &Inst, ops: &[Operand], comment: Option<&str>) -> Result<()>;

    /// Switch the active section.
    fn switch_section(&mut self, section: SectionId) -> Result<()>;

    /// Bind `label` at the current position.
    fn bind(&mut self, label: Label) -> Result<()>;

    /// Pad the current position to `alignment` (a power of two).
    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<()>;

    /// Emit raw bytes.
    fn embed(&mut self, data: &[u8]) -> Result<()>;

    /// Emit a `size`-byte placeholder (1, 2, 4, or 8) that resolves to the
    /// absolute address of `label`; records a relocation.
    fn embed_label(&mut self, label: Label, size: u8) -> Result<()>;

    /// Emit a `size`-byte value resolving to `label - base`.
    fn embed_label_delta(&mut self, label: Label, base: Label, size: u8) -> Result<()>;

    /// Bind `label` at the (aligned) start of `pool`'s serialized bytes.
    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<()>;

    /// Standalone annotation: logged immediately by an Assembler, attached
    /// to the instruction stream by Builder/Compiler.
    fn comment(&mut self, text: &str) -> Result<()>;

    /// Materialize deferred state. A no-op for Assembler; Builder/Compiler
    /// replay their node list through a transient Assembler and then refuse
    /// further emits with `AlreadyFinalized`.
    fn finalize(&mut self) -> Result<()>;

    /// Event fired after the emitter is attached to a holder.
    fn on_attach(&mut self) {}

    /// Event fired before the emitter is detached from its holder.
    fn on_detach(&mut self) {}

    // ------------------------------------------------------------------
    // Provided: instruction submission

    /// Submit one instruction with up to [`MAX_OPERANDS`] operands.
    ///
    /// The pending `set_inst_options` / `set_extra_reg` /
    /// `set_inline_comment` state decorates exactly this submission and is
    /// cleared whether or not it succeeds. Failures are routed through
    /// [`report_error`](Emitter::report_error) before being returned.
    fn emit(&mut self, id: InstId, ops: &[Operand]) -> Result<()> {
        let (inst, comment) = {
            let state = self.state_mut();
            let inst = Inst {
                id,
                options: state.next_inst_options | state.forced_inst_options,
                extra_reg: state.next_extra_reg,
            };
            (inst, state.next_comment.take())
        };
        let result = (|| {
            if ops.len() > MAX_OPERANDS {
                return Err(Error::InvalidArgument);
            }
            let state = self.state();
            if state.code().is_none() {
                return Err(Error::InvalidState);
            }
            if state.flags.contains(EmitterFlags::FINALIZED) {
                return Err(Error::AlreadyFinalized);
            }
            let wanted = match state.kind() {
                EmitterKind::Assembler => DiagnosticOptions::VALIDATE_ASSEMBLER,
                EmitterKind::Builder | EmitterKind::Compiler => {
                    DiagnosticOptions::VALIDATE_INTERMEDIATE
                }
            };
            if state.diagnostic_options.contains(wanted) {
                let mut flags = state.validation_flags;
                if state.kind() != EmitterKind::Assembler {
                    // Deferred streams may legitimately carry virtual
                    // registers.
                    flags |= ValidationFlags::VIRT_REGS;
                }
                let funcs = state.funcs().expect("attached emitter has arch funcs");
                (funcs.validate)(&inst, ops, flags)?;
            }
            self.emit_impl(&inst, ops, comment.as_deref())
        })();
        self.state_mut().reset_transient();
        result.map_err(|err| self.report_error(err, inst.id.name()))
    }

    /// Submit a pre-built [`Inst`]: its options and extra register are
    /// loaded into the transient state first, so forced options still merge
    /// and the clearing contract is identical to [`emit`](Emitter::emit).
    fn emit_inst(&mut self, inst: &Inst, ops: &[Operand]) -> Result<()> {
        {
            let state = self.state_mut();
            state.next_inst_options |= inst.options;
            if inst.extra_reg.is_some() {
                state.next_extra_reg = inst.extra_reg;
            }
        }
        self.emit(inst.id, ops)
    }

    // ------------------------------------------------------------------
    // Provided: transient and sticky per-instruction state

    /// Options applied to the next instruction only.
    fn set_inst_options(&mut self, options: InstOptions) {
        self.state_mut().next_inst_options |= options;
    }

    fn inst_options(&self) -> InstOptions {
        self.state().next_inst_options
    }

    /// Extra register (e.g. an AVX-512 mask) for the next instruction only.
    fn set_extra_reg(&mut self, reg: Reg) {
        self.state_mut().next_extra_reg = Some(reg);
    }

    fn extra_reg(&self) -> Option<Reg> {
        self.state().next_extra_reg
    }

    /// Comment attached to the next instruction only. The text is copied;
    /// deferred emitters copy it again into the IR node they create.
    fn set_inline_comment(&mut self, text: &str) {
        self.state_mut().next_comment = Some(text.to_string());
    }

    fn inline_comment(&self) -> Option<&str> {
        self.state().next_comment.as_deref()
    }

    /// Clear all pending transient state without emitting.
    fn reset_state(&mut self) {
        self.state_mut().reset_transient();
    }

    /// Options merged into every instruction until changed.
    fn set_forced_inst_options(&mut self, options: InstOptions) {
        self.state_mut().forced_inst_options = options;
    }

    fn forced_inst_options(&self) -> InstOptions {
        self.state().forced_inst_options
    }

    // ------------------------------------------------------------------
    // Provided: configuration

    fn encoding_options(&self) -> EncodingOptions {
        self.state().encoding_options
    }

    fn set_encoding_options(&mut self, options: EncodingOptions) {
        self.state_mut().encoding_options = options;
    }

    fn diagnostic_options(&self) -> DiagnosticOptions {
        self.state().diagnostic_options
    }

    fn set_diagnostic_options(&mut self, options: DiagnosticOptions) {
        self.state_mut().diagnostic_options = options;
    }

    fn validation_flags(&self) -> ValidationFlags {
        self.state().validation_flags
    }

    fn set_validation_flags(&mut self, flags: ValidationFlags) {
        self.state_mut().validation_flags = flags;
    }

    // ------------------------------------------------------------------
    // Provided: attachment queries

    fn emitter_kind(&self) -> EmitterKind {
        self.state().kind()
    }

    fn is_attached(&self) -> bool {
        self.state().code().is_some()
    }

    fn is_finalized(&self) -> bool {
        self.state().flags.contains(EmitterFlags::FINALIZED)
    }

    /// A handle to the attached holder, if any.
    fn code(&self) -> Option<CodeHolder> {
        self.state().code().cloned()
    }

    // ------------------------------------------------------------------
    // Provided: label management (delegates to the holder)

    fn new_label(&mut self) -> Result<Label> {
        self.holder()?.new_label()
    }

    fn new_named_label(
        &mut self,
        name: &str,
        label_type: LabelType,
        parent: Option<Label>,
    ) -> Result<Label> {
        self.holder()?.new_named_label(name, label_type, parent)
    }

    fn new_external_label(&mut self, name: &str) -> Result<Label> {
        self.holder()?.new_external_label(name)
    }

    fn new_anonymous_label(&mut self, name: &str) -> Result<Label> {
        self.holder()?.new_anonymous_label(name)
    }

    fn label_by_name(&self, name: &str, parent: Option<Label>) -> Option<Label> {
        self.state().code().and_then(|code| code.label_by_name(name, parent))
    }

    fn is_label_valid(&self, label: Label) -> bool {
        self.state().code().is_some_and(|code| code.is_label_valid(label))
    }

    #[doc(hidden)]
    fn holder(&self) -> Result<CodeHolder> {
        self.state().code().cloned().ok_or(Error::InvalidState)
    }

    // ------------------------------------------------------------------
    // Provided: data helpers

    /// Embed `count` elements of `element_size` bytes (1, 2, 4, or 8) from
    /// `data`, the whole array repeated `repeat` times.
    fn embed_data_array(
        &mut self,
        element_size: usize,
        data: &[u8],
        count: usize,
        repeat: usize,
    ) -> Result<()> {
        if !matches!(element_size, 1 | 2 | 4 | 8) || data.len() != element_size * count {
            return Err(self.report_error(Error::InvalidArgument, "embed_data_array"));
        }
        for _ in 0..repeat {
            self.embed(data)?;
        }
        Ok(())
    }

    /// `format!`-style [`comment`](Emitter::comment).
    fn comment_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<()> {
        self.comment(&args.to_string())
    }

    // ------------------------------------------------------------------
    // Provided: logger / error handler

    /// Install an emitter-local logger, overriding holder inheritance;
    /// `None` reverts to inheriting the holder's logger.
    fn set_logger(&mut self, logger: Option<Box<dyn Logger>>) {
        let state = self.state_mut();
        state.flags.set(EmitterFlags::OWN_LOGGER, logger.is_some());
        state.logger = logger;
        state.recompute_log_enabled();
    }

    fn has_own_logger(&self) -> bool {
        self.state().flags.contains(EmitterFlags::OWN_LOGGER)
    }

    /// Install an emitter-local error handler, overriding holder
    /// inheritance; `None` reverts to inheriting the holder's handler.
    fn set_error_handler(&mut self, handler: Option<Box<dyn ErrorHandler>>) {
        let state = self.state_mut();
        state.flags.set(EmitterFlags::OWN_ERROR_HANDLER, handler.is_some());
        state.error_handler = handler;
    }

    fn has_own_error_handler(&self) -> bool {
        self.state().flags.contains(EmitterFlags::OWN_ERROR_HANDLER)
    }

    /// Route `error` through the effective error handler (the emitter's
    /// own, else the holder's) and hand it back unchanged.
    fn report_error(&mut self, error: Error, message: &str) -> Error {
        let origin = self.state().id().unwrap_or_else(|| EmitterId::from_u32(u32::MAX));
        if let Some(mut handler) = self.state_mut().error_handler.take() {
            handler.handle_error(error, message, origin);
            let state = self.state_mut();
            if state.error_handler.is_none() {
                state.error_handler = Some(handler);
            }
        } else if let Some(code) = self.state().code().cloned() {
            let mut inner = code.borrow_mut();
            if let Some(handler) = inner.error_handler.as_deref_mut() {
                handler.handle_error(error, message, origin);
            }
        }
        error
    }

    /// Whether an effective logger is installed; refreshes holder-inherited
    /// settings first. Callers use this to skip formatting entirely.
    fn logging_enabled(&mut self) -> bool {
        self.state_mut().sync_settings();
        self.state().log_enabled()
    }

    /// Whether standalone comments should reach the logger.
    fn comments_logged(&mut self) -> bool {
        self.state().flags.contains(EmitterFlags::LOG_COMMENTS) && self.logging_enabled()
    }

    /// Send one listing line to the effective logger (the emitter's own,
    /// else the holder's).
    fn log_line(&mut self, line: &str) {
        self.state_mut().sync_settings();
        if !self.state().log_enabled() {
            return;
        }
        if let Some(logger) = self.state_mut().logger.as_deref_mut() {
            logger.log(line);
            return;
        }
        if let Some(code) = self.state().code().cloned() {
            code.borrow_mut().log(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitter_id_display() {
        assert_eq!(EmitterId::from_u32(3).to_string(), "emitter3");
    }

    #[test]
    fn state_transient_reset() {
        let mut state = EmitterState::new(EmitterKind::Assembler);
        state.next_inst_options = InstOptions::REP;
        state.next_extra_reg = Some(Reg::mask(1));
        state.next_comment = Some("hello".to_string());
        state.reset_transient();
        assert_eq!(state.next_inst_options, InstOptions::empty());
        assert_eq!(state.next_extra_reg, None);
        assert_eq!(state.next_comment, None);
    }
}
