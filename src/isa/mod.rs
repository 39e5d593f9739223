//! Per-architecture encoding backends.
//!
//! Each backend exposes a static [`ArchFuncs`] record of function pointers;
//! an emitter picks its record once, when it is attached to a holder, and
//! dispatches through it afterwards.

pub mod aarch64;
pub mod x64;

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::env::Arch;
use crate::error::Result;
use crate::holder::HolderInner;
use crate::inst::{EncodingOptions, Inst, ValidationFlags};
use crate::label::{Label, LabelUse, PatchSite};
use crate::operand::Operand;
use crate::reloc::RelocEntry;
use crate::section::SectionId;

/// The per-architecture entry points consumed by the emitters.
pub(crate) struct ArchFuncs {
    pub arch: Arch,
    /// Check operand shapes; used by the `VALIDATE_*` diagnostic options.
    pub validate: fn(&Inst, &[Operand], ValidationFlags) -> Result<()>,
    /// Encode one instruction into the context's active section.
    pub encode: fn(&mut EncodeCtx<'_>, &Inst, &[Operand]) -> Result<()>,
    /// Append `count` bytes of NOP filler.
    pub nop_fill: fn(&mut CodeBuffer, count: u32, optimized: bool) -> Result<()>,
}

pub(crate) fn funcs_for(arch: Arch) -> &'static ArchFuncs {
    match arch {
        Arch::X64 => &x64::FUNCS,
        Arch::Aarch64 => &aarch64::FUNCS,
    }
}

/// Everything an encoder may touch: the active section's buffer plus the
/// holder's label and relocation state, so label operands can be resolved
/// inline, linked for later patching, or spilled to relocations.
pub(crate) struct EncodeCtx<'a> {
    pub inner: &'a mut HolderInner,
    pub section: SectionId,
    pub encoding_options: EncodingOptions,
}

impl EncodeCtx<'_> {
    pub fn buffer(&mut self) -> &mut CodeBuffer {
        &mut self.inner.sections[self.section.index()].buffer
    }

    pub fn offset(&self) -> CodeOffset {
        self.inner.sections[self.section.index()].buffer.len()
    }

    /// The label's offset, if it is bound in the active section.
    pub fn label_bound_here(&self, label: Label) -> Option<CodeOffset> {
        let entry = self.inner.labels.get(label.index())?;
        (entry.section == Some(self.section)).then_some(entry.offset)
    }

    /// Resolve a label reference whose displacement field was just emitted
    /// (zero-filled) at `at`.
    ///
    /// Bound in the active section: patched immediately (an out-of-range
    /// displacement fails the encoding). Bound elsewhere: recorded as a
    /// relative relocation. Unbound: linked into the label's patch chain.
    pub fn use_label(&mut self, label: Label, at: CodeOffset, encoding: LabelUse) -> Result<()> {
        self.inner.label_ok(label)?;
        let bound = self.inner.labels[label.index()].section;
        match bound {
            Some(section) if section == self.section => {
                let target = self.inner.labels[label.index()].offset;
                let disp = i64::from(target) - i64::from(at + encoding.pcrel_base());
                let buffer = &mut self.inner.sections[self.section.index()].buffer;
                encoding.patch(buffer, at, disp)
            }
            Some(_) => {
                self.inner
                    .relocs
                    .push(RelocEntry::relative(self.section, at, label, encoding));
                Ok(())
            }
            None => {
                self.inner.labels[label.index()].links.push(PatchSite {
                    section: self.section,
                    offset: at,
                    encoding,
                });
                Ok(())
            }
        }
    }
}
