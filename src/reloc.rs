//! Relocation records: fixups whose targets cannot be resolved inline.

use crate::buffer::CodeOffset;
use crate::label::{Label, LabelUse};
use crate::section::SectionId;

/// Addend to add to the resolved target value.
pub type Addend = i64;

/// How a relocation's value is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// The absolute address of the target; only resolvable when the final
    /// load address is known, so these always survive as output relocations.
    Absolute,
    /// Displacement from the relocation site to the target.
    Relative,
    /// `target - base + addend`; produced by `embed_label_delta`.
    Expr,
}

/// What a relocation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// A label owned by the same holder (possibly external).
    Label(Label),
    /// A fixed external address.
    Address(u64),
    /// The start of a section.
    Section(SectionId),
}

/// A pending fixup recorded by a `CodeHolder`.
///
/// Entries are appended during encoding when a target is not resolvable
/// inline, and either rewritten by
/// [`resolve_cross_section`](crate::CodeHolder::resolve_cross_section) or
/// handed to the client as part of the emitted artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocEntry {
    pub kind: RelocKind,
    /// Section containing the bytes to fix up.
    pub src_section: SectionId,
    /// Offset of the fixup field within `src_section`.
    pub src_offset: CodeOffset,
    pub target: RelocTarget,
    /// Base label for [`RelocKind::Expr`] entries.
    pub base: Option<Label>,
    pub addend: Addend,
    /// Width of the fixup field in bytes.
    pub size: u8,
    /// Inline patch encoding, when the site was emitted as a patchable
    /// instruction field rather than raw data bytes.
    pub encoding: Option<LabelUse>,
}

impl RelocEntry {
    /// An absolute-address fixup of `size` bytes pointing at `label`.
    pub fn absolute(
        src_section: SectionId,
        src_offset: CodeOffset,
        label: Label,
        addend: Addend,
        size: u8,
    ) -> Self {
        Self {
            kind: RelocKind::Absolute,
            src_section,
            src_offset,
            target: RelocTarget::Label(label),
            base: None,
            addend,
            size,
            encoding: None,
        }
    }

    /// A pc-relative fixup created from a patch site whose label turned out
    /// to live in a different section.
    pub fn relative(
        src_section: SectionId,
        src_offset: CodeOffset,
        label: Label,
        encoding: LabelUse,
    ) -> Self {
        Self {
            kind: RelocKind::Relative,
            src_section,
            src_offset,
            target: RelocTarget::Label(label),
            base: None,
            addend: 0,
            size: encoding.size(),
            encoding: Some(encoding),
        }
    }
}
