//! Sections: named contiguous output regions.

use crate::buffer::{CodeBuffer, CodeOffset};
use bitflags::bitflags;
use core::fmt;

/// An opaque reference to a [`Section`] owned by a
/// [`CodeHolder`](crate::CodeHolder).
///
/// Section ids are dense and stable for the lifetime of the holder; id 0 is
/// always the implicit `.text` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u32);

impl SectionId {
    /// The implicit `.text` section created by `CodeHolder::new`.
    pub const TEXT: SectionId = SectionId(0);

    pub(crate) fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sect{}", self.0)
    }
}

bitflags! {
    /// Attributes of a section in the final image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// The section holds executable code.
        const EXECUTABLE = 0b001;
        /// The section is writable at run time.
        const WRITABLE = 0b010;
        /// The section occupies no file space and is zero-initialized.
        const ZERO_INITIALIZED = 0b100;
    }
}

/// A named region of output with its own byte buffer.
///
/// Sections are created by [`CodeHolder::new_section`](crate::CodeHolder::new_section)
/// and live until the holder is reset or dropped. Until
/// [`flatten`](crate::CodeHolder::flatten) runs, offsets within a section are
/// relative to the section start; flattening assigns each section a final
/// offset in the contiguous image.
#[derive(Debug, Clone)]
pub struct Section {
    id: SectionId,
    name: String,
    alignment: u32,
    flags: SectionFlags,
    pub(crate) buffer: CodeBuffer,
    pub(crate) final_offset: Option<u64>,
}

impl Section {
    pub(crate) fn new(id: SectionId, name: &str, flags: SectionFlags, alignment: u32) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            id,
            name: name.to_string(),
            alignment,
            flags,
            buffer: CodeBuffer::new(),
            final_offset: None,
        }
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    /// Current size of the section's buffer in bytes.
    pub fn size(&self) -> CodeOffset {
        self.buffer.len()
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// The section's offset in the flattened image, once
    /// [`flatten`](crate::CodeHolder::flatten) has run.
    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(SectionId::TEXT.to_string(), "sect0");
        assert_eq!(SectionId::from_u32(3).to_string(), "sect3");
    }

    #[test]
    fn flags() {
        let s = Section::new(SectionId::TEXT, ".text", SectionFlags::EXECUTABLE, 16);
        assert!(s.flags().contains(SectionFlags::EXECUTABLE));
        assert!(!s.flags().contains(SectionFlags::WRITABLE));
        assert_eq!(s.size(), 0);
    }
}
