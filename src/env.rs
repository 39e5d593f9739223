//! Target environment description.

use crate::error::{Error, Result};
use core::fmt;
use target_lexicon::{Architecture, Triple};

/// A target architecture supported by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86-64 (64-bit mode only).
    X64,
    /// AArch64.
    Aarch64,
}

impl Arch {
    /// Pointer width in bytes.
    pub fn pointer_width(self) -> u8 {
        8
    }

    /// Natural instruction alignment; this is the default alignment of the
    /// `.text` section.
    pub fn inst_alignment(self) -> u32 {
        match self {
            Arch::X64 => 1,
            Arch::Aarch64 => 4,
        }
    }

    /// The byte used to fill data-alignment padding in code sections.
    pub fn data_fill_byte(self) -> u8 {
        match self {
            // `int3`, so strays into padding fault loudly.
            Arch::X64 => 0xCC,
            Arch::Aarch64 => 0x00,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The target environment of a `CodeHolder`: architecture plus derived
/// parameters (pointer width, default alignments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    arch: Arch,
}

impl Environment {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    /// Look up an environment for the given target triple.
    ///
    /// Returns `Error::FeatureNotEnabled` for architectures this assembler
    /// does not support.
    pub fn from_triple(triple: &Triple) -> Result<Self> {
        match triple.architecture {
            Architecture::X86_64 => Ok(Self::new(Arch::X64)),
            Architecture::Aarch64(_) => Ok(Self::new(Arch::Aarch64)),
            _ => Err(Error::FeatureNotEnabled),
        }
    }

    /// The environment of the machine we are running on.
    pub fn host() -> Result<Self> {
        Self::from_triple(&Triple::host())
    }

    pub fn arch(self) -> Arch {
        self.arch
    }

    pub fn pointer_width(self) -> u8 {
        self.arch.pointer_width()
    }
}
