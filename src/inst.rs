//! Instruction ids, per-instruction options, and configuration flag sets.

use crate::env::Arch;
use crate::operand::Reg;
use bitflags::bitflags;
use core::fmt;

/// An architecture-neutral instruction mnemonic.
///
/// Each id maps onto the native instruction of the active architecture
/// (e.g. [`InstId::Jmp`] encodes as `jmp rel32` on x64 and `b` on aarch64);
/// ids with no counterpart on the active architecture are rejected with
/// `InvalidInstruction` at emit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstId {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Mov,
    /// String move (x64 `movsb`); honors the `REP`/`REPNE` options.
    Movs,
    Lea,
    Inc,
    Dec,
    Push,
    Pop,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Call,
    Ret,
    Nop,
    Int3,
    Ud2,
    /// aarch64 load (register or literal).
    Ldr,
    /// aarch64 store.
    Str,
    /// aarch64 pc-relative address materialization.
    Adr,
    /// aarch64 breakpoint.
    Brk,
    /// aarch64 permanently-undefined.
    Udf,
}

/// Mnemonic table; kept sorted by name so lookup can binary-search.
const MNEMONICS: &[(&str, InstId)] = &[
    ("add", InstId::Add),
    ("adr", InstId::Adr),
    ("and", InstId::And),
    ("brk", InstId::Brk),
    ("call", InstId::Call),
    ("cmp", InstId::Cmp),
    ("dec", InstId::Dec),
    ("inc", InstId::Inc),
    ("int3", InstId::Int3),
    ("je", InstId::Je),
    ("jg", InstId::Jg),
    ("jge", InstId::Jge),
    ("jl", InstId::Jl),
    ("jle", InstId::Jle),
    ("jmp", InstId::Jmp),
    ("jne", InstId::Jne),
    ("ldr", InstId::Ldr),
    ("lea", InstId::Lea),
    ("mov", InstId::Mov),
    ("movs", InstId::Movs),
    ("nop", InstId::Nop),
    ("or", InstId::Or),
    ("pop", InstId::Pop),
    ("push", InstId::Push),
    ("ret", InstId::Ret),
    ("str", InstId::Str),
    ("sub", InstId::Sub),
    ("test", InstId::Test),
    ("ud2", InstId::Ud2),
    ("udf", InstId::Udf),
    ("xor", InstId::Xor),
];

impl InstId {
    /// The mnemonic string for this id.
    pub fn name(self) -> &'static str {
        MNEMONICS
            .iter()
            .find(|(_, id)| *id == self)
            .map(|(name, _)| *name)
            .unwrap()
    }

    /// Parse a mnemonic; the inverse of [`InstId::name`].
    pub fn from_name(name: &str) -> Option<InstId> {
        MNEMONICS
            .binary_search_by_key(&name, |(n, _)| *n)
            .ok()
            .map(|i| MNEMONICS[i].1)
    }

    /// Whether the active architecture has an encoding for this id.
    pub fn is_supported_on(self, arch: Arch) -> bool {
        match arch {
            Arch::X64 => !matches!(
                self,
                InstId::Ldr | InstId::Str | InstId::Adr | InstId::Brk | InstId::Udf
            ),
            Arch::Aarch64 => !matches!(
                self,
                InstId::Movs
                    | InstId::Lea
                    | InstId::Inc
                    | InstId::Dec
                    | InstId::Push
                    | InstId::Pop
                    | InstId::Int3
                    | InstId::Ud2
            ),
        }
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Options decorating a single instruction.
    ///
    /// Bits outside the named set are reserved and round-trip unchanged
    /// through the option setters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstOptions: u32 {
        /// `rep`/`repe` prefix (x64).
        const REP = 1 << 0;
        /// `repne` prefix (x64).
        const REPNE = 1 << 1;
        /// `lock` prefix (x64).
        const LOCK = 1 << 2;
        /// Use the shortest encoding even when a longer canonical form
        /// exists.
        const SHORT_FORM = 1 << 3;
        /// Branch predicted taken (encoded only under `PREDICTED_JUMPS`).
        const PREDICT_TAKEN = 1 << 4;
        /// Branch predicted not taken.
        const PREDICT_NOT_TAKEN = 1 << 5;

        const _ = !0;
    }
}

bitflags! {
    /// Holder-wide options consumed by the encoders.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncodingOptions: u32 {
        /// Prefer shorter instruction forms where semantics allow it.
        const OPTIMIZE_FOR_SIZE = 1 << 0;
        /// Fill code alignment with multi-byte NOPs instead of repeating
        /// the single-byte form.
        const OPTIMIZED_ALIGN = 1 << 1;
        /// Encode branch-prediction hints for instructions carrying
        /// `PREDICT_*` options.
        const PREDICTED_JUMPS = 1 << 2;

        const _ = !0;
    }
}

bitflags! {
    /// Diagnostic switches; each bit's cost is paid only where consumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiagnosticOptions: u32 {
        /// Validate operands on the Assembler's direct emit path.
        const VALIDATE_ASSEMBLER = 1 << 0;
        /// Validate operands when Builder/Compiler record IR nodes.
        const VALIDATE_INTERMEDIATE = 1 << 1;
        /// Annotate register-allocation results as comments.
        const RA_ANNOTATE = 1 << 2;
        const RA_DEBUG_CFG = 1 << 3;
        const RA_DEBUG_LIVENESS = 1 << 4;
        const RA_DEBUG_ASSIGNMENT = 1 << 5;
        const RA_DEBUG_UNREACHABLE = 1 << 6;

        const _ = !0;
    }
}

bitflags! {
    /// Strictness knobs for the operand validator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValidationFlags: u32 {
        /// Accept virtual registers (Builder/Compiler streams before the
        /// allocation pass).
        const VIRT_REGS = 1 << 0;

        const _ = !0;
    }
}

/// A fully-described instruction: id plus the per-instruction state the
/// emitter merges from its transient options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inst {
    pub id: InstId,
    pub options: InstOptions,
    /// Extra register decorating the instruction (e.g. an AVX-512 mask).
    pub extra_reg: Option<Reg>,
}

impl Inst {
    pub fn new(id: InstId) -> Self {
        Self { id, options: InstOptions::empty(), extra_reg: None }
    }

    pub fn with_options(id: InstId, options: InstOptions) -> Self {
        Self { id, options, extra_reg: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_table_is_sorted() {
        for pair in MNEMONICS.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} !< {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn name_round_trip() {
        for (name, id) in MNEMONICS {
            assert_eq!(id.name(), *name);
            assert_eq!(InstId::from_name(name), Some(*id));
        }
        assert_eq!(InstId::from_name("bogus"), None);
    }

    #[test]
    fn arch_support() {
        assert!(InstId::Movs.is_supported_on(Arch::X64));
        assert!(!InstId::Movs.is_supported_on(Arch::Aarch64));
        assert!(InstId::Ldr.is_supported_on(Arch::Aarch64));
        assert!(!InstId::Ldr.is_supported_on(Arch::X64));
        assert!(InstId::Jmp.is_supported_on(Arch::X64));
        assert!(InstId::Jmp.is_supported_on(Arch::Aarch64));
    }

    #[test]
    fn reserved_option_bits_round_trip() {
        let raw = 0xF000_0000 | InstOptions::REP.bits();
        let opts = InstOptions::from_bits_retain(raw);
        assert_eq!(opts.bits(), raw);
        assert!(opts.contains(InstOptions::REP));
    }
}
