//! Error codes shared by the whole crate.

/// The result of an emission operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// An error reported by a `CodeHolder` or an emitter.
///
/// This is a closed set: every fallible operation in the crate maps onto one
/// of these codes, and the first failure wins (errors are never aggregated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A memory allocation for code or bookkeeping state failed.
    #[error("out of memory")]
    OutOfMemory,

    /// An argument was malformed, e.g. a non-power-of-two alignment.
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation is not valid in the current state, e.g. emitting
    /// through a detached emitter.
    #[error("invalid state")]
    InvalidState,

    /// The emitter is already attached to a `CodeHolder`.
    #[error("emitter is already attached")]
    AlreadyAttached,

    /// The emitter is not attached to the given `CodeHolder`.
    #[error("emitter is not attached")]
    NotAttached,

    /// `finalize()` already ran on this emitter.
    #[error("emitter was already finalized")]
    AlreadyFinalized,

    /// The label id does not name a live label in the `CodeHolder`.
    #[error("invalid label")]
    InvalidLabel,

    /// A global or local label with the same name already exists.
    #[error("label name collision")]
    LabelNameCollision,

    /// The label was already bound to a section and offset.
    #[error("label is already bound")]
    AlreadyBound,

    /// The label id space is exhausted.
    #[error("too many labels")]
    TooManyLabels,

    /// The section id does not name a section owned by the `CodeHolder`.
    #[error("invalid section")]
    InvalidSection,

    /// The instruction id is unknown to the target architecture.
    #[error("invalid instruction")]
    InvalidInstruction,

    /// An operand has a type or shape the instruction cannot accept.
    #[error("invalid operand")]
    InvalidOperand,

    /// Register or immediate widths disagree between operands.
    #[error("operand size mismatch")]
    OperandSizeMismatch,

    /// A displacement does not fit the patch-site encoding.
    #[error("relocation out of range")]
    RelocationOutOfRange,

    /// The register allocation pass could not assign physical registers.
    #[error("register allocation failed")]
    RegAllocFailure,

    /// The requested target or option is not enabled in this build.
    #[error("feature not enabled")]
    FeatureNotEnabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::RelocationOutOfRange.to_string(), "relocation out of range");
        assert_eq!(Error::AlreadyBound.to_string(), "label is already bound");
    }
}
