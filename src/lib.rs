//! A runtime assembler for x64 and aarch64.
//!
//! Clients build machine code through an emitter attached to a
//! [`CodeHolder`], which owns the section buffers, labels, and relocations.
//! Three emitters share one surface (the [`Emitter`] trait): [`Assembler`]
//! encodes immediately, [`Builder`] records a deferred instruction list,
//! and [`Compiler`] adds virtual registers on top of the deferred list.
//!
//! ```
//! use asmkit::x64::regs::{rax, rdi};
//! use asmkit::{Arch, Assembler, CodeHolder, Emitter, Environment, InstId};
//!
//! # fn main() -> Result<(), asmkit::Error> {
//! let code = CodeHolder::new(Environment::new(Arch::X64));
//! let mut a = Assembler::new(&code)?;
//!
//! // Forward references link into the label's patch chain and are
//! // resolved when the label is bound.
//! let exit = a.new_label()?;
//! a.emit(InstId::Mov, &[rax().into(), rdi().into()])?;
//! a.emit(InstId::Jmp, &[exit.into()])?;
//! a.bind(exit)?;
//! a.emit(InstId::Ret, &[])?;
//!
//! // Lay the sections out and serialize them.
//! let total = code.flatten()?;
//! let mut image = vec![0u8; usize::try_from(total).unwrap()];
//! code.copy_flattened_data(&mut image)?;
//! assert_eq!(image.last(), Some(&0xC3));
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod buffer;
pub mod builder;
pub mod compiler;
pub mod const_pool;
pub mod emitter;
pub mod env;
pub mod error;
pub mod fmt;
pub mod holder;
pub mod inst;
mod isa;
pub mod label;
pub mod operand;
pub mod reloc;
pub mod section;

pub use crate::assembler::Assembler;
pub use crate::buffer::{CodeBuffer, CodeOffset};
pub use crate::builder::Builder;
pub use crate::compiler::Compiler;
pub use crate::const_pool::ConstPool;
pub use crate::emitter::{
    AlignMode, Emitter, EmitterFlags, EmitterId, EmitterKind, EmitterState, ErrorHandler,
};
pub use crate::env::{Arch, Environment};
pub use crate::error::{Error, Result};
pub use crate::fmt::{format_inst, Logger, StringLogger};
pub use crate::holder::CodeHolder;
pub use crate::inst::{
    DiagnosticOptions, EncodingOptions, Inst, InstId, InstOptions, ValidationFlags,
};
pub use crate::isa::aarch64;
pub use crate::isa::x64;
pub use crate::label::{Label, LabelType, LabelUse, PatchSite};
pub use crate::operand::{Mem, Operand, Reg, RegClass, RegSize, MAX_OPERANDS};
pub use crate::reloc::{Addend, RelocEntry, RelocKind, RelocTarget};
pub use crate::section::{Section, SectionFlags, SectionId};
