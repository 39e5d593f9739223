//! The compiling backend: Builder semantics plus virtual registers and a
//! register-allocation pass run before replay.

use crate::builder::{Builder, Node};
use crate::const_pool::ConstPool;
use crate::emitter::{AlignMode, Emitter, EmitterFlags, EmitterKind, EmitterState};
use crate::env::Arch;
use crate::error::{Error, Result};
use crate::holder::CodeHolder;
use crate::inst::{DiagnosticOptions, Inst};
use crate::label::Label;
use crate::operand::{Operand, Reg, RegSize};
use crate::section::SectionId;
use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// SysV-style integer argument registers.
fn abi_arg_regs(arch: Arch) -> &'static [u8] {
    match arch {
        // rdi, rsi, rdx, rcx, r8, r9.
        Arch::X64 => &[7, 6, 2, 1, 8, 9],
        Arch::Aarch64 => &[0, 1, 2, 3, 4, 5, 6, 7],
    }
}

/// Registers the allocator may hand out, in preference order.
fn allocatable_regs(arch: Arch) -> &'static [u8] {
    match arch {
        // Caller-saved GPRs; rsp/rbp stay out of the pool.
        Arch::X64 => &[0, 1, 2, 6, 7, 8, 9, 10, 11],
        Arch::Aarch64 => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    }
}

/// A [`Builder`] that additionally hands out virtual registers and lowers
/// them to physical registers inside [`finalize`](Emitter::finalize).
///
/// The allocation pass is a first-use linear assignment over the node list:
/// argument registers pinned by [`set_args`](Compiler::set_args) first, the
/// remaining virtual registers in order of first appearance. Running out of
/// allocatable registers fails with `RegAllocFailure`; there is no spilling.
pub struct Compiler {
    b: Builder,
    virt_count: u32,
}

impl Compiler {
    /// Create a compiler attached to `code`.
    pub fn new(code: &CodeHolder) -> Result<Self> {
        Ok(Self {
            b: Builder::with_kind(code, EmitterKind::Compiler)?,
            virt_count: 0,
        })
    }

    fn new_virt(&mut self, size: RegSize) -> Result<Reg> {
        let id = u32::from(Reg::VIRT_BASE) + self.virt_count;
        let Ok(id) = u8::try_from(id) else {
            return Err(self.report_error(Error::RegAllocFailure, "virtual register pool"));
        };
        self.virt_count += 1;
        Ok(match size {
            RegSize::Size64 => Reg::gpr64(id),
            RegSize::Size32 => Reg::gpr32(id),
        })
    }

    /// Allocate a 64-bit virtual GPR.
    pub fn new_gpr64(&mut self) -> Result<Reg> {
        self.new_virt(RegSize::Size64)
    }

    /// Allocate a 32-bit virtual GPR.
    pub fn new_gpr32(&mut self) -> Result<Reg> {
        self.new_virt(RegSize::Size32)
    }

    /// Number of virtual registers handed out so far.
    pub fn virt_reg_count(&self) -> u32 {
        self.virt_count
    }

    /// Mark the start of a function frame.
    pub fn func_frame(&mut self) -> Result<()> {
        self.b.ensure_open().map_err(|err| self.report_error(err, "func_frame"))?;
        self.b.push_node(Node::FuncFrame);
        Ok(())
    }

    /// Pin `args` (virtual registers) to the ABI argument registers, in
    /// order.
    pub fn set_args(&mut self, args: &[Reg]) -> Result<()> {
        let result = self.b.ensure_open().and_then(|()| {
            let arch = self.b.state().arch().ok_or(Error::InvalidState)?;
            if args.len() > abi_arg_regs(arch).len() {
                return Err(Error::InvalidArgument);
            }
            if args.iter().any(|reg| !reg.is_virtual()) {
                return Err(Error::InvalidOperand);
            }
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.report_error(err, "set_args"));
        }
        self.b.push_node(Node::ArgsAssignment(SmallVec::from_slice(args)));
        Ok(())
    }

    /// Rewrite every virtual register in the node list to a physical one.
    fn run_alloc(&mut self) -> Result<()> {
        let arch = self.b.state().arch().ok_or(Error::InvalidState)?;
        let annotate = self
            .b
            .state()
            .diagnostic_options
            .contains(DiagnosticOptions::RA_ANNOTATE);

        let mut map: FxHashMap<u8, u8> = FxHashMap::default();
        let mut used: u32 = 0;

        // Arguments are pinned to their ABI registers first.
        for entry in &self.b.nodes {
            if let Node::ArgsAssignment(args) = &entry.node {
                for (index, reg) in args.iter().enumerate() {
                    let abi = abi_arg_regs(arch)[index];
                    map.insert(reg.id(), abi);
                    used |= 1 << abi;
                }
            }
        }

        let pool = allocatable_regs(arch);
        let mut assign = |virt: u8, map: &mut FxHashMap<u8, u8>, used: &mut u32| -> Result<u8> {
            if let Some(&phys) = map.get(&virt) {
                return Ok(phys);
            }
            let phys = pool
                .iter()
                .copied()
                .find(|&enc| *used & (1 << enc) == 0)
                .ok_or(Error::RegAllocFailure)?;
            *used |= 1 << phys;
            map.insert(virt, phys);
            trace!("ra: v{virt} -> gpr{phys}");
            Ok(phys)
        };

        for entry in &mut self.b.nodes {
            let Node::Inst { ops, comment, .. } = &mut entry.node else {
                continue;
            };
            let mut assigned: SmallVec<[(u8, u8); 2]> = SmallVec::new();
            for op in ops.iter_mut() {
                match op {
                    Operand::Reg(reg) if reg.is_virtual() => {
                        let fresh = !map.contains_key(&reg.id());
                        let phys = assign(reg.id(), &mut map, &mut used)?;
                        if fresh {
                            assigned.push((reg.id(), phys));
                        }
                        *op = Operand::Reg(reg.with_id(phys));
                    }
                    Operand::Mem(mem) => {
                        if let Some(base) = mem.base.filter(|r| r.is_virtual()) {
                            mem.base = Some(base.with_id(assign(base.id(), &mut map, &mut used)?));
                        }
                        if let Some(index) = mem.index.filter(|r| r.is_virtual()) {
                            mem.index =
                                Some(index.with_id(assign(index.id(), &mut map, &mut used)?));
                        }
                    }
                    _ => {}
                }
            }
            if annotate && !assigned.is_empty() && comment.is_none() {
                let text = assigned
                    .iter()
                    .map(|(virt, phys)| format!("v{virt} -> gpr{phys}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                *comment = Some(text);
            }
        }
        Ok(())
    }
}

impl Emitter for Compiler {
    fn state(&self) -> &EmitterState {
        self.b.state()
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        self.b.state_mut()
    }

    fn emit_impl(&mut self, inst: &Inst, ops: &[Operand], comment: Option<&str>) -> Result<()> {
        self.b.emit_impl(inst, ops, comment)
    }

    fn switch_section(&mut self, section: SectionId) -> Result<()> {
        self.b.switch_section(section)
    }

    fn bind(&mut self, label: Label) -> Result<()> {
        self.b.bind(label)
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<()> {
        self.b.align(mode, alignment)
    }

    fn embed(&mut self, data: &[u8]) -> Result<()> {
        self.b.embed(data)
    }

    fn embed_label(&mut self, label: Label, size: u8) -> Result<()> {
        self.b.embed_label(label, size)
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, size: u8) -> Result<()> {
        self.b.embed_label_delta(label, base, size)
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<()> {
        self.b.embed_const_pool(label, pool)
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        self.b.comment(text)
    }

    fn finalize(&mut self) -> Result<()> {
        let code = match self.b.ensure_open().and_then(|()| self.holder()) {
            Ok(code) => code,
            Err(err) => return Err(self.report_error(err, "finalize")),
        };
        if let Err(err) = self.run_alloc() {
            return Err(self.report_error(err, "register allocation"));
        }
        // Replay failures were already reported by the transient assembler.
        self.b.replay(&code)?;
        self.b.state_mut().flags.insert(EmitterFlags::FINALIZED);
        Ok(())
    }

    fn on_attach(&mut self) {}

    fn on_detach(&mut self) {}
}
