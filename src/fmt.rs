//! Text formatting of instructions, and the logger sink.

use crate::env::Arch;
use crate::inst::{Inst, InstOptions};
use crate::operand::{Mem, Operand, Reg, RegClass, RegSize};

/// A line-oriented sink for assembly listings.
///
/// Implementations receive one line per logged event, without a trailing
/// newline. They may perform I/O; the emitter treats them as black boxes.
pub trait Logger {
    fn log(&mut self, line: &str);
}

/// A [`Logger`] that collects lines into a `String`; mainly useful in tests.
#[derive(Debug, Default)]
pub struct StringLogger {
    content: String,
}

impl StringLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

impl Logger for StringLogger {
    fn log(&mut self, line: &str) {
        self.content.push_str(line);
        self.content.push('\n');
    }
}

static X64_GPR64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

static X64_GPR32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];

fn reg_name(arch: Arch, reg: Reg) -> String {
    if reg.is_virtual() {
        return format!("v{}", reg.id());
    }
    match (arch, reg.class()) {
        (_, RegClass::Mask) => format!("k{}", reg.id()),
        (Arch::X64, RegClass::Gpr) => {
            let table = match reg.size() {
                RegSize::Size32 => &X64_GPR32,
                RegSize::Size64 => &X64_GPR64,
            };
            table[reg.id() as usize & 15].to_string()
        }
        (Arch::Aarch64, RegClass::Gpr) => {
            let prefix = match reg.size() {
                RegSize::Size32 => 'w',
                RegSize::Size64 => 'x',
            };
            match (reg.id(), reg.size()) {
                (31, RegSize::Size64) => "xzr".to_string(),
                (31, RegSize::Size32) => "wzr".to_string(),
                (id, _) => format!("{prefix}{id}"),
            }
        }
    }
}

fn mem_text(arch: Arch, mem: &Mem) -> String {
    if let Some(label) = mem.label {
        return format!("[{label}]");
    }
    let mut out = String::from("[");
    if let Some(base) = mem.base {
        out.push_str(&reg_name(arch, base));
    }
    if let Some(index) = mem.index {
        out.push_str(" + ");
        out.push_str(&reg_name(arch, index));
        if mem.shift != 0 {
            out.push_str(&format!(" << {}", mem.shift));
        }
    }
    if mem.disp != 0 {
        if mem.disp < 0 {
            out.push_str(&format!(" - {:#x}", -i64::from(mem.disp)));
        } else {
            out.push_str(&format!(" + {:#x}", mem.disp));
        }
    }
    out.push(']');
    out
}

fn operand_text(arch: Arch, op: &Operand) -> String {
    match op {
        Operand::None => "<none>".to_string(),
        Operand::Reg(r) => reg_name(arch, *r),
        Operand::Imm(v) => {
            if *v < 0 {
                format!("-{:#x}", v.unsigned_abs())
            } else {
                format!("{v:#x}")
            }
        }
        Operand::Mem(m) => mem_text(arch, m),
        Operand::Label(l) => l.to_string(),
    }
}

/// Render one instruction as listing text, e.g. `rep movs` or
/// `add rax, rbx {k1} ; spilled`.
pub fn format_inst(arch: Arch, inst: &Inst, ops: &[Operand], comment: Option<&str>) -> String {
    let mut out = String::new();
    if inst.options.contains(InstOptions::LOCK) {
        out.push_str("lock ");
    }
    if inst.options.contains(InstOptions::REP) {
        out.push_str("rep ");
    }
    if inst.options.contains(InstOptions::REPNE) {
        out.push_str("repne ");
    }
    out.push_str(inst.id.name());
    for (i, op) in ops.iter().enumerate() {
        out.push_str(if i == 0 { " " } else { ", " });
        out.push_str(&operand_text(arch, op));
    }
    if let Some(extra) = inst.extra_reg {
        out.push_str(&format!(" {{{}}}", reg_name(arch, extra)));
    }
    if let Some(comment) = comment {
        out.push_str(" ; ");
        out.push_str(comment);
    }
    out
}
