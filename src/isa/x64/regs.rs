//! x64 register constructors.

use crate::operand::Reg;

/// A 64-bit GPR from its hardware encoding.
pub fn gpr(enc: u8) -> Reg {
    debug_assert!(enc < 16);
    Reg::gpr64(enc)
}

/// A 32-bit GPR view from its hardware encoding.
pub fn gpr32(enc: u8) -> Reg {
    debug_assert!(enc < 16);
    Reg::gpr32(enc)
}

/// An AVX-512 mask register.
pub fn k(enc: u8) -> Reg {
    Reg::mask(enc)
}

macro_rules! gpr64_ctors {
    ($($name:ident = $enc:expr;)*) => {
        $(pub fn $name() -> Reg { Reg::gpr64($enc) })*
    };
}

gpr64_ctors! {
    rax = 0; rcx = 1; rdx = 2; rbx = 3; rsp = 4; rbp = 5; rsi = 6; rdi = 7;
    r8 = 8; r9 = 9; r10 = 10; r11 = 11; r12 = 12; r13 = 13; r14 = 14; r15 = 15;
}

macro_rules! gpr32_ctors {
    ($($name:ident = $enc:expr;)*) => {
        $(pub fn $name() -> Reg { Reg::gpr32($enc) })*
    };
}

gpr32_ctors! {
    eax = 0; ecx = 1; edx = 2; ebx = 3; esp = 4; ebp = 5; esi = 6; edi = 7;
}
