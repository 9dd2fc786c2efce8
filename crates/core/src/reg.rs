//! 32-bit x86 register model.
//!
//! Registers are ordered so that save/restore sets iterate deterministically:
//! the emission prologue pushes in increasing order and the epilogue pops in
//! decreasing order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-bit x86 register, plus the flags pseudo-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum X86Reg {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    /// Flags register; participates in save sets but is pushed with `pushf`.
    Eflags,
}

/// General-purpose registers eligible as scratch space.
///
/// ESP is excluded: the chain engine owns the stack pointer. EBP is
/// included; frame-pointer-free functions may clobber it when dead.
pub const GPR: [X86Reg; 7] = [
    X86Reg::Eax,
    X86Reg::Ecx,
    X86Reg::Edx,
    X86Reg::Ebx,
    X86Reg::Ebp,
    X86Reg::Esi,
    X86Reg::Edi,
];

impl X86Reg {
    /// Registers clobbered by a `call` under the cdecl convention.
    pub const CALL_CLOBBERED: [X86Reg; 3] = [X86Reg::Eax, X86Reg::Ecx, X86Reg::Edx];

    /// Returns true for registers that can hold a computed value.
    pub fn is_gpr(self) -> bool {
        !matches!(self, X86Reg::Eflags)
    }
}

impl fmt::Display for X86Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            X86Reg::Eax => "eax",
            X86Reg::Ecx => "ecx",
            X86Reg::Edx => "edx",
            X86Reg::Ebx => "ebx",
            X86Reg::Esp => "esp",
            X86Reg::Ebp => "ebp",
            X86Reg::Esi => "esi",
            X86Reg::Edi => "edi",
            X86Reg::Eflags => "eflags",
        };
        f.write_str(name)
    }
}
