//! Machine instructions and operands.

use crate::reg::X86Reg;
use petgraph::graph::NodeIndex;
use std::collections::BTreeSet;
use std::fmt;

/// A local assembly label.
///
/// Anonymous labels render as `.Ltmp<id>`; named labels render verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    pub id: u32,
    pub name: Option<String>,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, ".Ltmp{}", self.id),
        }
    }
}

/// Reference to a module-level global symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRef {
    pub name: String,
}

impl GlobalRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Unique id of an original machine instruction within its function.
///
/// Instructions emitted by the lowering pass carry [`InstId::EMITTED`]; they
/// are never looked up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(pub u32);

impl InstId {
    pub const EMITTED: InstId = InstId(u32::MAX);
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Mnemonic-level x86-32 opcodes understood by the pass and its emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Opcode {
    Mov,
    Add,
    Sub,
    And,
    Xor,
    Neg,
    Imul,
    Lea,
    Cmp,
    Test,
    Push,
    Pop,
    Pushf,
    Popf,
    Ret,
    Jmp,
    Je,
    Jne,
    Jb,
    Call,
    Rdtsc,
    Nop,
    /// Debug-only pseudo instruction; skipped by the driver.
    DbgValue,
}

impl Opcode {
    /// Stable numeric id, used as the `op-id` column of the statistics table.
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Mov => "mov",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::And => "and",
            Opcode::Xor => "xor",
            Opcode::Neg => "neg",
            Opcode::Imul => "imul",
            Opcode::Lea => "lea",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Pushf => "pushf",
            Opcode::Popf => "popf",
            Opcode::Ret => "ret",
            Opcode::Jmp => "jmp",
            Opcode::Je => "je",
            Opcode::Jne => "jne",
            Opcode::Jb => "jb",
            Opcode::Call => "call",
            Opcode::Rdtsc => "rdtsc",
            Opcode::Nop => "nop",
            Opcode::DbgValue => "dbg_value",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One machine operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(X86Reg),
    Imm(i64),
    /// `[base + disp]`
    Mem { base: X86Reg, disp: i64 },
    /// Local label plus a byte offset folded into the relocation.
    Label { label: Label, offset: i64 },
    /// Exported library symbol plus offset; resolved by the linker.
    Sym { name: String, offset: i64 },
    /// Module-level global plus offset.
    Global { global: GlobalRef, offset: i64 },
    /// Basic-block target of input-side control flow.
    Block(NodeIndex),
}

impl Operand {
    pub fn label(label: Label) -> Self {
        Operand::Label { label, offset: 0 }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn with_offset(f: &mut fmt::Formatter<'_>, base: &dyn fmt::Display, off: i64) -> fmt::Result {
            if off == 0 {
                write!(f, "{base}")
            } else if off < 0 {
                write!(f, "{base}-{:#x}", -off)
            } else {
                write!(f, "{base}+{off:#x}")
            }
        }
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(v) => {
                if *v < 0 {
                    write!(f, "-{:#x}", -v)
                } else {
                    write!(f, "{v:#x}")
                }
            }
            Operand::Mem { base, disp } => {
                if *disp == 0 {
                    write!(f, "[{base}]")
                } else if *disp < 0 {
                    write!(f, "[{base} - {:#x}]", -disp)
                } else {
                    write!(f, "[{base} + {disp:#x}]")
                }
            }
            Operand::Label { label, offset } => with_offset(f, label, *offset),
            Operand::Sym { name, offset } => with_offset(f, name, *offset),
            Operand::Global { global, offset } => with_offset(f, &global.name, *offset),
            Operand::Block(node) => write!(f, "bb{}", node.index()),
        }
    }
}

/// A single machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInst {
    pub id: InstId,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl MachineInst {
    /// An instruction synthesized by the lowering pass.
    pub fn emitted(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Self {
            id: InstId::EMITTED,
            opcode,
            operands,
        }
    }

    pub fn is_debug(&self) -> bool {
        self.opcode == Opcode::DbgValue
    }

    fn dst_reg(&self) -> Option<X86Reg> {
        match self.operands.first() {
            Some(Operand::Reg(r)) => Some(*r),
            _ => None,
        }
    }

    fn operand_reg_uses(&self, from: usize) -> impl Iterator<Item = X86Reg> + '_ {
        self.operands.iter().skip(from).filter_map(|op| match op {
            Operand::Reg(r) => Some(*r),
            Operand::Mem { base, .. } => Some(*base),
            _ => None,
        })
    }

    /// General-purpose registers written by this instruction.
    pub fn defs(&self) -> BTreeSet<X86Reg> {
        let mut set = BTreeSet::new();
        match self.opcode {
            Opcode::Mov | Opcode::Lea => {
                set.extend(self.dst_reg());
            }
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Xor | Opcode::Imul | Opcode::Neg => {
                set.extend(self.dst_reg());
            }
            Opcode::Pop => {
                set.extend(self.dst_reg());
                set.insert(X86Reg::Esp);
            }
            Opcode::Push | Opcode::Pushf | Opcode::Popf | Opcode::Ret => {
                set.insert(X86Reg::Esp);
            }
            Opcode::Call => {
                set.extend(X86Reg::CALL_CLOBBERED);
                set.insert(X86Reg::Esp);
            }
            Opcode::Rdtsc => {
                set.insert(X86Reg::Eax);
                set.insert(X86Reg::Edx);
            }
            _ => {}
        }
        set
    }

    /// General-purpose registers read by this instruction.
    pub fn uses(&self) -> BTreeSet<X86Reg> {
        let mut set = BTreeSet::new();
        match self.opcode {
            // dst is written, not read
            Opcode::Mov | Opcode::Lea | Opcode::Pop => {
                if let Some(Operand::Mem { base, .. }) = self.operands.first() {
                    set.insert(*base);
                }
                set.extend(self.operand_reg_uses(1));
            }
            // dst is both read and written
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Xor | Opcode::Imul | Opcode::Neg => {
                set.extend(self.operand_reg_uses(0));
            }
            Opcode::Cmp | Opcode::Test | Opcode::Push => {
                set.extend(self.operand_reg_uses(0));
            }
            _ => {}
        }
        match self.opcode {
            Opcode::Push | Opcode::Pop | Opcode::Pushf | Opcode::Popf | Opcode::Ret
            | Opcode::Call => {
                set.insert(X86Reg::Esp);
            }
            _ => {}
        }
        set.remove(&X86Reg::Eflags);
        set
    }

    /// Does this instruction read EFLAGS?
    pub fn reads_flags(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Je | Opcode::Jne | Opcode::Jb | Opcode::Pushf
        )
    }

    /// Does this instruction (re)define EFLAGS?
    pub fn writes_flags(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Add
                | Opcode::Sub
                | Opcode::And
                | Opcode::Xor
                | Opcode::Neg
                | Opcode::Imul
                | Opcode::Cmp
                | Opcode::Test
                | Opcode::Popf
        )
    }
}

impl fmt::Display for MachineInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.name())?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}
