//! Assembly stream: the emission boundary of the pass.
//!
//! An [`AsmStream`] accumulates block items (instructions, labels, raw
//! directives) that are later spliced into a machine block in one shot.
//! Labels come from a shared [`LabelPool`] so ids stay unique across every
//! stream of a pass run.

use crate::mir::{BlockItem, GlobalRef, Label, MachineInst, Opcode, Operand};
use crate::reg::X86Reg;
use std::cell::Cell;

/// Allocator of unique label ids for one pass run.
#[derive(Debug, Default)]
pub struct LabelPool {
    next: Cell<u32>,
}

impl LabelPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u32 {
        let id = self.next.get();
        self.next.set(id + 1);
        id
    }

    /// A fresh anonymous label.
    pub fn fresh(&self) -> Label {
        Label {
            id: self.next_id(),
            name: None,
        }
    }

    /// A fresh label with a fixed, human-readable name.
    pub fn named(&self, name: impl Into<String>) -> Label {
        Label {
            id: self.next_id(),
            name: Some(name.into()),
        }
    }
}

/// Accumulates emitted assembly for one insertion point.
pub struct AsmStream<'a> {
    labels: &'a LabelPool,
    items: Vec<BlockItem>,
}

impl<'a> AsmStream<'a> {
    pub fn new(labels: &'a LabelPool) -> Self {
        Self {
            labels,
            items: Vec::new(),
        }
    }

    /// Consumes the stream, yielding the items to splice into a block.
    pub fn finish(self) -> Vec<BlockItem> {
        self.items
    }

    pub fn fresh_label(&self) -> Label {
        self.labels.fresh()
    }

    fn inst(&mut self, opcode: Opcode, operands: Vec<Operand>) {
        self.items
            .push(BlockItem::Inst(MachineInst::emitted(opcode, operands)));
    }

    /// Attaches `label` at the current point of the stream.
    pub fn put_label(&mut self, label: Label) {
        self.items.push(BlockItem::Label(label));
    }

    /// Splices raw assembly text (`.symver` directives).
    pub fn directive(&mut self, text: impl Into<String>) {
        self.items.push(BlockItem::Directive(text.into()));
    }

    pub fn push_imm(&mut self, value: i64) {
        self.inst(Opcode::Push, vec![Operand::Imm(value)]);
    }

    pub fn push_reg(&mut self, reg: X86Reg) {
        self.inst(Opcode::Push, vec![Operand::Reg(reg)]);
    }

    pub fn push_label(&mut self, label: Label) {
        self.inst(Opcode::Push, vec![Operand::label(label)]);
    }

    pub fn push_sym(&mut self, name: impl Into<String>, offset: i64) {
        self.inst(
            Opcode::Push,
            vec![Operand::Sym {
                name: name.into(),
                offset,
            }],
        );
    }

    pub fn push_global(&mut self, global: GlobalRef, offset: i64) {
        self.inst(Opcode::Push, vec![Operand::Global { global, offset }]);
    }

    pub fn pushf(&mut self) {
        self.inst(Opcode::Pushf, vec![]);
    }

    pub fn popf(&mut self) {
        self.inst(Opcode::Popf, vec![]);
    }

    pub fn pop_reg(&mut self, reg: X86Reg) {
        self.inst(Opcode::Pop, vec![Operand::Reg(reg)]);
    }

    /// `lea dst, [base + disp]`
    pub fn lea(&mut self, dst: X86Reg, base: X86Reg, disp: i64) {
        self.inst(
            Opcode::Lea,
            vec![Operand::Reg(dst), Operand::Mem { base, disp }],
        );
    }

    pub fn add_reg_imm(&mut self, reg: X86Reg, value: i64) {
        self.inst(Opcode::Add, vec![Operand::Reg(reg), Operand::Imm(value)]);
    }

    pub fn add_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.inst(Opcode::Add, vec![Operand::Reg(dst), Operand::Reg(src)]);
    }

    pub fn add_reg_label(&mut self, reg: X86Reg, label: Label, offset: i64) {
        self.inst(
            Opcode::Add,
            vec![Operand::Reg(reg), Operand::Label { label, offset }],
        );
    }

    pub fn add_reg_sym(&mut self, reg: X86Reg, name: impl Into<String>, offset: i64) {
        self.inst(
            Opcode::Add,
            vec![
                Operand::Reg(reg),
                Operand::Sym {
                    name: name.into(),
                    offset,
                },
            ],
        );
    }

    pub fn add_reg_global(&mut self, reg: X86Reg, global: GlobalRef, offset: i64) {
        self.inst(
            Opcode::Add,
            vec![Operand::Reg(reg), Operand::Global { global, offset }],
        );
    }

    pub fn sub_reg_imm(&mut self, reg: X86Reg, value: i64) {
        self.inst(Opcode::Sub, vec![Operand::Reg(reg), Operand::Imm(value)]);
    }

    pub fn and_reg_imm(&mut self, reg: X86Reg, value: i64) {
        self.inst(Opcode::And, vec![Operand::Reg(reg), Operand::Imm(value)]);
    }

    pub fn xor_reg_imm(&mut self, reg: X86Reg, value: i64) {
        self.inst(Opcode::Xor, vec![Operand::Reg(reg), Operand::Imm(value)]);
    }

    pub fn cmp_reg_imm(&mut self, reg: X86Reg, value: i64) {
        self.inst(Opcode::Cmp, vec![Operand::Reg(reg), Operand::Imm(value)]);
    }

    /// `imul dst, src, imm`
    pub fn imul_reg_reg_imm(&mut self, dst: X86Reg, src: X86Reg, value: i64) {
        self.inst(
            Opcode::Imul,
            vec![Operand::Reg(dst), Operand::Reg(src), Operand::Imm(value)],
        );
    }

    pub fn mov_reg_imm(&mut self, reg: X86Reg, value: i64) {
        self.inst(Opcode::Mov, vec![Operand::Reg(reg), Operand::Imm(value)]);
    }

    pub fn mov_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.inst(Opcode::Mov, vec![Operand::Reg(dst), Operand::Reg(src)]);
    }

    pub fn neg_reg(&mut self, reg: X86Reg) {
        self.inst(Opcode::Neg, vec![Operand::Reg(reg)]);
    }

    pub fn rdtsc(&mut self) {
        self.inst(Opcode::Rdtsc, vec![]);
    }

    pub fn jb(&mut self, label: Label) {
        self.inst(Opcode::Jb, vec![Operand::label(label)]);
    }

    pub fn jne(&mut self, label: Label) {
        self.inst(Opcode::Jne, vec![Operand::label(label)]);
    }

    pub fn jmp(&mut self, label: Label) {
        self.inst(Opcode::Jmp, vec![Operand::label(label)]);
    }

    pub fn ret(&mut self) {
        self.inst(Opcode::Ret, vec![]);
    }
}
