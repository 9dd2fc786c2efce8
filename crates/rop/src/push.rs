//! Lowered chain form: one "push one stack slot" action per chain element.
//!
//! Each action optionally routes through an opaque generator that computes a
//! statically unpredictable value into EAX; the action then adjusts EAX by a
//! compile-time difference and pushes it. Plain actions push directly.
//!
//! Offsets are 32-bit two's-complement: differences wrap modulo 2^32 and are
//! emitted as sign-agnostic immediates.

use crate::opaque::OpaqueConstruct;
use crate::{Error, Result};
use ropforge_core::asm::AsmStream;
use ropforge_core::autopsy::Symbol;
use ropforge_core::mir::{GlobalRef, Label};
use ropforge_core::X86Reg;
use std::rc::Rc;

const EAX: X86Reg = X86Reg::Eax;

/// The lowering shape of one stack slot.
#[derive(Debug)]
pub enum PushKind {
    /// `push imm`
    Imm { value: i64 },
    /// `push global+offset`
    Global { global: GlobalRef, offset: i64 },
    /// `push anchor+(gadget-anchor)`; the offset is already anchor-relative.
    Gadget { anchor: Rc<Symbol>, offset: u32 },
    /// `push label`
    Label { label: Label },
    /// `push esp`
    Esp,
    /// `pushf`
    Eflags,
}

/// One lowered push, optionally wrapped with an opaque generator.
pub struct PushInst {
    pub kind: PushKind,
    pub opaque: Option<Box<dyn OpaqueConstruct>>,
}

impl PushInst {
    pub fn plain(kind: PushKind) -> Self {
        Self { kind, opaque: None }
    }

    fn opaque_value(generator: &dyn OpaqueConstruct) -> Result<u32> {
        generator
            .output()
            .find_value(EAX)
            .ok_or(Error::OpaqueOutputMissing)
    }

    /// Emits this push at the current stream position.
    pub fn compile(&self, stream: &mut AsmStream<'_>) -> Result<()> {
        match (&self.kind, &self.opaque) {
            (PushKind::Imm { value }, None) => stream.push_imm(*value),
            (PushKind::Imm { value }, Some(generator)) => {
                let opaque = Self::opaque_value(generator.as_ref())?;
                generator.compile(stream);
                // adjust eax to be the constant
                let diff = (*value as u32).wrapping_sub(opaque);
                stream.add_reg_imm(X86Reg::Eax, diff as i64);
                stream.push_reg(X86Reg::Eax);
            }

            (PushKind::Global { global, offset }, None) => {
                stream.push_global(global.clone(), *offset)
            }
            (PushKind::Global { global, offset }, Some(generator)) => {
                let opaque = Self::opaque_value(generator.as_ref())?;
                generator.compile(stream);
                stream.add_reg_global(X86Reg::Eax, global.clone(), offset - opaque as i64);
                stream.push_reg(X86Reg::Eax);
            }

            (PushKind::Gadget { anchor, offset }, None) => {
                stream.push_sym(anchor.label(), *offset as i64)
            }
            (PushKind::Gadget { anchor, .. }, Some(generator)) => {
                // the composed adjustor already leaves the anchor-relative
                // offset in eax; the relocation resolves at link time
                generator.compile(stream);
                stream.add_reg_sym(X86Reg::Eax, anchor.label(), 0);
                stream.push_reg(X86Reg::Eax);
            }

            (PushKind::Label { label }, None) => stream.push_label(label.clone()),
            (PushKind::Label { label }, Some(generator)) => {
                let opaque = Self::opaque_value(generator.as_ref())?;
                generator.compile(stream);
                stream.add_reg_label(X86Reg::Eax, label.clone(), -(opaque as i64));
                stream.push_reg(X86Reg::Eax);
            }

            (PushKind::Esp, _) => stream.push_reg(X86Reg::Esp),
            (PushKind::Eflags, _) => stream.pushf(),
        }
        Ok(())
    }
}
