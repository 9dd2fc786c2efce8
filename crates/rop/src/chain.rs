//! Abstract ROP chains.
//!
//! A chain is the ropifier's description of what must sit on the stack when
//! the replacement executes: one element per stack slot, in stack order (the
//! last element is pushed last and therefore consumed first by `ret`).

use petgraph::graph::NodeIndex;
use ropforge_core::autopsy::Gadget;
use ropforge_core::mir::GlobalRef;
use std::rc::Rc;

/// When the emitted chain must save and restore EFLAGS.
///
/// The order forms the merge lattice: joining two chains keeps the larger
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FlagSaveMode {
    /// Flags are dead across the replaced instructions.
    #[default]
    NotSaved,
    /// Flags feed the chain itself; save them around the push sequence and
    /// restore before the chain runs.
    SaveBeforeExec,
    /// The replaced instructions do not define flags; restore them once the
    /// chain has finished.
    SaveAfterExec,
}

/// One stack slot of an abstract chain.
#[derive(Debug, Clone)]
pub enum ChainElem {
    /// Literal value.
    ImmValue(i64),
    /// Address of a module-level symbol plus offset.
    ImmGlobal { global: GlobalRef, offset: i64 },
    /// Placeholder for a gadget address; lowering picks an anchor symbol and
    /// emits `anchor + (gadget_addr - anchor_addr)`.
    Gadget(Rc<Gadget>),
    /// Label of another basic block; pushing this makes the block a
    /// successor of the current one.
    JmpBlock(NodeIndex),
    /// The address where normal execution resumes.
    JmpFallthrough,
    /// Record the stack cursor under `id`; emitted as `push esp`.
    EspPush { id: u32 },
    /// Push `value` minus the cursor recorded under `id`. The recording
    /// `EspPush` must precede this element in lowering order (lowering walks
    /// the chain last element first).
    EspOffset { id: u32, value: i64 },
}

/// An abstract ROP chain plus its flag discipline and jump summary.
#[derive(Debug, Clone, Default)]
pub struct RopChain {
    pub elems: Vec<ChainElem>,
    pub flag_save: FlagSaveMode,
    pub has_conditional_jump: bool,
    pub has_unconditional_jump: bool,
}

impl RopChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, elem: ChainElem) {
        self.elems.push(elem);
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// A chain is worth emitting once it carries at least one element.
    pub fn valid(&self) -> bool {
        !self.elems.is_empty()
    }

    pub fn has_jump(&self) -> bool {
        self.has_conditional_jump || self.has_unconditional_jump
    }

    /// Two chains merge only when neither contains a jump.
    pub fn can_merge(&self, other: &RopChain) -> bool {
        !self.has_jump() && !other.has_jump()
    }

    /// Concatenates `other` onto this chain, joining flag-save modes over the
    /// lattice `NotSaved < SaveBeforeExec < SaveAfterExec`.
    pub fn merge(&mut self, other: RopChain) {
        self.flag_save = self.flag_save.max(other.flag_save);
        self.has_conditional_jump |= other.has_conditional_jump;
        self.has_unconditional_jump |= other.has_unconditional_jump;
        self.elems.extend(other.elems);
    }
}
