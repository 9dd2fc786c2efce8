//! Per-block register liveness.
//!
//! A single backward walk over a block yields, for every instruction, the
//! general-purpose registers that are guaranteed dead at that point (usable
//! as scratch space by a replacement chain) and whether EFLAGS may be
//! clobbered there without changing observable behavior.

use crate::mir::{BlockItem, InstId, MachineFunction};
use crate::reg::{X86Reg, GPR};
use petgraph::graph::NodeIndex;
use std::collections::{BTreeSet, HashMap};

/// Liveness facts for one block, keyed by instruction id.
#[derive(Debug, Default)]
pub struct BlockLiveness {
    scratch: HashMap<InstId, Vec<X86Reg>>,
    flags_live: HashMap<InstId, bool>,
}

impl BlockLiveness {
    /// Registers free for clobbering while replacing this instruction.
    pub fn scratch_regs(&self, id: InstId) -> &[X86Reg] {
        self.scratch.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when EFLAGS carries no value that later code observes.
    pub fn is_safe_to_clobber_eflags(&self, id: InstId) -> bool {
        !self.flags_live.get(&id).copied().unwrap_or(false)
    }
}

/// Runs the backward liveness scan over one block.
pub fn analyze_block(func: &MachineFunction, node: NodeIndex) -> BlockLiveness {
    // live-out is the union of the successors' declared live-ins
    let mut live: BTreeSet<X86Reg> = BTreeSet::new();
    for succ in func.successors(node) {
        live.extend(func.block(succ).live_in.iter().copied());
    }
    let mut flags_live = live.remove(&X86Reg::Eflags);

    let mut facts = BlockLiveness::default();
    for item in func.block(node).items.iter().rev() {
        let inst = match item {
            BlockItem::Inst(inst) => inst,
            _ => continue,
        };
        let uses = inst.uses();
        let defs = inst.defs();

        let scratch: Vec<X86Reg> = GPR
            .iter()
            .copied()
            .filter(|r| !live.contains(r) && !uses.contains(r) && !defs.contains(r))
            .collect();
        facts.scratch.insert(inst.id, scratch);

        flags_live = if inst.reads_flags() {
            true
        } else if inst.writes_flags() {
            false
        } else {
            flags_live
        };
        facts.flags_live.insert(inst.id, flags_live);

        for def in &defs {
            live.remove(def);
        }
        live.extend(uses);
    }
    facts
}
