//! Machine-function intermediate representation.
//!
//! The host-compiler boundary of the pass: functions are petgraph CFGs of
//! blocks, blocks hold a flat item list (instructions, labels, raw
//! directives), and layout order is explicit so fall-through queries work.
//!
//! Original instructions carry unique ids. The driver schedules chain
//! insertions and deletions against those ids and applies them after a block
//! has been scanned, so no iterator is ever invalidated mid-walk.

mod inst;

pub use inst::{GlobalRef, InstId, Label, MachineInst, Opcode, Operand};

use crate::reg::X86Reg;
use crate::result::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;
use std::collections::BTreeSet;
use std::fmt;

/// Edge kinds of the block graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    Branch,
}

/// One entry of a block's item list.
#[derive(Debug, Clone)]
pub enum BlockItem {
    Inst(MachineInst),
    Label(Label),
    /// Raw assembly spliced into the stream (`.symver` directives).
    Directive(String),
}

/// A basic block: items plus the registers live on entry.
#[derive(Debug, Clone, Default)]
pub struct MachineBlock {
    pub items: Vec<BlockItem>,
    pub live_in: BTreeSet<X86Reg>,
}

/// A machine function under obfuscation.
#[derive(Debug)]
pub struct MachineFunction {
    pub name: String,
    pub cfg: StableDiGraph<MachineBlock, EdgeKind>,
    /// Block emission order; index `i + 1` is the layout successor of `i`.
    pub layout: Vec<NodeIndex>,
    pub is_64bit: bool,
    next_inst: u32,
}

impl MachineFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfg: StableDiGraph::new(),
            layout: Vec::new(),
            is_64bit: false,
            next_inst: 0,
        }
    }

    /// Appends a fresh block at the end of the layout.
    pub fn add_block(&mut self) -> NodeIndex {
        let node = self.cfg.add_node(MachineBlock::default());
        self.layout.push(node);
        node
    }

    pub fn block(&self, node: NodeIndex) -> &MachineBlock {
        &self.cfg[node]
    }

    pub fn block_mut(&mut self, node: NodeIndex) -> &mut MachineBlock {
        &mut self.cfg[node]
    }

    /// Appends an original instruction to `node`, assigning it a fresh id.
    pub fn push_inst(
        &mut self,
        node: NodeIndex,
        opcode: Opcode,
        operands: Vec<Operand>,
    ) -> InstId {
        let id = InstId(self.next_inst);
        self.next_inst += 1;
        self.cfg[node].items.push(BlockItem::Inst(MachineInst {
            id,
            opcode,
            operands,
        }));
        id
    }

    /// Records a control-flow successor, deduplicating repeated edges.
    pub fn add_successor(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) {
        self.cfg.update_edge(from, to, kind);
    }

    pub fn successors(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.cfg.neighbors_directed(node, Direction::Outgoing)
    }

    /// The block laid out directly after `node`, if any.
    pub fn layout_next(&self, node: NodeIndex) -> Option<NodeIndex> {
        let pos = self.layout.iter().position(|&n| n == node)?;
        self.layout.get(pos + 1).copied()
    }

    /// The successor of `node` reached by falling through the layout.
    pub fn layout_successor(&self, node: NodeIndex) -> Option<NodeIndex> {
        let next = self.layout_next(node)?;
        self.successors(node).find(|&s| s == next)
    }

    /// Iterates the original instructions of a block in order.
    pub fn insts(&self, node: NodeIndex) -> impl Iterator<Item = &MachineInst> {
        self.cfg[node].items.iter().filter_map(|item| match item {
            BlockItem::Inst(inst) => Some(inst),
            _ => None,
        })
    }

    /// Id of the last real instruction of the block, skipping debug pseudos.
    pub fn last_inst_id(&self, node: NodeIndex) -> Option<InstId> {
        self.insts(node)
            .filter(|inst| !inst.is_debug())
            .last()
            .map(|inst| inst.id)
    }

    fn index_of(&self, node: NodeIndex, id: InstId) -> Option<usize> {
        self.cfg[node].items.iter().position(|item| {
            matches!(item, BlockItem::Inst(inst) if inst.id == id)
        })
    }

    /// Splices `items` into the block directly before the instruction `anchor`.
    pub fn insert_before(
        &mut self,
        node: NodeIndex,
        anchor: InstId,
        items: Vec<BlockItem>,
    ) -> Result<()> {
        let at = self
            .index_of(node, anchor)
            .ok_or(Error::AnchorNotFound(anchor.0))?;
        self.cfg[node].items.splice(at..at, items);
        Ok(())
    }

    /// Places a label at the very start of a block.
    pub fn insert_label_at_start(&mut self, node: NodeIndex, label: Label) {
        self.cfg[node].items.insert(0, BlockItem::Label(label));
    }

    /// Removes the listed original instructions from `node`.
    pub fn erase_insts(&mut self, node: NodeIndex, ids: &[InstId]) {
        if ids.is_empty() {
            return;
        }
        let doomed: BTreeSet<InstId> = ids.iter().copied().collect();
        self.cfg[node]
            .items
            .retain(|item| !matches!(item, BlockItem::Inst(inst) if doomed.contains(&inst.id)));
    }

    /// Renders the whole function as assembly text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}:\n", self.name));
        for &node in &self.layout {
            for item in &self.cfg[node].items {
                match item {
                    BlockItem::Inst(inst) => out.push_str(&format!("\t{inst}\n")),
                    BlockItem::Label(label) => out.push_str(&format!("{label}:\n")),
                    BlockItem::Directive(text) => {
                        for line in text.lines() {
                            out.push_str(&format!("\t{line}\n"));
                        }
                    }
                }
            }
        }
        out
    }
}

impl fmt::Display for MachineFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
