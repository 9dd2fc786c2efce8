//! Chain emission engine.
//!
//! Turns one abstract chain into machine code around an anchor instruction:
//! version directives, the register/flag save prologue, the chain label, the
//! push sequence in reverse chain order, the terminal `ret`, and the resume
//! epilogue.
//!
//! Stack discipline: the pushes advance ESP by `espoffset` (always ≤ 0, a
//! multiple of 4). To park N saved registers below the chain's future end
//! without disturbing the slots the chain will occupy, the prologue first
//! points ESP at the chain end (`lea esp, [esp + espoffset]`), pushes the
//! save set, then restores ESP (`lea esp, [esp + 4N - espoffset]`). The
//! matching restore runs right before the `ret`, once every chain slot has
//! been written.

use crate::chain::{ChainElem, FlagSaveMode, RopChain};
use crate::opaque::{branching_opaque_constant_32, compose, opaque_constant_32, value_adjustor};
use crate::push::{PushInst, PushKind};
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use ropforge_core::asm::{AsmStream, LabelPool};
use ropforge_core::autopsy::{LibraryOracle, Symbol};
use ropforge_core::config::ObfuscationParameter;
use ropforge_core::mir::{EdgeKind, InstId, Label, MachineFunction};
use ropforge_core::X86Reg;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

const EAX: X86Reg = X86Reg::Eax;

/// Builds the human-readable chain and resume label names.
///
/// `$` is not valid in assembly labels, so mangled function names are
/// rewritten with underscores.
pub fn generate_chain_labels(func_name: &str, chain_id: usize) -> (String, String) {
    let chain_label = format!("{func_name}_chain_{chain_id}").replace('$', "_");
    let resume_label = format!("resume_{chain_label}");
    (chain_label, resume_label)
}

/// Emits chains into one machine function.
pub struct ChainEmitter<'a> {
    pub func: &'a mut MachineFunction,
    pub oracle: &'a LibraryOracle,
    pub labels: &'a LabelPool,
    pub param: &'a ObfuscationParameter,
    pub use_chain_label: bool,
    pub rng: &'a mut StdRng,
}

impl ChainEmitter<'_> {
    /// Replaces the code leading up to `anchor` with `chain`.
    ///
    /// The emitted items are spliced directly before the anchor instruction;
    /// the driver erases the replaced originals afterwards.
    pub fn insert_chain(
        &mut self,
        node: NodeIndex,
        anchor: InstId,
        mut chain: RopChain,
        chain_id: usize,
    ) -> Result<()> {
        // a chain without an internal jump needs the fall-through address on
        // top so its final ret resumes normal execution
        if !chain.has_jump() {
            chain.push(ChainElem::JmpFallthrough);
        }

        let mut is_last_in_block = self.func.last_inst_id(node) == Some(anchor);
        let mut resume_label_required = false;

        let (chain_label, resume_label) = if self.use_chain_label {
            let (chain_name, resume_name) = generate_chain_labels(&self.func.name, chain_id);
            (self.labels.named(chain_name), self.labels.named(resume_name))
        } else {
            (self.labels.fresh(), self.labels.fresh())
        };

        let mut pushchain: Vec<PushInst> = Vec::new();
        let mut espoffset: i64 = 0;
        let mut esp_offset_map: HashMap<u32, i64> = HashMap::new();
        let mut versioned_symbols: Vec<Rc<Symbol>> = Vec::new();

        if chain.flag_save == FlagSaveMode::SaveAfterExec {
            if chain.has_conditional_jump && chain.has_unconditional_jump {
                return Err(Error::ConflictingJumpFlags);
            }
            // flags are restored by a popf after the ret, so the chain's
            // slots sit above one extra eflags word
            pushchain.push(PushInst::plain(PushKind::Eflags));
            is_last_in_block = false;
            espoffset -= 4;
        }

        // lower every element, last chain element first: the slot pushed
        // first ends up deepest, and ret consumes the one pushed last
        for elem in chain.elems.iter().rev() {
            let push = match elem {
                ChainElem::ImmValue(value) => {
                    let mut push = PushInst::plain(PushKind::Imm { value: *value });
                    if self.param.opaque_predicates_enabled
                        && self.param.obfuscate_immediate_operand
                    {
                        push.opaque = Some(opaque_constant_32(
                            EAX,
                            self.param.opaque_constant_algorithm,
                            self.rng,
                        ));
                    }
                    push
                }

                ChainElem::ImmGlobal { global, offset } => {
                    let mut push = PushInst::plain(PushKind::Global {
                        global: global.clone(),
                        offset: *offset,
                    });
                    if self.param.opaque_predicates_enabled
                        && self.param.obfuscate_immediate_operand
                    {
                        push.opaque = Some(opaque_constant_32(
                            EAX,
                            self.param.opaque_constant_algorithm,
                            self.rng,
                        ));
                    }
                    push
                }

                ChainElem::Gadget(gadget) => {
                    self.lower_gadget(gadget, &mut versioned_symbols)?
                }

                ChainElem::JmpBlock(target) => {
                    self.func.add_successor(node, *target, EdgeKind::Branch);
                    let target_label = self.labels.fresh();
                    self.func
                        .insert_label_at_start(*target, target_label.clone());
                    self.branch_label_push(target_label)
                }

                ChainElem::JmpFallthrough => {
                    let target_label = if is_last_in_block {
                        match self.func.layout_successor(node) {
                            Some(succ) => {
                                self.func
                                    .insert_label_at_start(succ, resume_label.clone());
                                Some(resume_label.clone())
                            }
                            // block falls off the end of the function: a
                            // no-return call, so any return address will do
                            None => None,
                        }
                    } else {
                        resume_label_required = true;
                        Some(resume_label.clone())
                    };
                    match target_label {
                        Some(label) => self.branch_label_push(label),
                        None => PushInst::plain(PushKind::Imm { value: 0 }),
                    }
                }

                ChainElem::EspPush { id } => {
                    esp_offset_map.insert(*id, espoffset);
                    PushInst::plain(PushKind::Esp)
                }

                ChainElem::EspOffset { id, value } => {
                    let recorded = esp_offset_map
                        .get(id)
                        .copied()
                        .ok_or(Error::EspOffsetWithoutPush(*id))?;
                    PushInst::plain(PushKind::Imm {
                        value: value - recorded,
                    })
                }
            };
            pushchain.push(push);
            espoffset -= 4;
        }

        let mut stream = AsmStream::new(self.labels);

        // version directives precede any reference to the symbols
        if !versioned_symbols.is_empty() {
            let directives: Vec<String> = versioned_symbols
                .iter()
                .map(|sym| sym.symver_directive())
                .collect();
            stream.directive(directives.join("\n"));
        }

        // registers the chain body will clobber, saved on top of the chain's
        // future end
        let mut saved_regs: BTreeSet<X86Reg> = BTreeSet::new();
        if self.param.opaque_predicates_enabled {
            for push in &pushchain {
                if let Some(generator) = &push.opaque {
                    saved_regs.extend(generator.clobbered_regs().iter().copied());
                }
            }
        }
        if chain.flag_save == FlagSaveMode::SaveBeforeExec {
            saved_regs.insert(X86Reg::Eflags);
        } else {
            saved_regs.remove(&X86Reg::Eflags);
        }

        let saved_len = saved_regs.len() as i64;
        if !saved_regs.is_empty() {
            stream.lea(X86Reg::Esp, X86Reg::Esp, espoffset);
            for reg in &saved_regs {
                if *reg == X86Reg::Eflags {
                    stream.pushf();
                } else {
                    stream.push_reg(*reg);
                }
            }
            stream.lea(X86Reg::Esp, X86Reg::Esp, 4 * saved_len - espoffset);
        }

        stream.put_label(chain_label);

        for push in &pushchain {
            push.compile(&mut stream)?;
        }

        // restore the save set before control enters the chain
        if !saved_regs.is_empty() {
            stream.lea(X86Reg::Esp, X86Reg::Esp, -4 * saved_len);
            for reg in saved_regs.iter().rev() {
                if *reg == X86Reg::Eflags {
                    stream.popf();
                } else {
                    stream.pop_reg(*reg);
                }
            }
        }

        stream.ret();

        if resume_label_required {
            // only emitted when the chain does not end in a jump, so the
            // host's fall-through-only reachability analysis stays sound
            stream.put_label(resume_label);
        }

        if chain.flag_save == FlagSaveMode::SaveAfterExec {
            stream.popf();
        }

        self.func.insert_before(node, anchor, stream.finish())?;
        Ok(())
    }

    /// A label push honoring the branch-target obfuscation switch.
    fn branch_label_push(&mut self, label: Label) -> PushInst {
        let mut push = PushInst::plain(PushKind::Label { label });
        if self.param.opaque_predicates_enabled && self.param.obfuscate_branch_target {
            push.opaque = Some(opaque_constant_32(
                EAX,
                self.param.opaque_constant_algorithm,
                self.rng,
            ));
        }
        push
    }

    /// Picks an anchor and lowers one gadget slot, sampling divergence
    /// addresses when enabled.
    fn lower_gadget(
        &mut self,
        gadget: &Rc<ropforge_core::autopsy::Gadget>,
        versioned_symbols: &mut Vec<Rc<Symbol>>,
    ) -> Result<PushInst> {
        let anchor = self.oracle.random_symbol(self.rng).map_err(Error::Core)?;
        if gadget.addresses.is_empty() {
            return Err(Error::GadgetWithoutAddresses(gadget.text.clone()));
        }

        let branches = if self.param.branch_divergence_enabled {
            (self.param.branch_divergence_max_branches as usize).min(gadget.addresses.len())
        } else {
            1
        };
        let offsets: Vec<u32> =
            rand::seq::index::sample(&mut *self.rng, gadget.addresses.len(), branches)
                .into_iter()
                .map(|i| (gadget.addresses[i] as u32).wrapping_sub(anchor.address as u32))
                .collect();

        // .symver is needed once per versioned symbol, before its first use,
        // to keep same-named symbols of other versions from aliasing
        if !anchor.is_used() && anchor.is_versioned() {
            versioned_symbols.push(Rc::clone(&anchor));
            anchor.mark_used();
        }

        let mut push = PushInst::plain(PushKind::Gadget {
            anchor: Rc::clone(&anchor),
            offset: offsets[0],
        });
        if self.param.opaque_predicates_enabled {
            let producer = if branches > 1 {
                branching_opaque_constant_32(
                    EAX,
                    offsets.len(),
                    self.param.branch_divergence_algorithm,
                    self.rng,
                )
            } else {
                opaque_constant_32(EAX, self.param.opaque_constant_algorithm, self.rng)
            };
            let declared = producer
                .output()
                .find_values(EAX)
                .ok_or(Error::OpaqueOutputMissing)?;
            let adjustor = value_adjustor(EAX, &declared, &offsets);
            push.opaque = Some(compose(adjustor, producer));
        }
        Ok(push)
    }
}
