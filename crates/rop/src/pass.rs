//! Function driver.
//!
//! Walks every block of a machine function, asks the ropifier for a chain
//! per instruction, merges adjacent mergeable chains, and hands the merged
//! chains to the emission engine. Any per-instruction failure is local: the
//! original instruction stays and iteration continues.
//!
//! Blocks are scanned read-only first; emissions and deletions are applied
//! afterwards, addressed by instruction id, so the walk never races its own
//! mutations.

use crate::chain::{FlagSaveMode, RopChain};
use crate::emit::ChainEmitter;
use crate::stats::InstrStats;
use crate::{ChainStatus, Error, Result, Ropifier};
use rand::rngs::StdRng;
use ropforge_core::asm::LabelPool;
use ropforge_core::autopsy::LibraryOracle;
use ropforge_core::config::RopforgeConfig;
use ropforge_core::liveness::analyze_block;
use ropforge_core::mir::{InstId, MachineFunction};
use ropforge_core::seed::Seed;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, info};

/// Builds the gadget oracle once the library path is known.
pub type OracleProvider = Box<dyn FnOnce(&Path) -> ropforge_core::Result<LibraryOracle>>;

/// The ROP lowering pass over one module.
pub struct RopPass {
    config: RopforgeConfig,
    labels: LabelPool,
    rng: StdRng,
    stats: InstrStats,
    oracle: Option<Rc<LibraryOracle>>,
    provider: Option<OracleProvider>,
}

impl RopPass {
    /// A pass that builds its oracle lazily, on the first obfuscated
    /// function, from the configured or probed library path.
    pub fn new(config: RopforgeConfig, seed: &Seed, provider: OracleProvider) -> Self {
        Self {
            labels: LabelPool::new(),
            rng: seed.create_deterministic_rng(),
            stats: InstrStats::new(),
            oracle: None,
            provider: Some(provider),
            config,
        }
    }

    /// A pass over an already-built oracle.
    pub fn with_oracle(config: RopforgeConfig, seed: &Seed, oracle: Rc<LibraryOracle>) -> Self {
        Self {
            labels: LabelPool::new(),
            rng: seed.create_deterministic_rng(),
            stats: InstrStats::new(),
            oracle: Some(oracle),
            provider: None,
            config,
        }
    }

    pub fn stats(&self) -> &InstrStats {
        &self.stats
    }

    fn ensure_oracle(&mut self) -> Result<Rc<LibraryOracle>> {
        if let Some(oracle) = &self.oracle {
            return Ok(Rc::clone(oracle));
        }
        let provider = self.provider.take().ok_or(Error::OracleUnavailable)?;
        let path = self.config.resolve_library_path()?;
        let oracle = Rc::new(provider(&path)?);
        self.oracle = Some(Rc::clone(&oracle));
        Ok(oracle)
    }

    /// Rewrites every ropifiable instruction of `func` into chain form.
    pub fn obfuscate_function(
        &mut self,
        func: &mut MachineFunction,
        ropifier: &mut dyn Ropifier,
    ) -> Result<()> {
        let oracle = self.ensure_oracle()?;

        if func.is_64bit {
            return Err(Error::UnsupportedTarget);
        }

        let param = self.config.parameter_for(&func.name);
        if !param.obfuscation_enabled {
            return Ok(());
        }
        let use_chain_label = self.config.general.use_chain_label;

        let mut processed = 0u32;
        let mut obfuscated = 0u32;
        let mut chain_id = 0usize;

        for node in func.layout.clone() {
            let liveness = analyze_block(func, node);

            // scan phase: decide chains and merges without touching the block
            let mut scheduled: Vec<(RopChain, InstId)> = Vec::new();
            let mut pending = RopChain::new();
            let mut prev_anchor: Option<InstId> = None;
            let mut to_delete: Vec<InstId> = Vec::new();

            for inst in func.insts(node) {
                if inst.is_debug() {
                    continue;
                }
                processed += 1;
                debug!("    {inst}");

                let scratch_regs = liveness.scratch_regs(inst.id);
                let should_save_flags = !liveness.is_safe_to_clobber_eflags(inst.id);

                let (status, chain) =
                    match ropifier.ropify(inst, scratch_regs, should_save_flags) {
                        // a jump whose flags must be restored afterwards
                        // cannot be ropified
                        Ok(chain)
                            if chain.has_jump()
                                && chain.flag_save == FlagSaveMode::SaveAfterExec =>
                        {
                            (ChainStatus::Unsupported, None)
                        }
                        Ok(chain) => (ChainStatus::Ropified, Some(chain)),
                        Err(err) => (err.into(), None),
                    };
                self.stats.record(inst.opcode, status);

                let Some(chain) = chain else {
                    debug!("      ✗ kept original ({status:?})");
                    flush(&mut pending, prev_anchor, &mut scheduled);
                    continue;
                };

                to_delete.push(inst.id);
                if pending.can_merge(&chain) {
                    pending.merge(chain);
                } else {
                    flush(&mut pending, prev_anchor, &mut scheduled);
                    pending = chain;
                }
                prev_anchor = Some(inst.id);
                debug!("      ✓ replaced");
                obfuscated += 1;
            }
            flush(&mut pending, prev_anchor, &mut scheduled);

            // apply phase: emit chains at their anchors, then drop the
            // replaced originals
            let mut emitter = ChainEmitter {
                func: &mut *func,
                oracle: &oracle,
                labels: &self.labels,
                param: &param,
                use_chain_label,
                rng: &mut self.rng,
            };
            for (chain, anchor) in scheduled {
                emitter.insert_chain(node, anchor, chain, chain_id)?;
                chain_id += 1;
            }
            func.erase_insts(node, &to_delete);
        }

        if processed > 0 {
            debug!(
                "{}: {}/{} ({}%) instructions obfuscated",
                func.name,
                obfuscated,
                processed,
                obfuscated * 100 / processed
            );
        }
        Ok(())
    }
}

fn flush(pending: &mut RopChain, anchor: Option<InstId>, scheduled: &mut Vec<(RopChain, InstId)>) {
    if let Some(anchor) = anchor {
        if pending.valid() {
            scheduled.push((std::mem::take(pending), anchor));
        }
    }
}

impl Drop for RopPass {
    fn drop(&mut self) {
        if self.config.general.print_instr_stat && !self.stats.is_empty() {
            info!("instruction statistics:\n{}", self.stats);
        }
    }
}
