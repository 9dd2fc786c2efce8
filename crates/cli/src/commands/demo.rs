//! The `demo` subcommand: run the lowering pipeline over a fixture function.
//!
//! The fixture ropifier only knows how to turn `mov r32, imm` into a
//! `pop r32; ret` gadget chain; everything else is reported as
//! not-implemented and kept, which makes the demo output show replaced and
//! retained instructions side by side.

use clap::Args;
use ropforge_core::autopsy::{LibraryOracle, Symbol};
use ropforge_core::config::RopforgeConfig;
use ropforge_core::mir::{EdgeKind, MachineFunction, MachineInst, Opcode, Operand};
use ropforge_core::seed::Seed;
use ropforge_core::X86Reg;
use ropforge_rop::chain::{ChainElem, FlagSaveMode, RopChain};
use ropforge_rop::{RopPass, Ropifier, RopifyError};
use serde_json::json;
use std::error::Error;
use std::path::PathBuf;
use std::rc::Rc;

/// Arguments for the `demo` subcommand.
#[derive(Args)]
pub struct DemoArgs {
    /// Seed driving anchor picks and opaque constants (hex, 64 chars).
    #[arg(long)]
    seed: Option<String>,
    /// Optional configuration file; defaults enable chain labels.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path to emit a JSON summary to.
    #[arg(long)]
    emit: Option<PathBuf>,
}

impl super::Command for DemoArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let seed = match self.seed {
            Some(hex) => Seed::from_hex(&hex)?,
            None => Seed::generate(),
        };
        let config = match self.config {
            Some(path) => RopforgeConfig::load(&path)?,
            None => {
                let mut config = RopforgeConfig::default();
                config.general.use_chain_label = true;
                config.general.print_instr_stat = true;
                config
            }
        };

        let oracle = Rc::new(demo_oracle());
        let mut func = demo_function();
        println!("before:\n{func}");

        let mut ropifier = PopGadgetRopifier {
            oracle: Rc::clone(&oracle),
        };
        let mut pass = RopPass::with_oracle(config, &seed, oracle);
        pass.obfuscate_function(&mut func, &mut ropifier)?;

        println!("after:\n{func}");
        println!("{}", pass.stats());

        if let Some(path) = self.emit {
            let report = json!({
                "function": func.name,
                "seed": seed.to_hex(),
                "ropified": pass.stats().total_ropified(),
            });
            std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
            println!("wrote summary to {}", path.display());
        }
        Ok(())
    }
}

/// Lowers `mov r32, imm` through a `pop r32; ret` gadget.
struct PopGadgetRopifier {
    oracle: Rc<LibraryOracle>,
}

impl Ropifier for PopGadgetRopifier {
    fn ropify(
        &mut self,
        inst: &MachineInst,
        _scratch_regs: &[X86Reg],
        should_save_flags: bool,
    ) -> Result<RopChain, RopifyError> {
        match (inst.opcode, inst.operands.as_slice()) {
            (Opcode::Mov, [Operand::Reg(dst), Operand::Imm(value)]) if *dst != X86Reg::Esp => {
                let gadget = self
                    .oracle
                    .gadget(&format!("pop {dst}; ret"))
                    .ok_or(RopifyError::NoGadgetsAvailable)?;
                let mut chain = RopChain::new();
                chain.push(ChainElem::Gadget(gadget));
                chain.push(ChainElem::ImmValue(*value));
                chain.flag_save = if should_save_flags {
                    FlagSaveMode::SaveAfterExec
                } else {
                    FlagSaveMode::NotSaved
                };
                Ok(chain)
            }
            (Opcode::Mov, [Operand::Reg(_), Operand::Reg(_)]) => Err(RopifyError::Unsupported),
            _ => Err(RopifyError::NotImplemented),
        }
    }
}

/// Symbols and gadgets standing in for an analyzed libc.
fn demo_oracle() -> LibraryOracle {
    let mut oracle = LibraryOracle::default();
    oracle.add_symbol(Symbol::new("printf", "GLIBC_2.0", 0x0005_4320));
    oracle.add_symbol(Symbol::new("memcpy", "Base", 0x0007_7f00));
    oracle.add_symbol(Symbol::new("exit", "Base", 0x0001_2a90));
    oracle.add_gadget("pop eax; ret", vec![0x11223, 0x3341f, 0x8a111, 0x99010]);
    oracle.add_gadget("pop ebx; ret", vec![0x145b0, 0x7cc02]);
    oracle.add_gadget("pop ecx; ret", vec![0x19d74]);
    oracle
}

/// Two blocks: merged replacements, a kept add, and a trailing mov whose
/// chain falls through into the return block.
fn demo_function() -> MachineFunction {
    let mut func = MachineFunction::new("demo");
    let entry = func.add_block();
    let exit = func.add_block();

    func.push_inst(entry, Opcode::Mov, vec![
        Operand::Reg(X86Reg::Eax),
        Operand::Imm(0x12345678),
    ]);
    func.push_inst(entry, Opcode::Mov, vec![
        Operand::Reg(X86Reg::Ebx),
        Operand::Imm(0xcafe),
    ]);
    func.push_inst(entry, Opcode::Add, vec![
        Operand::Reg(X86Reg::Eax),
        Operand::Reg(X86Reg::Ebx),
    ]);
    func.push_inst(entry, Opcode::Mov, vec![
        Operand::Reg(X86Reg::Ecx),
        Operand::Imm(0x1000),
    ]);
    func.push_inst(exit, Opcode::Ret, vec![]);
    func.add_successor(entry, exit, EdgeKind::Fallthrough);
    func
}
