//! The `config` subcommand: parse and display a configuration file.

use clap::Args;
use ropforge_core::config::RopforgeConfig;
use std::error::Error;
use std::path::PathBuf;

/// Arguments for the `config` subcommand.
#[derive(Args)]
pub struct ConfigArgs {
    /// Path to the TOML configuration file.
    pub file: PathBuf,
    /// Function name to resolve parameters for (defaults to the module default).
    #[arg(long)]
    function: Option<String>,
}

impl super::Command for ConfigArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let config = RopforgeConfig::load(&self.file)?;

        println!("[general]");
        println!("obfuscation_enabled = {}", config.general.obfuscation_enabled);
        println!(
            "search_segment_for_gadget = {}",
            config.general.search_segment_for_gadget
        );
        println!(
            "avoid_multiversion_symbol = {}",
            config.general.avoid_multiversion_symbol
        );
        if let Some(path) = &config.general.custom_library_path {
            println!("custom_library_path = {:?}", path.display().to_string());
        }
        println!("use_chain_label = {}", config.general.use_chain_label);
        println!("print_instr_stat = {}", config.general.print_instr_stat);
        println!();

        let func_name = self.function.as_deref().unwrap_or("default");
        let param = config.parameter_for(func_name);
        println!("resolved parameters for `{func_name}`:");
        println!("  obfuscation_enabled = {}", param.obfuscation_enabled);
        println!(
            "  opaque_predicates_enabled = {}",
            param.opaque_predicates_enabled
        );
        println!(
            "  opaque_predicates_algorithm = {}",
            param.opaque_constant_algorithm.as_str()
        );
        println!(
            "  obfuscate_immediate_operand = {}",
            param.obfuscate_immediate_operand
        );
        println!(
            "  obfuscate_branch_target = {}",
            param.obfuscate_branch_target
        );
        println!(
            "  branch_divergence_enabled = {}",
            param.branch_divergence_enabled
        );
        println!(
            "  branch_divergence_max_branches = {}",
            param.branch_divergence_max_branches
        );
        println!(
            "  branch_divergence_algorithm = {}",
            param.branch_divergence_algorithm.as_str()
        );
        Ok(())
    }
}
