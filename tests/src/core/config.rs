use ropforge_core::config::{
    BranchDivergenceAlgo, OpaqueConstantAlgo, RopforgeConfig,
};
use std::path::PathBuf;

const FULL_CONFIG: &str = r#"
[general]
obfuscation_enabled = true
search_segment_for_gadget = false
avoid_multiversion_symbol = true
custom_library_path = "/opt/lib32/libc.so.6"
use_chain_label = true
print_instr_stat = true

[functions.default]
opaque_predicates_enabled = true
opaque_predicates_algorithm = "MOV"
obfuscate_immediate_operand = false
obfuscate_branch_target = false
branch_divergence_enabled = true
branch_divergence_max_branches = 16
branch_divergence_algorithm = "NEGATIVE_STACK"

[functions."main"]
obfuscation_enabled = false

[functions."crypt$worker"]
branch_divergence_algorithm = "rdtsc"
"#;

#[test]
fn full_configuration_round_trip() {
    let config: RopforgeConfig = toml::from_str(FULL_CONFIG).unwrap();

    assert!(!config.general.search_segment_for_gadget);
    assert!(config.general.avoid_multiversion_symbol);
    assert!(config.general.use_chain_label);
    assert!(config.general.print_instr_stat);

    let default = config.parameter_for("unlisted");
    assert!(default.opaque_predicates_enabled);
    assert_eq!(default.opaque_constant_algorithm, OpaqueConstantAlgo::Mov);
    assert!(!default.obfuscate_immediate_operand);
    assert!(!default.obfuscate_branch_target);
    assert!(default.branch_divergence_enabled);
    assert_eq!(default.branch_divergence_max_branches, 16);
    assert_eq!(
        default.branch_divergence_algorithm,
        BranchDivergenceAlgo::NegativeStack
    );

    // named override keeps the default-section values it does not set
    let main = config.parameter_for("main");
    assert!(!main.obfuscation_enabled);
    assert!(main.opaque_predicates_enabled);

    let worker = config.parameter_for("crypt$worker");
    assert_eq!(worker.branch_divergence_algorithm, BranchDivergenceAlgo::Rdtsc);
    assert_eq!(worker.branch_divergence_max_branches, 16);
}

#[test]
fn custom_library_path_wins_over_probing() {
    let config: RopforgeConfig = toml::from_str(FULL_CONFIG).unwrap();
    assert_eq!(
        config.resolve_library_path().unwrap(),
        PathBuf::from("/opt/lib32/libc.so.6")
    );
}

#[test]
fn oracle_options_mirror_the_general_section() {
    let config: RopforgeConfig = toml::from_str(FULL_CONFIG).unwrap();
    let options = config.general.oracle_options();
    assert!(!options.search_segment_for_gadget);
    assert!(options.avoid_multiversion_symbol);
}

#[test]
fn empty_file_is_all_defaults() {
    let config: RopforgeConfig = toml::from_str("").unwrap();
    assert!(config.general.obfuscation_enabled);
    assert!(!config.general.use_chain_label);
    let param = config.parameter_for("anything");
    assert!(param.obfuscation_enabled);
    assert!(!param.branch_divergence_enabled);
}
