use crate::support::{block_lines, mov_eax_imms, push_mov_imm};
use ropforge_core::asm::LabelPool;
use ropforge_core::autopsy::{LibraryOracle, Symbol};
use ropforge_core::config::{BranchDivergenceAlgo, ObfuscationParameter};
use ropforge_core::mir::{MachineFunction, Opcode};
use ropforge_core::X86Reg;
use ropforge_rop::chain::{ChainElem, RopChain};
use ropforge_rop::emit::ChainEmitter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;

const ANCHOR_ADDR: u32 = 0x1000;
const GADGET_ADDRS: [u64; 4] = [0x11000, 0x12000, 0x13000, 0x14000];

fn divergence_oracle() -> LibraryOracle {
    let mut oracle = LibraryOracle::default();
    oracle.add_symbol(Symbol::new("memcpy", "Base", ANCHOR_ADDR as u64));
    oracle.add_gadget("pop eax; ret", GADGET_ADDRS.to_vec());
    oracle
}

fn divergence_param(max_branches: u32) -> ObfuscationParameter {
    ObfuscationParameter {
        opaque_predicates_enabled: true,
        branch_divergence_enabled: true,
        branch_divergence_max_branches: max_branches,
        branch_divergence_algorithm: BranchDivergenceAlgo::AddReg,
        // keep the fall-through slot plain so only the gadget generates movs
        obfuscate_branch_target: false,
        ..Default::default()
    }
}

fn expected_offsets() -> BTreeSet<i64> {
    GADGET_ADDRS
        .iter()
        .map(|addr| (*addr as u32).wrapping_sub(ANCHOR_ADDR) as i64)
        .collect()
}

/// Emits a one-gadget chain and returns the adjustor's target values.
fn divergent_mov_targets(max_branches: u32, seed: u64) -> Vec<i64> {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let anchor = push_mov_imm(&mut func, bb, X86Reg::Eax, 0);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let oracle = divergence_oracle();
    let param = divergence_param(max_branches);
    let labels = LabelPool::new();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut chain = RopChain::new();
    chain.push(ChainElem::Gadget(oracle.gadget("pop eax; ret").unwrap()));

    let mut emitter = ChainEmitter {
        func: &mut func,
        oracle: &oracle,
        labels: &labels,
        param: &param,
        use_chain_label: false,
        rng: &mut rng,
    };
    emitter.insert_chain(bb, anchor, chain, 0).unwrap();
    mov_eax_imms(&func, bb)
}

#[test]
fn samples_exactly_max_branches_distinct_addresses() {
    let targets = divergent_mov_targets(2, 41);
    assert_eq!(targets.len(), 2);

    let distinct: BTreeSet<i64> = targets.iter().copied().collect();
    assert_eq!(distinct.len(), 2, "sampled addresses must be distinct");
    assert!(distinct.is_subset(&expected_offsets()));
}

#[test]
fn branch_count_is_capped_by_the_address_set() {
    let targets = divergent_mov_targets(32, 42);
    let distinct: BTreeSet<i64> = targets.iter().copied().collect();
    assert_eq!(distinct, expected_offsets());
}

#[test]
fn producer_reduces_into_the_sampled_range() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let anchor = push_mov_imm(&mut func, bb, X86Reg::Eax, 0);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let oracle = divergence_oracle();
    let param = divergence_param(2);
    let labels = LabelPool::new();
    let mut rng = StdRng::seed_from_u64(43);

    let mut chain = RopChain::new();
    chain.push(ChainElem::Gadget(oracle.gadget("pop eax; ret").unwrap()));

    let mut emitter = ChainEmitter {
        func: &mut func,
        oracle: &oracle,
        labels: &labels,
        param: &param,
        use_chain_label: false,
        rng: &mut rng,
    };
    emitter.insert_chain(bb, anchor, chain, 0).unwrap();

    let lines = block_lines(&func, bb);
    // two branches mask down to one bit before the adjustor maps them
    assert!(lines.contains(&"and eax, 0x1".to_string()));
    assert!(lines.iter().any(|l| l.starts_with("add eax, memcpy")));
}

#[test]
fn single_address_composes_an_exact_adjustment() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let anchor = push_mov_imm(&mut func, bb, X86Reg::Eax, 0);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut oracle = LibraryOracle::default();
    oracle.add_symbol(Symbol::new("memcpy", "Base", 0x1000));
    oracle.add_gadget("pop eax; ret", vec![0x11223]);

    let param = ObfuscationParameter {
        opaque_predicates_enabled: true,
        obfuscate_branch_target: false,
        ..Default::default()
    };
    let labels = LabelPool::new();
    let mut rng = StdRng::seed_from_u64(44);

    let mut chain = RopChain::new();
    chain.push(ChainElem::Gadget(oracle.gadget("pop eax; ret").unwrap()));

    let mut emitter = ChainEmitter {
        func: &mut func,
        oracle: &oracle,
        labels: &labels,
        param: &param,
        use_chain_label: false,
        rng: &mut rng,
    };
    emitter.insert_chain(bb, anchor, chain, 0).unwrap();

    // the mov constant plus the adjustor difference lands on the offset
    let movs = mov_eax_imms(&func, bb);
    assert_eq!(movs.len(), 1);
    let lines = block_lines(&func, bb);
    let add = lines
        .iter()
        .find(|l| l.starts_with("add eax, 0x") || l.starts_with("add eax, -"))
        .unwrap();
    let diff = parse_imm(add.trim_start_matches("add eax, "));
    assert_eq!(
        (movs[0] as u32).wrapping_add(diff as u32),
        0x11223 - 0x1000
    );
}

fn parse_imm(text: &str) -> i64 {
    if let Some(hex) = text.strip_prefix("-0x") {
        -i64::from_str_radix(hex, 16).unwrap()
    } else {
        i64::from_str_radix(text.trim_start_matches("0x"), 16).unwrap()
    }
}
