use crate::support::{block_lines, push_mov_imm, single_anchor_oracle, ScriptRopifier};
use ropforge_core::config::RopforgeConfig;
use ropforge_core::mir::{EdgeKind, MachineFunction, Opcode, Operand};
use ropforge_core::seed::Seed;
use ropforge_core::X86Reg;
use ropforge_rop::chain::{ChainElem, FlagSaveMode, RopChain};
use ropforge_rop::{ChainStatus, Error, RopPass, RopifyError};
use std::path::Path;
use std::rc::Rc;

const SEED: &str = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

fn test_pass(config_toml: &str) -> RopPass {
    let config: RopforgeConfig = toml::from_str(config_toml).unwrap();
    let seed = Seed::from_hex(SEED).unwrap();
    RopPass::with_oracle(config, &seed, Rc::new(single_anchor_oracle()))
}

fn imm_chain(value: i64) -> Result<RopChain, RopifyError> {
    let mut chain = RopChain::new();
    chain.push(ChainElem::ImmValue(value));
    Ok(chain)
}

#[test]
fn adjacent_chains_merge_into_one_emission() {
    let _ = tracing_subscriber::fmt()
        .with_ansi(false)
        .without_time()
        .try_init();

    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    push_mov_imm(&mut func, bb, X86Reg::Eax, 1);
    push_mov_imm(&mut func, bb, X86Reg::Ebx, 2);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut ropifier = ScriptRopifier::new(vec![
        imm_chain(1),
        imm_chain(2),
        Err(RopifyError::NotImplemented),
    ]);
    let mut pass = test_pass("[general]\nuse_chain_label = true\n");
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();

    let lines = block_lines(&func, bb);
    // one merged chain, anchored at the second instruction's position
    assert!(lines.contains(&"foo_chain_0:".to_string()));
    assert!(!lines.iter().any(|l| l.contains("foo_chain_1")));
    // both originals are gone, the rejected ret stays
    assert!(!lines.contains(&"mov eax, 0x1".to_string()));
    assert!(!lines.contains(&"mov ebx, 0x2".to_string()));
    assert_eq!(lines.last().unwrap(), "ret");
    // two merged slots plus the fall-through slot
    assert_eq!(
        lines.iter().filter(|l| l.starts_with("push")).count(),
        3
    );

    let mov = pass.stats().entry(Opcode::Mov).unwrap();
    assert_eq!(mov.count(ChainStatus::Ropified), 2);
    let ret = pass.stats().entry(Opcode::Ret).unwrap();
    assert_eq!(ret.count(ChainStatus::NotImplemented), 1);
}

#[test]
fn jump_with_save_after_exec_is_forced_unsupported() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let target = func.add_block();
    push_mov_imm(&mut func, bb, X86Reg::Eax, 1);
    func.push_inst(bb, Opcode::Je, vec![Operand::Block(target)]);
    func.push_inst(target, Opcode::Ret, vec![]);
    func.add_successor(bb, target, EdgeKind::Branch);

    let mut jump_chain = RopChain::new();
    jump_chain.push(ChainElem::JmpBlock(target));
    jump_chain.has_conditional_jump = true;
    jump_chain.flag_save = FlagSaveMode::SaveAfterExec;

    let mut ropifier = ScriptRopifier::new(vec![
        imm_chain(1),
        Ok(jump_chain),
        Err(RopifyError::NotImplemented),
    ]);
    let mut pass = test_pass("[general]\nuse_chain_label = true\n");
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();

    let lines = block_lines(&func, bb);
    // the jump stays in place, the pending chain was flushed at the mov
    assert!(lines.contains(&"je bb1".to_string()));
    assert!(lines.contains(&"foo_chain_0:".to_string()));
    assert!(!lines.contains(&"mov eax, 0x1".to_string()));

    let je = pass.stats().entry(Opcode::Je).unwrap();
    assert_eq!(je.count(ChainStatus::Unsupported), 1);
    assert_eq!(je.count(ChainStatus::Ropified), 0);
}

#[test]
fn rejection_mid_block_splits_the_chains() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    push_mov_imm(&mut func, bb, X86Reg::Eax, 1);
    func.push_inst(bb, Opcode::Add, vec![
        Operand::Reg(X86Reg::Eax),
        Operand::Reg(X86Reg::Ebx),
    ]);
    push_mov_imm(&mut func, bb, X86Reg::Ecx, 2);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut ropifier = ScriptRopifier::new(vec![
        imm_chain(1),
        Err(RopifyError::NotImplemented),
        imm_chain(2),
        Err(RopifyError::NotImplemented),
    ]);
    let mut pass = test_pass("[general]\nuse_chain_label = true\n");
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();

    let lines = block_lines(&func, bb);
    // the kept add separates two chains
    assert!(lines.contains(&"foo_chain_0:".to_string()));
    assert!(lines.contains(&"foo_chain_1:".to_string()));
    assert!(lines.contains(&"add eax, ebx".to_string()));
}

#[test]
fn disabled_function_never_reaches_the_engine() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    push_mov_imm(&mut func, bb, X86Reg::Eax, 1);
    func.push_inst(bb, Opcode::Ret, vec![]);
    let before = func.render();

    let mut ropifier = ScriptRopifier::new(vec![]);
    let mut pass = test_pass("[functions.\"foo\"]\nobfuscation_enabled = false\n");
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();

    assert_eq!(ropifier.calls, 0);
    assert_eq!(func.render(), before);
}

#[test]
fn oracle_is_built_lazily_from_the_configured_path() {
    let config: RopforgeConfig = toml::from_str(
        "[general]\ncustom_library_path = \"/tmp/libc.so.6\"\nuse_chain_label = true\n",
    )
    .unwrap();
    let seed = Seed::from_hex(SEED).unwrap();
    let mut pass = RopPass::new(
        config,
        &seed,
        Box::new(|path| {
            assert_eq!(path, Path::new("/tmp/libc.so.6"));
            Ok(single_anchor_oracle())
        }),
    );

    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    push_mov_imm(&mut func, bb, X86Reg::Eax, 1);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut ropifier = ScriptRopifier::new(vec![
        imm_chain(1),
        Err(RopifyError::NotImplemented),
    ]);
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();
    assert!(block_lines(&func, bb).contains(&"foo_chain_0:".to_string()));
}

#[test]
fn sixty_four_bit_targets_are_fatal() {
    let mut func = MachineFunction::new("foo");
    func.is_64bit = true;

    let mut ropifier = ScriptRopifier::new(vec![]);
    let mut pass = test_pass("");
    let err = pass.obfuscate_function(&mut func, &mut ropifier).unwrap_err();
    assert!(matches!(err, Error::UnsupportedTarget));
}

#[test]
fn debug_pseudo_instructions_are_skipped() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    func.push_inst(bb, Opcode::DbgValue, vec![]);
    push_mov_imm(&mut func, bb, X86Reg::Eax, 1);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut ropifier = ScriptRopifier::new(vec![
        imm_chain(1),
        Err(RopifyError::NotImplemented),
    ]);
    let mut pass = test_pass("");
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();

    // the ropifier saw the mov and the ret, never the pseudo
    assert_eq!(ropifier.calls, 2);
    assert!(block_lines(&func, bb).contains(&"dbg_value".to_string()));
}

#[test]
fn flags_liveness_is_reported_to_the_ropifier() {
    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let target = func.add_block();
    func.push_inst(bb, Opcode::Cmp, vec![
        Operand::Reg(X86Reg::Eax),
        Operand::Imm(0),
    ]);
    push_mov_imm(&mut func, bb, X86Reg::Ecx, 1);
    func.push_inst(bb, Opcode::Je, vec![Operand::Block(target)]);
    func.push_inst(target, Opcode::Ret, vec![]);
    func.add_successor(bb, target, EdgeKind::Branch);

    let mut ropifier = ScriptRopifier::new(vec![
        Err(RopifyError::NotImplemented),
        Err(RopifyError::NotImplemented),
        Err(RopifyError::NotImplemented),
        Err(RopifyError::NotImplemented),
    ]);
    let mut pass = test_pass("");
    pass.obfuscate_function(&mut func, &mut ropifier).unwrap();

    // the cmp may clobber flags, the mov in the middle may not
    assert_eq!(ropifier.saw_save_flags, vec![false, true, true, false]);
}
