use crate::support::{pop_eax_chain, push_mov_imm, single_anchor_oracle, versioned_anchor_oracle};
use ropforge_core::asm::LabelPool;
use ropforge_core::config::ObfuscationParameter;
use ropforge_core::mir::{BlockItem, MachineFunction, Opcode};
use ropforge_core::X86Reg;
use ropforge_rop::emit::ChainEmitter;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn all_lines(func: &MachineFunction) -> Vec<String> {
    func.layout
        .iter()
        .flat_map(|node| {
            func.block(*node)
                .items
                .iter()
                .flat_map(|item| match item {
                    BlockItem::Inst(inst) => vec![inst.to_string()],
                    BlockItem::Label(label) => vec![format!("{label}:")],
                    BlockItem::Directive(text) => text.lines().map(str::to_string).collect(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[test]
fn versioned_anchor_emits_one_directive_before_first_use() {
    let oracle = versioned_anchor_oracle();
    let param = ObfuscationParameter::default();
    let labels = LabelPool::new();
    let mut rng = StdRng::seed_from_u64(5);

    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let first = push_mov_imm(&mut func, bb, X86Reg::Eax, 0x11);
    let second = push_mov_imm(&mut func, bb, X86Reg::Eax, 0x22);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut emitter = ChainEmitter {
        func: &mut func,
        oracle: &oracle,
        labels: &labels,
        param: &param,
        use_chain_label: false,
        rng: &mut rng,
    };
    // two chains in the same function, both anchored on the same symbol
    let chain = pop_eax_chain(&oracle, 0x11);
    emitter.insert_chain(bb, first, chain, 0).unwrap();
    let chain = pop_eax_chain(&oracle, 0x22);
    emitter.insert_chain(bb, second, chain, 1).unwrap();
    func.erase_insts(bb, &[first, second]);

    let lines = all_lines(&func);
    let directives: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with(".symver"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(directives.len(), 1, "one directive per symbol per module");
    assert_eq!(
        lines[directives[0]],
        ".symver printf_GLIBC_2_0, printf@GLIBC_2.0"
    );

    let first_use = lines
        .iter()
        .position(|l| l.contains("push printf_GLIBC_2_0"))
        .unwrap();
    assert!(directives[0] < first_use);

    // both chains reference the aliased label
    assert_eq!(
        lines
            .iter()
            .filter(|l| l.contains("push printf_GLIBC_2_0"))
            .count(),
        2
    );
}

#[test]
fn base_symbols_never_get_directives() {
    let oracle = single_anchor_oracle();
    let param = ObfuscationParameter::default();
    let labels = LabelPool::new();
    let mut rng = StdRng::seed_from_u64(6);

    let mut func = MachineFunction::new("foo");
    let bb = func.add_block();
    let anchor = push_mov_imm(&mut func, bb, X86Reg::Eax, 0x11);
    func.push_inst(bb, Opcode::Ret, vec![]);

    let mut emitter = ChainEmitter {
        func: &mut func,
        oracle: &oracle,
        labels: &labels,
        param: &param,
        use_chain_label: false,
        rng: &mut rng,
    };
    let chain = pop_eax_chain(&oracle, 0x11);
    emitter.insert_chain(bb, anchor, chain, 0).unwrap();

    assert!(!all_lines(&func).iter().any(|l| l.starts_with(".symver")));
}
