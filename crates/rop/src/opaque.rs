//! Opaque-construct factory.
//!
//! An opaque construct is a code sequence computing, at runtime, one value
//! (or one of several declared values) into a storage register while looking
//! non-trivial to static analysis. The chain lowering only relies on the
//! contract: the declared outputs, the clobbered registers, and the ability
//! to compile into an assembly stream. Constant synthesis is seeded, so a
//! fixed seed reproduces identical generators.

use ropforge_core::asm::AsmStream;
use ropforge_core::config::{BranchDivergenceAlgo, OpaqueConstantAlgo};
use ropforge_core::X86Reg;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeSet;

/// Declared result of one storage register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpaqueValue {
    Single(u32),
    Multiple(Vec<u32>),
}

/// The declared outputs of an opaque construct, keyed by storage register.
#[derive(Debug, Clone, Default)]
pub struct OpaqueState {
    entries: Vec<(X86Reg, OpaqueValue)>,
}

impl OpaqueState {
    pub fn single(storage: X86Reg, value: u32) -> Self {
        Self {
            entries: vec![(storage, OpaqueValue::Single(value))],
        }
    }

    pub fn multiple(storage: X86Reg, values: Vec<u32>) -> Self {
        Self {
            entries: vec![(storage, OpaqueValue::Multiple(values))],
        }
    }

    /// The single declared value of `storage`, if any.
    pub fn find_value(&self, storage: X86Reg) -> Option<u32> {
        self.entries.iter().find_map(|(s, v)| match v {
            OpaqueValue::Single(value) if *s == storage => Some(*value),
            _ => None,
        })
    }

    /// All declared values of `storage`; a single value yields a one-element
    /// vector.
    pub fn find_values(&self, storage: X86Reg) -> Option<Vec<u32>> {
        self.entries.iter().find_map(|(s, v)| {
            if *s != storage {
                return None;
            }
            Some(match v {
                OpaqueValue::Single(value) => vec![*value],
                OpaqueValue::Multiple(values) => values.clone(),
            })
        })
    }
}

/// A compiled-on-demand opaque value generator.
pub trait OpaqueConstruct {
    /// Emits the generator at the current stream position.
    fn compile(&self, stream: &mut AsmStream<'_>);

    /// The declared outputs.
    fn output(&self) -> &OpaqueState;

    /// Registers the generated code may clobber.
    fn clobbered_regs(&self) -> &BTreeSet<X86Reg>;
}

fn regs(list: &[X86Reg]) -> BTreeSet<X86Reg> {
    list.iter().copied().collect()
}

/// `mov` algorithm: load one random 32-bit constant.
struct MovConstant {
    reg: X86Reg,
    value: u32,
    output: OpaqueState,
    clobbers: BTreeSet<X86Reg>,
}

impl OpaqueConstruct for MovConstant {
    fn compile(&self, stream: &mut AsmStream<'_>) {
        stream.mov_reg_imm(self.reg, self.value as i64);
    }

    fn output(&self) -> &OpaqueState {
        &self.output
    }

    fn clobbered_regs(&self) -> &BTreeSet<X86Reg> {
        &self.clobbers
    }
}

/// `multcomp` algorithm: the constant is the wrap-around product of two
/// random factors xored with a random mask, assembled at runtime.
struct MultCompConstant {
    reg: X86Reg,
    factor_a: u32,
    factor_m: u32,
    mask: u32,
    output: OpaqueState,
    clobbers: BTreeSet<X86Reg>,
}

impl MultCompConstant {
    fn value(&self) -> u32 {
        self.factor_a.wrapping_mul(self.factor_m) ^ self.mask
    }
}

impl OpaqueConstruct for MultCompConstant {
    fn compile(&self, stream: &mut AsmStream<'_>) {
        stream.mov_reg_imm(self.reg, self.factor_a as i64);
        stream.imul_reg_reg_imm(self.reg, self.reg, self.factor_m as i64);
        stream.xor_reg_imm(self.reg, self.mask as i64);
    }

    fn output(&self) -> &OpaqueState {
        &self.output
    }

    fn clobbered_regs(&self) -> &BTreeSet<X86Reg> {
        &self.clobbers
    }
}

/// Branching producer: leaves one of `0..count` in the storage register,
/// decided by a runtime source the chosen algorithm names.
struct BranchingProducer {
    reg: X86Reg,
    algo: BranchDivergenceAlgo,
    count: usize,
    output: OpaqueState,
    clobbers: BTreeSet<X86Reg>,
}

impl OpaqueConstruct for BranchingProducer {
    fn compile(&self, stream: &mut AsmStream<'_>) {
        match self.algo {
            BranchDivergenceAlgo::AddReg => {
                stream.mov_reg_reg(self.reg, X86Reg::Ecx);
                stream.add_reg_reg(self.reg, X86Reg::Edx);
            }
            BranchDivergenceAlgo::Rdtsc => {
                stream.rdtsc();
                if self.reg != X86Reg::Eax {
                    stream.mov_reg_reg(self.reg, X86Reg::Eax);
                }
            }
            BranchDivergenceAlgo::NegativeStack => {
                stream.mov_reg_reg(self.reg, X86Reg::Esp);
                stream.neg_reg(self.reg);
            }
        }

        // range-reduce into 0..count
        let mask = self.count.next_power_of_two() as i64 - 1;
        stream.and_reg_imm(self.reg, mask);
        if mask + 1 != self.count as i64 {
            let in_range = stream.fresh_label();
            stream.cmp_reg_imm(self.reg, self.count as i64);
            stream.jb(in_range.clone());
            stream.sub_reg_imm(self.reg, self.count as i64);
            stream.put_label(in_range);
        }
    }

    fn output(&self) -> &OpaqueState {
        &self.output
    }

    fn clobbered_regs(&self) -> &BTreeSet<X86Reg> {
        &self.clobbers
    }
}

/// Maps each declared input value of the storage register to its paired
/// output value.
struct ValueAdjustor {
    reg: X86Reg,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
    output: OpaqueState,
    clobbers: BTreeSet<X86Reg>,
}

impl OpaqueConstruct for ValueAdjustor {
    fn compile(&self, stream: &mut AsmStream<'_>) {
        if self.inputs.len() == 1 {
            let diff = self.outputs[0].wrapping_sub(self.inputs[0]);
            stream.add_reg_imm(self.reg, diff as i64);
            return;
        }

        let done = stream.fresh_label();
        let last = self.inputs.len() - 1;
        for (input, output) in self.inputs[..last].iter().zip(&self.outputs[..last]) {
            let next = stream.fresh_label();
            stream.cmp_reg_imm(self.reg, *input as i64);
            stream.jne(next.clone());
            stream.mov_reg_imm(self.reg, *output as i64);
            stream.jmp(done.clone());
            stream.put_label(next);
        }
        stream.mov_reg_imm(self.reg, self.outputs[last] as i64);
        stream.put_label(done);
    }

    fn output(&self) -> &OpaqueState {
        &self.output
    }

    fn clobbered_regs(&self) -> &BTreeSet<X86Reg> {
        &self.clobbers
    }
}

/// Runs `inner` first, then `outer` over its result.
struct Composed {
    inner: Box<dyn OpaqueConstruct>,
    outer: Box<dyn OpaqueConstruct>,
    clobbers: BTreeSet<X86Reg>,
}

impl OpaqueConstruct for Composed {
    fn compile(&self, stream: &mut AsmStream<'_>) {
        self.inner.compile(stream);
        self.outer.compile(stream);
    }

    fn output(&self) -> &OpaqueState {
        self.outer.output()
    }

    fn clobbered_regs(&self) -> &BTreeSet<X86Reg> {
        &self.clobbers
    }
}

/// Builds an opaque 32-bit constant generator with a fresh random value.
pub fn opaque_constant_32(
    storage: X86Reg,
    algo: OpaqueConstantAlgo,
    rng: &mut StdRng,
) -> Box<dyn OpaqueConstruct> {
    match algo {
        OpaqueConstantAlgo::Mov => {
            let value: u32 = rng.random();
            Box::new(MovConstant {
                reg: storage,
                value,
                output: OpaqueState::single(storage, value),
                clobbers: regs(&[storage]),
            })
        }
        OpaqueConstantAlgo::MultComp => {
            let constant = MultCompConstant {
                reg: storage,
                factor_a: rng.random(),
                factor_m: rng.random::<u32>() | 1,
                mask: rng.random(),
                output: OpaqueState::default(),
                clobbers: regs(&[storage, X86Reg::Eflags]),
            };
            let output = OpaqueState::single(storage, constant.value());
            Box::new(MultCompConstant { output, ..constant })
        }
    }
}

/// Builds a generator yielding one of `count` declared values at runtime.
pub fn branching_opaque_constant_32(
    storage: X86Reg,
    count: usize,
    algo: BranchDivergenceAlgo,
    _rng: &mut StdRng,
) -> Box<dyn OpaqueConstruct> {
    let mut clobbers = regs(&[storage, X86Reg::Eflags]);
    if algo == BranchDivergenceAlgo::Rdtsc {
        clobbers.insert(X86Reg::Eax);
        clobbers.insert(X86Reg::Edx);
    }
    Box::new(BranchingProducer {
        reg: storage,
        algo,
        count,
        output: OpaqueState::multiple(storage, (0..count as u32).collect()),
        clobbers,
    })
}

/// Builds an adjustor mapping each of `inputs` to the paired entry of
/// `outputs`.
pub fn value_adjustor(
    storage: X86Reg,
    inputs: &[u32],
    outputs: &[u32],
) -> Box<dyn OpaqueConstruct> {
    let output = if outputs.len() == 1 {
        OpaqueState::single(storage, outputs[0])
    } else {
        OpaqueState::multiple(storage, outputs.to_vec())
    };
    Box::new(ValueAdjustor {
        reg: storage,
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
        output,
        clobbers: regs(&[storage, X86Reg::Eflags]),
    })
}

/// Composes two constructs: `inner` runs first, `outer` consumes its result.
pub fn compose(
    outer: Box<dyn OpaqueConstruct>,
    inner: Box<dyn OpaqueConstruct>,
) -> Box<dyn OpaqueConstruct> {
    let mut clobbers = inner.clobbered_regs().clone();
    clobbers.extend(outer.clobbered_regs().iter().copied());
    Box::new(Composed {
        inner,
        outer,
        clobbers,
    })
}
