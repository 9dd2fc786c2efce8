//! ropforge-rop: lowers selected machine instructions into ROP chains.
//!
//! The crate owns the abstract chain model, the opaque-construct factory,
//! the push-instruction lowering, the chain emission engine and the
//! per-function driver pass. Translating one machine instruction into an
//! abstract chain is the ropifier collaborator's job, reached through the
//! [`Ropifier`] trait.

pub mod chain;
pub mod emit;
pub mod opaque;
pub mod pass;
pub mod push;
pub mod stats;

use ropforge_core::mir::MachineInst;
use ropforge_core::X86Reg;
use thiserror::Error;

pub use chain::{ChainElem, FlagSaveMode, RopChain};
pub use pass::RopPass;
pub use stats::InstrStats;

/// Lowering error type encompassing all chain emission failures.
///
/// Unlike per-instruction [`RopifyError`] rejections, these are fatal: they
/// signal a bug in the ropifier or an unusable compilation environment, and
/// the pass surfaces them instead of producing wrong code.
#[derive(Debug, Error)]
pub enum Error {
    /// A core operation failed.
    #[error(transparent)]
    Core(#[from] ropforge_core::Error),

    /// A chain asked to save flags after execution while carrying both jump kinds.
    #[error("chain with flags saved after execution carries conflicting jumps")]
    ConflictingJumpFlags,

    /// An `EspOffset` element referenced an id no `EspPush` recorded.
    #[error("esp offset {0} has no preceding esp push")]
    EspOffsetWithoutPush(u32),

    /// A chain referenced a gadget the library holds no addresses for.
    #[error("gadget `{0}` has no addresses")]
    GadgetWithoutAddresses(String),

    /// An opaque generator declared no output for its storage slot.
    #[error("opaque construct declares no output value")]
    OpaqueOutputMissing,

    /// The pass was constructed without an oracle or a way to build one.
    #[error("no gadget oracle available")]
    OracleUnavailable,

    /// Only 32-bit x86 functions can be lowered.
    #[error("only 32-bit x86 targets are supported")]
    UnsupportedTarget,
}

/// Lowering result type
pub type Result<T> = std::result::Result<T, Error>;

/// Why the ropifier rejected one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopifyError {
    /// The opcode is not handled.
    NotImplemented,
    /// No scratch register is dead at this point.
    NoRegisterAvailable,
    /// The library lacks a gadget of the required shape.
    NoGadgetsAvailable,
    /// Semantically rejected.
    Unsupported,
    /// The instruction touches ESP in a way the engine cannot preserve.
    UnsupportedStackPointer,
}

/// Outcome kind of one ropify attempt, as counted by the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Ropified,
    NotImplemented,
    NoRegisterAvailable,
    NoGadgetsAvailable,
    Unsupported,
    UnsupportedStackPointer,
}

impl ChainStatus {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<RopifyError> for ChainStatus {
    fn from(err: RopifyError) -> Self {
        match err {
            RopifyError::NotImplemented => ChainStatus::NotImplemented,
            RopifyError::NoRegisterAvailable => ChainStatus::NoRegisterAvailable,
            RopifyError::NoGadgetsAvailable => ChainStatus::NoGadgetsAvailable,
            RopifyError::Unsupported => ChainStatus::Unsupported,
            RopifyError::UnsupportedStackPointer => ChainStatus::UnsupportedStackPointer,
        }
    }
}

/// Translates one machine instruction into an abstract ROP chain.
///
/// Implementations must populate the chain's flag-save mode, jump flags and
/// element list consistently: `should_save_flags` tells the ropifier whether
/// EFLAGS carries a live value across the instruction.
pub trait Ropifier {
    fn ropify(
        &mut self,
        inst: &MachineInst,
        scratch_regs: &[X86Reg],
        should_save_flags: bool,
    ) -> std::result::Result<RopChain, RopifyError>;
}
