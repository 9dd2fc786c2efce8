//! Per-opcode statistics of ropification outcomes.

use crate::ChainStatus;
use ropforge_core::mir::Opcode;
use std::collections::BTreeMap;
use std::fmt;

/// One row of counters, indexed by [`ChainStatus`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatEntry {
    data: [u32; ChainStatus::COUNT],
}

impl StatEntry {
    pub fn record(&mut self, status: ChainStatus) {
        self.data[status.index()] += 1;
    }

    pub fn count(&self, status: ChainStatus) -> u32 {
        self.data[status.index()]
    }

    pub fn total(&self) -> u32 {
        self.data.iter().sum()
    }
}

/// Per-opcode outcome counters, dumped as a table on teardown.
#[derive(Debug, Clone, Default)]
pub struct InstrStats {
    entries: BTreeMap<Opcode, StatEntry>,
}

impl InstrStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, opcode: Opcode, status: ChainStatus) {
        self.entries.entry(opcode).or_default().record(status);
    }

    pub fn entry(&self, opcode: Opcode) -> Option<&StatEntry> {
        self.entries.get(&opcode)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instructions successfully replaced, across all opcodes.
    pub fn total_ropified(&self) -> u32 {
        self.entries
            .values()
            .map(|e| e.count(ChainStatus::Ropified))
            .sum()
    }
}

impl fmt::Display for InstrStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "op-id\top-name\tropfuscated\tnot-implemented\tno-register\tno-gadget\tunsupported\tunsupported-esp\ttotal"
        )?;
        for (opcode, entry) in &self.entries {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                opcode.id(),
                opcode.name(),
                entry.count(ChainStatus::Ropified),
                entry.count(ChainStatus::NotImplemented),
                entry.count(ChainStatus::NoRegisterAvailable),
                entry.count(ChainStatus::NoGadgetsAvailable),
                entry.count(ChainStatus::Unsupported),
                entry.count(ChainStatus::UnsupportedStackPointer),
                entry.total(),
            )?;
        }
        Ok(())
    }
}
