//! Pass configuration.
//!
//! Deserialized from a TOML file with a `[general]` table and per-function
//! `[functions.<name>]` tables. A named table starts from the resolved
//! `[functions.default]` parameter and overlays only the keys it sets.
//! Algorithm strings are matched case-insensitively; unknown values fail the
//! parse.

use crate::autopsy::{find_libc_path, OracleOptions};
use crate::result::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Key of the function table holding module-wide defaults.
pub const DEFAULT_FUNCTION_SECTION: &str = "default";

/// Algorithm used to synthesize opaque 32-bit constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaqueConstantAlgo {
    /// Plain load of a random value.
    Mov,
    /// Multiply-and-compare synthesis.
    MultComp,
}

impl FromStr for OpaqueConstantAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mov" => Ok(OpaqueConstantAlgo::Mov),
            "multcomp" => Ok(OpaqueConstantAlgo::MultComp),
            _ => Err(Error::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl OpaqueConstantAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            OpaqueConstantAlgo::Mov => "mov",
            OpaqueConstantAlgo::MultComp => "multcomp",
        }
    }
}

/// Algorithm producing one of several runtime values for branch divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchDivergenceAlgo {
    /// Sum of two live registers.
    AddReg,
    /// Timestamp counter.
    Rdtsc,
    /// Negated stack pointer.
    NegativeStack,
}

impl FromStr for BranchDivergenceAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "addreg" => Ok(BranchDivergenceAlgo::AddReg),
            "rdtsc" => Ok(BranchDivergenceAlgo::Rdtsc),
            "negative_stack" => Ok(BranchDivergenceAlgo::NegativeStack),
            _ => Err(Error::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl BranchDivergenceAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchDivergenceAlgo::AddReg => "addreg",
            BranchDivergenceAlgo::Rdtsc => "rdtsc",
            BranchDivergenceAlgo::NegativeStack => "negative_stack",
        }
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(OpaqueConstantAlgo);
string_serde!(BranchDivergenceAlgo);

/// The `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub obfuscation_enabled: bool,
    pub search_segment_for_gadget: bool,
    pub avoid_multiversion_symbol: bool,
    pub custom_library_path: Option<PathBuf>,
    /// Emit human-readable chain and resume labels.
    pub use_chain_label: bool,
    /// Dump the per-opcode status table when the pass is torn down.
    pub print_instr_stat: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            obfuscation_enabled: true,
            search_segment_for_gadget: true,
            avoid_multiversion_symbol: false,
            custom_library_path: None,
            use_chain_label: false,
            print_instr_stat: false,
        }
    }
}

impl GeneralConfig {
    pub fn oracle_options(&self) -> OracleOptions {
        OracleOptions {
            search_segment_for_gadget: self.search_segment_for_gadget,
            avoid_multiversion_symbol: self.avoid_multiversion_symbol,
        }
    }
}

/// Obfuscation parameters resolved for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscationParameter {
    pub obfuscation_enabled: bool,
    pub opaque_predicates_enabled: bool,
    pub obfuscate_immediate_operand: bool,
    pub obfuscate_branch_target: bool,
    pub branch_divergence_enabled: bool,
    pub branch_divergence_max_branches: u32,
    pub opaque_constant_algorithm: OpaqueConstantAlgo,
    pub branch_divergence_algorithm: BranchDivergenceAlgo,
}

impl Default for ObfuscationParameter {
    fn default() -> Self {
        Self {
            obfuscation_enabled: true,
            opaque_predicates_enabled: false,
            obfuscate_immediate_operand: true,
            obfuscate_branch_target: true,
            branch_divergence_enabled: false,
            branch_divergence_max_branches: 32,
            opaque_constant_algorithm: OpaqueConstantAlgo::Mov,
            branch_divergence_algorithm: BranchDivergenceAlgo::AddReg,
        }
    }
}

/// One `[functions.<name>]` table; unset keys fall back to the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionOverride {
    pub obfuscation_enabled: Option<bool>,
    pub opaque_predicates_enabled: Option<bool>,
    pub opaque_predicates_algorithm: Option<OpaqueConstantAlgo>,
    pub obfuscate_immediate_operand: Option<bool>,
    pub obfuscate_branch_target: Option<bool>,
    pub branch_divergence_enabled: Option<bool>,
    pub branch_divergence_max_branches: Option<u32>,
    pub branch_divergence_algorithm: Option<BranchDivergenceAlgo>,
}

impl FunctionOverride {
    fn apply(&self, param: &mut ObfuscationParameter) {
        if let Some(v) = self.obfuscation_enabled {
            param.obfuscation_enabled = v;
        }
        if let Some(v) = self.opaque_predicates_enabled {
            param.opaque_predicates_enabled = v;
        }
        if let Some(v) = self.opaque_predicates_algorithm {
            param.opaque_constant_algorithm = v;
        }
        if let Some(v) = self.obfuscate_immediate_operand {
            param.obfuscate_immediate_operand = v;
        }
        if let Some(v) = self.obfuscate_branch_target {
            param.obfuscate_branch_target = v;
        }
        if let Some(v) = self.branch_divergence_enabled {
            param.branch_divergence_enabled = v;
        }
        if let Some(v) = self.branch_divergence_max_branches {
            param.branch_divergence_max_branches = v;
        }
        if let Some(v) = self.branch_divergence_algorithm {
            param.branch_divergence_algorithm = v;
        }
    }
}

/// Complete configuration of one compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RopforgeConfig {
    pub general: GeneralConfig,
    pub functions: BTreeMap<String, FunctionOverride>,
}

impl RopforgeConfig {
    /// Loads and parses a TOML configuration file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        debug!("loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|source| Error::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Resolves the obfuscation parameter for `func_name`.
    pub fn parameter_for(&self, func_name: &str) -> ObfuscationParameter {
        let mut param = ObfuscationParameter::default();
        if let Some(default) = self.functions.get(DEFAULT_FUNCTION_SECTION) {
            default.apply(&mut param);
        }
        if func_name != DEFAULT_FUNCTION_SECTION {
            if let Some(named) = self.functions.get(func_name) {
                named.apply(&mut param);
            }
        }
        param.obfuscation_enabled &= self.general.obfuscation_enabled;
        param
    }

    /// The library to analyze: the configured path, or the probed libc.
    pub fn resolve_library_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.general.custom_library_path {
            return Ok(path.clone());
        }
        find_libc_path().ok_or(Error::LibraryNotFound)
    }
}
