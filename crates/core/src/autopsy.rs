//! Gadget and symbol oracle.
//!
//! The boundary towards the library-analysis collaborator: exported symbols
//! usable as gadget anchors, the gadgets themselves with every address they
//! occur at, and the `.symver` bookkeeping for versioned symbols.
//!
//! The oracle is read-mostly and single-threaded; the only mutation the pass
//! performs is flipping each symbol's set-once `used` flag the first time its
//! version directive is emitted.

use crate::result::{Error, Result};
use rand::prelude::IndexedRandom;
use rand::rngs::StdRng;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

/// Symbol version meaning "only one version of this symbol exists".
pub const BASE_VERSION: &str = "Base";

/// Directories probed, in order, for the default `libc.so.6`.
const POSSIBLE_LIBC_FOLDERS: [&str; 7] = [
    "/lib/i386-linux-gnu",
    "/usr/lib/i386-linux-gnu",
    "/lib32",
    "/usr/lib32",
    "/usr/local/lib",
    "/lib",
    "/usr/lib",
];

/// An exported symbol of the analyzed library.
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub version: String,
    pub address: u64,
    used: Cell<bool>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, version: impl Into<String>, address: u64) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            address,
            used: Cell::new(false),
        }
    }

    /// True once the symbol's version directive has been emitted.
    pub fn is_used(&self) -> bool {
        self.used.get()
    }

    /// Set-once marker; never cleared for the oracle's lifetime.
    pub fn mark_used(&self) {
        self.used.set(true);
    }

    pub fn is_versioned(&self) -> bool {
        self.version != BASE_VERSION
    }

    /// Label under which the symbol is referenced in emitted assembly.
    ///
    /// Versioned symbols get an aliased label so that same-named symbols of
    /// different versions cannot collide at assembly time.
    pub fn label(&self) -> String {
        if self.is_versioned() {
            format!("{}_{}", self.name, self.version.replace('.', "_"))
        } else {
            self.name.clone()
        }
    }

    /// The `.symver` directive binding the alias label to `name@version`.
    pub fn symver_directive(&self) -> String {
        format!(".symver {}, {}@{}", self.label(), self.name, self.version)
    }
}

/// A gadget and every address it appears at inside the library.
#[derive(Debug, Clone)]
pub struct Gadget {
    /// Canonical text of the instruction sequence, e.g. `pop eax; ret`.
    pub text: String,
    pub addresses: Vec<u64>,
}

/// Options carried over from the `[general]` configuration section.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleOptions {
    /// Gadgets were harvested from the whole code segment rather than just
    /// the code section.
    pub search_segment_for_gadget: bool,
    /// Exclude symbols that exist in multiple versions from anchor duty.
    pub avoid_multiversion_symbol: bool,
}

/// Symbol and gadget tables of one analyzed shared library.
#[derive(Debug, Default)]
pub struct LibraryOracle {
    options: OracleOptions,
    symbols: Vec<Rc<Symbol>>,
    gadgets: HashMap<String, Rc<Gadget>>,
}

impl LibraryOracle {
    pub fn new(options: OracleOptions) -> Self {
        Self {
            options,
            symbols: Vec::new(),
            gadgets: HashMap::new(),
        }
    }

    pub fn options(&self) -> OracleOptions {
        self.options
    }

    pub fn add_symbol(&mut self, symbol: Symbol) {
        if self.options.avoid_multiversion_symbol && symbol.is_versioned() {
            return;
        }
        self.symbols.push(Rc::new(symbol));
    }

    pub fn add_gadget(&mut self, text: impl Into<String>, addresses: Vec<u64>) -> Rc<Gadget> {
        let text = text.into();
        let gadget = Rc::new(Gadget {
            text: text.clone(),
            addresses,
        });
        self.gadgets.insert(text, Rc::clone(&gadget));
        gadget
    }

    /// A uniformly random anchor symbol.
    pub fn random_symbol(&self, rng: &mut StdRng) -> Result<Rc<Symbol>> {
        self.symbols
            .choose(rng)
            .cloned()
            .ok_or(Error::NoSymbols)
    }

    /// Looks up a gadget by its canonical text.
    pub fn gadget(&self, text: &str) -> Option<Rc<Gadget>> {
        self.gadgets.get(text).cloned()
    }

    pub fn symbols(&self) -> &[Rc<Symbol>] {
        &self.symbols
    }
}

/// Probes the standard 32-bit library directories for `libc.so.6`.
///
/// First match wins; directories are not recursed into.
pub fn find_libc_path() -> Option<PathBuf> {
    for dir in POSSIBLE_LIBC_FOLDERS {
        let candidate = PathBuf::from(dir).join("libc.so.6");
        match std::fs::metadata(&candidate) {
            Ok(meta) if meta.is_file() => {
                debug!("using library path: {}", candidate.display());
                return Some(candidate);
            }
            _ => continue,
        }
    }
    None
}
