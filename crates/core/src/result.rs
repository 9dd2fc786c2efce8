//! Core results and error types

use thiserror::Error;

/// Core error type encompassing all core module errors.
#[derive(Debug, Error)]
pub enum Error {
    /// An instruction id was not found in the block it was expected in.
    #[error("anchor instruction {0} not found in block")]
    AnchorNotFound(u32),

    /// Failed to parse the configuration file.
    #[error("configuration parse failed: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to read file at the specified path.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// The path to the file that could not be read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid hexadecimal in seed.
    #[error("invalid hexadecimal in seed")]
    InvalidSeedHex,

    /// Invalid seed length.
    #[error("invalid seed length: expected 64 hex chars, got {0}")]
    InvalidSeedLength(usize),

    /// No `libc.so.6` was found in any of the probed directories.
    #[error("no libc.so.6 found in the standard library directories")]
    LibraryNotFound,

    /// The oracle has no symbols to pick anchors from.
    #[error("symbol oracle is empty")]
    NoSymbols,

    /// An algorithm string in the configuration is not recognized.
    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),
}

/// Core result type
pub type Result<T> = std::result::Result<T, Error>;
