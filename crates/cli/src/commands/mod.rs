//! CLI subcommands.

mod config;
mod demo;
mod probe;

use clap::Subcommand;
use std::error::Error;

pub use config::ConfigArgs;
pub use demo::DemoArgs;
pub use probe::ProbeArgs;

/// Behavior shared by every subcommand.
pub trait Command {
    fn execute(self) -> Result<(), Box<dyn Error>>;
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Cmd {
    /// Parse a configuration file and print the resolved parameters.
    Config(ConfigArgs),
    /// Run a demonstration lowering over a small fixture function.
    Demo(DemoArgs),
    /// Probe the standard directories for the default libc.
    Probe(ProbeArgs),
}

impl Command for Cmd {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        match self {
            Cmd::Config(args) => args.execute(),
            Cmd::Demo(args) => args.execute(),
            Cmd::Probe(args) => args.execute(),
        }
    }
}
