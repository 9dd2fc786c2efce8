//! The `probe` subcommand: locate the default gadget library.

use clap::Args;
use ropforge_core::autopsy::find_libc_path;
use std::error::Error;

/// Arguments for the `probe` subcommand.
#[derive(Args)]
pub struct ProbeArgs {}

impl super::Command for ProbeArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        match find_libc_path() {
            Some(path) => {
                println!("{}", path.display());
                Ok(())
            }
            None => Err("no libc.so.6 found in the standard library directories".into()),
        }
    }
}
