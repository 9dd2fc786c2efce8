use clap::Parser;
use ropforge_cli::commands::{Cmd, Command};
use tracing_subscriber::EnvFilter;

/// ropforge CLI
///
/// ropforge rewrites 32-bit x86 machine code into ROP-chain form. The CLI
/// inspects configurations, probes for the library to harvest gadgets from,
/// and runs a demonstration lowering pipeline.
#[derive(Parser)]
#[command(name = "ropforge")]
#[command(about = "ropforge: ROP-chain code rewriting")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

/// Runs the ropforge CLI with the provided arguments.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    cli.command.execute()
}
