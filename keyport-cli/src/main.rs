//! Keyport CLI - connect a wallet from the terminal.

use clap::{Parser, Subcommand};
use keyport_cli::{ConnectArgs, run_connect};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keyport CLI - wallet connection manager
#[derive(Parser, Debug)]
#[command(name = "keyport")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect with a private key, mnemonic or keystore and show the account
    Connect(ConnectArgs),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("keyport=debug,keyport_cli=debug")
    } else {
        EnvFilter::new("keyport=warn,keyport_cli=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Connect(connect) => run_connect(connect).await,
    }
}
