mod bootstrap_helpers;
mod commands;

use anyhow::Result;
use clap::Parser;
use kestrel_cli::Cli;

use crate::bootstrap_helpers::init_tracing;
use crate::commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let exit_code = run_cli(cli).await?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
