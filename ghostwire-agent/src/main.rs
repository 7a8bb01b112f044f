use anyhow::{Context, Result};
use clap::Parser;
use ghostwire::{Config, Desktop};
use ghostwire_agent::serve;
use ghostwire_agent::utils::{init_logging, Args};
use std::io;
use tracing::info;

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    let desktop = Desktop::new(config).context("failed to initialize the desktop engine")?;
    info!(version = env!("CARGO_PKG_VERSION"), "ghostwire agent ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let handled = serve(&desktop, stdin.lock(), stdout.lock())?;
    info!(handled, "input closed, shutting down");
    Ok(())
}
