use anyhow::{anyhow, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use ghostwire::AutomationError;

/// Desktop automation agent speaking newline-delimited JSON over stdio.
#[derive(Debug, Parser)]
#[command(name = "ghostwire-agent", version)]
pub struct Args {
    /// JSON configuration file (defaults to $GHOSTWIRE_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset: error, warn, info or debug
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Logs go to stderr; stdout carries responses only.
pub fn init_logging(level: Option<&str>) -> Result<()> {
    let log_level = level
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::default().add_directive(log_level.into()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}

/// Decode request arguments. Absent arguments read as an empty object.
pub fn parse_args<T: DeserializeOwned>(op: &str, args: Value) -> Result<T, AutomationError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| AutomationError::InvalidArgument(format!("bad arguments for '{op}': {e}")))
}
