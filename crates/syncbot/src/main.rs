use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use syncbot::console::ConsoleClient;
use syncbot_core::{ClientFactory, ProtocolClient};
use syncbot_runtime::{LogLevel, SyncbotRuntime};

#[derive(Parser)]
#[command(name = "syncbot")]
#[command(about = "Keeps conversations in sync across chat platforms")]
#[command(version)]
struct Cli {
    /// Settings file (syncbot.toml / syncbot.yaml); searched for when omitted
    #[arg(short, long, env = "SYNCBOT_SETTINGS")]
    settings: Option<PathBuf>,

    /// Bot configuration store, overrides `paths.config`
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bot memory store, overrides `paths.memory`
    #[arg(long)]
    memory: Option<PathBuf>,

    /// Log file, overrides the `[logging]` output
    #[arg(long)]
    log: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, value_parser = parse_level)]
    log_level: Option<LogLevel>,

    /// Name of the console operator
    #[arg(long, default_value = "Operator")]
    operator: String,
}

fn parse_level(s: &str) -> Result<LogLevel, String> {
    s.parse()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let operator = cli.operator.clone();
    let factory: ClientFactory =
        Arc::new(move || Arc::new(ConsoleClient::new(operator.clone())) as Arc<dyn ProtocolClient>);

    let mut builder = SyncbotRuntime::builder(factory);
    if let Some(path) = &cli.settings {
        builder = builder.config_file(path);
    }
    if let Some(path) = cli.config {
        builder = builder.bot_config(path);
    }
    if let Some(path) = cli.memory {
        builder = builder.bot_memory(path);
    }
    if let Some(level) = cli.log_level {
        builder = builder.log_level(level);
    }
    if let Some(path) = cli.log {
        builder = builder.log_file(path);
    }
    let runtime = builder.build().context("Failed to load settings")?;

    // All bot state is mutated from this one thread.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?
        .block_on(runtime.run())
        .context("Bot runtime failed")?;
    Ok(())
}
