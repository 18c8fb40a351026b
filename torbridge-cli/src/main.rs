//! torbridge: drive an embedded tor daemon from the shell.
//!
//! # Usage
//!
//! ```text
//! torbridge check
//! torbridge request <url> [-X get|post|delete] [-d body] [-H "K: V"]... [--insecure] [--json]
//! torbridge stream <host:port> [--id ID] [--send MSG]... [--wait-secs N]
//! ```
//!
//! Every command starts `tor`, does its work, and stops it again before exiting.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, request::RequestArgs, stream::StreamArgs};
use torbridge_core::BridgeConfig;
use torbridge_daemon::{init_tracing, LogFormat};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "torbridge",
    version,
    about = "Proxied requests and raw TCP streams through an embedded tor daemon",
    long_about = None,
)]
struct Cli {
    /// Config file (default: ~/.torbridge/config.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the local SOCKS port.
    #[arg(long, global = true)]
    socks_port: Option<u16>,

    /// Override the tor executable.
    #[arg(long, global = true)]
    tor: Option<PathBuf>,

    /// Log output: pretty or json.
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start tor, report its port and status, then stop it.
    Check(CheckArgs),

    /// Issue one HTTP request through tor.
    Request(RequestArgs),

    /// Open a raw TCP stream through tor and print its events.
    Stream(StreamArgs),
}

impl Cli {
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => BridgeConfig::load().context("failed to load ~/.torbridge/config.yaml")?,
        };
        if let Some(port) = self.socks_port {
            config.socks_port = port;
        }
        if let Some(tor) = &self.tor {
            config.tor_binary = tor.clone();
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let config = cli.bridge_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Check(args) => args.run(config).await,
            Commands::Request(args) => args.run(config).await,
            Commands::Stream(args) => args.run(config).await,
        }
    })
}
