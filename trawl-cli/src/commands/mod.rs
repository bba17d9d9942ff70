pub mod clear;
pub mod init;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::Context;
use clap::Subcommand;

use trawl_core::config::TrawlConfig;
use trawl_core::error::TrawlError;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a starter trawl.toml config file
    Init(init::InitArgs),
    /// Extract the configured projects into the local store
    Run(run::RunArgs),
    /// Show row counts, checkpoints, and database size
    Status(status::StatusArgs),
    /// Delete extracted data for one project, or everything
    Clear(clear::ClearArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<i32> {
    match cmd {
        Command::Init(args) => init::run(args).await,
        Command::Run(args) => run::run(args).await,
        Command::Status(args) => status::run(args).await,
        Command::Clear(args) => clear::run(args).await,
    }
}

/// Load the config: an explicit `--config` path must exist, the default
/// `trawl.toml` falls back to built-in defaults when absent.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TrawlConfig> {
    match path {
        Some(path) => TrawlConfig::load(path)
            .map_err(TrawlError::from)
            .with_context(|| format!("Cannot load config: {}", path.display())),
        None => TrawlConfig::load_or_default(Path::new("trawl.toml"))
            .map_err(TrawlError::from)
            .context("Cannot load config: trawl.toml"),
    }
}
