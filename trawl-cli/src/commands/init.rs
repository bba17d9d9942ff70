use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use trawl_core::config::TrawlConfig;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Where to write the config file
    #[arg(default_value = "trawl.toml")]
    pub path: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

#[allow(clippy::unused_async)]
pub async fn run(args: InitArgs) -> anyhow::Result<i32> {
    if args.path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists. Pass --force to overwrite it.",
            args.path.display()
        );
    }

    let defaults = toml::to_string_pretty(&TrawlConfig::default())
        .context("Cannot serialize default config")?;
    let text = format!(
        "# Trawl configuration. The API token is read from the environment\n\
         # variable named by [source].token_env; an empty [run].projects list\n\
         # means every project the token can see.\n\n{defaults}"
    );
    std::fs::write(&args.path, text)
        .with_context(|| format!("Cannot write config: {}", args.path.display()))?;

    println!("Wrote {}", args.path.display());
    println!();
    println!("Next steps:");
    println!("  1. export TRACKER_API_TOKEN=<your token>");
    println!("  2. trawl run");
    Ok(0)
}
