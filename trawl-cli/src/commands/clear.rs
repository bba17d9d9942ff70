use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use trawl_core::store::TrackerStore;
use trawl_core::store::sqlite::SqliteStore;

#[derive(Args, Debug)]
pub struct ClearArgs {
    /// Path to the config file (default: ./trawl.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Only delete data for this source project id
    #[arg(long)]
    pub project: Option<i64>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

pub async fn run(args: ClearArgs) -> anyhow::Result<i32> {
    let config = super::load_config(args.config.as_deref())?;

    let db_path = &config.storage.db_path;
    if !db_path.exists() {
        anyhow::bail!("Database not found: {}", db_path.display());
    }

    let prompt = match args.project {
        Some(code) => format!("Delete all extracted data for project {code}? [y/N] "),
        None => "Delete ALL extracted data? [y/N] ".to_string(),
    };
    if !args.yes && !confirm(&prompt)? {
        println!("Aborted.");
        return Ok(0);
    }

    let store = SqliteStore::open(db_path)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;

    match args.project {
        Some(code) => {
            let deleted = store.purge_project(code).await?;
            store.clear_project_checkpoints(code).await?;
            let dir = config.storage.attachments_dir.join(code.to_string());
            std::fs::remove_dir_all(&dir).ok();
            println!("Removed {deleted} rows for project {code}");
        }
        None => {
            let mut deleted = 0;
            for code in store.project_codes().await? {
                deleted += store.purge_project(code).await?;
            }
            store.clear_checkpoints().await?;
            std::fs::remove_dir_all(&config.storage.attachments_dir).ok();
            println!("Removed {deleted} rows across all projects");
        }
    }

    Ok(0)
}

/// Ask on stdin; anything but yes declines.
fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}
