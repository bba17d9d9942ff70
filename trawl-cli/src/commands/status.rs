use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use trawl_core::run::stories_checkpoint;
use trawl_core::store::TrackerStore;
use trawl_core::store::sqlite::SqliteStore;
use trawl_core::types::StoreStats;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Path to the config file (default: ./trawl.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatusArgs) -> anyhow::Result<i32> {
    let config = super::load_config(args.config.as_deref())?;

    let db_path = &config.storage.db_path;
    if !db_path.exists() {
        anyhow::bail!(
            "Database not found: {}. Run `trawl run` first.",
            db_path.display()
        );
    }

    let store = SqliteStore::open(db_path)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;
    let stats = store.stats().await.context("Failed to read store stats")?;

    // A story checkpoint exists only for projects mid-extraction.
    let mut checkpoints = Vec::new();
    for code in store.project_codes().await? {
        if let Some(offset) = store.get_checkpoint(&stories_checkpoint(code)).await? {
            checkpoints.push((code, offset));
        }
    }

    if args.json {
        print_json(&stats, &checkpoints)?;
        return Ok(0);
    }

    println!("Trawl status");
    println!();
    println!("  Database: {}", db_path.display());
    if stats.db_size_bytes > 0 {
        println!("  Size:     {}", format_bytes(stats.db_size_bytes));
    }
    println!();

    let live: u64 = stats.rows_by_table.iter().map(|(_, count)| *count).sum();
    println!("  Rows: {live} live, {} expired", stats.expired_rows);
    for (table, count) in &stats.rows_by_table {
        if *count > 0 {
            println!("    {table:<28} {count:>8}");
        }
    }
    println!();

    println!("  Story checkpoints:");
    if checkpoints.is_empty() {
        println!("    (none)");
    } else {
        for (code, offset) in &checkpoints {
            println!("    project {code}: offset {offset}");
        }
    }

    Ok(0)
}

fn print_json(stats: &StoreStats, checkpoints: &[(i64, String)]) -> anyhow::Result<()> {
    let rows: serde_json::Map<String, serde_json::Value> = stats
        .rows_by_table
        .iter()
        .map(|(table, count)| (table.clone(), serde_json::Value::from(*count)))
        .collect();
    let pending: Vec<serde_json::Value> = checkpoints
        .iter()
        .map(|(code, offset)| serde_json::json!({ "project": code, "stories_offset": offset }))
        .collect();
    let doc = serde_json::json!({
        "rows": rows,
        "expired_rows": stats.expired_rows,
        "db_size_bytes": stats.db_size_bytes,
        "story_checkpoints": pending,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
