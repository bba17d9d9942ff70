use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Args;
use tracing::info;

use trawl_core::api::http::HttpTrackerClient;
use trawl_core::api::rate_limit::RateLimiter;
use trawl_core::error::TrawlError;
use trawl_core::progress::{IndicatifReporter, ProgressReporter};
use trawl_core::run::RunController;
use trawl_core::store::TrackerStore;
use trawl_core::store::sqlite::SqliteStore;
use trawl_core::types::{RunOutcome, RunSummary};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the config file (default: ./trawl.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Project ids to extract, overriding the config
    #[arg(short, long, value_delimiter = ',')]
    pub projects: Vec<i64>,

    /// Database path, overriding the config
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Attachment directory, overriding the config
    #[arg(long, value_name = "DIR")]
    pub attachments_dir: Option<PathBuf>,

    /// Purge the selected projects' rows before extracting
    #[arg(long)]
    pub clear: bool,

    /// Clear checkpoints first and walk every page again
    #[arg(long)]
    pub full: bool,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = super::load_config(args.config.as_deref())?;
    if !args.projects.is_empty() {
        config.run.projects = args.projects.clone();
    }
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }
    if let Some(dir) = args.attachments_dir {
        config.storage.attachments_dir = dir;
    }

    let token = config.source.resolve_token().map_err(TrawlError::from)?;

    if let Some(parent) = config.storage.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }
    let store = SqliteStore::open(&config.storage.db_path).with_context(|| {
        format!("Cannot open database: {}", config.storage.db_path.display())
    })?;

    if args.clear {
        let targets = if config.run.projects.is_empty() {
            store.project_codes().await?
        } else {
            config.run.projects.clone()
        };
        let mut deleted = 0;
        for code in &targets {
            deleted += store.purge_project(*code).await?;
            store.clear_project_checkpoints(*code).await?;
        }
        info!(projects = targets.len(), rows = deleted, "Cleared stored rows before extraction");
    }

    if args.full {
        info!("Full mode: clearing all checkpoints");
        store
            .clear_checkpoints()
            .await
            .context("Failed to clear checkpoints")?;
    }

    let limiter = Arc::new(RateLimiter::from_config(&config.source.rate_limit));
    let api = Arc::new(HttpTrackerClient::new(&config.source, token, limiter));

    let progress: Arc<dyn ProgressReporter> = if args.no_progress {
        Arc::new(IndicatifReporter::hidden())
    } else {
        Arc::new(IndicatifReporter::new())
    };

    // First Ctrl-C finishes the current page, commits, and keeps the
    // checkpoints so the next run resumes.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Stopping after the current page...");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let controller = RunController::new(Arc::new(store), api, config, progress, stop);
    let summary = controller.run().await?;

    print_summary(&summary);

    Ok(match summary.outcome() {
        RunOutcome::Success => 0,
        RunOutcome::Partial => 10,
    })
}

fn print_summary(summary: &RunSummary) {
    let totals = summary.totals();

    println!("Extraction finished in {:.2?}", summary.duration);
    println!();
    println!("  Projects:    {}", summary.reports.len());
    println!("  Workspaces:  {}", summary.workspaces);
    println!("  Members:     {}", totals.members);
    println!("  Labels:      {}", totals.labels);
    println!("  Iterations:  {}", totals.iterations);
    println!("  Epics:       {}", totals.epics);
    println!("  Stories:     {}", totals.stories);
    println!("  Tasks:       {}", totals.tasks);
    println!("  Blockers:    {}", totals.blockers);
    println!("  Comments:    {}", totals.comments);
    println!(
        "  Attachments: {} downloaded, {} already present, {} failed",
        totals.attachments_downloaded, totals.attachments_skipped, totals.attachments_failed
    );
    if totals.skipped > 0 {
        println!("  Skipped:     {} malformed entities", totals.skipped);
    }
    if totals.expired > 0 {
        println!("  Expired:     {} rows gone upstream", totals.expired);
    }

    if summary.interrupted {
        println!();
        println!("  Interrupted: checkpoints kept, rerun to resume");
    }

    let mut warnings = Vec::new();
    if summary.workspaces_failed {
        warnings.push("workspace listing failed".to_string());
    }
    for report in &summary.reports {
        for (stage, error) in &report.errors {
            warnings.push(format!("project {}: {stage}: {error}", report.project));
        }
    }
    if !warnings.is_empty() {
        println!();
        println!("  Warnings ({}):", warnings.len());
        for warning in &warnings {
            println!("    - {warning}");
        }
    }
}
