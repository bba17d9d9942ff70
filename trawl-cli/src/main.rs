use clap::Parser;

use trawl_core::error::{FetchError, TrawlError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "trawl",
    version,
    about = "Archive agile tracker projects into a local SQLite database"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into an exit code.
///
/// Exit codes:
///   0  — success
///   1  — general/unknown error
///   2  — configuration error
///   3  — credential rejected by the tracker
///   4  — database error
///   10 — partial success (some entities skipped or failed)
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(trawl) = err.downcast_ref::<TrawlError>() {
        return match trawl {
            TrawlError::Config(_) => 2,
            TrawlError::Fetch(FetchError::Auth { .. }) => 3,
            TrawlError::Store(_) => 4,
            _ => 1,
        };
    }

    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();

    if lower.contains("config") {
        2
    } else if lower.contains("authentication")
        || lower.contains("unauthorized")
        || lower.contains("credential")
    {
        3
    } else if lower.contains("database") || lower.contains("sqlite") {
        4
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    // Run the selected command
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(commands::run(cli.command)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
