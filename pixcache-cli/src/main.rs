use std::process::ExitCode;

use clap::Parser;
use error::AppError;
use indicatif::MultiProgress;
use pixcache_engine::ImageFetcher;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod config;
mod error;
mod processor;
mod utils;

use cli::CliArgs;
use processor::FetchPlan;
use utils::format_bytes;
use utils::progress::ProgressManager;

fn main() -> ExitCode {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("pixcache {} - fetch-through image cache", env!("CARGO_PKG_VERSION"));

    let engine_config = config::engine_config(&args)?;
    let crop = args.crop.as_deref().map(config::parse_crop).transpose()?;

    let fetcher = ImageFetcher::open(engine_config).await?;
    let store = fetcher.store();

    if args.clear {
        store.clear().wait().await?;
        info!("Cache cleared");
    }

    if args.sweep {
        let (report, pending) = store.sweep();
        pending.wait().await?;
        info!(
            expired = report.expired.len(),
            evicted = report.evicted.len(),
            reclaimed = %format_bytes(report.reclaimed_bytes),
            "Sweep finished"
        );
    }

    let multi = MultiProgress::new();
    let progress_manager = if args.show_progress {
        ProgressManager::new(multi.clone())
    } else {
        ProgressManager::new_disabled(multi.clone())
    };

    let plan = FetchPlan {
        priority: args.priority,
        crop,
        output_dir: args.output_dir.as_deref(),
    };
    let summary = processor::process_inputs(&fetcher, &args.input, &plan, &progress_manager).await?;

    // let the last disk writes land before the runtime shuts down
    store.flush().await;

    info!(
        hits = summary.hits,
        misses = summary.misses,
        failed = summary.failed,
        entries = store.entry_count(),
        size = %format_bytes(store.size()),
        "Done"
    );

    if summary.failed > 0 {
        return Err(AppError::Incomplete {
            failed: summary.failed,
            total: summary.total(),
        });
    }
    Ok(())
}
