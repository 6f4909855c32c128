//! resource-index: batch entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Open the store under the work directory
//!   6. Run the pipeline orchestrator to completion

use std::sync::Arc;

use tracing::info;

use resource_index::config;
use resource_index::error::AppError;
use resource_index::logger;
use resource_index::pipeline::PipelineOrchestrator;
use resource_index::store::Store;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present: ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();
    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some())?;

    info!(
        work_dir = %config.work_dir.display(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        resources = ?config.pipeline.resources,
        "config loaded"
    );

    let store = Arc::new(Store::open_with(&config.work_dir, config.store_retry)?);
    info!(db = %store.db_path().display(), "store ready");

    let report = PipelineOrchestrator::new(config, store).run().await?;
    info!(
        ontologies_loaded = report.ingested.len(),
        versions_removed = report.lifecycle.removed.len(),
        resources = report.resources.len(),
        failed = ?report.failed_resources,
        "done"
    );

    if report.failed_resources.is_empty() {
        Ok(())
    } else {
        Err(AppError::Resource(format!(
            "{} resource(s) failed: {}",
            report.failed_resources.len(),
            report.failed_resources.join(", ")
        )))
    }
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: resource-index [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    //   -v      → warn
    //   -vv     → info
    //   -vvv    → debug  (per-stage row counts, skipped lines)
    //   -vvvv+  → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, config_path }
}
