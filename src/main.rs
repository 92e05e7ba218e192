use std::path::Path;
use std::process::ExitCode;

use forum_mirror::cli::{Cli, Commands, CrawlArgs};
use forum_mirror::config::ConfigError;
use forum_mirror::json_utils::{JsonError, safe_serialize_pretty};
use forum_mirror::logging::{LoggingError, init_logging};
use forum_mirror::metrics::ProgressEvent;
use forum_mirror::orchestration::{
    ArchiveError, build_archiver, rebuild_mirror, setup_shutdown_handler, shutdown_channel,
};
use forum_mirror::rulesets::{BUILTIN_RULESETS, builtin_spec};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("JSON error: {0}")]
    Json(#[from] JsonError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),
}

impl MainError {
    /// 3 for configuration, state and output problems, 4 for failures while crawling.
    fn exit_code(&self) -> u8 {
        match self {
            MainError::Archive(ArchiveError::Transport(_)) => 4,
            _ => 3,
        }
    }
}

async fn run_crawl_command(args: CrawlArgs) -> Result<(), MainError> {
    let config = args.to_config()?;
    info!(
        "Archiving {} into {} ({} page workers, {} media workers, {}ms per-host delay)",
        config.base_url,
        config.output_dir.display(),
        config.concurrency,
        config.media_concurrency,
        config.rate_limit_per_host_ms
    );

    let (trigger, signal) = shutdown_channel();
    let archiver = build_archiver(config, signal).await?;
    let _signal_handler = setup_shutdown_handler(trigger);
    let progress = tokio::spawn(log_progress(archiver.subscribe_progress()));

    let summary = archiver.run().await?;
    // The archiver dropped its sender; the logger ends on its own.
    let _ = progress.await;

    info!("{}", summary);
    if let Some(index) = &summary.index_path {
        info!("Browse the mirror from {}", index.display());
    }
    if summary.has_errors() {
        warn!(
            "{} errors recorded; see run_summary.json for details",
            summary.errors_count
        );
    }
    if summary.cancelled {
        info!("Run the same command with --resume to continue");
    }
    Ok(())
}

async fn log_progress(mut rx: watch::Receiver<ProgressEvent>) {
    while rx.changed().await.is_ok() {
        let event = rx.borrow_and_update().clone();
        info!(
            "{} pages visited, {} pending, {} media, {} errors{}",
            event.pages_visited,
            event.pages_pending,
            event.media_downloaded,
            event.errors_count,
            event
                .current_url
                .map(|url| format!(" ({})", url))
                .unwrap_or_default()
        );
    }
}

fn run_rebuild_command(
    output_dir: &Path,
    base_url: Option<&str>,
    ruleset: &str,
    embed_media: bool,
) -> Result<(), MainError> {
    let report = rebuild_mirror(output_dir, base_url, ruleset, embed_media)?;
    for (path, reason) in &report.failures {
        warn!("Skipped {}: {}", path.display(), reason);
    }
    info!(
        "Rebuilt {} threads in {} ({} skipped)",
        report.threads.len(),
        output_dir.display(),
        report.failures.len()
    );
    Ok(())
}

fn run_ruleset_command(name: &str) -> Result<(), MainError> {
    let spec = builtin_spec(name).ok_or_else(|| ConfigError::UnknownRuleset(name.to_string()))?;
    println!("{}", safe_serialize_pretty(&spec)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let _log_guards = match init_logging(&cli.log_dir, !cli.quiet_files) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(3);
        }
    };

    let result = match cli.command {
        Commands::Crawl(args) => run_crawl_command(args).await,
        Commands::Rebuild {
            output_dir,
            base_url,
            ruleset,
            embed_media,
        } => run_rebuild_command(&output_dir, base_url.as_deref(), &ruleset, embed_media),
        Commands::Ruleset { name } => {
            if builtin_spec(&name).is_none() {
                warn!("Built-in rulesets: {}", BUILTIN_RULESETS.join(", "));
            }
            run_ruleset_command(&name)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
