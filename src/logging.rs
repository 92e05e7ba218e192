/// Logging setup: stdout plus optional daily-rotated text and JSON files.
///
/// `RUST_LOG` controls filtering and defaults to `info`, e.g.
/// `RUST_LOG=forum_mirror=debug,reqwest=warn`.
use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracing subscriber already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Flush guards for the background file writers. Keep alive until exit.
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// With `files` set, `app.log` (compact text) and `app.json.log` (one JSON object
/// per line, with span context) are written under `log_dir`, rotated daily.
pub fn init_logging(log_dir: &Path, files: bool) -> Result<LogGuards, LoggingError> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut guards = Vec::new();

    let (text_layer, json_layer) = if files {
        std::fs::create_dir_all(log_dir)?;

        let (text_writer, text_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "app.log"));
        let (json_writer, json_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "app.json.log"));
        guards.push(text_guard);
        guards.push(json_guard);

        let text_layer = fmt::layer()
            .with_writer(text_writer)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_ansi(false)
            .compact()
            .with_filter(env_filter());

        let json_layer = fmt::layer()
            .json()
            .with_writer(json_writer)
            .with_target(true)
            .with_thread_names(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter());

        (Some(text_layer), Some(json_layer))
    } else {
        (None, None)
    };

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()?;

    if files {
        tracing::debug!("Writing logs to {}", log_dir.display());
    }

    Ok(LogGuards { _guards: guards })
}
