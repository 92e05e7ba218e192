//! Wires a configuration into a ready-to-run archiver.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::backoff::ExponentialBackoff;
use crate::canonical::Canonicalizer;
use crate::config::{ArchiveConfig, ConfigError};
use crate::extractor::PageExtractor;
use crate::fetcher::{Fetcher, FetcherConfig};
use crate::frontier::Frontier;
use crate::media::MediaMirror;
use crate::metrics::{Metrics, ProgressEmitter};
use crate::network::{HttpClient, Transport};
use crate::rulesets::{Ruleset, load_ruleset};
use crate::state::CrawlState;
use crate::writer::{MirrorWriter, RebuildReport};
use crate::writer_thread::WriterThread;

use super::archiver::{Archiver, PageWorker};
use super::assembler::ThreadAssembler;
use super::shutdown::ShutdownSignal;
use super::summary::ArchiveError;

/// Build an archiver that talks HTTP with the configured user agent and session.
pub async fn build_archiver(
    config: ArchiveConfig,
    shutdown: ShutdownSignal,
) -> Result<Archiver, ArchiveError> {
    let http = HttpClient::new(&config.user_agent, config.request_timeout(), &config.session)?;
    build_archiver_with_transport(config, Arc::new(http), shutdown).await
}

/// Builds the complete archiver with all components wired up.
#[tracing::instrument(skip(config, transport, shutdown), fields(base_url = %config.base_url))]
pub async fn build_archiver_with_transport(
    config: ArchiveConfig,
    transport: Arc<dyn Transport>,
    shutdown: ShutdownSignal,
) -> Result<Archiver, ArchiveError> {
    let base = config.validate()?;
    config.ensure_output_dir()?;

    let ruleset = load_ruleset(&config.ruleset)?;
    let canonicalizer = build_canonicalizer(&config, &base, ruleset.as_ref())?;
    let seed = canonicalizer.canonicalize_absolute(base.as_str())?;

    let metrics = Arc::new(Metrics::new());
    let checkpoint = if config.resume {
        CrawlState::load(&config.output_dir, base.as_str())?
    } else {
        if CrawlState::path(&config.output_dir).exists() {
            info!("Ignoring the existing checkpoint; pass --resume to continue it");
        }
        None
    };
    let resumed = checkpoint.is_some();

    let (frontier, assembler, written, deferred) = match checkpoint {
        Some(state) => {
            metrics.restore(&state.counters);
            let finished: Vec<String> = state
                .written_threads
                .keys()
                .cloned()
                .chain(state.deferred_threads.iter().map(|r| r.thread_id.clone()))
                .collect();
            (
                Frontier::restore(config.max_depth, state.frontier),
                ThreadAssembler::restore(state.pending_threads, finished),
                state.written_threads,
                state.deferred_threads,
            )
        }
        None => {
            if config.resume {
                info!("No checkpoint in {}, starting fresh", config.output_dir.display());
            }
            (
                Frontier::new(config.max_depth),
                ThreadAssembler::new(),
                BTreeMap::new(),
                Vec::new(),
            )
        }
    };
    // A resumed frontier already knows the seed; the offer is then a no-op.
    frontier.offer(seed, 0, None);

    let fetcher = Arc::new(Fetcher::new(
        transport,
        FetcherConfig {
            max_in_flight: config.concurrency + config.media_concurrency,
            rate_limit_per_host: config.rate_limit(),
            max_attempts: config.max_attempts,
            backoff: ExponentialBackoff::new(config.backoff_base_ms, config.backoff_max_ms),
            max_page_bytes: config.max_page_bytes,
            max_media_bytes: config.max_media_bytes,
        },
        shutdown.clone(),
    ));

    let media = if config.download_media {
        let mirror = MediaMirror::new(
            Arc::clone(&fetcher),
            config.output_dir.clone(),
            config.media_concurrency,
            shutdown.clone(),
        );
        if let Err(e) = mirror.load_index() {
            warn!("Media index unreadable, assets will be fetched again: {}", e);
        }
        Some(Arc::new(mirror))
    } else {
        None
    };

    let writer = Arc::new(WriterThread::spawn(
        MirrorWriter::new(&config.output_dir)
            .with_canonicalizer(canonicalizer.clone())
            .with_embedded_media(config.embed_media),
    ));
    if !written.is_empty() {
        writer.register(written.values().cloned().collect()).await?;
    }

    info!(
        "Archiver ready: ruleset {}, max depth {}, {} threads already written",
        ruleset.name(),
        config.max_depth,
        written.len()
    );

    let progress = Arc::new(ProgressEmitter::new(config.progress_interval()));
    Ok(Archiver {
        worker: PageWorker {
            fetcher,
            extractor: Arc::new(PageExtractor::new(ruleset)),
            canonicalizer: Arc::new(canonicalizer),
            frontier: Arc::new(frontier),
            media,
            metrics,
        },
        config,
        base,
        writer,
        assembler,
        written,
        finalizing: BTreeMap::new(),
        peak_finalizing: 0,
        deferred,
        reported_media: Default::default(),
        progress,
        shutdown,
        resumed,
    })
}

/// Scope and query rules for a crawl. An empty allow-list means the ruleset's defaults.
pub fn build_canonicalizer(
    config: &ArchiveConfig,
    base: &Url,
    ruleset: &dyn Ruleset,
) -> Result<Canonicalizer, ConfigError> {
    let allowed: Vec<String> = if config.allowed_query_params.is_empty() {
        ruleset.default_query_params().to_vec()
    } else {
        config.allowed_query_params.iter().cloned().collect()
    };
    Canonicalizer::new(
        base,
        &config.scope_path,
        allowed,
        ruleset.excluded_url_patterns(),
    )
    .map_err(|e| ConfigError::Pattern(e.to_string()))
}

/// Re-render the HTML mirror and index from the JSON exports in `out_dir`.
/// With a base URL, links between threads are matched through the canonicalizer too.
#[tracing::instrument]
pub fn rebuild_mirror(
    out_dir: &Path,
    base_url: Option<&str>,
    ruleset: &str,
    embed_media: bool,
) -> Result<RebuildReport, ArchiveError> {
    if !out_dir.is_dir() {
        return Err(ConfigError::OutputDir {
            path: out_dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory"),
        }
        .into());
    }

    let mut writer = MirrorWriter::new(out_dir).with_embedded_media(embed_media);
    if let Some(base_url) = base_url {
        let config = ArchiveConfig {
            base_url: base_url.to_string(),
            ruleset: ruleset.to_string(),
            ..ArchiveConfig::default()
        };
        let base = config.validate()?;
        let ruleset = load_ruleset(ruleset)?;
        writer = writer.with_canonicalizer(build_canonicalizer(&config, &base, ruleset.as_ref())?);
    }
    Ok(writer.rebuild()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ArchiveConfig {
        ArchiveConfig {
            base_url: "https://forum.test/".to_string(),
            output_dir: dir.path().to_path_buf(),
            ..ArchiveConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_seeds_frontier() {
        let dir = TempDir::new().unwrap();
        let archiver = build_archiver_with_transport(
            config(&dir),
            Arc::new(MockTransport::new()),
            ShutdownSignal::never(),
        )
        .await
        .unwrap();

        assert_eq!(archiver.frontier().stats().pending, 1);
        assert_eq!(archiver.base_url().as_str(), "https://forum.test/");
    }

    #[tokio::test]
    async fn test_build_rejects_bad_config() {
        let dir = TempDir::new().unwrap();
        let mut bad = config(&dir);
        bad.concurrency = 0;
        let result =
            build_archiver_with_transport(bad, Arc::new(MockTransport::new()), ShutdownSignal::never())
                .await;
        assert!(matches!(result, Err(ArchiveError::Config(ConfigError::Zero(_)))));

        let mut unknown = config(&dir);
        unknown.ruleset = "no-such-theme".to_string();
        let result = build_archiver_with_transport(
            unknown,
            Arc::new(MockTransport::new()),
            ShutdownSignal::never(),
        )
        .await;
        assert!(matches!(result, Err(ArchiveError::Config(ConfigError::UnknownRuleset(_)))));
    }

    #[tokio::test]
    async fn test_resume_with_foreign_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        CrawlState::new("https://elsewhere.test/").save(dir.path()).unwrap();

        let mut resume = config(&dir);
        resume.resume = true;
        let result =
            build_archiver_with_transport(resume, Arc::new(MockTransport::new()), ShutdownSignal::never())
                .await;
        assert!(matches!(result, Err(ArchiveError::State(_))));
    }

    #[test]
    fn test_rebuild_missing_dir() {
        let dir = TempDir::new().unwrap();
        let result = rebuild_mirror(&dir.path().join("absent"), None, "xenforo", false);
        assert!(matches!(result, Err(ArchiveError::Config(ConfigError::OutputDir { .. }))));
    }

    #[test]
    fn test_canonicalizer_uses_ruleset_params_by_default() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.ruleset = "vbulletin".to_string();
        let base = config.validate().unwrap();
        let ruleset = load_ruleset("vbulletin").unwrap();
        let canonicalizer = build_canonicalizer(&config, &base, ruleset.as_ref()).unwrap();

        let url = canonicalizer
            .canonicalize_absolute("https://forum.test/showthread.php?t=5&utm_source=x")
            .unwrap();
        assert_eq!(url.as_str(), "https://forum.test/showthread.php?t=5");
    }
}
