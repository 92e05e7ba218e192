//! The crawl loop: frontier entries in, thread exports out.

use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::canonical::Canonicalizer;
use crate::config::{ArchiveConfig, Limits};
use crate::extractor::{ExtractError, PageExtractor};
use crate::fetcher::{FetchError, Fetcher};
use crate::frontier::{Frontier, OfferOutcome};
use crate::media::{MediaError, MediaMirror, truncate_for_log};
use crate::metrics::{ProgressEmitter, ProgressEvent, SharedMetrics};
use crate::models::{FrontierEntry, MediaRef, ThreadPage, ThreadRecord};
use crate::state::CrawlState;
use crate::writer::{INDEX_FILE, IndexEntry, PersistenceError};
use crate::writer_thread::WriterThread;

use super::assembler::ThreadAssembler;
use super::shutdown::ShutdownSignal;
use super::summary::{ArchiveError, RunSummary};

/// Everything a page task needs. Cloned into each task.
#[derive(Clone)]
pub(crate) struct PageWorker {
    pub(crate) fetcher: Arc<Fetcher>,
    pub(crate) extractor: Arc<PageExtractor>,
    pub(crate) canonicalizer: Arc<Canonicalizer>,
    pub(crate) frontier: Arc<Frontier>,
    /// `None` when media mirroring is disabled.
    pub(crate) media: Option<Arc<MediaMirror>>,
    pub(crate) metrics: SharedMetrics,
}

enum PageFailure {
    Fetch(FetchError),
    Extract(ExtractError),
}

/// Result from handling one frontier entry.
struct PageOutcome {
    entry: FrontierEntry,
    result: Result<Option<ThreadPage>, PageFailure>,
}

enum Finalized {
    Written {
        thread_id: String,
        partial: bool,
        result: Result<IndexEntry, PersistenceError>,
        media_failures: Vec<(String, MediaError)>,
    },
    /// Media resolution was cancelled; the record goes into the checkpoint.
    Deferred(ThreadRecord),
}

impl PageWorker {
    /// Fetch, extract, feed links back into the frontier and start media downloads.
    async fn process(self, entry: FrontierEntry) -> PageOutcome {
        let started = Instant::now();
        let document = match self.fetcher.fetch_document(&entry.url).await {
            Ok(document) => document,
            Err(e) => {
                return PageOutcome {
                    entry,
                    result: Err(PageFailure::Fetch(e)),
                };
            }
        };
        self.metrics.record_fetch(entry.url.as_str(), started.elapsed());

        let extracted = match self.extractor.extract(&document) {
            Ok(extracted) => extracted,
            Err(e) => {
                return PageOutcome {
                    entry,
                    result: Err(PageFailure::Extract(e)),
                };
            }
        };

        let mut accepted = 0u64;
        let mut rejected = 0u64;
        for raw in &extracted.candidate_links {
            match self.canonicalizer.canonicalize(raw, Some(&document.final_url)) {
                Ok(url) => {
                    if self.frontier.offer_child(url, &entry) == OfferOutcome::Accepted {
                        accepted += 1;
                    }
                }
                Err(rejection) => {
                    rejected += 1;
                    trace!("Dropped link {} on {}: {}", raw, entry.url, rejection);
                }
            }
        }
        self.metrics.links_discovered.add(accepted);
        self.metrics.links_rejected.add(rejected);

        if let Some(media) = &self.media {
            media.prefetch(extracted.media_refs.iter());
        }

        debug!(
            "{} (depth {}): {} new links, {} posts",
            entry.url,
            entry.depth,
            accepted,
            extracted.thread_page.as_ref().map_or(0, |page| page.posts.len())
        );
        PageOutcome {
            entry,
            result: Ok(extracted.thread_page),
        }
    }
}

/// Resolve a finished thread's media, then hand it to the writer thread.
async fn finalize_thread(
    record: ThreadRecord,
    media: Option<Arc<MediaMirror>>,
    writer: Arc<WriterThread>,
) -> Finalized {
    let mut assets = Vec::new();
    let mut media_failures = Vec::new();

    if let Some(media) = media {
        let mut seen = HashSet::new();
        let refs: Vec<MediaRef> = record
            .media_refs()
            .filter(|media_ref| seen.insert(media_ref.remote_url.clone()))
            .cloned()
            .collect();
        for media_ref in refs {
            match media.mirror(&media_ref).await {
                Ok(asset) => assets.push((media_ref.remote_url, asset)),
                Err(e) if e.is_cancelled() => return Finalized::Deferred(record),
                Err(e) => media_failures.push((media_ref.remote_url, e)),
            }
        }
    }

    let thread_id = record.thread_id.clone();
    let partial = record.partial;
    let result = writer.write_thread(record, assets).await;
    Finalized::Written {
        thread_id,
        partial,
        result,
        media_failures,
    }
}

/// Page dispatch pauses while this many finished threads wait on media or the writer.
fn finalizer_backlog(concurrency: usize) -> usize {
    concurrency.max(1) * Limits::FINALIZER_BACKLOG_PER_WORKER
}

/// Whether another frontier entry may start. Completing pages can still add
/// finalizers past the backlog, at most one per page already in flight.
fn may_dispatch(pages: usize, finalizers: usize, concurrency: usize) -> bool {
    pages < concurrency.max(1) && finalizers < finalizer_backlog(concurrency)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub struct Archiver {
    pub(super) config: ArchiveConfig,
    pub(super) base: Url,
    pub(super) worker: PageWorker,
    pub(super) writer: Arc<WriterThread>,
    pub(super) assembler: ThreadAssembler,
    pub(super) written: BTreeMap<String, IndexEntry>,
    /// Records handed to a finalizer and not yet written.
    pub(super) finalizing: BTreeMap<String, ThreadRecord>,
    pub(super) peak_finalizing: usize,
    pub(super) deferred: Vec<ThreadRecord>,
    pub(super) reported_media: HashSet<String>,
    pub(super) progress: Arc<ProgressEmitter>,
    pub(super) shutdown: ShutdownSignal,
    pub(super) resumed: bool,
}

impl Archiver {
    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.worker.frontier
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.worker.metrics
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Crawl until the frontier drains or cancellation is requested.
    #[tracing::instrument(skip(self), fields(base = %self.base))]
    pub async fn run(mut self) -> Result<RunSummary, ArchiveError> {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            "Archiving {} into {} ({} page workers, ruleset {})",
            self.base,
            self.config.output_dir.display(),
            self.config.concurrency,
            self.worker.extractor.ruleset().name()
        );

        let shutdown = self.shutdown.clone();
        let mut pages: JoinSet<PageOutcome> = JoinSet::new();
        let mut finalizers: JoinSet<Finalized> = JoinSet::new();
        let mut checkpoints = self.config.checkpoint_interval().map(|period| {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        for record in std::mem::take(&mut self.deferred) {
            self.spawn_finalizer(&mut finalizers, record);
        }

        let concurrency = self.config.concurrency;
        loop {
            if shutdown.is_triggered() {
                info!("Cancellation requested, draining in-flight pages");
                self.worker.frontier.close();
                break;
            }

            // Phase 1: fill worker pool, unless finished threads are piling up
            while may_dispatch(pages.len(), finalizers.len(), concurrency) {
                let Some(entry) = self.worker.frontier.take_next() else {
                    break;
                };
                pages.spawn(self.worker.clone().process(entry));
            }

            // Phase 2: check for completion
            if pages.is_empty() && self.worker.frontier.is_empty() {
                info!("Crawl complete: frontier empty and no pages in flight");
                break;
            }

            // Phase 3: collect completed tasks
            tokio::select! {
                Some(joined) = pages.join_next() => match joined {
                    Ok(outcome) => self.handle_page(outcome, &mut finalizers),
                    Err(e) => error!("Page task failed: {}", e),
                },
                Some(joined) = finalizers.join_next(), if !finalizers.is_empty() => {
                    self.handle_finalized(joined)?;
                }
                _ = next_tick(&mut checkpoints) => {
                    self.checkpoint().await;
                }
                _ = shutdown.triggered() => {}
            }
        }

        // Fetches abort promptly once cancelled, so this does not wait on the network.
        while let Some(joined) = pages.join_next().await {
            match joined {
                Ok(outcome) => self.handle_page(outcome, &mut finalizers),
                Err(e) => error!("Page task failed: {}", e),
            }
        }

        if !shutdown.is_triggered() {
            let incomplete = self.assembler.drain_all();
            if !incomplete.is_empty() {
                info!("Writing {} incomplete threads as partial", incomplete.len());
            }
            let mut incomplete = VecDeque::from(incomplete);
            loop {
                while finalizers.len() < finalizer_backlog(concurrency)
                    && let Some(record) = incomplete.pop_front()
                {
                    self.spawn_finalizer(&mut finalizers, record);
                }
                match finalizers.join_next().await {
                    Some(joined) => self.handle_finalized(joined)?,
                    None => break,
                }
            }
        }
        while let Some(joined) = finalizers.join_next().await {
            self.handle_finalized(joined)?;
        }

        if let Some(media) = &self.worker.media {
            media.drain().await;
            if let Err(e) = media.save_index() {
                warn!("Could not save media index: {}", e);
                self.record_error("media_index", &media.index_path().display().to_string(), e);
            }
        }

        let cancelled = shutdown.is_triggered() || !self.deferred.is_empty();
        let mut index_path = None;
        let mut checkpoint_path = None;

        if cancelled {
            checkpoint_path = self.checkpoint().await;
            let entries: Vec<IndexEntry> = self.written.values().cloned().collect();
            match self.writer.write_index(entries).await {
                Ok(path) => index_path = Some(path),
                Err(PersistenceError::WriterClosed) => return Err(PersistenceError::WriterClosed.into()),
                Err(e) => {
                    error!("Could not write index: {}", e);
                    self.record_error(e.kind(), INDEX_FILE, e);
                }
            }
        } else {
            index_path = self.relink().await?;
            if let Err(e) = CrawlState::clear(&self.config.output_dir) {
                self.record_error("checkpoint", "crawl_state.json", e);
            }
        }

        let summary = self.summary(started_at, started, cancelled, index_path, checkpoint_path);
        self.progress.emit_now(self.progress_event());

        let out_dir = self.config.output_dir.clone();
        if let Ok(writer) = Arc::try_unwrap(self.writer) {
            let _ = tokio::task::spawn_blocking(move || writer.shutdown()).await;
        }

        match summary.write(&out_dir) {
            Ok(path) => debug!("Run summary written to {}", path.display()),
            Err(e) => warn!("Could not write run summary: {}", e),
        }
        info!("Archive finished: {}", summary);
        Ok(summary)
    }

    /// Re-render every thread from its export so links to threads archived later resolve.
    async fn relink(&mut self) -> Result<Option<PathBuf>, ArchiveError> {
        match self.writer.rebuild().await {
            Ok(report) => {
                for (path, message) in report.failures {
                    self.record_error("rebuild", &path.display().to_string(), message);
                }
                Ok(Some(self.config.output_dir.join(INDEX_FILE)))
            }
            Err(PersistenceError::WriterClosed) => Err(PersistenceError::WriterClosed.into()),
            Err(e) => {
                error!("Relink pass failed: {}", e);
                self.record_error(e.kind(), INDEX_FILE, e);
                Ok(None)
            }
        }
    }

    fn handle_page(&mut self, outcome: PageOutcome, finalizers: &mut JoinSet<Finalized>) {
        let PageOutcome { entry, result } = outcome;

        match result {
            Ok(Some(page)) => {
                self.worker.frontier.complete(&entry.url);
                if let Some(record) = self.assembler.add_page(entry.url, page) {
                    self.spawn_finalizer(finalizers, record);
                }
            }
            Ok(None) => self.worker.frontier.complete(&entry.url),
            // Left in flight so the checkpoint requeues it.
            Err(PageFailure::Fetch(e)) if e.is_cancelled() => {
                debug!("Cancelled {}", entry.url);
            }
            Err(failure) => {
                self.worker.frontier.complete(&entry.url);
                self.worker.metrics.pages_failed.inc();
                let (kind, message) = match failure {
                    PageFailure::Fetch(e) => (e.kind(), e.to_string()),
                    PageFailure::Extract(e) => {
                        self.worker.metrics.pages_unrecognized.inc();
                        ("extract", e.to_string())
                    }
                };
                warn!("Page failed: {}", message);
                self.worker.metrics.errors.record(kind, entry.url.as_str(), message);

                let ruleset = self.worker.extractor.ruleset();
                let thread_page = ruleset.thread_id(entry.url.as_str()).map(|thread_id| {
                    let page = ruleset.page_number(entry.url.as_str()).unwrap_or(1);
                    (thread_id, page)
                });
                if let Some((thread_id, page)) = thread_page
                    && let Some(record) = self.assembler.page_failed(&thread_id, page, entry.url)
                {
                    self.spawn_finalizer(finalizers, record);
                }
            }
        }

        self.progress.emit(|| self.progress_event());
    }

    fn spawn_finalizer(&mut self, finalizers: &mut JoinSet<Finalized>, record: ThreadRecord) {
        debug!(
            "Thread {} assembled: {} posts over {} pages",
            record.thread_id,
            record.posts.len(),
            record.page_count
        );
        self.finalizing.insert(record.thread_id.clone(), record.clone());
        finalizers.spawn(finalize_thread(
            record,
            self.worker.media.clone(),
            Arc::clone(&self.writer),
        ));
        self.peak_finalizing = self.peak_finalizing.max(finalizers.len());
    }

    fn handle_finalized(&mut self, joined: Result<Finalized, JoinError>) -> Result<(), ArchiveError> {
        let finalized = match joined {
            Ok(finalized) => finalized,
            Err(e) => {
                error!("Finalizer task failed: {}", e);
                return Ok(());
            }
        };

        match finalized {
            Finalized::Deferred(record) => {
                info!("Thread {} deferred until resume", record.thread_id);
                self.finalizing.remove(&record.thread_id);
                self.deferred.push(record);
            }
            Finalized::Written {
                thread_id,
                partial,
                result,
                media_failures,
            } => {
                self.finalizing.remove(&thread_id);
                for (url, e) in media_failures {
                    if self.reported_media.insert(url.clone()) {
                        self.worker
                            .metrics
                            .errors
                            .record(e.kind(), &truncate_for_log(&url), e.to_string());
                    }
                }

                match result {
                    Ok(entry) => {
                        self.worker.metrics.threads_written.inc();
                        if partial {
                            self.worker.metrics.threads_partial.inc();
                        }
                        info!(
                            "Archived thread {} \"{}\" ({} posts{})",
                            thread_id,
                            entry.title,
                            entry.post_count,
                            if partial { ", partial" } else { "" }
                        );
                        self.written.insert(thread_id, entry);
                    }
                    Err(PersistenceError::WriterClosed) => {
                        return Err(PersistenceError::WriterClosed.into());
                    }
                    Err(e) => {
                        error!("Could not write thread {}: {}", thread_id, e);
                        self.worker.metrics.errors.record(e.kind(), &thread_id, e.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    /// Save the crawl state through the writer thread. Failures are recorded, not fatal.
    async fn checkpoint(&self) -> Option<PathBuf> {
        let mut state = CrawlState::new(self.base.as_str());
        state.frontier = self.worker.frontier.snapshot();
        state.pending_threads = self.assembler.snapshot();
        state.written_threads = self.written.clone();
        state.deferred_threads = self
            .deferred
            .iter()
            .chain(self.finalizing.values())
            .cloned()
            .collect();
        state.counters = self.worker.metrics.snapshot();

        if let Some(media) = &self.worker.media
            && let Err(e) = media.save_index()
        {
            warn!("Could not save media index: {}", e);
        }

        match self.writer.checkpoint(state).await {
            Some(Ok(path)) => Some(path),
            Some(Err(e)) => {
                error!("Checkpoint failed: {}", e);
                self.record_error("checkpoint", "crawl_state.json", e);
                None
            }
            None => {
                error!("Writer thread is gone, checkpoint not saved");
                None
            }
        }
    }

    fn record_error(&self, kind: &str, url: &str, error: impl std::fmt::Display) {
        self.worker.metrics.errors.record(kind, url, error.to_string());
    }

    fn progress_event(&self) -> ProgressEvent {
        let metrics = &self.worker.metrics;
        let stats = self.worker.frontier.stats();
        ProgressEvent {
            pages_visited: metrics.pages_fetched.get(),
            pages_pending: (stats.pending + stats.in_flight) as u64,
            media_downloaded: self
                .worker
                .media
                .as_ref()
                .map_or(0, |media| media.stats().downloaded as u64),
            errors_count: metrics.errors.total(),
            current_url: metrics.current_url(),
        }
    }

    fn summary(
        &self,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
        cancelled: bool,
        index_path: Option<PathBuf>,
        checkpoint_path: Option<PathBuf>,
    ) -> RunSummary {
        let metrics = &self.worker.metrics;
        let media = self
            .worker
            .media
            .as_ref()
            .map(|media| media.stats())
            .unwrap_or_default();
        let stats = self.worker.frontier.stats();

        RunSummary {
            base_url: self.base.to_string(),
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            duration_secs: started.elapsed().as_secs(),
            cancelled,
            resumed: self.resumed,
            pages_visited: metrics.pages_fetched.get(),
            pages_failed: metrics.pages_failed.get(),
            pages_unrecognized: metrics.pages_unrecognized.get(),
            links_discovered: metrics.links_discovered.get(),
            links_rejected: metrics.links_rejected.get(),
            mean_fetch_ms: metrics.mean_fetch_ms(),
            recent_fetch_ms: metrics.fetch_ewma_ms().round() as u64,
            pages_pending: stats.pending + stats.in_flight,
            peak_finalizers: self.peak_finalizing,
            threads_written: metrics.threads_written.get(),
            threads_partial: metrics.threads_partial.get(),
            media_downloaded: media.downloaded,
            media_reused: media.reused,
            media_failed: media.failed,
            media_bytes: media.bytes,
            errors_count: metrics.errors.total(),
            errors_by_kind: metrics.errors.by_kind(),
            errors: metrics.errors.records(),
            index_path,
            checkpoint_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_pauses_on_finalizer_backlog() {
        assert!(may_dispatch(0, 0, 4));
        assert!(may_dispatch(3, 7, 4));
        assert!(!may_dispatch(4, 0, 4));
        assert!(!may_dispatch(0, 8, 4));
        assert!(!may_dispatch(0, 9, 4));
    }

    #[test]
    fn test_zero_concurrency_still_dispatches_one() {
        assert_eq!(finalizer_backlog(0), Limits::FINALIZER_BACKLOG_PER_WORKER);
        assert!(may_dispatch(0, 0, 0));
        assert!(!may_dispatch(1, 0, 0));
    }
}
