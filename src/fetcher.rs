//! Paced, bounded, retrying retrieval on top of a [`Transport`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::debug;
use url::Url;

use crate::backoff::ExponentialBackoff;
use crate::models::CanonicalUrl;
use crate::network::{RawResponse, Transport, TransportError};
use crate::orchestration::shutdown::ShutdownSignal;
use crate::url_utils::{extract_host, is_html_content_type};

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("{url}: gave up after {attempts} attempts ({last})")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("{url}: expected an HTML document, got {content_type:?}")]
    NotHtml {
        url: String,
        content_type: Option<String>,
    },

    #[error("{url}: cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    /// 429, 5xx and transient transport failures are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { source, .. } => source.is_transient(),
            FetchError::RetriesExhausted { .. }
            | FetchError::NotHtml { .. }
            | FetchError::Cancelled { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled { .. })
    }

    /// Short label for run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http { .. } => "http_status",
            FetchError::Transport { .. } => "transport",
            FetchError::RetriesExhausted { .. } => "retries_exhausted",
            FetchError::NotHtml { .. } => "content_type",
            FetchError::Cancelled { .. } => "cancelled",
        }
    }
}

/// A fetched HTML page, ready for extraction.
#[derive(Debug, Clone)]
pub struct Document {
    pub url: CanonicalUrl,
    /// Location after redirects; relative links resolve against it.
    pub final_url: Url,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub max_in_flight: usize,
    pub rate_limit_per_host: Duration,
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    pub max_page_bytes: usize,
    pub max_media_bytes: usize,
}

/// Next permitted request time per host.
#[derive(Debug)]
struct HostRateLimiter {
    interval: Duration,
    next_slot: DashMap<String, Instant>,
}

impl HostRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: DashMap::new(),
        }
    }

    /// Reserve the earliest free slot for `host` and return its start time.
    fn reserve(&self, host: &str) -> Instant {
        let now = Instant::now();
        let mut slot = self.next_slot.entry(host.to_string()).or_insert(now);
        let start = (*slot).max(now);
        *slot = start + self.interval;
        start
    }
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    permits: Semaphore,
    limiter: HostRateLimiter,
    config: FetcherConfig,
    shutdown: ShutdownSignal,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, config: FetcherConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            transport,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            limiter: HostRateLimiter::new(config.rate_limit_per_host),
            config,
            shutdown,
        }
    }

    /// Retrieve an HTML page.
    pub async fn fetch_document(&self, url: &CanonicalUrl) -> Result<Document, FetchError> {
        let response = self.get_with_retry(url.as_str(), self.config.max_page_bytes).await?;

        if !Self::looks_like_html(&response) {
            return Err(FetchError::NotHtml {
                url: url.to_string(),
                content_type: response.content_type,
            });
        }

        let final_url = Url::parse(&response.final_url)
            .or_else(|_| Url::parse(url.as_str()))
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                source: TransportError::InvalidRequest(e.to_string()),
            })?;

        Ok(Document {
            url: url.clone(),
            final_url,
            html: String::from_utf8_lossy(&response.body).into_owned(),
        })
    }

    /// Retrieve a binary payload under the same pacing and retry policy.
    pub async fn fetch_bytes(&self, url: &str) -> Result<RawResponse, FetchError> {
        self.get_with_retry(url, self.config.max_media_bytes).await
    }

    /// A declared HTML type passes. With no declared type, sniff the body.
    fn looks_like_html(response: &RawResponse) -> bool {
        match &response.content_type {
            Some(content_type) => is_html_content_type(content_type),
            None => {
                let head = &response.body[..response.body.len().min(512)];
                let head = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
                head.starts_with("<!doctype html") || head.starts_with("<html")
            }
        }
    }

    async fn get_with_retry(&self, url: &str, max_bytes: usize) -> Result<RawResponse, FetchError> {
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };
        let host = extract_host(url).unwrap_or_default();
        let mut attempt = 0u32;

        loop {
            if self.shutdown.is_triggered() {
                return Err(cancelled());
            }

            let slot = self.limiter.reserve(&host);
            tokio::select! {
                _ = sleep_until(slot) => {}
                _ = self.shutdown.triggered() => return Err(cancelled()),
            }

            let result = {
                let _permit = tokio::select! {
                    permit = self.permits.acquire() => permit.map_err(|_| cancelled())?,
                    _ = self.shutdown.triggered() => return Err(cancelled()),
                };
                tokio::select! {
                    result = self.transport.get(url, max_bytes) => result,
                    _ = self.shutdown.triggered() => return Err(cancelled()),
                }
            };
            attempt += 1;

            let (error, retry_after) = match result {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) => (
                    FetchError::Http {
                        url: url.to_string(),
                        status: response.status,
                    },
                    response.retry_after,
                ),
                Err(source) => (
                    FetchError::Transport {
                        url: url.to_string(),
                        source,
                    },
                    None,
                ),
            };

            if !error.is_transient() {
                return Err(error);
            }
            if attempt >= self.config.max_attempts {
                return Err(FetchError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.config.backoff.delay_with_hint(attempt - 1, retry_after);
            debug!("Retrying {} in {:?} after: {}", url, delay, error);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.triggered() => return Err(cancelled()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::shutdown::shutdown_channel;
    use crate::testing::{MockTransport, MockReply};

    fn config() -> FetcherConfig {
        FetcherConfig {
            max_in_flight: 4,
            rate_limit_per_host: Duration::ZERO,
            max_attempts: 3,
            backoff: ExponentialBackoff::new(1, 5).with_jitter(0),
            max_page_bytes: 1024 * 1024,
            max_media_bytes: 1024 * 1024,
        }
    }

    fn canonical(url: &str) -> CanonicalUrl {
        CanonicalUrl::from_normalized(url.to_string())
    }

    #[tokio::test]
    async fn test_fetch_document_ok() {
        let transport = Arc::new(MockTransport::new());
        transport.html("https://forum.test/a", "<html><body>hi</body></html>");
        let fetcher = Fetcher::new(transport.clone(), config(), ShutdownSignal::never());

        let doc = fetcher.fetch_document(&canonical("https://forum.test/a")).await.unwrap();
        assert!(doc.html.contains("hi"));
        assert_eq!(doc.final_url.as_str(), "https://forum.test/a");
        assert_eq!(transport.hits("https://forum.test/a"), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let transport = Arc::new(MockTransport::new());
        transport.sequence(
            "https://forum.test/flaky",
            vec![
                MockReply::status(503),
                MockReply::error(TransportError::Timeout),
                MockReply::html("<html>ok</html>"),
            ],
        );
        let fetcher = Fetcher::new(transport.clone(), config(), ShutdownSignal::never());

        let doc = fetcher
            .fetch_document(&canonical("https://forum.test/flaky"))
            .await
            .unwrap();
        assert!(doc.html.contains("ok"));
        assert_eq!(transport.hits("https://forum.test/flaky"), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let transport = Arc::new(MockTransport::new());
        transport.sequence("https://forum.test/down", vec![MockReply::status(429)]);
        let fetcher = Fetcher::new(transport.clone(), config(), ShutdownSignal::never());

        let err = fetcher
            .fetch_document(&canonical("https://forum.test/down"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(transport.hits("https://forum.test/down"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honored() {
        let transport = Arc::new(MockTransport::new());
        transport.sequence(
            "https://forum.test/busy",
            vec![
                MockReply::status(429).with_retry_after(Duration::from_secs(1)),
                MockReply::html("<html>ok</html>"),
            ],
        );
        let mut cfg = config();
        cfg.backoff = ExponentialBackoff::new(1, 60_000).with_jitter(0);
        let fetcher = Fetcher::new(transport.clone(), cfg, ShutdownSignal::never());

        let start = tokio::time::Instant::now();
        let doc = fetcher
            .fetch_document(&canonical("https://forum.test/busy"))
            .await
            .unwrap();
        assert!(doc.html.contains("ok"));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.hits("https://forum.test/busy"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_capped_by_backoff_ceiling() {
        let transport = Arc::new(MockTransport::new());
        transport.sequence(
            "https://forum.test/busy",
            vec![
                MockReply::status(503).with_retry_after(Duration::from_secs(3600)),
                MockReply::html("<html>ok</html>"),
            ],
        );
        let mut cfg = config();
        cfg.backoff = ExponentialBackoff::new(1, 200).with_jitter(0);
        let fetcher = Fetcher::new(transport, cfg, ShutdownSignal::never());

        let start = tokio::time::Instant::now();
        assert!(fetcher
            .fetch_document(&canonical("https://forum.test/busy"))
            .await
            .is_ok());
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_client_errors_are_terminal() {
        let transport = Arc::new(MockTransport::new());
        transport.sequence("https://forum.test/gone", vec![MockReply::status(404)]);
        let fetcher = Fetcher::new(transport.clone(), config(), ShutdownSignal::never());

        let err = fetcher
            .fetch_document(&canonical("https://forum.test/gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 404, .. }));
        assert!(!err.is_transient());
        assert_eq!(transport.hits("https://forum.test/gone"), 1);
    }

    #[tokio::test]
    async fn test_content_type_is_validated() {
        let transport = Arc::new(MockTransport::new());
        transport.bytes("https://forum.test/feed", "application/json", b"{}".to_vec());
        transport.sequence(
            "https://forum.test/untyped",
            vec![MockReply::untyped(b"<!DOCTYPE html><html></html>".to_vec())],
        );
        let fetcher = Fetcher::new(transport, config(), ShutdownSignal::never());

        let err = fetcher
            .fetch_document(&canonical("https://forum.test/feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotHtml { .. }));
        assert!(fetcher
            .fetch_document(&canonical("https://forum.test/untyped"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_per_host_rate_limit_spaces_requests() {
        let transport = Arc::new(MockTransport::new());
        transport.html("https://forum.test/1", "<html></html>");
        transport.html("https://forum.test/2", "<html></html>");
        transport.html("https://forum.test/3", "<html></html>");
        let mut cfg = config();
        cfg.rate_limit_per_host = Duration::from_millis(40);
        let fetcher = Fetcher::new(transport, cfg, ShutdownSignal::never());

        let start = std::time::Instant::now();
        let (u1, u2, u3) = (
            canonical("https://forum.test/1"),
            canonical("https://forum.test/2"),
            canonical("https://forum.test/3"),
        );
        let (a, b, c) = tokio::join!(
            fetcher.fetch_document(&u1),
            fetcher.fetch_document(&u2),
            fetcher.fetch_document(&u3),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let transport = Arc::new(MockTransport::new());
        transport.sequence(
            "https://forum.test/slow",
            vec![MockReply::html("<html></html>").delayed(Duration::from_secs(30))],
        );
        let (trigger, signal) = shutdown_channel();
        let fetcher = Fetcher::new(transport, config(), signal);

        let slow = canonical("https://forum.test/slow");
        let pending = fetcher.fetch_document(&slow);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        };
        let (result, _) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(pending, cancel)
        })
        .await
        .expect("cancellation did not abort the fetch");
        assert!(result.unwrap_err().is_cancelled());
    }
}
