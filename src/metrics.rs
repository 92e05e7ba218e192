use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Error records kept verbatim; beyond this only the per-kind counts grow.
pub const MAX_ERROR_RECORDS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    buckets: Vec<(u64, u64)>,
    sum_ms: u64,
    count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![
                (10, 0),
                (50, 0),
                (100, 0),
                (250, 0),
                (500, 0),
                (1000, 0),
                (5000, 0),
                (u64::MAX, 0),
            ],
            sum_ms: 0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value_ms: u64) {
        self.sum_ms += value_ms;
        self.count += 1;

        for (threshold, count) in &mut self.buckets {
            if value_ms <= *threshold {
                *count += 1;
                break;
            }
        }
    }

    pub fn mean_ms(&self) -> Option<u64> {
        (self.count > 0).then(|| self.sum_ms / self.count)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// EWMA with configurable alpha (0=smooth, 1=responsive).
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    alpha: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn update(&mut self, new_value: f64) {
        if self.value == 0.0 {
            self.value = new_value;
        } else {
            self.value = self.alpha * new_value + (1.0 - self.alpha) * self.value;
        }
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// One non-fatal failure, as surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub url: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct ErrorLogInner {
    records: Vec<ErrorRecord>,
    by_kind: BTreeMap<String, u64>,
    total: u64,
}

/// Aggregates non-fatal errors for the run summary.
#[derive(Debug, Default)]
pub struct ErrorLog {
    inner: Mutex<ErrorLogInner>,
}

impl ErrorLog {
    pub fn record(&self, kind: &str, url: &str, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        *inner.by_kind.entry(kind.to_string()).or_insert(0) += 1;
        if inner.records.len() < MAX_ERROR_RECORDS {
            inner.records.push(ErrorRecord {
                kind: kind.to_string(),
                url: url.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn by_kind(&self) -> BTreeMap<String, u64> {
        self.inner.lock().by_kind.clone()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.inner.lock().records.clone()
    }
}

/// Counter values carried across a resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub pages_fetched: u64,
    pub pages_failed: u64,
    pub links_rejected: u64,
    pub threads_written: u64,
    #[serde(default)]
    pub threads_partial: u64,
    #[serde(default)]
    pub pages_unrecognized: u64,
}

pub struct Metrics {
    pub fetch_latency: Mutex<Histogram>,
    pub fetch_ewma: Mutex<Ewma>,

    pub pages_fetched: Counter,
    pub pages_failed: Counter,
    pub pages_unrecognized: Counter,
    pub links_discovered: Counter,
    pub links_rejected: Counter,
    pub threads_written: Counter,
    pub threads_partial: Counter,

    pub errors: ErrorLog,
    current_url: Mutex<Option<String>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            fetch_latency: Mutex::new(Histogram::new()),
            fetch_ewma: Mutex::new(Ewma::new(0.3)),
            pages_fetched: Counter::new(),
            pages_failed: Counter::new(),
            pages_unrecognized: Counter::new(),
            links_discovered: Counter::new(),
            links_rejected: Counter::new(),
            threads_written: Counter::new(),
            threads_partial: Counter::new(),
            errors: ErrorLog::default(),
            current_url: Mutex::new(None),
        }
    }

    pub fn record_fetch(&self, url: &str, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.fetch_latency.lock().observe(ms);
        self.fetch_ewma.lock().update(ms as f64);
        self.pages_fetched.inc();
        *self.current_url.lock() = Some(url.to_string());
    }

    pub fn fetch_ewma_ms(&self) -> f64 {
        self.fetch_ewma.lock().get()
    }

    /// Mean page fetch latency over the whole run, `None` before the first fetch.
    pub fn mean_fetch_ms(&self) -> Option<u64> {
        self.fetch_latency.lock().mean_ms()
    }

    pub fn current_url(&self) -> Option<String> {
        self.current_url.lock().clone()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pages_fetched: self.pages_fetched.get(),
            pages_failed: self.pages_failed.get(),
            links_rejected: self.links_rejected.get(),
            threads_written: self.threads_written.get(),
            threads_partial: self.threads_partial.get(),
            pages_unrecognized: self.pages_unrecognized.get(),
        }
    }

    pub fn restore(&self, snapshot: &CounterSnapshot) {
        self.pages_fetched.set(snapshot.pages_fetched);
        self.pages_failed.set(snapshot.pages_failed);
        self.links_rejected.set(snapshot.links_rejected);
        self.threads_written.set(snapshot.threads_written);
        self.threads_partial.set(snapshot.threads_partial);
        self.pages_unrecognized.set(snapshot.pages_unrecognized);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

/// Progress as seen by a presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub pages_visited: u64,
    pub pages_pending: u64,
    pub media_downloaded: u64,
    pub errors_count: u64,
    #[serde(rename = "currentURL")]
    pub current_url: Option<String>,
}

/// Publishes progress on a watch channel, at most once per interval.
#[derive(Debug)]
pub struct ProgressEmitter {
    tx: watch::Sender<ProgressEvent>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressEmitter {
    pub fn new(interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(ProgressEvent::default());
        Self {
            tx,
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publish unless the previous event went out less than one interval ago.
    /// Returns whether the event was published.
    pub fn emit(&self, event: impl FnOnce() -> ProgressEvent) -> bool {
        {
            let mut last = self.last.lock();
            if let Some(previous) = *last
                && previous.elapsed() < self.interval
            {
                return false;
            }
            *last = Some(Instant::now());
        }
        self.tx.send_replace(event());
        true
    }

    /// Publish regardless of the rate limit (used for the final state).
    pub fn emit_now(&self, event: ProgressEvent) {
        *self.last.lock() = Some(Instant::now());
        self.tx.send_replace(event);
    }
}
