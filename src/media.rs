//! Media mirror: downloads referenced assets into a content-addressed store.
//!
//! Assets live at `media/<hh>/<sha256>.<ext>` under the output directory, where
//! the extension comes from the sniffed payload rather than the URL. Every
//! write goes through a `.partial-*.tmp` sibling that is renamed into place, so
//! a cancelled or failed download never leaves a file under its final name.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fetcher::{FetchError, Fetcher};
use crate::json_utils::{JsonError, read_json_file, write_bytes_atomic, write_json_atomic};
use crate::models::{MediaAsset, MediaRef};
use crate::orchestration::shutdown::ShutdownSignal;
use crate::url_utils::path_extension;

pub const MEDIA_DIR: &str = "media";
pub const MEDIA_INDEX_FILE: &str = "_index.json";

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("{source}")]
    Fetch {
        #[from]
        source: FetchError,
    },

    #[error("{url}: payload is not a recognized media kind (declared {declared:?})")]
    Unrecognized { url: String, declared: Option<String> },

    #[error("{url}: malformed data URI")]
    InvalidDataUri { url: String },

    #[error("{url}: write failed: {message}")]
    Io { url: String, message: String },

    #[error("{url}: cancelled")]
    Cancelled { url: String },
}

impl MediaError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            MediaError::Cancelled { .. } => true,
            MediaError::Fetch { source } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MediaError::Fetch { .. } => "media_fetch",
            MediaError::Unrecognized { .. } => "media_type",
            MediaError::InvalidDataUri { .. } => "media_data_uri",
            MediaError::Io { .. } => "media_io",
            MediaError::Cancelled { .. } => "cancelled",
        }
    }
}

/// A payload kind recognized from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedKind {
    pub mime: &'static str,
    pub extension: &'static str,
}

const fn kind(mime: &'static str, extension: &'static str) -> Option<SniffedKind> {
    Some(SniffedKind { mime, extension })
}

/// Identify a payload from its magic bytes.
pub fn sniff(bytes: &[u8]) -> Option<SniffedKind> {
    let at = |offset: usize, magic: &[u8]| bytes.get(offset..offset + magic.len()) == Some(magic);

    if at(0, &[0xFF, 0xD8, 0xFF]) {
        return kind("image/jpeg", "jpg");
    }
    if at(0, &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return kind("image/png", "png");
    }
    if at(0, b"GIF87a") || at(0, b"GIF89a") {
        return kind("image/gif", "gif");
    }
    if at(0, b"RIFF") {
        if at(8, b"WEBP") {
            return kind("image/webp", "webp");
        }
        if at(8, b"WAVE") {
            return kind("audio/wav", "wav");
        }
        if at(8, b"AVI ") {
            return kind("video/x-msvideo", "avi");
        }
    }
    if at(0, b"II*\0") || at(0, b"MM\0*") {
        return kind("image/tiff", "tiff");
    }
    if at(0, &[0x00, 0x00, 0x01, 0x00]) {
        return kind("image/x-icon", "ico");
    }
    if at(4, b"ftyp") {
        return match bytes.get(8..12) {
            Some(b"avif") | Some(b"avis") => kind("image/avif", "avif"),
            Some(b"heic") | Some(b"heix") | Some(b"mif1") => kind("image/heic", "heic"),
            Some(b"qt  ") => kind("video/quicktime", "mov"),
            Some(b"M4A ") => kind("audio/mp4", "m4a"),
            _ => kind("video/mp4", "mp4"),
        };
    }
    if at(0, &[0x1A, 0x45, 0xDF, 0xA3]) {
        let head = &bytes[..bytes.len().min(64)];
        return if head.windows(4).any(|w| w == b"webm") {
            kind("video/webm", "webm")
        } else {
            kind("video/x-matroska", "mkv")
        };
    }
    if at(0, b"OggS") {
        return kind("audio/ogg", "ogg");
    }
    if at(0, b"fLaC") {
        return kind("audio/flac", "flac");
    }
    if at(0, b"ID3") || (bytes.len() > 1 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0) {
        return kind("audio/mpeg", "mp3");
    }
    if at(0, b"%PDF-") {
        return kind("application/pdf", "pdf");
    }
    if at(0, b"PK\x03\x04") {
        return kind("application/zip", "zip");
    }
    if at(0, b"BM") && bytes.len() > 14 {
        return kind("image/bmp", "bmp");
    }
    if looks_like_svg(bytes) {
        return kind("image/svg+xml", "svg");
    }
    None
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]);
    let head = head.trim_start_matches('\u{feff}').trim_start();
    (head.starts_with("<svg") || head.starts_with("<?xml") || head.starts_with("<!--"))
        && head.contains("<svg")
}

pub fn is_data_uri(url: &str) -> bool {
    url.len() > 5 && url[..5].eq_ignore_ascii_case("data:")
}

/// Decode a `data:` URI into its declared type and payload. The payload is
/// percent-decoded first, then base64-decoded when declared so.
pub fn decode_data_uri(url: &str) -> Option<(Option<String>, Vec<u8>)> {
    let rest = url.get(5..)?;
    let (header, data) = rest.split_once(',')?;
    let mut params = header.split(';');
    let mime = params
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_ascii_lowercase);
    let is_base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let data = urlencoding::decode_binary(data.as_bytes());
    let bytes = if is_base64 {
        let cleaned: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        STANDARD.decode(cleaned).ok()?
    } else {
        data.into_owned()
    };
    Some((mime, bytes))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    /// Assets written to the store during this run.
    pub downloaded: usize,
    /// Requests answered from the index or by an identical payload.
    pub reused: usize,
    pub failed: usize,
    pub bytes: u64,
}

type MirrorCell = Arc<OnceCell<Result<MediaAsset, MediaError>>>;

pub struct MediaMirror {
    fetcher: Arc<Fetcher>,
    out_dir: PathBuf,
    permits: Semaphore,
    shutdown: ShutdownSignal,
    /// One cell per remote URL; concurrent requests share the first download.
    inflight: DashMap<String, MirrorCell>,
    /// Content hash to stored asset.
    by_hash: DashMap<String, MediaAsset>,
    /// Remote URL to stored asset, persisted across runs.
    index: DashMap<String, MediaAsset>,
    tasks: Mutex<JoinSet<()>>,
    downloaded: AtomicUsize,
    reused: AtomicUsize,
    failed: AtomicUsize,
    bytes: AtomicU64,
}

impl MediaMirror {
    pub fn new(
        fetcher: Arc<Fetcher>,
        out_dir: PathBuf,
        concurrency: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            fetcher,
            out_dir,
            permits: Semaphore::new(concurrency.max(1)),
            shutdown,
            inflight: DashMap::new(),
            by_hash: DashMap::new(),
            index: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
            downloaded: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.out_dir.join(MEDIA_DIR).join(MEDIA_INDEX_FILE)
    }

    /// Resolve a reference to a stored asset, downloading it at most once per run.
    pub async fn mirror(&self, media: &MediaRef) -> Result<MediaAsset, MediaError> {
        self.mirror_url(&media.remote_url).await
    }

    pub async fn mirror_url(&self, url: &str) -> Result<MediaAsset, MediaError> {
        if let Some(asset) = self.index.get(url) {
            return Ok(asset.clone());
        }
        let cell = self.inflight.entry(url.to_string()).or_default().clone();
        cell.get_or_init(|| self.download(url)).await.clone()
    }

    /// Already-resolved asset for a URL, without downloading.
    pub fn lookup(&self, url: &str) -> Option<MediaAsset> {
        self.index.get(url).map(|asset| asset.clone())
    }

    /// Schedule downloads on the media pool without waiting for them.
    pub fn prefetch<'a, I>(self: &Arc<Self>, refs: I)
    where
        I: IntoIterator<Item = &'a MediaRef>,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}

        for media in refs {
            let url = &media.remote_url;
            if self.index.contains_key(url) || self.inflight.contains_key(url) {
                continue;
            }
            let mirror = Arc::clone(self);
            let url = url.clone();
            tasks.spawn(async move {
                let _ = mirror.mirror_url(&url).await;
            });
        }
    }

    /// Wait for every scheduled download to settle.
    pub async fn drain(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            while tasks.join_next().await.is_some() {}
        }
    }

    pub fn stats(&self) -> MediaStats {
        MediaStats {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// Load the URL index left by an earlier run, keeping entries whose file is still on disk.
    pub fn load_index(&self) -> Result<usize, JsonError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(0);
        }
        let entries: BTreeMap<String, MediaAsset> = read_json_file(&path)?;
        let mut loaded = 0;
        for (url, asset) in entries {
            if !self.out_dir.join(&asset.local_path).is_file() {
                continue;
            }
            self.by_hash.insert(asset.sha256.clone(), asset.clone());
            self.index.insert(url, asset);
            loaded += 1;
        }
        info!("Loaded {} media index entries from {}", loaded, path.display());
        Ok(loaded)
    }

    /// Persist the URL index. Inline `data:` URIs are left out.
    pub fn save_index(&self) -> Result<(), JsonError> {
        let entries: BTreeMap<String, MediaAsset> = self
            .index
            .iter()
            .filter(|entry| !is_data_uri(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        write_json_atomic(&self.index_path(), &entries)
    }

    async fn download(&self, url: &str) -> Result<MediaAsset, MediaError> {
        let result = self.fetch_and_store(url).await;
        match &result {
            Ok(asset) => {
                self.index.insert(url.to_string(), asset.clone());
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Media failed: {}", e);
            }
        }
        result
    }

    async fn fetch_and_store(&self, url: &str) -> Result<MediaAsset, MediaError> {
        let cancelled = || MediaError::Cancelled {
            url: url.to_string(),
        };

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| cancelled())?,
            _ = self.shutdown.triggered() => return Err(cancelled()),
        };

        let (declared, body) = if is_data_uri(url) {
            decode_data_uri(url).ok_or_else(|| MediaError::InvalidDataUri {
                url: truncate_for_log(url),
            })?
        } else {
            let response = self.fetcher.fetch_bytes(url).await?;
            (response.content_type, response.body)
        };

        let Some(sniffed) = sniff(&body) else {
            return Err(MediaError::Unrecognized {
                url: truncate_for_log(url),
                declared,
            });
        };
        self.note_mismatch(url, declared.as_deref(), sniffed);

        let sha256 = hex::encode(Sha256::digest(&body));
        if let Some(existing) = self.by_hash.get(&sha256) {
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!("Media {} duplicates {}", truncate_for_log(url), existing.local_path.display());
            return Ok(existing.clone());
        }

        if self.shutdown.is_triggered() {
            return Err(cancelled());
        }

        let local_path = Path::new(MEDIA_DIR)
            .join(&sha256[..2])
            .join(format!("{}.{}", sha256, sniffed.extension));
        let absolute = self.out_dir.join(&local_path);
        let size_bytes = body.len() as u64;

        if !absolute.is_file() {
            let target = absolute.clone();
            tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &body))
                .await
                .map_err(|e| MediaError::Io {
                    url: truncate_for_log(url),
                    message: e.to_string(),
                })?
                .map_err(|e| MediaError::Io {
                    url: truncate_for_log(url),
                    message: e.to_string(),
                })?;
        }

        let asset = MediaAsset {
            local_path,
            content_type: sniffed.mime.to_string(),
            size_bytes,
            sha256: sha256.clone(),
        };
        let stored = self.by_hash.entry(sha256).or_insert(asset).clone();
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size_bytes, Ordering::Relaxed);
        debug!("Mirrored {} -> {}", truncate_for_log(url), stored.local_path.display());
        Ok(stored)
    }

    fn note_mismatch(&self, url: &str, declared: Option<&str>, sniffed: SniffedKind) {
        let declared_mime = declared
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());
        if let Some(declared_mime) = declared_mime
            && declared_mime != sniffed.mime
        {
            debug!(
                "Media {} declared {} but contains {}",
                truncate_for_log(url),
                declared_mime,
                sniffed.mime
            );
        }
        if !is_data_uri(url)
            && let Some(ext) = path_extension(url)
            && ext != sniffed.extension
        {
            debug!("Media {} re-extensioned .{} -> .{}", url, ext, sniffed.extension);
        }
    }
}

/// Data URIs can be megabytes long; keep log lines and error records short.
pub(crate) fn truncate_for_log(url: &str) -> String {
    const MAX: usize = 96;
    if url.len() <= MAX {
        return url.to_string();
    }
    let cut = (0..=MAX).rev().find(|&i| url.is_char_boundary(i)).unwrap_or(0);
    format!("{}...", &url[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::fetcher::FetcherConfig;
    use crate::models::MediaKind;
    use crate::orchestration::shutdown::shutdown_channel;
    use crate::testing::{MockReply, MockTransport, jpeg_payload, png_payload};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fetcher(transport: Arc<MockTransport>, shutdown: ShutdownSignal) -> Arc<Fetcher> {
        Arc::new(Fetcher::new(
            transport,
            FetcherConfig {
                max_in_flight: 8,
                rate_limit_per_host: Duration::ZERO,
                max_attempts: 2,
                backoff: ExponentialBackoff::new(1, 2).with_jitter(0),
                max_page_bytes: 1024,
                max_media_bytes: 1024 * 1024,
            },
            shutdown,
        ))
    }

    fn mirror_in(dir: &TempDir, transport: Arc<MockTransport>) -> Arc<MediaMirror> {
        Arc::new(MediaMirror::new(
            fetcher(transport, ShutdownSignal::never()),
            dir.path().to_path_buf(),
            4,
            ShutdownSignal::never(),
        ))
    }

    fn media_ref(url: &str) -> MediaRef {
        MediaRef {
            remote_url: url.to_string(),
            kind: MediaKind::Image,
            referencing_post_id: "1".to_string(),
        }
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(&png_payload(b"x")).unwrap().extension, "png");
        assert_eq!(sniff(&jpeg_payload(b"x")).unwrap().mime, "image/jpeg");
        assert_eq!(sniff(b"GIF89a....").unwrap().extension, "gif");
        assert_eq!(sniff(b"RIFF\0\0\0\0WEBPVP8 ").unwrap().extension, "webp");
        assert_eq!(sniff(b"\0\0\0\x18ftypmp42\0\0").unwrap().extension, "mp4");
        assert_eq!(sniff(b"\0\0\0\x18ftypavif\0\0").unwrap().extension, "avif");
        assert_eq!(sniff(b"%PDF-1.7\n").unwrap().extension, "pdf");
        assert_eq!(
            sniff(b"<?xml version=\"1.0\"?><svg xmlns=\"http://www.w3.org/2000/svg\"/>")
                .unwrap()
                .extension,
            "svg"
        );
        assert_eq!(sniff(b"<!DOCTYPE html><html>"), None);
        assert_eq!(sniff(b""), None);
    }

    #[test]
    fn test_decode_data_uri() {
        let (mime, bytes) = decode_data_uri("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(mime.as_deref(), Some("image/png"));
        assert_eq!(bytes, png_payload(b""));

        let (mime, bytes) = decode_data_uri("data:,hello").unwrap();
        assert_eq!(mime, None);
        assert_eq!(bytes, b"hello");

        let (mime, bytes) = decode_data_uri(
            "data:image/svg+xml,%3Csvg%20xmlns='http://www.w3.org/2000/svg'%3E%3C/svg%3E",
        )
        .unwrap();
        assert_eq!(mime.as_deref(), Some("image/svg+xml"));
        assert_eq!(bytes, b"<svg xmlns='http://www.w3.org/2000/svg'></svg>");
        assert_eq!(sniff(&bytes).map(|k| k.extension), Some("svg"));

        let (_, bytes) = decode_data_uri("data:image/png;base64,iVBORw0K%0AGgo%3D").unwrap();
        assert_eq!(bytes, png_payload(b""));

        assert!(decode_data_uri("data:image/png;base64").is_none());
        assert!(decode_data_uri("data:image/png;base64,@@@").is_none());
    }

    #[tokio::test]
    async fn test_identical_payloads_stored_once() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.bytes("https://cdn.test/a.png", "image/png", png_payload(b"same"));
        transport.bytes("https://cdn.test/copy-of-a.png", "image/png", png_payload(b"same"));
        let mirror = mirror_in(&dir, transport.clone());

        let a = mirror.mirror(&media_ref("https://cdn.test/a.png")).await.unwrap();
        let b = mirror.mirror(&media_ref("https://cdn.test/copy-of-a.png")).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(files_under(&dir.path().join(MEDIA_DIR)).len(), 1);
        assert!(dir.path().join(&a.local_path).is_file());
        assert_eq!(a.size_bytes, png_payload(b"same").len() as u64);

        let stats = mirror.stats();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_download() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.sequence(
            "https://cdn.test/slow.jpg",
            vec![MockReply::bytes("image/jpeg", jpeg_payload(b"slow")).delayed(Duration::from_millis(30))],
        );
        let mirror = mirror_in(&dir, transport.clone());
        let r = media_ref("https://cdn.test/slow.jpg");

        let (a, b, c) = tokio::join!(mirror.mirror(&r), mirror.mirror(&r), mirror.mirror(&r));
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.is_ok());
        assert_eq!(transport.hits("https://cdn.test/slow.jpg"), 1);
    }

    #[tokio::test]
    async fn test_mismatched_extension_is_corrected() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.bytes("https://cdn.test/photo.jpg", "image/jpeg", png_payload(b"really png"));
        let mirror = mirror_in(&dir, transport);

        let asset = mirror.mirror(&media_ref("https://cdn.test/photo.jpg")).await.unwrap();
        assert_eq!(asset.content_type, "image/png");
        assert_eq!(asset.local_path.extension().unwrap(), "png");
        assert!(asset.local_path.starts_with(MEDIA_DIR));
    }

    #[tokio::test]
    async fn test_failures() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.bytes("https://cdn.test/error-page.png", "image/png", b"<html>oops</html>".to_vec());
        let mirror = mirror_in(&dir, transport.clone());

        let missing = mirror.mirror(&media_ref("https://cdn.test/missing.png")).await.unwrap_err();
        assert!(matches!(missing, MediaError::Fetch { .. }));
        assert_eq!(missing.kind(), "media_fetch");

        let bogus = mirror
            .mirror(&media_ref("https://cdn.test/error-page.png"))
            .await
            .unwrap_err();
        assert!(matches!(bogus, MediaError::Unrecognized { .. }));

        // Failures are remembered for the rest of the run.
        assert!(mirror.mirror(&media_ref("https://cdn.test/missing.png")).await.is_err());
        assert_eq!(transport.hits("https://cdn.test/missing.png"), 1);
        assert_eq!(mirror.stats().failed, 2);
        assert!(!dir.path().join(MEDIA_DIR).exists());
    }

    #[tokio::test]
    async fn test_data_uri_is_recovered() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let mirror = mirror_in(&dir, transport.clone());

        let asset = mirror
            .mirror(&media_ref("data:image/png;base64,iVBORw0KGgpkYXRh"))
            .await
            .unwrap();
        assert_eq!(asset.content_type, "image/png");
        assert!(dir.path().join(&asset.local_path).is_file());
        assert_eq!(transport.total_hits(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_then_drain() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let refs: Vec<MediaRef> = (0..6)
            .map(|i| {
                let url = format!("https://cdn.test/{}.png", i);
                transport.bytes(&url, "image/png", png_payload(&[i as u8]));
                media_ref(&url)
            })
            .collect();
        let mirror = mirror_in(&dir, transport.clone());

        mirror.prefetch(&refs);
        mirror.prefetch(&refs);
        mirror.drain().await;

        assert_eq!(mirror.stats().downloaded, 6);
        assert_eq!(transport.total_hits(), 6);
        assert!(refs.iter().all(|r| mirror.lookup(&r.remote_url).is_some()));
    }

    #[tokio::test]
    async fn test_index_survives_restart() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.bytes("https://cdn.test/keep.png", "image/png", png_payload(b"keep"));

        let first = mirror_in(&dir, transport.clone());
        let asset = first.mirror(&media_ref("https://cdn.test/keep.png")).await.unwrap();
        first.save_index().unwrap();

        let second = mirror_in(&dir, transport.clone());
        assert_eq!(second.load_index().unwrap(), 1);
        let again = second.mirror(&media_ref("https://cdn.test/keep.png")).await.unwrap();
        assert_eq!(asset, again);
        assert_eq!(transport.hits("https://cdn.test/keep.png"), 1);
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_temporary_files() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        for i in 0..4 {
            let url = format!("https://cdn.test/big{}.jpg", i);
            transport.sequence(
                &url,
                vec![MockReply::bytes("image/jpeg", jpeg_payload(&[i; 2048])).delayed(Duration::from_millis(200))],
            );
        }
        let (trigger, signal) = shutdown_channel();
        let mirror = Arc::new(MediaMirror::new(
            fetcher(transport, signal.clone()),
            dir.path().to_path_buf(),
            2,
            signal,
        ));
        let refs: Vec<MediaRef> = (0..4).map(|i| media_ref(&format!("https://cdn.test/big{}.jpg", i))).collect();

        mirror.prefetch(&refs);
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), mirror.drain())
            .await
            .expect("drain hung after cancellation");

        let leftovers: Vec<_> = if dir.path().join(MEDIA_DIR).exists() {
            files_under(&dir.path().join(MEDIA_DIR))
        } else {
            Vec::new()
        };
        assert!(leftovers.iter().all(|p| {
            let name = p.file_name().unwrap().to_string_lossy();
            !name.starts_with(".partial-") && !name.ends_with(".tmp")
        }));
        assert_eq!(mirror.stats().failed, 0);
    }
}
