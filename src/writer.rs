//! JSON exports and the browsable HTML mirror.
//!
//! Layout under the output directory:
//!
//! ```text
//! threads/<threadId>.json                        structured export
//! threads/<threadId>.csv                         one row per post, BBCode bodies
//! <forum>/<subforum>/<threadId>-<slug>.html      rendered thread
//! <forum>/<subforum>/<threadId>-<slug>_media/    links into the asset store
//! media/<hh>/<sha256>.<ext>                      content-addressed asset store
//! index.html                                     table of contents
//! ```
//!
//! Rendering is a pure function of the record and the rewrite map (plus the
//! stored asset bytes when media is embedded), so writing the same thread
//! twice produces byte-identical files.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use html_escape::decode_html_entities;
use lol_html::{HtmlRewriter, Settings, element};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bbcode::html_to_bbcode;
use crate::canonical::Canonicalizer;
use crate::config::Limits;
use crate::json_utils::{JsonError, read_json_file, write_bytes_atomic, write_json_atomic};
use crate::models::{CanonicalUrl, MediaAsset, MediaKind, MediaRef, PostRecord, ThreadRecord};
use crate::url_utils::{relative_link, slugify};

pub const THREADS_DIR: &str = "threads";
pub const INDEX_FILE: &str = "index.html";

/// Attributes whose URLs are rewritten to local paths.
const LINK_ATTRIBUTES: &[(&str, &str)] = &[
    ("[src]", "src"),
    ("[href]", "href"),
    ("[poster]", "poster"),
    ("[data-src]", "data-src"),
];

const STYLESHEET: &str = "body{font-family:sans-serif;max-width:60em;margin:auto;padding:1em;color:#222}\
nav.breadcrumbs{font-size:.9em;color:#666}\
article.post{border:1px solid #ddd;border-radius:4px;margin:1em 0;padding:.5em 1em}\
article.post header{display:flex;gap:.75em;align-items:center;color:#555;font-size:.9em}\
img.avatar{width:48px;height:48px;border-radius:50%;object-fit:cover}\
.badge{background:#eef;border-radius:3px;padding:0 .4em;font-weight:bold}\
.original-post .badge{background:#dfd}\
.post-body img{max-width:100%}\
.partial{color:#a00}";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("thread {thread_id}: {source}")]
    Json {
        thread_id: String,
        #[source]
        source: JsonError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("thread {thread_id}: CSV export failed: {source}")]
    Csv {
        thread_id: String,
        #[source]
        source: csv::Error,
    },

    #[error("writer thread has shut down")]
    WriterClosed,
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceError::Json { .. } => "persist_json",
            PersistenceError::Io { .. } => "persist_io",
            PersistenceError::Csv { .. } => "persist_csv",
            PersistenceError::WriterClosed => "persist_closed",
        }
    }
}

/// Remote URL to local target lookups used while rendering.
#[derive(Debug, Clone, Default)]
pub struct UrlRewriteMap {
    media: HashMap<String, MediaAsset>,
    threads: HashMap<String, PathBuf>,
}

impl UrlRewriteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_media(&mut self, remote_url: impl Into<String>, asset: MediaAsset) {
        self.media.insert(remote_url.into(), asset);
    }

    /// Map a thread page URL to the thread's HTML file (relative to the output directory).
    pub fn insert_thread(&mut self, page_url: impl Into<String>, html_path: PathBuf) {
        self.threads.insert(page_url.into(), html_path);
    }

    /// Register every page URL of an archived thread.
    pub fn register_thread(&mut self, record: &ThreadRecord) {
        let html_path = thread_html_path(&record.thread_id, &record.title, &record.forum_path);
        for url in &record.source_urls {
            self.insert_thread(url.as_str(), html_path.clone());
        }
    }

    pub fn media(&self, url: &str) -> Option<&MediaAsset> {
        self.media.get(url)
    }

    pub fn thread(&self, url: &str) -> Option<&Path> {
        self.threads.get(url).map(PathBuf::as_path)
    }

    pub fn clear_media(&mut self) {
        self.media.clear();
    }

    pub fn thread_len(&self) -> usize {
        self.threads.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaExport {
    #[serde(rename = "remoteURL")]
    pub remote_url: String,
    pub local_path: Option<String>,
    pub kind: MediaKind,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostExport {
    pub post_id: String,
    pub author: String,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: Option<DateTime<Utc>>,
    /// Post body HTML with absolute remote URLs.
    pub content: String,
    pub plain_text: String,
    #[serde(default)]
    pub bbcode: String,
    pub media: Vec<MediaExport>,
}

/// On-disk JSON shape of one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadExport {
    pub thread_id: String,
    pub title: String,
    pub forum_path: Vec<String>,
    pub page_count: u32,
    pub source_urls: Vec<CanonicalUrl>,
    pub partial: bool,
    pub missing_pages: Vec<u32>,
    pub posts: Vec<PostExport>,
}

impl ThreadExport {
    pub fn from_record(record: &ThreadRecord, map: &UrlRewriteMap) -> Self {
        let posts = record
            .posts
            .iter()
            .map(|post| PostExport {
                post_id: post.post_id.clone(),
                author: post.author.clone(),
                timestamp_utc: post.timestamp_utc,
                content: post.content_html.clone(),
                plain_text: post.content_text.clone(),
                bbcode: html_to_bbcode(&post.content_html),
                media: post
                    .media_refs
                    .iter()
                    .map(|media| {
                        let asset = map.media(&media.remote_url);
                        MediaExport {
                            remote_url: media.remote_url.clone(),
                            local_path: asset.map(|a| relative_link(Path::new(""), &a.local_path)),
                            kind: media.kind,
                            content_type: asset.map(|a| a.content_type.clone()),
                            size_bytes: asset.map(|a| a.size_bytes),
                            sha256: asset.map(|a| a.sha256.clone()),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            thread_id: record.thread_id.clone(),
            title: record.title.clone(),
            forum_path: record.forum_path.clone(),
            page_count: record.page_count,
            source_urls: record.source_urls.clone(),
            partial: record.partial,
            missing_pages: record.missing_pages.clone(),
            posts,
        }
    }

    pub fn to_record(&self) -> ThreadRecord {
        ThreadRecord {
            thread_id: self.thread_id.clone(),
            title: self.title.clone(),
            forum_path: self.forum_path.clone(),
            posts: self
                .posts
                .iter()
                .map(|post| PostRecord {
                    post_id: post.post_id.clone(),
                    author: post.author.clone(),
                    timestamp_utc: post.timestamp_utc,
                    content_html: post.content.clone(),
                    content_text: post.plain_text.clone(),
                    media_refs: post
                        .media
                        .iter()
                        .map(|media| MediaRef {
                            remote_url: media.remote_url.clone(),
                            kind: media.kind,
                            referencing_post_id: post.post_id.clone(),
                        })
                        .collect(),
                })
                .collect(),
            page_count: self.page_count,
            source_urls: self.source_urls.clone(),
            partial: self.partial,
            missing_pages: self.missing_pages.clone(),
        }
    }

    /// Media that was mirrored when this export was written.
    pub fn resolved_media(&self) -> impl Iterator<Item = (&str, MediaAsset)> {
        self.posts.iter().flat_map(|post| post.media.iter()).filter_map(|media| {
            let asset = MediaAsset {
                local_path: PathBuf::from(media.local_path.as_ref()?),
                content_type: media.content_type.clone().unwrap_or_default(),
                size_bytes: media.size_bytes.unwrap_or(0),
                sha256: media.sha256.clone().unwrap_or_default(),
            };
            Some((media.remote_url.as_str(), asset))
        })
    }
}

/// One row of the table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub thread_id: String,
    pub title: String,
    pub forum_path: Vec<String>,
    pub html_path: String,
    pub json_path: String,
    pub post_count: usize,
    pub partial: bool,
    pub source_urls: Vec<CanonicalUrl>,
}

impl IndexEntry {
    pub fn for_record(record: &ThreadRecord) -> Self {
        let html = thread_html_path(&record.thread_id, &record.title, &record.forum_path);
        let json = thread_json_path(&record.thread_id);
        Self {
            thread_id: record.thread_id.clone(),
            title: record.title.clone(),
            forum_path: record.forum_path.clone(),
            html_path: relative_link(Path::new(""), &html),
            json_path: relative_link(Path::new(""), &json),
            post_count: record.posts.len(),
            partial: record.partial,
            source_urls: record.source_urls.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub threads: Vec<IndexEntry>,
    pub failures: Vec<(PathBuf, String)>,
}

/// Keep file names portable: anything outside `[A-Za-z0-9_-]` becomes `_`.
fn file_stem_safe(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

fn thread_stem(thread_id: &str, title: &str) -> String {
    format!("{}-{}", file_stem_safe(thread_id), slugify(title, Limits::SLUG_MAX_LEN))
}

/// HTML location of a thread, relative to the output directory.
pub fn thread_html_path(thread_id: &str, title: &str, forum_path: &[String]) -> PathBuf {
    let mut path = PathBuf::new();
    for segment in forum_path {
        path.push(slugify(segment, Limits::SLUG_MAX_LEN));
    }
    path.push(format!("{}.html", thread_stem(thread_id, title)));
    path
}

/// Per-thread media folder, relative to the output directory.
pub fn thread_media_dir(thread_id: &str, title: &str, forum_path: &[String]) -> PathBuf {
    let html = thread_html_path(thread_id, title, forum_path);
    let parent = html.parent().map(Path::to_path_buf).unwrap_or_default();
    parent.join(format!("{}_media", thread_stem(thread_id, title)))
}

pub fn thread_json_path(thread_id: &str) -> PathBuf {
    Path::new(THREADS_DIR).join(format!("{}.json", file_stem_safe(thread_id)))
}

pub fn thread_csv_path(thread_id: &str) -> PathBuf {
    Path::new(THREADS_DIR).join(format!("{}.csv", file_stem_safe(thread_id)))
}

const CSV_HEADER: [&str; 6] = [
    "thread_title",
    "post_id",
    "post_author",
    "post_date",
    "post_content_bbcode",
    "media_references",
];

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn format_timestamp(timestamp: Option<DateTime<Utc>>) -> (String, String) {
    match timestamp {
        Some(ts) => (
            ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            ts.format("%Y-%m-%d %H:%M UTC").to_string(),
        ),
        None => (String::new(), "unknown date".to_string()),
    }
}

/// Resolves URLs in one thread's HTML to paths relative to that thread's file.
struct LinkResolver<'a> {
    map: &'a UrlRewriteMap,
    canonicalizer: Option<&'a Canonicalizer>,
    html_dir: PathBuf,
    media_folder: String,
    /// Asset store root when media is inlined as `data:` URIs.
    embed_from: Option<&'a Path>,
}

impl LinkResolver<'_> {
    fn resolve(&self, url: &str) -> Option<String> {
        if let Some(asset) = self.map.media(url) {
            if let Some(store) = self.embed_from
                && let Some(data_uri) = embedded_asset(store, asset)
            {
                return Some(data_uri);
            }
            let name = asset.local_path.file_name()?.to_string_lossy();
            return Some(format!("{}/{}", self.media_folder, name));
        }

        let (target, fragment) = match url.split_once('#') {
            Some((target, fragment)) => (target, Some(fragment)),
            None => (url, None),
        };
        let html_path = self.map.thread(target).or_else(|| {
            let canonical = self.canonicalizer?.canonicalize_absolute(target).ok()?;
            self.map.thread(canonical.as_str())
        })?;

        let mut local = relative_link(&self.html_dir, html_path);
        if let Some(fragment) = fragment {
            local.push('#');
            local.push_str(fragment);
        }
        Some(local)
    }

    fn resolve_or_remote(&self, url: &str) -> String {
        self.resolve(url).unwrap_or_else(|| url.to_string())
    }

    fn rewrite(&self, html: &str) -> String {
        let handlers = LINK_ATTRIBUTES
            .iter()
            .map(|&(selector, attr)| {
                element!(selector, move |el| {
                    // Attribute values come back still entity-encoded (`&amp;`).
                    if let Some(value) = el.get_attribute(attr)
                        && let Some(local) = self.resolve(&decode_html_entities(value.trim()))
                    {
                        el.set_attribute(attr, &local)?;
                    }
                    Ok(())
                })
            })
            .collect();

        let mut output = Vec::with_capacity(html.len());
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            |c: &[u8]| output.extend_from_slice(c),
        );
        let result = rewriter.write(html.as_bytes()).and_then(|_| rewriter.end());

        match result {
            Ok(()) => String::from_utf8_lossy(&output).into_owned(),
            Err(e) => {
                warn!("Could not rewrite links: {}", e);
                html.to_string()
            }
        }
    }
}

/// Read a stored asset as a `data:` URI. Oversized or unreadable assets stay linked.
fn embedded_asset(store: &Path, asset: &MediaAsset) -> Option<String> {
    if asset.size_bytes > Limits::MAX_EMBED_BYTES {
        return None;
    }
    let path = store.join(&asset.local_path);
    match std::fs::read(&path) {
        Ok(bytes) => Some(format!(
            "data:{};base64,{}",
            asset.content_type,
            STANDARD.encode(bytes)
        )),
        Err(e) => {
            debug!("Not embedding {}: {}", path.display(), e);
            None
        }
    }
}

/// Writes exports, thread pages and the index below one output directory.
#[derive(Debug, Clone)]
pub struct MirrorWriter {
    out_dir: PathBuf,
    canonicalizer: Option<Canonicalizer>,
    embed_media: bool,
}

impl MirrorWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            canonicalizer: None,
            embed_media: false,
        }
    }

    /// Inline mirrored media into thread pages so each page stands alone.
    pub fn with_embedded_media(mut self, embed: bool) -> Self {
        self.embed_media = embed;
        self
    }

    /// Links found in post bodies are canonicalized before looking up archived threads.
    pub fn with_canonicalizer(mut self, canonicalizer: Canonicalizer) -> Self {
        self.canonicalizer = Some(canonicalizer);
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn write_json(
        &self,
        record: &ThreadRecord,
        map: &UrlRewriteMap,
    ) -> Result<PathBuf, PersistenceError> {
        let path = self.out_dir.join(thread_json_path(&record.thread_id));
        let export = ThreadExport::from_record(record, map);
        write_json_atomic(&path, &export).map_err(|source| PersistenceError::Json {
            thread_id: record.thread_id.clone(),
            source,
        })?;
        Ok(path)
    }

    /// One row per post: title, id, author, date, BBCode body and the media it
    /// references (local paths where mirrored, remote URLs otherwise).
    pub fn write_csv(
        &self,
        record: &ThreadRecord,
        map: &UrlRewriteMap,
    ) -> Result<PathBuf, PersistenceError> {
        let csv_error = |source: csv::Error| PersistenceError::Csv {
            thread_id: record.thread_id.clone(),
            source,
        };

        let mut rows = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .from_writer(Vec::new());
        rows.write_record(CSV_HEADER).map_err(csv_error)?;
        for post in &record.posts {
            let date = post
                .timestamp_utc
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            let media: Vec<String> = post
                .media_refs
                .iter()
                .map(|media| match map.media(&media.remote_url) {
                    Some(asset) => relative_link(Path::new(""), &asset.local_path),
                    None => media.remote_url.clone(),
                })
                .collect();
            rows.write_record([
                record.title.as_str(),
                post.post_id.as_str(),
                post.author.as_str(),
                date.as_str(),
                html_to_bbcode(&post.content_html).as_str(),
                media.join(" ").as_str(),
            ])
            .map_err(csv_error)?;
        }
        let bytes = rows
            .into_inner()
            .map_err(|e| csv_error(csv::Error::from(e.into_error())))?;

        let path = self.out_dir.join(thread_csv_path(&record.thread_id));
        write_bytes_atomic(&path, &bytes).map_err(|e| PersistenceError::io(&path, e))?;
        Ok(path)
    }

    pub fn read_export(path: &Path) -> Result<ThreadExport, PersistenceError> {
        read_json_file(path).map_err(|source| PersistenceError::Json {
            thread_id: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source,
        })
    }

    pub fn read_json(path: &Path) -> Result<ThreadRecord, PersistenceError> {
        Self::read_export(path).map(|export| export.to_record())
    }

    /// Render a thread page from `record` and `map`; embedded media is read from the store.
    pub fn render_html(&self, record: &ThreadRecord, map: &UrlRewriteMap) -> String {
        let html_path = thread_html_path(&record.thread_id, &record.title, &record.forum_path);
        let html_dir = html_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let resolver = LinkResolver {
            map,
            canonicalizer: self.canonicalizer.as_ref(),
            media_folder: format!("{}_media", thread_stem(&record.thread_id, &record.title)),
            html_dir: html_dir.clone(),
            embed_from: self.embed_media.then_some(self.out_dir.as_path()),
        };
        let title = escape_html(&record.title);

        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", title));
        html.push_str(&format!("<style>{}</style>\n</head>\n<body>\n", STYLESHEET));

        html.push_str(&format!(
            "<nav class=\"breadcrumbs\"><a href=\"{}\">Archive</a>",
            relative_link(&html_dir, Path::new(INDEX_FILE))
        ));
        for segment in &record.forum_path {
            html.push_str(&format!(" &rsaquo; {}", escape_html(segment)));
        }
        html.push_str("</nav>\n");

        html.push_str(&format!("<h1>{}</h1>\n", title));
        html.push_str(&format!(
            "<p class=\"thread-meta\">Thread {} &middot; {} posts &middot; {} pages",
            escape_html(&record.thread_id),
            record.posts.len(),
            record.page_count
        ));
        if record.partial {
            let missing: Vec<String> = record.missing_pages.iter().map(u32::to_string).collect();
            html.push_str(&format!(
                " &middot; <span class=\"partial\">incomplete, missing pages: {}</span>",
                missing.join(", ")
            ));
        }
        html.push_str("</p>\n");

        for (index, post) in record.posts.iter().enumerate() {
            render_post(&mut html, post, index, &resolver);
        }

        html.push_str("<footer>");
        if let Some(source) = record.source_urls.first() {
            let source = escape_html(source.as_str());
            html.push_str(&format!("Archived from <a href=\"{0}\">{0}</a>", source));
        }
        html.push_str("</footer>\n</body>\n</html>\n");
        html
    }

    /// Render and write a thread page, linking its media folder into the asset store.
    pub fn write_html(
        &self,
        record: &ThreadRecord,
        map: &UrlRewriteMap,
    ) -> Result<PathBuf, PersistenceError> {
        let html = self.render_html(record, map);
        self.link_thread_media(record, map)?;

        let path = self
            .out_dir
            .join(thread_html_path(&record.thread_id, &record.title, &record.forum_path));
        write_bytes_atomic(&path, html.as_bytes()).map_err(|e| PersistenceError::io(&path, e))?;
        Ok(path)
    }

    /// JSON and CSV exports plus the HTML page.
    pub fn write_thread(
        &self,
        record: &ThreadRecord,
        map: &UrlRewriteMap,
    ) -> Result<IndexEntry, PersistenceError> {
        self.write_json(record, map)?;
        self.write_csv(record, map)?;
        let html_path = self.write_html(record, map)?;
        debug!("Wrote thread {} to {}", record.thread_id, html_path.display());
        Ok(IndexEntry::for_record(record))
    }

    fn link_thread_media(
        &self,
        record: &ThreadRecord,
        map: &UrlRewriteMap,
    ) -> Result<(), PersistenceError> {
        let assets: BTreeSet<&Path> = record
            .media_refs()
            .filter_map(|media| map.media(&media.remote_url))
            .map(|asset| asset.local_path.as_path())
            .collect();
        if assets.is_empty() {
            return Ok(());
        }

        let media_dir = self
            .out_dir
            .join(thread_media_dir(&record.thread_id, &record.title, &record.forum_path));
        std::fs::create_dir_all(&media_dir).map_err(|e| PersistenceError::io(&media_dir, e))?;

        for local_path in assets {
            let Some(name) = local_path.file_name() else {
                continue;
            };
            let source = self.out_dir.join(local_path);
            let target = media_dir.join(name);
            if target.exists() {
                continue;
            }
            if !source.is_file() {
                warn!("Asset {} missing from the store", source.display());
                continue;
            }
            if std::fs::hard_link(&source, &target).is_err() {
                let bytes = std::fs::read(&source).map_err(|e| PersistenceError::io(&source, e))?;
                write_bytes_atomic(&target, &bytes).map_err(|e| PersistenceError::io(&target, e))?;
            }
        }
        Ok(())
    }

    /// Table of contents grouped by forum path.
    pub fn write_index(&self, entries: &[IndexEntry]) -> Result<PathBuf, PersistenceError> {
        let mut groups: BTreeMap<&[String], Vec<&IndexEntry>> = BTreeMap::new();
        for entry in entries {
            groups.entry(entry.forum_path.as_slice()).or_default().push(entry);
        }

        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str("<title>Forum archive</title>\n");
        html.push_str(&format!("<style>{}</style>\n</head>\n<body>\n", STYLESHEET));
        html.push_str(&format!(
            "<h1>Forum archive</h1>\n<p>{} threads</p>\n",
            entries.len()
        ));

        for (forum_path, mut threads) in groups {
            threads.sort_by(|a, b| {
                a.title
                    .to_lowercase()
                    .cmp(&b.title.to_lowercase())
                    .then_with(|| a.thread_id.cmp(&b.thread_id))
            });
            let heading = if forum_path.is_empty() {
                "Uncategorized".to_string()
            } else {
                forum_path
                    .iter()
                    .map(|s| escape_html(s))
                    .collect::<Vec<_>>()
                    .join(" &rsaquo; ")
            };
            html.push_str(&format!("<section>\n<h2>{}</h2>\n<ul>\n", heading));
            for thread in threads {
                html.push_str(&format!(
                    "<li><a href=\"{}\">{}</a> <small>({} posts{})</small></li>\n",
                    escape_html(&thread.html_path),
                    escape_html(&thread.title),
                    thread.post_count,
                    if thread.partial { ", incomplete" } else { "" }
                ));
            }
            html.push_str("</ul>\n</section>\n");
        }
        html.push_str("</body>\n</html>\n");

        let path = self.out_dir.join(INDEX_FILE);
        write_bytes_atomic(&path, html.as_bytes()).map_err(|e| PersistenceError::io(&path, e))?;
        Ok(path)
    }

    /// Re-render every thread page and the index from the JSON exports on disk.
    /// Unreadable exports are reported and skipped.
    pub fn rebuild(&self) -> Result<RebuildReport, PersistenceError> {
        let threads_dir = self.out_dir.join(THREADS_DIR);
        let mut report = RebuildReport::default();
        if !threads_dir.is_dir() {
            self.write_index(&report.threads)?;
            return Ok(report);
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&threads_dir)
            .map_err(|e| PersistenceError::io(&threads_dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut exports = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_export(&path) {
                Ok(export) => exports.push(export),
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    report.failures.push((path, e.to_string()));
                }
            }
        }

        let mut map = UrlRewriteMap::new();
        let records: Vec<ThreadRecord> = exports.iter().map(ThreadExport::to_record).collect();
        for (export, record) in exports.iter().zip(&records) {
            for (url, asset) in export.resolved_media() {
                map.insert_media(url, asset);
            }
            map.register_thread(record);
        }

        for record in &records {
            match self.write_html(record, &map) {
                Ok(_) => report.threads.push(IndexEntry::for_record(record)),
                Err(e) => {
                    warn!("Could not re-render thread {}: {}", record.thread_id, e);
                    report
                        .failures
                        .push((self.out_dir.join(thread_json_path(&record.thread_id)), e.to_string()));
                }
            }
        }
        self.write_index(&report.threads)?;
        info!(
            "Rebuilt {} thread pages in {} ({} failures)",
            report.threads.len(),
            self.out_dir.display(),
            report.failures.len()
        );
        Ok(report)
    }
}

fn render_post(html: &mut String, post: &PostRecord, index: usize, resolver: &LinkResolver<'_>) {
    let (class, badge) = if index == 0 {
        ("post original-post", "Original post".to_string())
    } else {
        ("post reply", format!("Reply #{}", index))
    };
    let (datetime, shown) = format_timestamp(post.timestamp_utc);

    html.push_str(&format!(
        "<article class=\"{}\" id=\"post-{}\">\n<header>",
        class,
        escape_html(&post.post_id)
    ));
    if let Some(avatar) = post.media_refs.iter().find(|m| m.kind == MediaKind::Avatar) {
        html.push_str(&format!(
            "<img class=\"avatar\" src=\"{}\" alt=\"\">",
            escape_html(&resolver.resolve_or_remote(&avatar.remote_url))
        ));
    }
    let author = if post.author.is_empty() {
        "Unknown".to_string()
    } else {
        escape_html(&post.author)
    };
    html.push_str(&format!(
        "<span class=\"badge\">{}</span> <span class=\"author\">{}</span> ",
        badge, author
    ));
    if datetime.is_empty() {
        html.push_str(&format!("<time>{}</time>", shown));
    } else {
        html.push_str(&format!("<time datetime=\"{}\">{}</time>", datetime, shown));
    }
    html.push_str("</header>\n");

    html.push_str("<div class=\"post-body\">");
    html.push_str(&resolver.rewrite(&post.content_html));
    html.push_str("</div>\n");

    let attachments: Vec<&MediaRef> = post
        .media_refs
        .iter()
        .filter(|m| m.kind == MediaKind::Attachment)
        .collect();
    if !attachments.is_empty() {
        html.push_str("<ul class=\"attachments\">\n");
        for attachment in attachments {
            let label = attachment
                .remote_url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(&attachment.remote_url);
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                escape_html(&resolver.resolve_or_remote(&attachment.remote_url)),
                escape_html(label)
            ));
        }
        html.push_str("</ul>\n");
    }
    html.push_str("</article>\n");
}
