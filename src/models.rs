use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable crawl identity of a page. Only the canonicalizer constructs these from raw input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub(crate) fn from_normalized(url: String) -> Self {
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A scheduled crawl target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierEntry {
    pub url: CanonicalUrl,
    pub depth: u32,
    pub parent: Option<CanonicalUrl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Avatar,
    Attachment,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Avatar => "avatar",
            MediaKind::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    #[serde(rename = "remoteURL")]
    pub remote_url: String,
    pub kind: MediaKind,
    pub referencing_post_id: String,
}

/// A mirrored asset. `local_path` is relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub local_path: PathBuf,
    pub content_type: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub post_id: String,
    pub author: String,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: Option<DateTime<Utc>>,
    pub content_html: String,
    pub content_text: String,
    pub media_refs: Vec<MediaRef>,
}

/// Posts and metadata extracted from one page of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    pub thread_id: String,
    pub page_number: u32,
    pub title: String,
    pub forum_path: Vec<String>,
    pub page_count: u32,
    pub posts: Vec<PostRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub thread_id: String,
    pub title: String,
    pub forum_path: Vec<String>,
    pub posts: Vec<PostRecord>,
    pub page_count: u32,
    pub source_urls: Vec<CanonicalUrl>,
    pub partial: bool,
    pub missing_pages: Vec<u32>,
}

impl ThreadRecord {
    pub fn media_refs(&self) -> impl Iterator<Item = &MediaRef> {
        self.posts.iter().flat_map(|post| post.media_refs.iter())
    }
}
