//! Platform extraction rules.
//!
//! A ruleset knows where a forum theme keeps thread titles, breadcrumbs,
//! pagination and posts, and how its URLs encode thread ids and page numbers.
//! Rules are data: every built-in is a [`RulesetSpec`] that can be dumped to
//! JSON, edited, and loaded back from a file for themes the presets miss.

pub mod phpbb;
pub mod selector;
pub mod vbulletin;
pub mod xenforo;

use scraper::{ElementRef, Html};
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::json_utils::read_json_file;

pub use selector::{RulesetSpec, SelectorRuleset};

pub const BUILTIN_RULESETS: &[&str] = &["xenforo", "vbulletin", "phpbb"];

/// Thread-level fields read from a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadMetadata {
    pub title: Option<String>,
    pub forum_path: Vec<String>,
    /// Highest page number referenced by the pagination widget.
    pub last_page: Option<u32>,
}

/// One post as located by a ruleset, before normalization.
#[derive(Debug, Clone)]
pub struct RawPost<'a> {
    pub post_id: Option<String>,
    pub author: Option<String>,
    /// Attribute values and text that may hold the post date, best first.
    pub timestamp_candidates: Vec<String>,
    pub content: Option<ElementRef<'a>>,
    pub avatar_url: Option<String>,
    pub attachment_urls: Vec<String>,
}

pub trait Ruleset: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Thread id encoded in a page URL, if the URL addresses a thread.
    fn thread_id(&self, url: &str) -> Option<String>;

    /// Page number encoded in a URL. `None` means the first page.
    fn page_number(&self, url: &str) -> Option<u32>;

    fn thread_metadata(&self, document: &Html) -> ThreadMetadata;

    fn posts<'a>(&self, document: &'a Html) -> Vec<RawPost<'a>>;

    /// Raw hrefs worth following.
    fn links(&self, document: &Html) -> Vec<String>;

    /// `strftime` formats for dates shown without a machine-readable attribute.
    fn timestamp_formats(&self) -> &[String];

    /// Path/query patterns of action pages that must never be crawled.
    fn excluded_url_patterns(&self) -> &[String];

    /// Query parameters that carry identity on this platform.
    fn default_query_params(&self) -> &[String];
}

pub fn builtin_spec(name: &str) -> Option<RulesetSpec> {
    match name.trim().to_ascii_lowercase().as_str() {
        "xenforo" => Some(xenforo::spec()),
        "vbulletin" => Some(vbulletin::spec()),
        "phpbb" => Some(phpbb::spec()),
        _ => None,
    }
}

/// Resolve a built-in name or a path to a ruleset JSON file.
pub fn load_ruleset(identifier: &str) -> Result<Arc<dyn Ruleset>, ConfigError> {
    let spec = match builtin_spec(identifier) {
        Some(spec) => spec,
        None => {
            let path = Path::new(identifier.trim());
            if !path.is_file() {
                return Err(ConfigError::UnknownRuleset(identifier.to_string()));
            }
            read_json_file::<RulesetSpec>(path)?
        }
    };
    Ok(Arc::new(SelectorRuleset::from_spec(spec)?))
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
