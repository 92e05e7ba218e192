//! Ruleset driven entirely by CSS selectors and URL regexes.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::{RawPost, Ruleset, ThreadMetadata, collapse_whitespace};
use crate::config::ConfigError;

/// Serializable description of a forum theme. Selector lists are tried in order
/// and the first one that yields something wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetSpec {
    pub name: String,
    /// Regexes over the page URL; capture group 1 is the thread id.
    pub thread_id_patterns: Vec<String>,
    /// Regexes over the page URL; capture group 1 is the page (or item offset).
    pub page_patterns: Vec<String>,
    /// When set, page patterns capture an item offset and the page is
    /// `offset / page_size + 1`.
    #[serde(default)]
    pub page_size: Option<u32>,
    pub title_selectors: Vec<String>,
    #[serde(default)]
    pub breadcrumb_selector: Option<String>,
    /// Breadcrumb labels dropped from the forum path (case-insensitive).
    #[serde(default)]
    pub breadcrumb_ignore: Vec<String>,
    #[serde(default)]
    pub pagination_selector: Option<String>,
    pub post_selector: String,
    /// Attributes on the post element holding its id, tried in order.
    pub post_id_attributes: Vec<String>,
    /// Capture group 1 of this regex over the attribute value is the post id.
    pub post_id_pattern: String,
    #[serde(default)]
    pub author_attribute: Option<String>,
    pub author_selectors: Vec<String>,
    pub timestamp_selectors: Vec<String>,
    #[serde(default)]
    pub timestamp_formats: Vec<String>,
    pub content_selectors: Vec<String>,
    #[serde(default)]
    pub avatar_selector: Option<String>,
    #[serde(default)]
    pub attachment_selector: Option<String>,
    pub link_selector: String,
    #[serde(default)]
    pub excluded_url_patterns: Vec<String>,
    #[serde(default)]
    pub default_query_params: Vec<String>,
}

/// Attributes that may carry a machine-readable post date.
const TIMESTAMP_ATTRIBUTES: &[&str] = &[
    "datetime",
    "data-time",
    "data-timestamp",
    "data-lb-caption-desc",
    "title",
];

#[derive(Debug)]
pub struct SelectorRuleset {
    spec: RulesetSpec,
    thread_id_patterns: Vec<Regex>,
    page_patterns: Vec<Regex>,
    title: Vec<Selector>,
    breadcrumb: Option<Selector>,
    pagination: Option<Selector>,
    post: Selector,
    post_id_pattern: Regex,
    author: Vec<Selector>,
    timestamp: Vec<Selector>,
    content: Vec<Selector>,
    avatar: Option<Selector>,
    attachment: Option<Selector>,
    links: Selector,
}

fn compile_selector(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|e| ConfigError::Pattern(format!("{}: {:?}", selector, e)))
}

fn compile_selectors(selectors: &[String]) -> Result<Vec<Selector>, ConfigError> {
    selectors.iter().map(|s| compile_selector(s)).collect()
}

fn compile_regex(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::Pattern(format!("{}: {}", pattern, e)))
}

fn compile_regexes(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns.iter().map(|p| compile_regex(p)).collect()
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn first_capture(patterns: &[Regex], haystack: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(haystack)?.get(1).map(|m| m.as_str().to_string()))
}

impl SelectorRuleset {
    pub fn from_spec(spec: RulesetSpec) -> Result<Self, ConfigError> {
        for pattern in &spec.excluded_url_patterns {
            compile_regex(pattern)?;
        }

        Ok(Self {
            thread_id_patterns: compile_regexes(&spec.thread_id_patterns)?,
            page_patterns: compile_regexes(&spec.page_patterns)?,
            title: compile_selectors(&spec.title_selectors)?,
            breadcrumb: spec.breadcrumb_selector.as_deref().map(compile_selector).transpose()?,
            pagination: spec.pagination_selector.as_deref().map(compile_selector).transpose()?,
            post: compile_selector(&spec.post_selector)?,
            post_id_pattern: compile_regex(&spec.post_id_pattern)?,
            author: compile_selectors(&spec.author_selectors)?,
            timestamp: compile_selectors(&spec.timestamp_selectors)?,
            content: compile_selectors(&spec.content_selectors)?,
            avatar: spec.avatar_selector.as_deref().map(compile_selector).transpose()?,
            attachment: spec.attachment_selector.as_deref().map(compile_selector).transpose()?,
            links: compile_selector(&spec.link_selector)?,
            spec,
        })
    }

    fn first_text(&self, scope: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
        selectors.iter().find_map(|selector| {
            scope
                .select(selector)
                .map(element_text)
                .find(|text| !text.is_empty())
        })
    }

    fn post_id(&self, post: ElementRef<'_>) -> Option<String> {
        self.spec.post_id_attributes.iter().find_map(|attr| {
            let value = post.value().attr(attr)?;
            self.post_id_pattern
                .captures(value)?
                .get(1)
                .map(|m| m.as_str().to_string())
        })
    }

    fn author(&self, post: ElementRef<'_>) -> Option<String> {
        self.spec
            .author_attribute
            .as_deref()
            .and_then(|attr| post.value().attr(attr))
            .map(collapse_whitespace)
            .filter(|name| !name.is_empty())
            .or_else(|| self.first_text(post, &self.author))
    }

    fn timestamp_candidates(&self, post: ElementRef<'_>) -> Vec<String> {
        let mut candidates = Vec::new();
        for selector in &self.timestamp {
            let Some(element) = post.select(selector).next() else {
                continue;
            };
            for attr in TIMESTAMP_ATTRIBUTES {
                if let Some(value) = element.value().attr(attr) {
                    let value = value.trim();
                    if !value.is_empty() {
                        candidates.push(value.to_string());
                    }
                }
            }
            let text = element_text(element);
            if !text.is_empty() {
                candidates.push(text);
            }
        }
        candidates
    }

    fn media_source(element: ElementRef<'_>) -> Option<String> {
        let value = element.value();
        value
            .attr("data-src")
            .or_else(|| value.attr("data-url"))
            .or_else(|| value.attr("href"))
            .or_else(|| value.attr("src"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl Ruleset for SelectorRuleset {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn thread_id(&self, url: &str) -> Option<String> {
        first_capture(&self.thread_id_patterns, url)
    }

    fn page_number(&self, url: &str) -> Option<u32> {
        let captured: u32 = first_capture(&self.page_patterns, url)?.parse().ok()?;
        match self.spec.page_size {
            Some(size) if size > 0 => Some(captured / size + 1),
            _ => Some(captured.max(1)),
        }
    }

    fn thread_metadata(&self, document: &Html) -> ThreadMetadata {
        let root = document.root_element();
        let title = self.first_text(root, &self.title);

        let mut forum_path: Vec<String> = Vec::new();
        if let Some(selector) = &self.breadcrumb {
            for label in document.select(selector).map(element_text) {
                let ignored = self
                    .spec
                    .breadcrumb_ignore
                    .iter()
                    .any(|skip| skip.eq_ignore_ascii_case(&label));
                if label.is_empty() || ignored || forum_path.last() == Some(&label) {
                    continue;
                }
                forum_path.push(label);
            }
        }

        let last_page = self.pagination.as_ref().and_then(|selector| {
            document
                .select(selector)
                .flat_map(|link| {
                    let from_text = element_text(link).parse::<u32>().ok();
                    let from_href = link
                        .value()
                        .attr("href")
                        .and_then(|href| self.page_number(href));
                    [from_text, from_href]
                })
                .flatten()
                .max()
        });

        ThreadMetadata {
            title,
            forum_path,
            last_page,
        }
    }

    fn posts<'a>(&self, document: &'a Html) -> Vec<RawPost<'a>> {
        document
            .select(&self.post)
            .map(|post| {
                let content = self
                    .content
                    .iter()
                    .find_map(|selector| post.select(selector).next());
                let avatar_url = self
                    .avatar
                    .as_ref()
                    .and_then(|selector| post.select(selector).find_map(Self::media_source));
                let attachment_urls = self
                    .attachment
                    .as_ref()
                    .map(|selector| post.select(selector).filter_map(Self::media_source).collect())
                    .unwrap_or_default();

                RawPost {
                    post_id: self.post_id(post),
                    author: self.author(post),
                    timestamp_candidates: self.timestamp_candidates(post),
                    content,
                    avatar_url,
                    attachment_urls,
                }
            })
            .collect()
    }

    fn links(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.links)
            .filter_map(|a| a.value().attr("href"))
            .map(|href| href.trim().to_string())
            .filter(|href| !href.is_empty())
            .collect()
    }

    fn timestamp_formats(&self) -> &[String] {
        &self.spec.timestamp_formats
    }

    fn excluded_url_patterns(&self) -> &[String] {
        &self.spec.excluded_url_patterns
    }

    fn default_query_params(&self) -> &[String] {
        &self.spec.default_query_params
    }
}
