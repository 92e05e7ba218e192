//! Reduces raw links to the identity key used for deduplication.
//!
//! Canonicalization never touches the network or the filesystem: the same raw
//! input with the same configuration always yields the same output, and feeding
//! an output back in returns it unchanged.

use regex::{Regex, RegexBuilder};
use std::collections::BTreeSet;
use thiserror::Error;
use url::Url;

use crate::models::CanonicalUrl;
use crate::url_utils::{is_non_navigable, is_same_site, strip_www};

/// Parameter values that address the first page and therefore add nothing to identity.
const DEFAULT_VALUED_PARAMS: &[(&str, &str)] = &[("page", "1"), ("start", "0")];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed URL: {0}")]
    Malformed(String),

    #[error("link does not lead to a document")]
    NonNavigable,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("outside crawl scope: {0}")]
    OutOfScope(String),

    #[error("non-content URL: {0}")]
    NonContent(String),
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    scope_host: String,
    scope_path: String,
    allowed_params: BTreeSet<String>,
    excluded: Vec<Regex>,
}

impl Canonicalizer {
    /// Scope is the host of `base` plus everything at or below `scope_path`.
    /// `excluded_patterns` are case-insensitive regexes matched against path and
    /// query, both as linked and as normalized.
    pub fn new<I, S>(
        base: &Url,
        scope_path: &str,
        allowed_params: I,
        excluded_patterns: &[String],
    ) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let excluded = excluded_patterns
            .iter()
            .map(|pattern| RegexBuilder::new(pattern).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;

        let scope_path = if scope_path.starts_with('/') {
            scope_path.to_string()
        } else {
            format!("/{}", scope_path)
        };

        Ok(Self {
            scope_host: strip_www(&base.host_str().unwrap_or_default().to_ascii_lowercase())
                .to_string(),
            scope_path,
            allowed_params: allowed_params
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .collect(),
            excluded,
        })
    }

    /// Resolve `raw` against `base` (when relative) and normalize it.
    pub fn canonicalize(&self, raw: &str, base: Option<&Url>) -> Result<CanonicalUrl, Rejection> {
        if is_non_navigable(raw) {
            return Err(Rejection::NonNavigable);
        }

        let trimmed = raw.trim();
        let parsed = match base {
            Some(base) => base.join(trimmed),
            None => Url::parse(trimmed),
        }
        .map_err(|e| Rejection::Malformed(format!("{}: {}", trimmed, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Rejection::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| Rejection::Malformed(format!("{}: missing host", trimmed)))?;
        if !is_same_site(host, &self.scope_host) || !within_scope(parsed.path(), &self.scope_path) {
            return Err(Rejection::OutOfScope(parsed.to_string()));
        }
        if self.is_excluded(&parsed) {
            return Err(Rejection::NonContent(parsed.to_string()));
        }

        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
            .filter(|(k, v)| self.allowed_params.contains(k) && !v.is_empty())
            .filter(|(k, v)| {
                !DEFAULT_VALUED_PARAMS
                    .iter()
                    .any(|(name, value)| k == name && v == value)
            })
            .collect();
        pairs.sort();
        pairs.dedup();

        let mut normalized = parsed;
        normalized.set_fragment(None);
        normalized.set_query(None);
        if !pairs.is_empty() {
            normalized.query_pairs_mut().extend_pairs(pairs.iter());
        }
        // The canonical form must not be rejected when fed back in.
        if self.is_excluded(&normalized) {
            return Err(Rejection::NonContent(normalized.to_string()));
        }

        Ok(CanonicalUrl::from_normalized(normalized.into()))
    }

    fn is_excluded(&self, url: &Url) -> bool {
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        self.excluded.iter().any(|re| re.is_match(&target))
    }

    /// Canonicalize an absolute URL.
    pub fn canonicalize_absolute(&self, raw: &str) -> Result<CanonicalUrl, Rejection> {
        self.canonicalize(raw, None)
    }
}

/// `/board` covers `/board` and `/board/...` but not `/boardgames`.
fn within_scope(path: &str, scope_path: &str) -> bool {
    let scope = scope_path.trim_end_matches('/');
    path.strip_prefix(scope)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
