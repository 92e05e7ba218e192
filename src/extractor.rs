//! Turns a fetched page into thread records, follow-up links and media references.
//!
//! The extractor never fetches and never deduplicates links; it only reports
//! what the page contains. Missing fields fall back to defaults so a damaged
//! page still yields whatever posts it has.

use chrono::{DateTime, NaiveDateTime, Utc};
use html_escape::decode_html_entities;
use lol_html::{HtmlRewriter, Settings, element};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::fetcher::Document;
use crate::models::{MediaKind, MediaRef, PostRecord, ThreadPage};
use crate::rulesets::{RawPost, Ruleset, collapse_whitespace};
use crate::url_utils::{has_media_extension, is_non_navigable};

/// Elements inside a post body that may reference media.
static INLINE_MEDIA: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("img, video, audio, source, a[href]").expect("Invalid CSS selector")
});

/// URL-bearing attributes rewritten to absolute form in stored post HTML.
const URL_ATTRIBUTES: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("img[src]", "src"),
    ("img[data-src]", "data-src"),
    ("video[src]", "src"),
    ("video[poster]", "poster"),
    ("audio[src]", "src"),
    ("source[src]", "src"),
    ("iframe[src]", "src"),
];

/// Separators forums put between an author name and a date in one caption.
const CAPTION_SEPARATORS: &[char] = &['·', '»', '|'];

#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("{url}: page not recognized by the {ruleset} ruleset")]
    Unrecognized { url: String, ruleset: String },
}

#[derive(Debug, Clone, Default)]
pub struct ExtractResult {
    /// Present when the page belongs to a thread.
    pub thread_page: Option<ThreadPage>,
    /// Raw hrefs, unresolved and undeduplicated.
    pub candidate_links: Vec<String>,
    pub media_refs: Vec<MediaRef>,
}

#[derive(Debug, Clone)]
pub struct PageExtractor {
    ruleset: Arc<dyn Ruleset>,
}

impl PageExtractor {
    pub fn new(ruleset: Arc<dyn Ruleset>) -> Self {
        Self { ruleset }
    }

    pub fn ruleset(&self) -> &Arc<dyn Ruleset> {
        &self.ruleset
    }

    pub fn extract(&self, document: &Document) -> Result<ExtractResult, ExtractError> {
        self.extract_html(&document.html, document.url.as_str(), &document.final_url)
    }

    /// Extract from raw HTML. `source_url` identifies the page; `base` resolves
    /// relative references.
    pub fn extract_html(
        &self,
        html: &str,
        source_url: &str,
        base: &Url,
    ) -> Result<ExtractResult, ExtractError> {
        let document = Html::parse_document(html);
        let metadata = self.ruleset.thread_metadata(&document);
        let raw_posts = self.ruleset.posts(&document);
        let candidate_links = self.ruleset.links(&document);

        if raw_posts.is_empty() && metadata.title.is_none() && candidate_links.is_empty() {
            return Err(ExtractError::Unrecognized {
                url: source_url.to_string(),
                ruleset: self.ruleset.name().to_string(),
            });
        }

        let thread_id = self
            .ruleset
            .thread_id(source_url)
            .or_else(|| self.ruleset.thread_id(base.as_str()));

        let Some(thread_id) = thread_id else {
            return Ok(ExtractResult {
                thread_page: None,
                candidate_links,
                media_refs: Vec::new(),
            });
        };

        let page_number = self
            .ruleset
            .page_number(source_url)
            .or_else(|| self.ruleset.page_number(base.as_str()))
            .unwrap_or(1);

        let posts: Vec<PostRecord> = raw_posts
            .into_iter()
            .enumerate()
            .map(|(index, raw)| self.build_post(raw, &thread_id, page_number, index, base))
            .collect();
        let media_refs = posts
            .iter()
            .flat_map(|post| post.media_refs.iter().cloned())
            .collect();

        Ok(ExtractResult {
            thread_page: Some(ThreadPage {
                page_count: metadata.last_page.unwrap_or(1).max(page_number),
                thread_id,
                page_number,
                title: metadata.title.unwrap_or_else(|| "Untitled".to_string()),
                forum_path: metadata.forum_path,
                posts,
            }),
            candidate_links,
            media_refs,
        })
    }

    fn build_post(
        &self,
        raw: RawPost<'_>,
        thread_id: &str,
        page_number: u32,
        index: usize,
        base: &Url,
    ) -> PostRecord {
        let post_id = raw
            .post_id
            .unwrap_or_else(|| format!("{}-p{}-{}", thread_id, page_number, index + 1));

        let (content_html, content_text) = match raw.content {
            Some(content) => (
                absolutize_fragment(&content.inner_html(), base),
                collapse_whitespace(&content.text().collect::<String>()),
            ),
            None => (String::new(), String::new()),
        };

        let mut media = MediaCollector::new(&post_id, base);
        if let Some(avatar) = &raw.avatar_url {
            media.push(avatar, MediaKind::Avatar);
        }
        if let Some(content) = raw.content {
            media.collect_inline(content);
        }
        for attachment in &raw.attachment_urls {
            media.push(attachment, MediaKind::Attachment);
        }

        PostRecord {
            timestamp_utc: parse_timestamp(&raw.timestamp_candidates, self.ruleset.timestamp_formats()),
            author: raw.author.unwrap_or_default(),
            content_html,
            content_text,
            media_refs: media.into_refs(),
            post_id,
        }
    }
}

/// Accumulates a post's media references in document order, once per URL.
struct MediaCollector<'a> {
    post_id: &'a str,
    base: &'a Url,
    seen: HashSet<String>,
    refs: Vec<MediaRef>,
}

impl<'a> MediaCollector<'a> {
    fn new(post_id: &'a str, base: &'a Url) -> Self {
        Self {
            post_id,
            base,
            seen: HashSet::new(),
            refs: Vec::new(),
        }
    }

    fn push(&mut self, raw: &str, kind: MediaKind) {
        let Some(remote_url) = resolve_media_url(raw, self.base) else {
            return;
        };
        if self.seen.insert(remote_url.clone()) {
            self.refs.push(MediaRef {
                remote_url,
                kind,
                referencing_post_id: self.post_id.to_string(),
            });
        }
    }

    fn collect_inline(&mut self, content: ElementRef<'_>) {
        for element in content.select(&INLINE_MEDIA) {
            let value = element.value();
            match value.name() {
                "img" => {
                    let lazy = value.attr("data-src").or_else(|| value.attr("data-url"));
                    if let Some(src) = lazy.or_else(|| value.attr("src")) {
                        self.push(src, MediaKind::Image);
                    }
                }
                "video" | "audio" | "source" => {
                    if let Some(src) = value.attr("src") {
                        self.push(src, MediaKind::Image);
                    }
                    if let Some(poster) = value.attr("poster") {
                        self.push(poster, MediaKind::Image);
                    }
                }
                "a" => {
                    if let Some(href) = value.attr("href")
                        && has_media_extension(href)
                    {
                        self.push(href, MediaKind::Attachment);
                    }
                }
                _ => {}
            }
        }
    }

    fn into_refs(self) -> Vec<MediaRef> {
        self.refs
    }
}

/// Absolute http(s) URL for a media reference. Inline `data:` URIs pass through.
fn resolve_media_url(raw: &str, base: &Url) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() > 5 && trimmed[..5].eq_ignore_ascii_case("data:") {
        return Some(trimmed.to_string());
    }
    if is_non_navigable(trimmed) {
        return None;
    }
    let url = base.join(trimmed).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// `raw` is an attribute value as lol_html reports it, entities not yet decoded.
fn absolute_reference(raw: &str, base: &Url) -> Option<String> {
    let decoded = decode_html_entities(raw.trim());
    if is_non_navigable(&decoded) {
        return None;
    }
    base.join(&decoded).ok().map(|u| u.to_string())
}

/// Rewrite every URL attribute of a post body to absolute form, promote lazy
/// `data-src` images to `src`, and drop scripts.
pub fn absolutize_fragment(html: &str, base: &Url) -> String {
    let mut handlers = vec![element!("script", |el| {
        el.remove();
        Ok(())
    })];

    for &(selector, attr) in URL_ATTRIBUTES {
        handlers.push(element!(selector, move |el| {
            if let Some(value) = el.get_attribute(attr)
                && let Some(absolute) = absolute_reference(&value, base)
            {
                el.set_attribute(attr, &absolute)?;
            }
            Ok(())
        }));
    }

    handlers.push(element!("img[data-src]", move |el| {
        if let Some(lazy) = el.get_attribute("data-src") {
            let src = absolute_reference(&lazy, base).unwrap_or(lazy);
            el.set_attribute("src", &src)?;
        }
        Ok(())
    }));

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
            warn!("Could not rewrite post body against {}: {}", base, e);
            html.to_string()
        }
    }
}

/// First candidate that parses as a date. Naive formats are read as UTC.
pub fn parse_timestamp(candidates: &[String], formats: &[String]) -> Option<DateTime<Utc>> {
    candidates.iter().find_map(|candidate| {
        let trimmed = candidate.trim();
        parse_one(trimmed, formats).or_else(|| {
            let (_, tail) = trimmed.rsplit_once(CAPTION_SEPARATORS)?;
            parse_one(tail.trim(), formats)
        })
    })
}

fn parse_one(value: &str, formats: &[String]) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }
    if value.len() >= 9 && value.len() <= 11 && value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(parsed.with_timezone(&Utc));
    }
    formats.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(value, format)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rulesets::load_ruleset;
    use crate::testing::{FixturePost, xenforo_thread_page};
    use chrono::TimeZone;

    fn extractor() -> PageExtractor {
        PageExtractor::new(load_ruleset("xenforo").unwrap())
    }

    fn base(path: &str) -> Url {
        Url::parse(&format!("https://forum.test{}", path)).unwrap()
    }

    #[test]
    fn test_extract_thread_page() {
        let html = xenforo_thread_page(
            "Lens cleaning",
            "/threads/lens-cleaning.42/",
            2,
            3,
            &[
                FixturePost::new(501, "ann", "2023-04-01T12:00:00+0000", "Use a <a href=\"/wiki/blower\">blower</a>.")
                    .with_image("/data/attachments/5/5-lens.jpg"),
                FixturePost::new(502, "ben", "2023-04-01T13:30:00+0200", "Agreed"),
            ],
        );
        let page_url = "https://forum.test/threads/lens-cleaning.42/page-2";
        let result = extractor()
            .extract_html(&html, page_url, &base("/threads/lens-cleaning.42/page-2"))
            .unwrap();

        let page = result.thread_page.unwrap();
        assert_eq!(page.thread_id, "42");
        assert_eq!(page.page_number, 2);
        assert_eq!(page.page_count, 3);
        assert_eq!(page.title, "Lens cleaning");
        assert_eq!(page.forum_path, vec!["General", "Help"]);
        assert_eq!(page.posts.len(), 2);

        let first = &page.posts[0];
        assert_eq!(first.post_id, "501");
        assert_eq!(first.author, "ann");
        assert_eq!(
            first.timestamp_utc,
            Some(Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap())
        );
        assert!(first.content_html.contains("href=\"https://forum.test/wiki/blower\""));
        assert!(first.content_html.contains("src=\"https://forum.test/data/attachments/5/5-lens.jpg\""));
        assert_eq!(first.content_text, "Use a blower.");

        let kinds: Vec<_> = first.media_refs.iter().map(|m| (m.kind, m.remote_url.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (MediaKind::Avatar, "https://forum.test/data/avatars/m/0/ann.jpg"),
                (MediaKind::Image, "https://forum.test/data/attachments/5/5-lens.jpg"),
            ]
        );
        assert!(first.media_refs.iter().all(|m| m.referencing_post_id == "501"));

        assert_eq!(
            page.posts[1].timestamp_utc,
            Some(Utc.with_ymd_and_hms(2023, 4, 1, 11, 30, 0).unwrap())
        );
        assert_eq!(result.media_refs.len(), 3);
        assert!(result.candidate_links.iter().any(|l| l == "/threads/lens-cleaning.42/page-3"));
        assert!(result.candidate_links.iter().any(|l| l.starts_with("mailto:")));
    }

    #[test]
    fn test_non_thread_page_yields_links_only() {
        let html = r#"<html><head><title>Help</title></head><body>
            <div class="structItem"><a href="/threads/a.1/">A</a><a href="/threads/b.2/">B</a></div>
            </body></html>"#;
        let result = extractor()
            .extract_html(html, "https://forum.test/forums/help.2/", &base("/forums/help.2/"))
            .unwrap();
        assert!(result.thread_page.is_none());
        assert_eq!(result.candidate_links, vec!["/threads/a.1/", "/threads/b.2/"]);
    }

    #[test]
    fn test_missing_fields_degrade_to_defaults() {
        let html = r#"<html><body>
            <article class="message"><div class="bbWrapper">orphan text</div></article>
            </body></html>"#;
        let result = extractor()
            .extract_html(html, "https://forum.test/threads/x.9/", &base("/threads/x.9/"))
            .unwrap();
        let page = result.thread_page.unwrap();
        assert_eq!(page.title, "Untitled");
        assert_eq!(page.page_count, 1);
        let post = &page.posts[0];
        assert_eq!(post.post_id, "9-p1-1");
        assert_eq!(post.author, "");
        assert_eq!(post.timestamp_utc, None);
        assert_eq!(post.content_text, "orphan text");
    }

    #[test]
    fn test_unrecognized_document() {
        let err = extractor()
            .extract_html("<html><body><p>maintenance</p></body></html>", "https://forum.test/x", &base("/x"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unrecognized { .. }));
    }

    #[test]
    fn test_lazy_images_and_data_uris() {
        let html = r#"<html><body><article class="message" data-content="post-7">
            <div class="bbWrapper">
              <img src="data:image/gif;base64,R0lGODlhAQABAAAAACw=" data-src="/img/real.png">
              <img src="data:image/png;base64,iVBORw0KGgo=">
              <a href="/files/manual.pdf">manual</a>
              <a href="/threads/other.3/">not media</a>
              <script>alert(1)</script>
            </div></article></body></html>"#;
        let result = extractor()
            .extract_html(html, "https://forum.test/threads/y.5/", &base("/threads/y.5/"))
            .unwrap();
        let post = &result.thread_page.unwrap().posts[0];

        let urls: Vec<_> = post.media_refs.iter().map(|m| m.remote_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://forum.test/img/real.png",
                "data:image/png;base64,iVBORw0KGgo=",
                "https://forum.test/files/manual.pdf",
            ]
        );
        assert_eq!(post.media_refs[2].kind, MediaKind::Attachment);
        assert!(post.content_html.contains("src=\"https://forum.test/img/real.png\""));
        assert!(!post.content_html.contains("<script"));
    }

    #[test]
    fn test_absolutize_decodes_entities_in_urls() {
        let page = Url::parse("https://forum.test/showthread.php?t=9").unwrap();
        let html = absolutize_fragment(
            "<img src=\"attachment.php?attachmentid=5&amp;d=123\"><a href=\"&#x2F;threads&#47;x.3/\">x</a>",
            &page,
        );
        assert!(html.contains("src=\"https://forum.test/attachment.php?attachmentid=5&d=123\""));
        assert!(html.contains("href=\"https://forum.test/threads/x.3/\""));
        assert!(!html.contains("&amp;"));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let formats = vec!["%b %d, %Y at %I:%M %p".to_string()];
        let expected = Utc.with_ymd_and_hms(2020, 1, 2, 15, 4, 0).unwrap();

        for candidate in [
            "2020-01-02T15:04:00Z",
            "2020-01-02T16:04:00+0100",
            "1577977440",
            "Jan 02, 2020 at 3:04 PM",
            "alice · Jan 02, 2020 at 03:04 PM",
        ] {
            assert_eq!(
                parse_timestamp(&[candidate.to_string()], &formats),
                Some(expected),
                "{}",
                candidate
            );
        }
        assert_eq!(parse_timestamp(&["yesterday".to_string()], &formats), None);
        assert_eq!(
            parse_timestamp(&["junk".to_string(), "1577977440".to_string()], &formats),
            Some(expected)
        );
    }
}
