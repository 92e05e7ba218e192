//! XenForo 2 themes.
//!
//! Thread URLs look like `/threads/some-title.123/` with later pages at
//! `/threads/some-title.123/page-4`. Each post is an `article.message`
//! carrying its author in `data-author` and its id in `data-content`.

use super::RulesetSpec;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn spec() -> RulesetSpec {
    RulesetSpec {
        name: "xenforo".to_string(),
        thread_id_patterns: strings(&[r"/threads/(?:[^/?#]*\.)?(\d+)(?:/|$|\?)"]),
        page_patterns: strings(&[r"/page-(\d+)", r"[?&]page=(\d+)"]),
        page_size: None,
        title_selectors: strings(&["h1.p-title-value", "h1", "title"]),
        breadcrumb_selector: Some(".p-breadcrumbs a".to_string()),
        breadcrumb_ignore: strings(&["Home", "Forums"]),
        pagination_selector: Some(".pageNav-main a".to_string()),
        post_selector: "article.message".to_string(),
        post_id_attributes: strings(&["data-content", "id"]),
        post_id_pattern: r"(\d+)".to_string(),
        author_attribute: Some("data-author".to_string()),
        author_selectors: strings(&[".message-name .username", ".message-name", ".username"]),
        timestamp_selectors: strings(&["time.u-dt", "time", ".message-userContent"]),
        timestamp_formats: strings(&["%b %d, %Y at %I:%M %p", "%b %e, %Y at %I:%M %p"]),
        content_selectors: strings(&[".message-body .bbWrapper", ".bbWrapper", ".message-content"]),
        avatar_selector: Some(".message-avatar img".to_string()),
        attachment_selector: Some(".attachmentList a.file-preview, .attachmentList a[href]".to_string()),
        link_selector: "a[href]".to_string(),
        excluded_url_patterns: strings(&[
            r"/login",
            r"/logout",
            r"/register",
            r"/lost-password",
            r"/search",
            r"/account/",
            r"/conversations/",
            r"/members/",
            r"/posts/\d+",
            r"/post-\d+",
            r"/whats-new",
            r"/find-threads/",
            r"/online/",
            r"/misc/",
            r"/help/",
            r"/goto/",
            r"/reactions",
            r"/attachments/",
            r"/data/",
            r"/threads/[^/]+/(?:reply|watch|unread|latest|preview|add-reply|approve|draft|threadmarks)",
            r"/forums/[^/]+/(?:post-thread|watch|mark-read)",
            r"[?&]_xf(?:Token|Redirect)=",
        ]),
        default_query_params: strings(&["page"]),
    }
}
