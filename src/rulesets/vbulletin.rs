//! vBulletin 3/4 themes: `showthread.php?t=123&page=2` or `/threads/123-title/page2`.

use super::RulesetSpec;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn spec() -> RulesetSpec {
    RulesetSpec {
        name: "vbulletin".to_string(),
        thread_id_patterns: strings(&[
            r"showthread\.php.*[?&](?:t|threadid)=(\d+)",
            r"showthread\.php/(\d+)",
            r"/threads/(\d+)",
        ]),
        page_patterns: strings(&[r"[?&]page=(\d+)", r"/page(\d+)"]),
        page_size: None,
        title_selectors: strings(&[
            "span.threadtitle",
            "h1.threadtitle",
            "h2.title",
            "td.navbar strong",
            "title",
        ]),
        breadcrumb_selector: Some("#breadcrumb .navbit a, .navbar a".to_string()),
        breadcrumb_ignore: strings(&["Forum", "Forums", "Home"]),
        pagination_selector: Some("div.pagenav a, .pagination a".to_string()),
        post_selector: "li.postcontainer, table[id^=\"post\"]".to_string(),
        post_id_attributes: strings(&["id"]),
        post_id_pattern: r"(\d+)".to_string(),
        author_attribute: None,
        author_selectors: strings(&["a.username", ".bigusername", ".username"]),
        timestamp_selectors: strings(&["span.date", "td.thead"]),
        timestamp_formats: strings(&[
            "%m-%d-%Y, %I:%M %p",
            "%m-%d-%Y %I:%M %p",
            "%d-%m-%Y, %H:%M",
            "%Y-%m-%d, %H:%M",
        ]),
        content_selectors: strings(&[
            "div[id^=\"post_message_\"]",
            "blockquote.postcontent",
            "div.postcontent",
        ]),
        avatar_selector: Some("a.postuseravatar img, img[alt$=\"Avatar\"]".to_string()),
        attachment_selector: Some(
            "div.attachments a[href], fieldset a[href*=\"attachment.php\"]".to_string(),
        ),
        link_selector: "a[href]".to_string(),
        excluded_url_patterns: strings(&[
            r"login\.php",
            r"register\.php",
            r"search\.php",
            r"private\.php",
            r"member\.php",
            r"memberlist\.php",
            r"newreply\.php",
            r"newthread\.php",
            r"editpost\.php",
            r"report\.php",
            r"profile\.php",
            r"sendmessage\.php",
            r"showpost\.php",
            r"printthread\.php",
            r"attachment\.php",
            r"misc\.php\?do=",
            r"showthread\.php\?(?:[^#]*&)?p=\d+",
            r"[?&]do=(?:logout|newpost|getnew|markread)",
            r"[?&]goto=",
        ]),
        default_query_params: strings(&["t", "threadid", "f", "forumid", "page"]),
    }
}
