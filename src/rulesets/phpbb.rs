//! phpBB 3 (prosilver and derivatives).
//!
//! Later pages of a topic are addressed by item offset (`&start=20`), so
//! page numbers are derived from the offset and the board's posts-per-page.

use super::RulesetSpec;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// phpBB's stock posts-per-page setting.
pub const DEFAULT_POSTS_PER_PAGE: u32 = 10;

pub fn spec() -> RulesetSpec {
    RulesetSpec {
        name: "phpbb".to_string(),
        thread_id_patterns: strings(&[r"viewtopic\.php.*[?&]t=(\d+)"]),
        page_patterns: strings(&[r"[?&]start=(\d+)"]),
        page_size: Some(DEFAULT_POSTS_PER_PAGE),
        title_selectors: strings(&["h2.topic-title a", "h2.topic-title", "h3.first a", "title"]),
        breadcrumb_selector: Some(".breadcrumbs .crumb a".to_string()),
        breadcrumb_ignore: strings(&["Board index", "Home", "Index page"]),
        pagination_selector: Some(".pagination a".to_string()),
        post_selector: "div.post".to_string(),
        post_id_attributes: strings(&["id"]),
        post_id_pattern: r"(\d+)".to_string(),
        author_attribute: None,
        author_selectors: strings(&[".author a.username", ".author a.username-coloured", ".author strong"]),
        timestamp_selectors: strings(&[".author time", "time", "p.author"]),
        timestamp_formats: strings(&[
            "%a %b %d, %Y %I:%M %p",
            "%a %b %d, %Y %H:%M",
            "%d %b %Y, %H:%M",
        ]),
        content_selectors: strings(&["div.content"]),
        avatar_selector: Some(".postprofile img.avatar, .postprofile .avatar img".to_string()),
        attachment_selector: Some("dl.attachbox a.postlink, dl.file a[href]".to_string()),
        link_selector: "a[href]".to_string(),
        excluded_url_patterns: strings(&[
            r"ucp\.php",
            r"memberlist\.php",
            r"search\.php",
            r"posting\.php",
            r"report\.php",
            r"mcp\.php",
            r"faq\.php",
            r"download/file\.php",
            r"[?&]view=(?:next|previous|print|unread)",
            r"[?&]mode=",
            r"viewtopic\.php\?(?:[^#]*&)?p=\d+",
            r"[?&]hilit=",
        ]),
        default_query_params: strings(&["t", "f", "start"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rulesets::{Ruleset, SelectorRuleset};
    use scraper::Html;

    const PAGE: &str = r#"
        <html><head><title>Soldering tips - Electronics Board</title></head><body>
        <ul class="breadcrumbs">
          <li><span class="crumb"><a href="./index.php">Board index</a></span>
          <span class="crumb"><a href="./viewforum.php?f=4">Workshop</a></span></li>
        </ul>
        <h2 class="topic-title"><a href="./viewtopic.php?t=812">Soldering tips</a></h2>
        <div class="pagination"><ul>
          <li><a class="button" href="./viewtopic.php?t=812&amp;start=10">2</a></li>
          <li><a class="button" href="./viewtopic.php?t=812&amp;start=20">3</a></li>
        </ul></div>
        <div id="p4410" class="post has-profile bg2">
          <dl class="postprofile"><dt><img class="avatar" src="./download/file.php?avatar=7.png"></dt></dl>
          <div class="postbody">
            <p class="author">by <strong><a class="username" href="./memberlist.php?u=7">flux</a></strong>
              &raquo; <time datetime="2019-06-01T18:30:00+00:00">Sat Jun 01, 2019 6:30 pm</time></p>
            <div class="content">Use more flux.</div>
            <dl class="attachbox"><dd><a class="postlink" href="./download/file.php?id=90">board.jpg</a></dd></dl>
          </div>
        </div></body></html>"#;

    #[test]
    fn test_offset_pagination() {
        let r = SelectorRuleset::from_spec(spec()).unwrap();
        assert_eq!(r.thread_id("https://b.test/viewtopic.php?f=4&t=812"), Some("812".to_string()));
        assert_eq!(r.page_number("https://b.test/viewtopic.php?t=812&start=20"), Some(3));
        assert_eq!(r.page_number("https://b.test/viewtopic.php?t=812"), None);
    }

    #[test]
    fn test_page_extraction() {
        let r = SelectorRuleset::from_spec(spec()).unwrap();
        let document = Html::parse_document(PAGE);

        let meta = r.thread_metadata(&document);
        assert_eq!(meta.title.as_deref(), Some("Soldering tips"));
        assert_eq!(meta.forum_path, vec!["Workshop"]);
        assert_eq!(meta.last_page, Some(3));

        let posts = r.posts(&document);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].post_id.as_deref(), Some("4410"));
        assert_eq!(posts[0].author.as_deref(), Some("flux"));
        assert_eq!(posts[0].timestamp_candidates[0], "2019-06-01T18:30:00+00:00");
        assert_eq!(
            posts[0].attachment_urls,
            vec!["./download/file.php?id=90"]
        );
    }
}
