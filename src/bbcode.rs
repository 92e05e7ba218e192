//! BBCode rendition of archived post bodies, so a post can be pasted back into a forum.

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::sync::LazyLock;

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("Invalid blank-line pattern"));

/// Convert post HTML to BBCode. Unknown elements keep only their text; scripts,
/// styles and other non-content elements are dropped.
pub fn html_to_bbcode(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = inner(fragment.root_element());
    BLANK_RUNS.replace_all(&text, "\n\n").trim().to_string()
}

fn inner(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    out.push_str(&convert(child));
                }
            }
            _ => {}
        }
    }
    out
}

fn convert(element: ElementRef<'_>) -> String {
    let tag = element.value().name();
    if matches!(tag, "script" | "style" | "head" | "meta" | "link" | "noscript") {
        return String::new();
    }
    let attr = |name: &str| element.value().attr(name).map(str::trim).filter(|v| !v.is_empty());

    match tag {
        "img" => match attr("src") {
            Some(src) if src.starts_with("data:") => "[IMG]<embedded>[/IMG]".to_string(),
            Some(src) => format!("[IMG]{}[/IMG]", src),
            None => String::new(),
        },
        "br" => "\n".to_string(),
        _ => {
            let body = inner(element);
            match tag {
                "b" | "strong" => format!("[B]{}[/B]", body),
                "i" | "em" => format!("[I]{}[/I]", body),
                "u" => format!("[U]{}[/U]", body),
                "s" | "strike" | "del" => format!("[S]{}[/S]", body),
                "a" => match attr("href") {
                    Some(href) => format!("[URL={}]{}[/URL]", href, body),
                    None => body,
                },
                "blockquote" => format!("[QUOTE]{}[/QUOTE]", body.trim()),
                "code" | "pre" => format!("[CODE]{}[/CODE]", body),
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = tag[1..].parse::<u8>().unwrap_or(3);
                    format!("[SIZE={}][B]{}[/B][/SIZE]\n", 7 - level, body.trim())
                }
                "p" => format!("{}\n\n", body.trim()),
                "ul" => format!("[LIST]\n{}[/LIST]\n", body.trim_start()),
                "ol" => format!("[LIST=1]\n{}[/LIST]\n", body.trim_start()),
                "li" => format!("[*]{}\n", body.trim()),
                _ => body,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_formatting() {
        assert_eq!(
            html_to_bbcode("Use <b>isopropyl</b>, <em>not</em> <u>water</u> <del>ever</del>"),
            "Use [B]isopropyl[/B], [I]not[/I] [U]water[/U] [S]ever[/S]"
        );
    }

    #[test]
    fn test_links_images_and_quotes() {
        let html = r#"<blockquote class="bbCodeBlock"> Said before </blockquote>
            See <a href="https://forum.test/threads/x.3/">this</a><br>
            <img src="https://forum.test/img/a.png"><img src="data:image/png;base64,AAAA">
            <a>bare</a>"#;
        let bbcode = html_to_bbcode(html);
        assert!(bbcode.starts_with("[QUOTE]Said before[/QUOTE]"));
        assert!(bbcode.contains("[URL=https://forum.test/threads/x.3/]this[/URL]\n"));
        assert!(bbcode.contains("[IMG]https://forum.test/img/a.png[/IMG][IMG]<embedded>[/IMG]"));
        assert!(bbcode.ends_with("bare"));
    }

    #[test]
    fn test_block_structure() {
        let html = "<h2>Steps</h2><ol><li> Blow </li><li>Wipe</li></ol>\
            <p>one</p><p></p><p></p><p>two</p><pre>let x = 1;</pre><script>alert(1)</script>";
        assert_eq!(
            html_to_bbcode(html),
            "[SIZE=5][B]Steps[/B][/SIZE]\n[LIST=1]\n[*]Blow\n[*]Wipe\n[/LIST]\none\n\ntwo\n\n[CODE]let x = 1;[/CODE]"
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(html_to_bbcode("  just text &amp; more "), "just text & more");
        assert_eq!(html_to_bbcode(""), "");
    }
}
