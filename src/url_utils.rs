//! URL and path helpers shared by the canonicalizer, extractor and writer.

use std::path::{Component, Path};
use url::Url;

/// Extensions that mark an anchor target as a media asset rather than a page.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "tiff", "avif", "ico", "mp4", "webm",
    "mov", "avi", "mkv", "ogv", "flv", "m4v", "mp3", "ogg", "wav", "aac", "flac", "m4a",
    "opus", "pdf", "zip",
];

pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_ascii_lowercase()))
}

/// Host without a leading `www.` label.
pub fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

pub fn is_same_site(url_host: &str, base_host: &str) -> bool {
    strip_www(&url_host.to_ascii_lowercase()) == strip_www(&base_host.to_ascii_lowercase())
}

/// References that never lead to a fetchable document.
pub fn is_non_navigable(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    ["javascript:", "mailto:", "tel:", "data:", "about:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

/// Add https:// prefix for bare domains (CLI convenience).
pub fn normalize_url_for_cli(url: &str) -> String {
    let trimmed = url.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }

    format!("https://{}", trimmed)
}

pub fn is_html_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
}

/// Lowercased extension of the last path segment, if any.
pub fn path_extension(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn has_media_extension(url: &str) -> bool {
    path_extension(url).is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Filesystem-safe slug: lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len().min(max_len));
    let mut pending_dash = false;

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
            if slug.len() >= max_len {
                break;
            }
        } else {
            pending_dash = true;
        }
    }

    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Relative link from a document living in `from_dir` to `target`, with `/` separators.
pub fn relative_link(from_dir: &Path, target: &Path) -> String {
    let from: Vec<Component<'_>> = from_dir.components().collect();
    let to: Vec<Component<'_>> = target.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    for _ in common..from.len() {
        parts.push("..".to_string());
    }
    for component in &to[common..] {
        parts.push(component.as_os_str().to_string_lossy().into_owned());
    }

    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_extract_host() {
        assert_eq!(
            extract_host("https://Forum.Example.com/path"),
            Some("forum.example.com".to_string())
        );
        assert_eq!(extract_host("invalid"), None);
    }

    #[test]
    fn test_is_same_site() {
        assert!(is_same_site("forum.test", "forum.test"));
        assert!(is_same_site("www.forum.test", "forum.test"));
        assert!(is_same_site("forum.test", "WWW.forum.test"));
        assert!(!is_same_site("cdn.forum.test", "forum.test"));
    }

    #[test]
    fn test_is_non_navigable() {
        assert!(is_non_navigable("javascript:void(0)"));
        assert!(is_non_navigable("MAILTO:someone@test"));
        assert!(is_non_navigable("tel:123"));
        assert!(is_non_navigable("#post-5"));
        assert!(is_non_navigable("data:image/png;base64,AAAA"));
        assert!(is_non_navigable("   "));
        assert!(!is_non_navigable("/threads/a.1/"));
        assert!(!is_non_navigable("https://forum.test/"));
    }

    #[test]
    fn test_normalize_url_for_cli() {
        assert_eq!(normalize_url_for_cli("forum.test"), "https://forum.test");
        assert_eq!(normalize_url_for_cli("http://forum.test"), "http://forum.test");
    }

    #[test]
    fn test_is_html_content_type() {
        assert!(is_html_content_type("text/html"));
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(!is_html_content_type("application/json"));
        assert!(!is_html_content_type("image/png"));
    }

    #[test]
    fn test_path_extension() {
        assert_eq!(
            path_extension("https://forum.test/data/a/photo.JPG?x=1"),
            Some("jpg".to_string())
        );
        assert_eq!(path_extension("https://forum.test/threads/a.12345678/"), None);
        assert_eq!(path_extension("https://forum.test/.htaccess"), None);
        assert!(has_media_extension("https://forum.test/clip.webm"));
        assert!(!has_media_extension("https://forum.test/showthread.php?t=4"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello, World!  Again", 80), "hello-world-again");
        assert_eq!(slugify("***", 80), "untitled");
        assert_eq!(slugify("abcdefghij", 4), "abcd");
        assert_eq!(slugify("Ünïcode Title 2", 80), "n-code-title-2");
    }

    #[test]
    fn test_relative_link() {
        let from = PathBuf::from("out/general/help");
        assert_eq!(
            relative_link(&from, &PathBuf::from("out/media/ab/ab12.png")),
            "../../media/ab/ab12.png"
        );
        assert_eq!(
            relative_link(&from, &PathBuf::from("out/general/help/1-a_media/x.png")),
            "1-a_media/x.png"
        );
    }
}
