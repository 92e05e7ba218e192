//! In-memory [`Transport`] used by unit tests, integration tests and benches.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::network::{RawResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct MockReply {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
    error: Option<TransportError>,
    delay: Option<Duration>,
    retry_after: Option<Duration>,
}

impl MockReply {
    pub fn html(body: &str) -> Self {
        Self::bytes("text/html; charset=utf-8", body.as_bytes().to_vec())
    }

    pub fn bytes(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body,
            error: None,
            delay: None,
            retry_after: None,
        }
    }

    pub fn untyped(body: Vec<u8>) -> Self {
        Self {
            content_type: None,
            ..Self::bytes("", body)
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::bytes("text/plain", Vec::new())
        }
    }

    pub fn error(error: TransportError) -> Self {
        Self {
            error: Some(error),
            ..Self::status(0)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Routes URLs to scripted replies. The last reply of a route repeats; unknown
/// URLs answer 404.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    hits: DashMap<String, usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn html(&self, url: &str, body: &str) {
        self.sequence(url, vec![MockReply::html(body)]);
    }

    pub fn bytes(&self, url: &str, content_type: &str, body: Vec<u8>) {
        self.sequence(url, vec![MockReply::bytes(content_type, body)]);
    }

    pub fn sequence(&self, url: &str, replies: Vec<MockReply>) {
        self.routes
            .lock()
            .insert(url.to_string(), replies.into_iter().collect());
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.get(url).map(|h| *h).unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.iter().map(|entry| *entry.value()).sum()
    }

    fn next_reply(&self, url: &str) -> MockReply {
        let mut routes = self.routes.lock();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| MockReply::status(404)),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| MockReply::status(404)),
            None => MockReply::status(404),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &str, max_bytes: usize) -> Result<RawResponse, TransportError> {
        *self.hits.entry(url.to_string()).or_insert(0) += 1;
        let reply = self.next_reply(url);

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = reply.error {
            return Err(error);
        }
        if reply.body.len() > max_bytes {
            return Err(TransportError::ContentTooLarge(reply.body.len(), max_bytes));
        }

        Ok(RawResponse {
            status: reply.status,
            content_type: reply.content_type,
            body: reply.body,
            final_url: url.to_string(),
            retry_after: reply.retry_after,
        })
    }
}

/// A post rendered into fixture pages.
#[derive(Debug, Clone)]
pub struct FixturePost {
    pub id: u64,
    pub author: String,
    pub datetime: String,
    pub body: String,
    pub images: Vec<String>,
}

impl FixturePost {
    pub fn new(id: u64, author: &str, datetime: &str, body: &str) -> Self {
        Self {
            id,
            author: author.to_string(),
            datetime: datetime.to_string(),
            body: body.to_string(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, src: &str) -> Self {
        self.images.push(src.to_string());
        self
    }
}

/// Page `page` of a XenForo 2 thread living at `thread_path` (e.g.
/// `/threads/title.7/`), in forum General > Help.
pub fn xenforo_thread_page(
    title: &str,
    thread_path: &str,
    page: u32,
    page_count: u32,
    posts: &[FixturePost],
) -> String {
    let page_href = |n: u32| {
        if n <= 1 {
            thread_path.to_string()
        } else {
            format!("{}page-{}", thread_path, n)
        }
    };

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html><head><title>");
    html.push_str(title);
    html.push_str(" | Test Forum</title></head><body>\n");
    html.push_str(
        "<ul class=\"p-breadcrumbs\">\
         <li><a href=\"/\"><span>Home</span></a></li>\
         <li><a href=\"/forums/\"><span>Forums</span></a></li>\
         <li><a href=\"/categories/general.1/\"><span>General</span></a></li>\
         <li><a href=\"/forums/help.2/\"><span>Help</span></a></li></ul>\n",
    );
    html.push_str(&format!("<h1 class=\"p-title-value\">{}</h1>\n", title));

    html.push_str("<nav class=\"pageNavWrapper\"><div class=\"pageNav\"><ul class=\"pageNav-main\">");
    for n in 1..=page_count {
        html.push_str(&format!(
            "<li class=\"pageNav-page\"><a href=\"{}\">{}</a></li>",
            page_href(n),
            n
        ));
    }
    html.push_str("</ul>");
    let next = if page >= page_count { 1 } else { page + 1 };
    html.push_str(&format!(
        "<a class=\"pageNav-jump pageNav-jump--next\" href=\"{}\">Next</a>",
        page_href(next)
    ));
    html.push_str("</div></nav>\n");

    for post in posts {
        html.push_str(&format!(
            "<article class=\"message message--post js-post\" data-author=\"{author}\" \
             data-content=\"post-{id}\" id=\"js-post-{id}\">\
             <div class=\"message-cell message-cell--user\">\
             <div class=\"message-avatar\"><a class=\"avatar\" href=\"/members/{author}.1/\">\
             <img src=\"/data/avatars/m/0/{author}.jpg\" alt=\"{author}\"></a></div>\
             <h4 class=\"message-name\"><a class=\"username\" href=\"/members/{author}.1/\">{author}</a></h4></div>\
             <div class=\"message-cell message-cell--main\">\
             <header class=\"message-attribution\"><a href=\"{thread}post-{id}\">\
             <time class=\"u-dt\" datetime=\"{datetime}\">date</time></a></header>\
             <div class=\"message-content\"><div class=\"message-userContent\">\
             <article class=\"message-body\"><div class=\"bbWrapper\">{body}",
            author = post.author,
            id = post.id,
            thread = thread_path,
            datetime = post.datetime,
            body = post.body,
        ));
        for src in &post.images {
            html.push_str(&format!("<img src=\"{}\" class=\"bbImage\" alt=\"\">", src));
        }
        html.push_str("</div></article></div></div></div></article>\n");
    }

    html.push_str("<footer><a href=\"/login/\">Log in</a> <a href=\"mailto:admin@forum.test\">Contact</a></footer>");
    html.push_str("</body></html>\n");
    html
}

/// A payload that sniffs as PNG; `tag` makes the content (and hash) unique.
pub fn png_payload(tag: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(tag);
    bytes
}

/// A payload that sniffs as JPEG.
pub fn jpeg_payload(tag: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend_from_slice(tag);
    bytes
}
