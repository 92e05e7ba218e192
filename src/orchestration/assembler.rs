//! Collects extracted pages per thread until every page of the thread has settled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::models::{CanonicalUrl, ThreadPage, ThreadRecord};

/// A thread with at least one page seen but not yet written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingThread {
    pub thread_id: String,
    pub title: Option<String>,
    pub forum_path: Vec<String>,
    /// Highest page count any page has reported.
    pub page_count: u32,
    pub pages: BTreeMap<u32, ThreadPage>,
    pub failed_pages: BTreeSet<u32>,
    pub source_urls: BTreeSet<CanonicalUrl>,
}

impl PendingThread {
    fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..Self::default()
        }
    }

    /// Every page in `1..=page_count` was extracted or failed.
    fn is_settled(&self) -> bool {
        self.page_count > 0
            && (1..=self.page_count)
                .all(|n| self.pages.contains_key(&n) || self.failed_pages.contains(&n))
    }

    fn missing_pages(&self) -> Vec<u32> {
        (1..=self.page_count.max(1))
            .filter(|n| !self.pages.contains_key(n))
            .collect()
    }

    /// Merge pages in page order, then in-page order; a post repeated on a later
    /// page keeps its first occurrence.
    fn into_record(self, partial: bool) -> ThreadRecord {
        let missing_pages = self.missing_pages();
        let mut seen = HashSet::new();
        let posts = self
            .pages
            .into_values()
            .flat_map(|page| page.posts)
            .filter(|post| seen.insert(post.post_id.clone()))
            .collect();

        ThreadRecord {
            thread_id: self.thread_id,
            title: self.title.unwrap_or_else(|| "Untitled".to_string()),
            forum_path: self.forum_path,
            posts,
            page_count: self.page_count.max(1),
            source_urls: self.source_urls.into_iter().collect(),
            partial: partial || !missing_pages.is_empty(),
            missing_pages,
        }
    }
}

#[derive(Debug, Default)]
pub struct ThreadAssembler {
    pending: HashMap<String, PendingThread>,
    finished: HashSet<String>,
}

impl ThreadAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a checkpoint. `finished` threads ignore further pages.
    pub fn restore<I>(pending: Vec<PendingThread>, finished: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            pending: pending
                .into_iter()
                .map(|thread| (thread.thread_id.clone(), thread))
                .collect(),
            finished: finished.into_iter().collect(),
        }
    }

    pub fn snapshot(&self) -> Vec<PendingThread> {
        let mut threads: Vec<PendingThread> = self.pending.values().cloned().collect();
        threads.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        threads
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record an extracted page. Returns the thread once all of its pages have settled.
    pub fn add_page(&mut self, url: CanonicalUrl, page: ThreadPage) -> Option<ThreadRecord> {
        if self.finished.contains(&page.thread_id) {
            debug!("Thread {} already written, ignoring page {}", page.thread_id, url);
            return None;
        }

        let thread = self
            .pending
            .entry(page.thread_id.clone())
            .or_insert_with(|| PendingThread::new(&page.thread_id));

        thread.source_urls.insert(url);
        thread.page_count = thread.page_count.max(page.page_count).max(page.page_number);
        if thread.title.is_none() || page.page_number == 1 {
            thread.title = Some(page.title.clone());
            thread.forum_path = page.forum_path.clone();
        }
        thread.failed_pages.remove(&page.page_number);
        let thread_id = page.thread_id.clone();
        thread.pages.entry(page.page_number).or_insert(page);

        self.take_if_settled(thread_id)
    }

    /// Record a page that could not be fetched or extracted.
    pub fn page_failed(
        &mut self,
        thread_id: &str,
        page_number: u32,
        url: CanonicalUrl,
    ) -> Option<ThreadRecord> {
        if self.finished.contains(thread_id) {
            return None;
        }
        let thread = self
            .pending
            .entry(thread_id.to_string())
            .or_insert_with(|| PendingThread::new(thread_id));
        thread.source_urls.insert(url);
        if !thread.pages.contains_key(&page_number) {
            thread.failed_pages.insert(page_number);
        }
        self.take_if_settled(thread_id.to_string())
    }

    fn take_if_settled(&mut self, thread_id: String) -> Option<ThreadRecord> {
        let settled = self
            .pending
            .get(&thread_id)
            .is_some_and(|thread| thread.is_settled() && !thread.pages.is_empty());
        if !settled {
            return None;
        }
        let thread = self.pending.remove(&thread_id)?;
        self.finished.insert(thread_id);
        Some(thread.into_record(false))
    }

    /// Flush every unfinished thread as partial. Threads with no extracted page
    /// have nothing to write and are dropped.
    pub fn drain_all(&mut self) -> Vec<ThreadRecord> {
        let mut threads: Vec<PendingThread> = self.pending.drain().map(|(_, t)| t).collect();
        threads.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        threads
            .into_iter()
            .filter(|thread| !thread.pages.is_empty())
            .map(|thread| {
                self.finished.insert(thread.thread_id.clone());
                thread.into_record(true)
            })
            .collect()
    }
}
