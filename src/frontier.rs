use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::models::{CanonicalUrl, FrontierEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    Duplicate,
    DepthExceeded,
}

/// Frontier state. Every mutation happens under one lock so that check-and-insert
/// and take-and-mark-visited are atomic.
#[derive(Debug, Default)]
struct FrontierInner {
    /// Pending entries, breadth-first by depth, FIFO within a depth.
    tiers: BTreeMap<u32, VecDeque<FrontierEntry>>,
    pending: HashSet<CanonicalUrl>,
    /// Every URL ever handed out, including those still in flight.
    visited: HashSet<CanonicalUrl>,
    in_flight: HashMap<CanonicalUrl, (u64, FrontierEntry)>,
    take_seq: u64,
    closed: bool,
}

/// Pending/visited sets of a crawl. Shared by all page workers.
#[derive(Debug)]
pub struct Frontier {
    max_depth: u32,
    inner: Mutex<FrontierInner>,
}

/// Serializable frontier contents. In-flight entries are stored as pending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierSnapshot {
    pub pending: Vec<FrontierEntry>,
    pub visited: Vec<CanonicalUrl>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontierStats {
    pub pending: usize,
    pub in_flight: usize,
    pub visited: usize,
}

impl std::fmt::Display for FrontierStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frontier: {} pending, {} in flight, {} visited",
            self.pending, self.in_flight, self.visited
        )
    }
}

impl Frontier {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            inner: Mutex::new(FrontierInner::default()),
        }
    }

    /// Schedule `url` unless it was already scheduled or lies beyond the depth bound.
    pub fn offer(
        &self,
        url: CanonicalUrl,
        depth: u32,
        parent: Option<CanonicalUrl>,
    ) -> OfferOutcome {
        let mut inner = self.inner.lock();

        if inner.pending.contains(&url) || inner.visited.contains(&url) {
            return OfferOutcome::Duplicate;
        }
        if depth > self.max_depth {
            return OfferOutcome::DepthExceeded;
        }

        inner.pending.insert(url.clone());
        inner
            .tiers
            .entry(depth)
            .or_default()
            .push_back(FrontierEntry { url, depth, parent });
        OfferOutcome::Accepted
    }

    /// Offer a link discovered on `parent`'s page, one level deeper.
    pub fn offer_child(&self, url: CanonicalUrl, parent: &FrontierEntry) -> OfferOutcome {
        self.offer(url, parent.depth.saturating_add(1), Some(parent.url.clone()))
    }

    /// Pop the next entry and mark it visited in the same critical section.
    pub fn take_next(&self) -> Option<FrontierEntry> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }

        let entry = loop {
            let mut tier = inner.tiers.first_entry()?;
            match tier.get_mut().pop_front() {
                Some(entry) => {
                    if tier.get().is_empty() {
                        tier.remove();
                    }
                    break entry;
                }
                None => {
                    tier.remove();
                }
            }
        };

        inner.pending.remove(&entry.url);
        inner.visited.insert(entry.url.clone());
        inner.take_seq += 1;
        let seq = inner.take_seq;
        inner
            .in_flight
            .insert(entry.url.clone(), (seq, entry.clone()));
        Some(entry)
    }

    /// Mark a taken entry as settled.
    pub fn complete(&self, url: &CanonicalUrl) {
        self.inner.lock().in_flight.remove(url);
    }

    /// Stop yielding entries. Offers are still recorded so a checkpoint keeps them.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// No pending entries remain.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    pub fn is_visited(&self, url: &CanonicalUrl) -> bool {
        self.inner.lock().visited.contains(url)
    }

    pub fn stats(&self) -> FrontierStats {
        let inner = self.inner.lock();
        FrontierStats {
            pending: inner.pending.len(),
            in_flight: inner.in_flight.len(),
            visited: inner.visited.len(),
        }
    }

    /// Capture pending and visited sets. In-flight entries go back to the front
    /// of their depth tier so a resumed crawl processes them again.
    pub fn snapshot(&self) -> FrontierSnapshot {
        let inner = self.inner.lock();

        let mut requeued: Vec<&(u64, FrontierEntry)> = inner.in_flight.values().collect();
        requeued.sort_by_key(|(seq, entry)| (entry.depth, *seq));

        let mut pending = Vec::with_capacity(inner.pending.len() + requeued.len());
        let depths: Vec<u32> = inner
            .tiers
            .keys()
            .copied()
            .chain(requeued.iter().map(|(_, e)| e.depth))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for depth in depths {
            pending.extend(
                requeued
                    .iter()
                    .filter(|(_, e)| e.depth == depth)
                    .map(|(_, e)| e.clone()),
            );
            if let Some(tier) = inner.tiers.get(&depth) {
                pending.extend(tier.iter().cloned());
            }
        }

        let mut visited: Vec<CanonicalUrl> = inner
            .visited
            .iter()
            .filter(|url| !inner.in_flight.contains_key(*url))
            .cloned()
            .collect();
        visited.sort();

        FrontierSnapshot { pending, visited }
    }

    pub fn restore(max_depth: u32, snapshot: FrontierSnapshot) -> Self {
        let frontier = Self::new(max_depth);
        {
            let mut inner = frontier.inner.lock();
            inner.visited.extend(snapshot.visited);
            for entry in snapshot.pending {
                if inner.visited.contains(&entry.url) || !inner.pending.insert(entry.url.clone()) {
                    continue;
                }
                inner.tiers.entry(entry.depth).or_default().push_back(entry);
            }
        }
        frontier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn url(path: &str) -> CanonicalUrl {
        CanonicalUrl::from_normalized(format!("https://forum.test/{}", path))
    }

    #[test]
    fn test_offer_and_take_fifo_within_depth() {
        let frontier = Frontier::new(5);
        assert_eq!(frontier.offer(url("a"), 1, None), OfferOutcome::Accepted);
        assert_eq!(frontier.offer(url("b"), 1, None), OfferOutcome::Accepted);
        assert_eq!(frontier.offer(url("c"), 1, None), OfferOutcome::Accepted);

        let order: Vec<String> = std::iter::from_fn(|| frontier.take_next())
            .map(|e| e.url.into_string())
            .collect();
        assert_eq!(
            order,
            vec![
                "https://forum.test/a",
                "https://forum.test/b",
                "https://forum.test/c"
            ]
        );
    }

    #[test]
    fn test_breadth_first_across_depths() {
        let frontier = Frontier::new(5);
        frontier.offer(url("deep"), 2, None);
        frontier.offer(url("root"), 0, None);
        frontier.offer(url("mid"), 1, None);

        assert_eq!(frontier.take_next().unwrap().url, url("root"));
        assert_eq!(frontier.take_next().unwrap().url, url("mid"));
        assert_eq!(frontier.take_next().unwrap().url, url("deep"));
        assert!(frontier.take_next().is_none());
    }

    #[test]
    fn test_duplicates_rejected_while_pending_and_after_visit() {
        let frontier = Frontier::new(5);
        assert_eq!(frontier.offer(url("a"), 0, None), OfferOutcome::Accepted);
        assert_eq!(frontier.offer(url("a"), 0, None), OfferOutcome::Duplicate);

        let entry = frontier.take_next().unwrap();
        frontier.complete(&entry.url);
        assert_eq!(frontier.offer(url("a"), 1, None), OfferOutcome::Duplicate);
        assert!(frontier.is_visited(&url("a")));
    }

    #[test]
    fn test_depth_bound() {
        let frontier = Frontier::new(1);
        frontier.offer(url("root"), 0, None);
        let root = frontier.take_next().unwrap();
        assert_eq!(frontier.offer_child(url("child"), &root), OfferOutcome::Accepted);
        let child = frontier.take_next().unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent, Some(url("root")));
        assert_eq!(
            frontier.offer_child(url("grandchild"), &child),
            OfferOutcome::DepthExceeded
        );
        assert!(frontier.take_next().is_none());
    }

    #[test]
    fn test_close_stops_yielding() {
        let frontier = Frontier::new(3);
        frontier.offer(url("a"), 0, None);
        frontier.close();
        assert!(frontier.is_closed());
        assert!(frontier.take_next().is_none());
        assert!(!frontier.is_empty());
    }

    #[test]
    fn test_concurrent_offers_accept_each_url_once() {
        let frontier = Arc::new(Frontier::new(10));
        let accepted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let frontier = Arc::clone(&frontier);
                    scope.spawn(move || {
                        (0..500)
                            .filter(|i| {
                                frontier.offer(url(&format!("p{}", i)), 1, None)
                                    == OfferOutcome::Accepted
                            })
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
        });
        assert_eq!(accepted, 500);

        let mut taken = HashSet::new();
        while let Some(entry) = frontier.take_next() {
            assert!(taken.insert(entry.url), "URL dispatched twice");
        }
        assert_eq!(taken.len(), 500);
    }

    #[test]
    fn test_snapshot_requeues_in_flight() {
        let frontier = Frontier::new(5);
        frontier.offer(url("done"), 0, None);
        frontier.offer(url("working"), 1, None);
        frontier.offer(url("waiting"), 1, None);

        let done = frontier.take_next().unwrap();
        frontier.complete(&done.url);
        let _working = frontier.take_next().unwrap();

        let snapshot = frontier.snapshot();
        assert_eq!(snapshot.visited, vec![url("done")]);
        let pending: Vec<_> = snapshot.pending.iter().map(|e| e.url.clone()).collect();
        assert_eq!(pending, vec![url("working"), url("waiting")]);

        let restored = Frontier::restore(5, snapshot);
        assert_eq!(restored.offer(url("done"), 0, None), OfferOutcome::Duplicate);
        assert_eq!(restored.take_next().unwrap().url, url("working"));
        assert_eq!(restored.take_next().unwrap().url, url("waiting"));
        assert!(restored.take_next().is_none());
    }

    #[test]
    fn test_stats_display() {
        let frontier = Frontier::new(5);
        frontier.offer(url("a"), 0, None);
        frontier.offer(url("b"), 0, None);
        frontier.take_next();
        let stats = frontier.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.visited, 1);
        assert_eq!(
            stats.to_string(),
            "Frontier: 1 pending, 1 in flight, 1 visited"
        );
    }
}
