use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Where a feed is in its refresh cycle.
///
/// Feeds absent from the dispatch table are `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Idle,
    /// Waiting for a free worker slot
    Queued,
    Fetching,
}

/// In-memory refresh bookkeeping, guarded by the worker's single mutex.
///
/// A feed id appears at most once across the queue and the fetching set, so
/// a feed never has two cycles in flight. `fetching` is the maintained
/// pending counter.
#[derive(Debug)]
pub(crate) struct RefreshState {
    pool_size: usize,
    queue: VecDeque<i64>,
    status: HashMap<i64, RefreshStatus>,
    fetching: usize,
    /// Unix timestamp of each feed's last finished cycle
    last_attempt: HashMap<i64, i64>,
    /// Feeds deleted while their cycle was in flight
    evicted: HashSet<i64>,
}

impl RefreshState {
    /// A pool size of 0 is treated as 1.
    pub(crate) fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            queue: VecDeque::new(),
            status: HashMap::new(),
            fetching: 0,
            last_attempt: HashMap::new(),
            evicted: HashSet::new(),
        }
    }

    /// Queue `feed_id` unless it is already queued or fetching.
    ///
    /// Returns `true` if the feed was idle and is now queued.
    pub(crate) fn enqueue(&mut self, feed_id: i64) -> bool {
        if self.status.contains_key(&feed_id) {
            return false;
        }
        self.evicted.remove(&feed_id);
        self.status.insert(feed_id, RefreshStatus::Queued);
        self.queue.push_back(feed_id);
        true
    }

    /// Claim a worker slot for the next queued feed, marking it `Fetching`.
    ///
    /// Returns `None` when every slot is busy or nothing is queued.
    pub(crate) fn next_ready(&mut self) -> Option<i64> {
        if self.fetching >= self.pool_size {
            return None;
        }
        let feed_id = self.queue.pop_front()?;
        self.status.insert(feed_id, RefreshStatus::Fetching);
        self.fetching += 1;
        Some(feed_id)
    }

    /// Release the slot held by `feed_id`, returning the feed to `Idle`.
    pub(crate) fn finish(&mut self, feed_id: i64, at: i64) {
        if self.status.get(&feed_id) != Some(&RefreshStatus::Fetching) {
            return;
        }
        self.status.remove(&feed_id);
        self.fetching -= 1;
        if !self.evicted.remove(&feed_id) {
            self.last_attempt.insert(feed_id, at);
        }
    }

    /// Drop everything known about a deleted feed.
    ///
    /// A queued entry is discarded. An in-flight cycle keeps its slot until
    /// it finishes, but leaves no trace behind.
    pub(crate) fn forget(&mut self, feed_id: i64) {
        self.last_attempt.remove(&feed_id);
        match self.status.get(&feed_id) {
            Some(RefreshStatus::Queued) => {
                self.status.remove(&feed_id);
                self.queue.retain(|id| *id != feed_id);
            }
            Some(RefreshStatus::Fetching) => {
                self.evicted.insert(feed_id);
            }
            _ => {}
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.fetching
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.fetching == 0 && self.queue.is_empty()
    }

    pub(crate) fn status(&self, feed_id: i64) -> RefreshStatus {
        self.status
            .get(&feed_id)
            .copied()
            .unwrap_or(RefreshStatus::Idle)
    }

    pub(crate) fn last_attempt(&self, feed_id: i64) -> Option<i64> {
        self.last_attempt.get(&feed_id).copied()
    }

    /// Number of feeds with any retained state.
    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.status.len() + self.last_attempt.len() + self.evicted.len()
    }
}
