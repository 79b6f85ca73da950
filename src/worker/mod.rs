//! The refresh worker: bounded-concurrency scheduling of feed refreshes.
//!
//! A [`Worker`] is created once at startup and handed (cloned) to whatever
//! needs it. It owns all in-memory per-feed state:
//!
//! - **Dispatch**: each feed is `Idle`, `Queued` or `Fetching`; a feed is
//!   never queued twice and at most `pool_size` cycles run at once
//! - **Ticker**: calls [`Worker::refresh_all`] on the refresh interval,
//!   restarting its timer whenever the interval changes
//! - **Icons**: a bounded LRU of served favicons
//!
//! Fetch and parse failures never surface to callers of the refresh
//! operations; they are stored on the feed and retried on the next tick.
//! Deleting a feed through [`Worker::delete_feed`] evicts all of its state.

mod dispatch;
mod icon_cache;
mod refresh;
mod ticker;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::feed::{
    discover_feed, find_favicon, merge_items, Discovery, DiscoveryError, FeedCandidate,
    FetchError, Fetcher, FetcherConfig, OpmlFeed,
};
use crate::storage::{Database, Feed, SettingsPatch};

pub use dispatch::RefreshStatus;
pub use icon_cache::CachedIcon;

use dispatch::RefreshState;
use icon_cache::IconCache;
use refresh::CycleOutcome;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Caller input was rejected; no state was changed
    #[error("{0}")]
    Validation(String),

    #[error("Feed {0} not found")]
    FeedNotFound(i64),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent refresh cycles
    pub pool_size: usize,
    /// Time between automatic refreshes; zero disables them
    pub refresh_interval: Duration,
    pub fetcher: FetcherConfig,
    /// Bound on each favicon request
    pub favicon_timeout: Duration,
    /// Maximum icons held in memory
    pub icon_cache_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            refresh_interval: Duration::from_secs(30 * 60),
            fetcher: FetcherConfig::default(),
            favicon_timeout: Duration::from_secs(10),
            icon_cache_size: 256,
        }
    }
}

/// Result of subscribing to a URL.
#[derive(Debug, Clone)]
pub enum SubscribeOutcome {
    /// The feed was stored together with its current items
    Subscribed(Feed),
    /// The page announces several feeds; nothing was stored
    Candidates(Vec<FeedCandidate>),
}

/// Counts from an OPML import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub folders: usize,
    pub feeds: usize,
}

// ============================================================================
// Worker
// ============================================================================

/// Handle to the refresh worker. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    fetcher: Fetcher,
    pool_size: usize,
    favicon_timeout: Duration,
    /// Dispatch table and pending counter, under one lock
    state: Mutex<RefreshState>,
    /// Signalled whenever the last in-flight cycle finishes
    idle: Notify,
    interval: watch::Sender<Duration>,
    shutdown: watch::Sender<bool>,
    icons: Mutex<IconCache>,
}

impl Worker {
    pub fn new(db: Database, config: WorkerConfig) -> Result<Self, WorkerError> {
        let fetcher = Fetcher::new(config.fetcher)?;
        let pool_size = config.pool_size.max(1);
        let (interval, _) = watch::channel(config.refresh_interval);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                pool_size,
                favicon_timeout: config.favicon_timeout,
                state: Mutex::new(RefreshState::new(pool_size)),
                idle: Notify::new(),
                interval,
                shutdown,
                icons: Mutex::new(IconCache::new(config.icon_cache_size)),
            }),
        })
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn icons(&self) -> MutexGuard<'_, IconCache> {
        self.inner
            .icons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Refresh Control
    // ========================================================================

    /// Queue every idle feed for refresh.
    ///
    /// Feeds already queued or fetching are skipped. Returns as soon as the
    /// work is dispatched, with the number of feeds newly queued.
    pub async fn refresh_all(&self) -> Result<usize, WorkerError> {
        let feeds = self.inner.db.list_feeds().await?;
        let queued = {
            let mut state = self.state();
            feeds.iter().filter(|feed| state.enqueue(feed.id)).count()
        };
        tracing::info!(feeds = feeds.len(), queued, "Refreshing feeds");
        self.dispatch();
        Ok(queued)
    }

    /// Fire-and-forget [`refresh_all`](Self::refresh_all).
    pub fn refresh_feeds(&self) {
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.refresh_all().await {
                tracing::warn!(error = %e, "Failed to start refresh");
            }
        });
    }

    /// Queue one feed for refresh.
    ///
    /// Returns `false` if the feed was already queued or fetching.
    pub async fn refresh_one(&self, feed_id: i64) -> Result<bool, WorkerError> {
        if self.inner.db.get_feed(feed_id).await?.is_none() {
            return Err(WorkerError::FeedNotFound(feed_id));
        }
        let queued = self.state().enqueue(feed_id);
        if queued {
            self.dispatch();
        } else {
            tracing::debug!(feed_id, "Feed refresh already pending");
        }
        Ok(queued)
    }

    /// Number of feeds currently fetching.
    pub fn feeds_pending(&self) -> usize {
        self.state().pending()
    }

    pub fn refresh_status(&self, feed_id: i64) -> RefreshStatus {
        self.state().status(feed_id)
    }

    /// Unix time at which the feed's last refresh cycle finished.
    pub fn last_attempt(&self, feed_id: i64) -> Option<i64> {
        self.state().last_attempt(feed_id)
    }

    /// Replace the refresh interval. The running ticker restarts its timer
    /// from now; cycles in flight are unaffected. `0` disables ticking.
    pub fn set_refresh_rate(&self, seconds: u64) {
        self.inner
            .interval
            .send_replace(Duration::from_secs(seconds));
        tracing::info!(seconds, "Refresh interval changed");
    }

    pub fn refresh_interval(&self) -> Duration {
        *self.inner.interval.borrow()
    }

    /// Wait until no feed is queued or fetching.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Start the ticker. It runs until [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let worker = self.clone();
        let interval = self.inner.interval.subscribe();
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(ticker::run_ticker(interval, shutdown, move || {
            let worker = worker.clone();
            async move {
                if let Err(e) = worker.refresh_all().await {
                    tracing::warn!(error = %e, "Scheduled refresh failed to start");
                }
            }
        }))
    }

    /// Stop issuing ticks. Cycles already running are left to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Start cycles for queued feeds while worker slots are free.
    fn dispatch(&self) {
        loop {
            let next = self.state().next_ready();
            let Some(feed_id) = next else {
                break;
            };
            self.spawn_cycle(feed_id);
        }
    }

    fn spawn_cycle(&self, feed_id: i64) {
        let worker = self.clone();
        tokio::spawn(async move { worker.run_cycle(feed_id).await });
    }

    async fn run_cycle(self, feed_id: i64) {
        let cycle = refresh::refresh_feed(&self.inner.db, &self.inner.fetcher, feed_id);
        match catch_task_panic(cycle).await {
            Ok(CycleOutcome::Updated { new_items }) if new_items > 0 => {
                tracing::info!(feed_id, new_items, "Feed has new items");
            }
            Ok(CycleOutcome::Failed(error)) => {
                tracing::warn!(feed_id, error = %error, "Feed refresh failed");
            }
            Ok(_) => {}
            Err(panic) => {
                tracing::error!(feed_id, error = %panic, "Refresh cycle panicked");
            }
        }

        // Hand the freed slot to the next queued feed under the same lock
        let (next, idle) = {
            let mut state = self.state();
            state.finish(feed_id, chrono::Utc::now().timestamp());
            let next = state.next_ready();
            (next, state.is_idle())
        };
        match next {
            Some(next) => self.spawn_cycle(next),
            None if idle => self.inner.idle.notify_waiters(),
            None => {}
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Resolve `url` to a feed or a list of candidates without storing anything.
    pub async fn discover_feed(&self, url: &str) -> Result<Discovery, WorkerError> {
        Ok(discover_feed(&self.inner.fetcher, url).await?)
    }

    /// Subscribe to the feed at (or announced by) `url`.
    ///
    /// A single feed is stored with its current items and an icon lookup
    /// starts in the background.
    pub async fn subscribe(
        &self,
        url: &str,
        folder_id: Option<i64>,
    ) -> Result<SubscribeOutcome, WorkerError> {
        let (feed_url, parsed) = match self.discover_feed(url).await? {
            Discovery::Feed { url, feed } => (url, feed),
            Discovery::Candidates(candidates) => {
                return Ok(SubscribeOutcome::Candidates(candidates))
            }
        };

        let db = &self.inner.db;
        let feed = db
            .create_feed(
                &parsed.title,
                parsed.description.as_deref(),
                parsed.site_link.as_deref(),
                &feed_url,
                folder_id,
            )
            .await?;
        let added = merge_items(db, feed.id, &parsed.items, None).await?;
        if added > 0 {
            db.sync_search().await?;
        }
        tracing::info!(feed_id = feed.id, url = %feed_url, items = added, "Subscribed to feed");

        self.spawn_favicon_lookup(feed.id);

        let feed = db
            .get_feed(feed.id)
            .await?
            .ok_or(WorkerError::FeedNotFound(feed.id))?;
        Ok(SubscribeOutcome::Subscribed(feed))
    }

    /// Store the feeds of a parsed OPML document, creating their folders.
    ///
    /// Icon lookups and a full refresh start in the background afterwards.
    pub async fn import_feeds(&self, feeds: &[OpmlFeed]) -> Result<ImportSummary, WorkerError> {
        let db = &self.inner.db;
        let mut folder_ids: HashMap<&str, i64> = HashMap::new();
        let mut summary = ImportSummary::default();

        for entry in feeds {
            let folder_id = match entry.folder.as_deref() {
                Some(title) => match folder_ids.get(title) {
                    Some(id) => Some(*id),
                    None => {
                        let folder = db.create_folder(title).await?;
                        folder_ids.insert(title, folder.id);
                        summary.folders += 1;
                        Some(folder.id)
                    }
                },
                None => None,
            };

            match db
                .create_feed(
                    &entry.title,
                    None,
                    entry.html_url.as_deref(),
                    &entry.xml_url,
                    folder_id,
                )
                .await
            {
                Ok(_) => summary.feeds += 1,
                Err(e) => {
                    tracing::warn!(url = %entry.xml_url, error = %e, "Skipping imported feed")
                }
            }
        }
        tracing::info!(feeds = summary.feeds, folders = summary.folders, "Imported OPML");

        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.find_favicons().await {
                tracing::warn!(error = %e, "Favicon lookup after import failed");
            }
        });
        self.refresh_feeds();

        Ok(summary)
    }

    /// Delete a feed and everything cached about it.
    ///
    /// Returns the number of items removed with it.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<u64, WorkerError> {
        if self.inner.db.get_feed(feed_id).await?.is_none() {
            return Err(WorkerError::FeedNotFound(feed_id));
        }
        let removed = self.inner.db.delete_feed(feed_id).await?;
        self.state().forget(feed_id);
        self.icons().evict(feed_id);
        tracing::info!(feed_id, items = removed, "Feed deleted");
        Ok(removed)
    }

    /// Last refresh error of every failing feed.
    pub async fn feed_errors(&self) -> Result<HashMap<i64, String>, WorkerError> {
        Ok(self.inner.db.get_feed_errors().await?)
    }

    /// Apply a settings update. A new `refresh_rate` (minutes) takes effect
    /// immediately.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<(), WorkerError> {
        patch
            .validate()
            .map_err(|e| WorkerError::Validation(e.to_string()))?;
        self.inner.db.update_settings(patch).await?;
        if let Some(minutes) = patch.refresh_rate {
            self.set_refresh_rate(minutes.saturating_mul(60));
        }
        Ok(())
    }

    // ========================================================================
    // Favicons
    // ========================================================================

    /// Look up and store an icon for one feed.
    ///
    /// Returns `Ok(false)` when no icon was found; that is not an error.
    pub async fn find_feed_favicon(&self, feed_id: i64) -> Result<bool, WorkerError> {
        let feed = self
            .inner
            .db
            .get_feed(feed_id)
            .await?
            .ok_or(WorkerError::FeedNotFound(feed_id))?;
        Ok(self.lookup_icon(&feed).await?)
    }

    /// Look up icons for every feed that has none, `pool_size` at a time.
    ///
    /// Returns the number of icons found.
    pub async fn find_favicons(&self) -> Result<usize, WorkerError> {
        let feeds = self.inner.db.list_feeds_without_icons().await?;
        let total = feeds.len();

        let found = stream::iter(feeds)
            .map(|feed| async move {
                match self.lookup_icon(&feed).await {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!(feed_id = feed.id, error = %e, "Failed to store favicon");
                        false
                    }
                }
            })
            .buffer_unordered(self.inner.pool_size)
            .filter(|found| std::future::ready(*found))
            .count()
            .await;

        tracing::info!(feeds = total, found, "Favicon lookup finished");
        Ok(found)
    }

    /// The icon of a feed, from memory when possible.
    pub async fn feed_icon(&self, feed_id: i64) -> Result<Option<CachedIcon>, WorkerError> {
        let (cached, generation) = {
            let mut icons = self.icons();
            (icons.get(feed_id), icons.generation())
        };
        if cached.is_some() {
            return Ok(cached);
        }
        let Some(bytes) = self.inner.db.get_feed_icon(feed_id).await? else {
            return Ok(None);
        };
        // The lock is not held across the read; a replacement stored meanwhile wins
        Ok(Some(self.icons().insert_if_current(feed_id, bytes, generation)))
    }

    fn spawn_favicon_lookup(&self, feed_id: i64) {
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.find_feed_favicon(feed_id).await {
                tracing::debug!(feed_id, error = %e, "Favicon lookup failed");
            }
        });
    }

    async fn lookup_icon(&self, feed: &Feed) -> anyhow::Result<bool> {
        let site = feed
            .link
            .as_deref()
            .filter(|link| !link.trim().is_empty())
            .unwrap_or(&feed.feed_link);

        match find_favicon(&self.inner.fetcher, site, self.inner.favicon_timeout).await {
            Some(icon) => {
                self.inner.db.update_feed_icon(feed.id, Some(&icon)).await?;
                tracing::debug!(feed_id = feed.id, bytes = icon.len(), "Stored favicon");
                {
                    let mut icons = self.icons();
                    icons.evict(feed.id);
                    icons.insert(feed.id, icon);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // Pass-through
    // ========================================================================

    /// Fetch a page and return its text, decoded by its declared charset.
    pub async fn get_body(&self, url: &str) -> Result<String, WorkerError> {
        Ok(self.inner.fetcher.get_body(url).await?)
    }
}

/// Run a future, turning a panic into an `Err` with the panic message.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        }
    })
}
