use crate::feed::{merge_items, parse_feed, FetchOutcome, Fetcher};
use crate::storage::Database;

/// How one fetch/parse/merge cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// 304: nothing parsed or merged, stored error left as it was
    NotModified,
    Updated { new_items: usize },
    /// The error text now stored on the feed
    Failed(String),
    /// The feed was deleted before the cycle started
    Gone,
}

/// Run one refresh cycle for `feed_id`.
///
/// Failures never propagate: they are stored as the feed's error text and
/// retried on the next tick. Conditional-request validators are
/// only committed together with the merged items.
pub(crate) async fn refresh_feed(db: &Database, fetcher: &Fetcher, feed_id: i64) -> CycleOutcome {
    let feed = match db.get_feed(feed_id).await {
        Ok(Some(feed)) => feed,
        Ok(None) => {
            tracing::debug!(feed_id, "Feed deleted before refresh, skipping");
            return CycleOutcome::Gone;
        }
        Err(e) => {
            tracing::warn!(feed_id, error = %e, "Failed to load feed for refresh");
            return CycleOutcome::Failed(e.to_string());
        }
    };

    tracing::debug!(feed_id, url = %feed.feed_link, "Refreshing feed");

    let fetched = match fetcher.fetch(&feed.feed_link, &feed.validators).await {
        Ok(FetchOutcome::Fetched(fetched)) => fetched,
        Ok(FetchOutcome::NotModified) => {
            tracing::debug!(feed_id, "Feed not modified");
            if let Err(e) = db.touch_feed_fetched(feed_id).await {
                tracing::warn!(feed_id, error = %e, "Failed to record fetch time");
            }
            return CycleOutcome::NotModified;
        }
        Err(e) => return record_failure(db, feed_id, e.to_string()).await,
    };

    let charset = fetched.charset();
    let outcome = match parse_feed(&fetched.body, charset.as_deref(), &fetched.final_url) {
        Ok(outcome) => outcome,
        Err(e) => return record_failure(db, feed_id, e.to_string()).await,
    };
    if outcome.partial {
        tracing::warn!(
            feed_id,
            salvaged = outcome.feed.items.len(),
            "Feed document is damaged, kept the readable entries"
        );
    }

    let new_items = match merge_items(db, feed_id, &outcome.feed.items, Some(&fetched.validators))
        .await
    {
        Ok(n) => n,
        Err(e) => return record_failure(db, feed_id, format!("Storage error: {e}")).await,
    };

    if new_items > 0 {
        if let Err(e) = db.sync_search().await {
            tracing::warn!(feed_id, error = %e, "Search index sync failed");
        }
    }
    if !outcome.feed.title.is_empty() {
        if let Err(e) = db.backfill_feed_title(feed_id, &outcome.feed.title).await {
            tracing::warn!(feed_id, error = %e, "Failed to backfill feed title");
        }
    }

    tracing::debug!(feed_id, new_items, "Feed refreshed");
    CycleOutcome::Updated { new_items }
}

async fn record_failure(db: &Database, feed_id: i64, message: String) -> CycleOutcome {
    if let Err(e) = db.set_feed_error(feed_id, Some(&message)).await {
        tracing::warn!(feed_id, error = %e, "Failed to store feed error");
    }
    CycleOutcome::Failed(message)
}
