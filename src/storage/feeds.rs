use anyhow::{bail, Result};
use sqlx::QueryBuilder;
use std::collections::HashMap;

use super::schema::Database;
use super::types::{CacheValidators, DatabaseError, Feed, FeedRow, NewItem};
use crate::util::clean_text;

/// Columns selected for every `FeedRow` query.
const FEED_COLUMNS: &str = "id, title, description, link, feed_link, folder_id, \
     icon IS NOT NULL AS has_icon, error, size, etag, last_modified, last_fetched";

/// Keeps 7 bound columns per row well under SQLite's 999 parameter limit.
pub(crate) const INSERT_BATCH_SIZE: usize = 50;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a feed, returning the stored row.
    ///
    /// Subscribing to an already-known `feed_link` keeps the existing row and
    /// only moves it into `folder_id`.
    pub async fn create_feed(
        &self,
        title: &str,
        description: Option<&str>,
        link: Option<&str>,
        feed_link: &str,
        folder_id: Option<i64>,
    ) -> Result<Feed> {
        let feed_link = feed_link.trim();
        if feed_link.is_empty() {
            bail!("Feed URL cannot be empty");
        }
        let title = clean_text(title);
        let title = if title.is_empty() {
            feed_link.to_owned()
        } else {
            title
        };
        let description = description.map(clean_text).filter(|d| !d.is_empty());

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, description, link, feed_link, folder_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(feed_link) DO UPDATE SET folder_id = excluded.folder_id
            RETURNING id
        "#,
        )
        .bind(&title)
        .bind(description)
        .bind(link)
        .bind(feed_link)
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;

        match self.get_feed(id).await? {
            Some(feed) => Ok(feed),
            None => bail!("Feed {id} vanished right after insert"),
        }
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?");
        let row = sqlx::query_as::<_, FeedRow>(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FeedRow::into_feed))
    }

    /// All feeds ordered by title (case-insensitive)
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY title COLLATE NOCASE, id");
        let rows = sqlx::query_as::<_, FeedRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    /// Feeds that have no stored icon yet, for the bulk favicon pass
    pub async fn list_feeds_without_icons(&self) -> Result<Vec<Feed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE icon IS NULL ORDER BY id");
        let rows = sqlx::query_as::<_, FeedRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    /// Rename a feed. Returns false if the feed does not exist.
    pub async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<bool> {
        let title = clean_text(title);
        if title.is_empty() {
            bail!("Feed title cannot be empty or whitespace-only");
        }
        let result = sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(&title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace a placeholder title with the one the feed publishes.
    ///
    /// Only applies while the stored title is empty or still the feed URL
    /// (what OPML imports without a title fall back to), so user renames win.
    pub async fn backfill_feed_title(&self, feed_id: i64, title: &str) -> Result<bool> {
        let title = clean_text(title);
        if title.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE feeds SET title = ? WHERE id = ? AND (title = '' OR title = feed_link)",
        )
        .bind(&title)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a feed into a folder, or to the top level if `folder_id` is `None`.
    pub async fn update_feed_folder(&self, feed_id: i64, folder_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE feeds SET folder_id = ? WHERE id = ?")
            .bind(folder_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a feed and, via ON DELETE CASCADE, all of its items.
    ///
    /// Returns the number of items removed. Deleting an unknown id is a no-op.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let (items,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(items as u64)
    }

    /// Set or clear the error status for a feed
    pub async fn set_feed_error(&self, feed_id: i64, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE feeds SET error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Map of feed id to its last refresh error, for feeds that have one
    pub async fn get_feed_errors(&self) -> Result<HashMap<i64, String>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, error FROM feeds WHERE error IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn update_feed_icon(&self, feed_id: i64, icon: Option<&[u8]>) -> Result<()> {
        sqlx::query("UPDATE feeds SET icon = ? WHERE id = ?")
            .bind(icon)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_feed_icon(&self, feed_id: i64) -> Result<Option<Vec<u8>>> {
        let row: Option<(Option<Vec<u8>>,)> = sqlx::query_as("SELECT icon FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|(icon,)| icon))
    }

    pub async fn set_feed_size(&self, feed_id: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE feeds SET size = ? WHERE id = ?")
            .bind(size)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a "not modified" answer: only the fetch timestamp moves.
    pub async fn touch_feed_fetched(&self, feed_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE feeds SET last_fetched = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Refresh Completion
    // ========================================================================

    /// Complete a feed refresh atomically.
    ///
    /// In one transaction: inserts `items` (already filtered to unseen
    /// fingerprints, in source order), clears the error, stores the new
    /// conditional-request validators and fetch time, and recomputes the
    /// feed size. Validators are therefore never committed without the items
    /// they describe.
    ///
    /// # Returns
    ///
    /// The number of newly inserted items. Rows whose `(feed_id, guid)`
    /// already exists are ignored, so a racing insert is not double-counted.
    pub async fn complete_feed_refresh(
        &self,
        feed_id: i64,
        items: &[NewItem],
        validators: &CacheValidators,
    ) -> Result<usize, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = insert_items(&mut tx, feed_id, items, now).await?;

        sqlx::query(
            r#"
            UPDATE feeds SET
                error = NULL,
                etag = ?,
                last_modified = ?,
                last_fetched = ?,
                size = (SELECT COUNT(*) FROM items WHERE feed_id = ?)
            WHERE id = ?
        "#,
        )
        .bind(&validators.etag)
        .bind(&validators.last_modified)
        .bind(now)
        .bind(feed_id)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }
}

/// INSERT OR IGNORE `items` in batches, returning how many rows were new.
pub(crate) async fn insert_items(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    feed_id: i64,
    items: &[NewItem],
    now: i64,
) -> Result<usize, sqlx::Error> {
    let mut total_inserted = 0usize;

    for chunk in items.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO items (guid, feed_id, title, link, content, date, date_arrived) ",
        );
        builder.push_values(chunk, |mut b, item| {
            b.push_bind(&item.guid)
                .push_bind(feed_id)
                .push_bind(&item.title)
                .push_bind(&item.link)
                .push_bind(&item.content)
                .push_bind(item.date)
                .push_bind(now);
        });
        let result = builder.build().execute(&mut **tx).await?;
        total_inserted += result.rows_affected() as usize;
    }

    Ok(total_inserted)
}
