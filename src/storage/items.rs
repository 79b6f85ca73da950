use anyhow::Result;
use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::feeds::insert_items;
use super::schema::Database;
use super::search::fts_match_expression;
use super::types::{FeedStats, Item, ItemFilter, ItemRow, ItemStatus, MarkFilter, NewItem};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of items to return from any single query (OOM protection)
const MAX_ITEMS: i64 = 2000;

/// Fingerprints per `IN (...)` lookup
const GUID_LOOKUP_BATCH: usize = 500;

const ITEM_COLUMNS: &str = "i.id, i.guid, i.feed_id, i.title, i.link, i.content, i.date, i.status";

impl Database {
    // ========================================================================
    // Item Writes
    // ========================================================================

    /// Insert items for a feed, returning how many were new.
    ///
    /// Items whose fingerprint is already stored for the feed are skipped.
    pub async fn create_items(&self, feed_id: i64, items: &[NewItem]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let inserted = insert_items(&mut tx, feed_id, items, now).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Which of `guids` are already stored for `feed_id`
    pub async fn existing_guids(&self, feed_id: i64, guids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();

        for chunk in guids.chunks(GUID_LOOKUP_BATCH) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT guid FROM items WHERE feed_id = ");
            builder.push_bind(feed_id);
            builder.push(" AND guid IN (");
            let mut separated = builder.separated(", ");
            for guid in chunk {
                separated.push_bind(guid);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&self.pool).await?;
            found.extend(rows.into_iter().map(|(guid,)| guid));
        }

        Ok(found)
    }

    /// Set the status of one item. Returns false if the item does not exist.
    pub async fn update_item_status(&self, item_id: i64, status: ItemStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE items SET status = ? WHERE id = ?")
            .bind(status.as_i64())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark unread items as read, optionally limited to a folder or feed.
    ///
    /// Starred items keep their status. Returns the number of items changed.
    pub async fn mark_items_read(&self, filter: MarkFilter) -> Result<u64> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE items SET status = ");
        builder.push_bind(ItemStatus::Read.as_i64());
        builder.push(" WHERE status = ");
        builder.push_bind(ItemStatus::Unread.as_i64());
        if let Some(feed_id) = filter.feed_id {
            builder.push(" AND feed_id = ");
            builder.push_bind(feed_id);
        }
        if let Some(folder_id) = filter.folder_id {
            builder.push(" AND feed_id IN (SELECT id FROM feeds WHERE folder_id = ");
            builder.push_bind(folder_id);
            builder.push(")");
        }

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Item Queries
    // ========================================================================

    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items i WHERE i.id = ?");
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ItemRow::into_item))
    }

    /// List items matching `filter`, ordered by publication date.
    ///
    /// Items without a date sort as the oldest. Ties break on id, so
    /// `filter.after` works as a stable cursor. A search term first brings
    /// the full-text index up to date.
    ///
    /// PERF-003: `limit` is capped at MAX_ITEMS.
    pub async fn list_items(
        &self,
        filter: &ItemFilter,
        limit: i64,
        newest_first: bool,
    ) -> Result<Vec<Item>> {
        let limit = limit.clamp(1, MAX_ITEMS);

        let search = match filter.search.as_deref() {
            Some(term) => match fts_match_expression(term)? {
                Some(expr) => {
                    self.sync_search().await?;
                    Some(expr)
                }
                None => None,
            },
            None => None,
        };

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM items i WHERE 1 = 1"));

        if let Some(folder_id) = filter.folder_id {
            builder.push(" AND i.feed_id IN (SELECT id FROM feeds WHERE folder_id = ");
            builder.push_bind(folder_id);
            builder.push(")");
        }
        if let Some(feed_id) = filter.feed_id {
            builder.push(" AND i.feed_id = ");
            builder.push_bind(feed_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND i.status = ");
            builder.push_bind(status.as_i64());
        }
        if let Some(expr) = search {
            builder.push(" AND i.id IN (SELECT rowid FROM items_fts WHERE items_fts MATCH ");
            builder.push_bind(expr);
            builder.push(")");
        }
        let (cmp, dir) = if newest_first { ("<", "DESC") } else { (">", "ASC") };
        if let Some(after) = filter.after {
            builder.push(format!(
                " AND (COALESCE(i.date, 0), i.id) {cmp} \
                 (SELECT COALESCE(date, 0), id FROM items WHERE id = "
            ));
            builder.push_bind(after);
            builder.push(")");
        }
        builder.push(format!(" ORDER BY COALESCE(i.date, 0) {dir}, i.id {dir} LIMIT "));
        builder.push_bind(limit);

        tracing::debug!(limit, newest_first, "list_items");

        let rows: Vec<ItemRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ItemRow::into_item).collect())
    }

    pub async fn count_items(&self, feed_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Unread and starred counts for every feed that has items
    pub async fn feed_stats(&self) -> Result<Vec<FeedStats>> {
        let stats = sqlx::query_as::<_, FeedStats>(
            r#"
            SELECT feed_id,
                   SUM(CASE WHEN status = 0 THEN 1 ELSE 0 END) AS unread,
                   SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END) AS starred
            FROM items
            GROUP BY feed_id
            ORDER BY feed_id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, ItemFilter, ItemStatus, MarkFilter, NewItem};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(guid: &str, date: Option<i64>) -> NewItem {
        NewItem {
            guid: guid.to_string(),
            title: format!("Item {guid}"),
            link: None,
            content: Some(format!("Content of {guid}")),
            date,
        }
    }

    async fn seeded() -> (Database, i64) {
        let db = test_db().await;
        let feed = db
            .create_feed("F", None, None, "https://example.com/feed", None)
            .await
            .unwrap();
        let items = vec![
            item("a", Some(100)),
            item("b", Some(300)),
            item("c", Some(200)),
        ];
        db.create_items(feed.id, &items).await.unwrap();
        (db, feed.id)
    }

    fn guids(items: &[crate::storage::Item]) -> Vec<&str> {
        items.iter().map(|i| i.guid.as_str()).collect()
    }

    #[tokio::test]
    async fn test_create_items_skips_duplicates() {
        let (db, feed_id) = seeded().await;
        let inserted = db
            .create_items(feed_id, &[item("a", Some(100)), item("d", None)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.count_items(feed_id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_existing_guids() {
        let (db, feed_id) = seeded().await;
        let known = db
            .existing_guids(feed_id, &["a".to_string(), "x".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.contains("a"));
        assert!(known.contains("c"));
    }

    #[tokio::test]
    async fn test_existing_guids_is_per_feed() {
        let (db, _) = seeded().await;
        let other = db
            .create_feed("G", None, None, "https://other.example.com/feed", None)
            .await
            .unwrap();
        let known = db.existing_guids(other.id, &["a".to_string()]).await.unwrap();
        assert!(known.is_empty());
    }

    #[tokio::test]
    async fn test_list_items_order() {
        let (db, _) = seeded().await;
        let newest = db.list_items(&ItemFilter::default(), 10, true).await.unwrap();
        assert_eq!(guids(&newest), vec!["b", "c", "a"]);

        let oldest = db.list_items(&ItemFilter::default(), 10, false).await.unwrap();
        assert_eq!(guids(&oldest), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_list_items_cursor() {
        let (db, _) = seeded().await;
        let first = db.list_items(&ItemFilter::default(), 1, true).await.unwrap();
        assert_eq!(guids(&first), vec!["b"]);

        let filter = ItemFilter {
            after: Some(first[0].id),
            ..Default::default()
        };
        let rest = db.list_items(&filter, 10, true).await.unwrap();
        assert_eq!(guids(&rest), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_list_items_by_status_and_folder() {
        let db = test_db().await;
        let folder = db.create_folder("Tech").await.unwrap();
        let inside = db
            .create_feed("In", None, None, "https://in.example.com/feed", Some(folder.id))
            .await
            .unwrap();
        let outside = db
            .create_feed("Out", None, None, "https://out.example.com/feed", None)
            .await
            .unwrap();
        db.create_items(inside.id, &[item("in-1", Some(1)), item("in-2", Some(2))])
            .await
            .unwrap();
        db.create_items(outside.id, &[item("out-1", Some(3))])
            .await
            .unwrap();

        let in_folder = db
            .list_items(
                &ItemFilter {
                    folder_id: Some(folder.id),
                    ..Default::default()
                },
                10,
                true,
            )
            .await
            .unwrap();
        assert_eq!(guids(&in_folder), vec!["in-2", "in-1"]);

        let starred_id = in_folder[0].id;
        assert!(db
            .update_item_status(starred_id, ItemStatus::Starred)
            .await
            .unwrap());
        let starred = db
            .list_items(
                &ItemFilter {
                    status: Some(ItemStatus::Starred),
                    ..Default::default()
                },
                10,
                true,
            )
            .await
            .unwrap();
        assert_eq!(guids(&starred), vec!["in-2"]);
    }

    #[tokio::test]
    async fn test_mark_items_read_keeps_starred() {
        let (db, feed_id) = seeded().await;
        let items = db.list_items(&ItemFilter::default(), 10, true).await.unwrap();
        db.update_item_status(items[0].id, ItemStatus::Starred)
            .await
            .unwrap();

        let changed = db
            .mark_items_read(MarkFilter {
                feed_id: Some(feed_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let item = db.get_item(items[0].id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Starred);
    }

    #[tokio::test]
    async fn test_feed_stats() {
        let (db, feed_id) = seeded().await;
        let items = db.list_items(&ItemFilter::default(), 10, true).await.unwrap();
        db.update_item_status(items[0].id, ItemStatus::Read)
            .await
            .unwrap();
        db.update_item_status(items[1].id, ItemStatus::Starred)
            .await
            .unwrap();

        let stats = db.feed_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].feed_id, feed_id);
        assert_eq!(stats[0].unread, 1);
        assert_eq!(stats[0].starred, 1);
    }

    #[tokio::test]
    async fn test_delete_feed_cascades_items() {
        let (db, feed_id) = seeded().await;
        db.sync_search().await.unwrap();
        let removed = db.delete_feed(feed_id).await.unwrap();
        assert_eq!(removed, 3);
        assert!(db
            .list_items(&ItemFilter::default(), 10, true)
            .await
            .unwrap()
            .is_empty());
    }
}
