use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The database is locked by another process. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// lock contention when a second process opens the same file.
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Item Status
// ============================================================================

/// Read state of an item. Stored as an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Unread,
    Read,
    Starred,
}

impl ItemStatus {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            ItemStatus::Unread => 0,
            ItemStatus::Read => 1,
            ItemStatus::Starred => 2,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            1 => ItemStatus::Read,
            2 => ItemStatus::Starred,
            _ => ItemStatus::Unread,
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(ItemStatus::Unread),
            "read" => Ok(ItemStatus::Read),
            "starred" => Ok(ItemStatus::Starred),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// A storage-ready item produced by the merge step.
///
/// `guid` is the per-feed fingerprint; `(feed_id, guid)` is unique.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub content: Option<String>,
    /// Publication time as a Unix timestamp
    pub date: Option<i64>,
}

/// Conditional-request state remembered from the last successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Filter for [`Database::list_items`](super::Database::list_items).
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub folder_id: Option<i64>,
    pub feed_id: Option<i64>,
    pub status: Option<ItemStatus>,
    pub search: Option<String>,
    /// Pagination cursor: continue after this item id in list order
    pub after: Option<i64>,
}

/// Filter for [`Database::mark_items_read`](super::Database::mark_items_read).
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkFilter {
    pub folder_id: Option<i64>,
    pub feed_id: Option<i64>,
}

/// Internal row type for Feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub feed_link: String,
    pub folder_id: Option<i64>,
    pub has_icon: bool,
    pub error: Option<String>,
    pub size: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched: Option<i64>,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: self.title,
            description: self.description,
            link: self.link,
            feed_link: self.feed_link,
            folder_id: self.folder_id,
            has_icon: self.has_icon,
            error: self.error,
            size: self.size,
            validators: CacheValidators {
                etag: self.etag,
                last_modified: self.last_modified,
            },
            last_fetched: self.last_fetched,
        }
    }
}

/// Internal row type for Item queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub guid: String,
    pub feed_id: i64,
    pub title: String,
    pub link: Option<String>,
    pub content: Option<String>,
    pub date: Option<i64>,
    pub status: i64,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> Item {
        Item {
            id: self.id,
            guid: self.guid,
            feed_id: self.feed_id,
            title: self.title,
            link: self.link,
            content: self.content,
            date: self.date,
            status: ItemStatus::from_i64(self.status),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed.
///
/// The icon blob is not loaded with the feed; `has_icon` says whether one is
/// stored and [`Database::get_feed_icon`](super::Database::get_feed_icon)
/// reads it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    /// Website URL
    pub link: Option<String>,
    /// Subscription URL
    pub feed_link: String,
    pub folder_id: Option<i64>,
    pub has_icon: bool,
    pub error: Option<String>,
    /// Number of stored items
    pub size: i64,
    #[serde(skip)]
    pub validators: CacheValidators,
    pub last_fetched: Option<i64>,
}

/// A stored feed entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub id: i64,
    pub guid: String,
    pub feed_id: i64,
    pub title: String,
    pub link: Option<String>,
    /// Raw content as published; sanitization happens when it is served
    pub content: Option<String>,
    pub date: Option<i64>,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub title: String,
    pub is_expanded: bool,
}

/// Per-feed unread/starred counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct FeedStats {
    pub feed_id: i64,
    pub unread: i64,
    pub starred: i64,
}
