use anyhow::{bail, Result};

use super::schema::Database;

// ============================================================================
// FTS5 Query Construction
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_TERMS: usize = 10;

/// Turn free-form user input into an FTS5 MATCH expression.
///
/// Every whitespace-separated word becomes a quoted prefix term, so FTS5
/// operators and syntax characters typed by the user are matched literally
/// and the query can never fail to parse. Returns `None` for blank input.
///
/// Rejects queries longer than 256 characters or with more than 10 words
/// to bound prefix expansion cost.
pub(crate) fn fts_match_expression(query: &str) -> Result<Option<String>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(None);
    }
    if query.len() > MAX_QUERY_LENGTH {
        bail!("Search query exceeds maximum length of {MAX_QUERY_LENGTH} characters");
    }

    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{word}\"*"))
        .collect();

    if terms.len() > MAX_TERMS {
        bail!("Search query contains too many words (max {MAX_TERMS})");
    }
    if terms.is_empty() {
        return Ok(None);
    }
    Ok(Some(terms.join(" ")))
}

impl Database {
    // ========================================================================
    // Search Index
    // ========================================================================

    /// Add every not-yet-indexed item to the full-text index.
    ///
    /// Runs after refreshes that stored new items and before any search, so
    /// the index lags inserts by at most one refresh. Returns the number of
    /// items indexed.
    pub async fn sync_search(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO items_fts (rowid, title, content)
            SELECT id, title, COALESCE(content, '') FROM items WHERE search_indexed = 0
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE items SET search_indexed = 1 WHERE search_indexed = 0")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let indexed = result.rows_affected();
        if indexed > 0 {
            tracing::debug!(indexed, "Search index synced");
        }
        Ok(indexed)
    }
}
