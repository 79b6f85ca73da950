use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::parser::ParsedItem;
use crate::storage::{CacheValidators, Database, NewItem};

/// Stable per-feed identifier for an entry.
///
/// The entry's own identifier when it has one, otherwise a SHA-256 over
/// link, title and publication time.
pub fn fingerprint(item: &ParsedItem) -> String {
    if let Some(id) = item.source_id.as_deref() {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        item.link.as_deref().unwrap_or(""),
        item.title,
        item.date.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// Convert parsed entries into storage records.
///
/// Entries repeating an earlier fingerprint in the same document are
/// dropped; the first occurrence wins and source order is kept.
pub fn to_new_items(items: &[ParsedItem]) -> Vec<NewItem> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter_map(|item| {
            let guid = fingerprint(item);
            if !seen.insert(guid.clone()) {
                return None;
            }
            Some(NewItem {
                guid,
                title: item.title.clone(),
                link: item.link.clone(),
                content: item.content.clone(),
                date: item.date,
            })
        })
        .collect()
}

/// Persist the entries of `items` not yet stored for `feed_id`.
///
/// With `validators`, this is the completion of a refresh: the new items,
/// the validators, the cleared error and the feed size commit together.
/// Without, items are inserted and the size updated (initial subscription).
///
/// # Returns
///
/// The number of newly stored items. Merging the same entries again
/// returns 0.
pub async fn merge_items(
    db: &Database,
    feed_id: i64,
    items: &[ParsedItem],
    validators: Option<&CacheValidators>,
) -> anyhow::Result<usize> {
    let candidates = to_new_items(items);
    let guids: Vec<String> = candidates.iter().map(|i| i.guid.clone()).collect();
    let existing = db.existing_guids(feed_id, &guids).await?;

    let unseen: Vec<NewItem> = candidates
        .into_iter()
        .filter(|item| !existing.contains(&item.guid))
        .collect();

    tracing::debug!(
        feed_id,
        parsed = items.len(),
        unseen = unseen.len(),
        "Merging items"
    );

    match validators {
        Some(validators) => Ok(db
            .complete_feed_refresh(feed_id, &unseen, validators)
            .await?),
        None => {
            let inserted = db.create_items(feed_id, &unseen).await?;
            let size = db.count_items(feed_id).await?;
            db.set_feed_size(feed_id, size).await?;
            Ok(inserted)
        }
    }
}
