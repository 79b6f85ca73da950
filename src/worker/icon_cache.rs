use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::feed::sniff_image_type;

/// A feed icon ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIcon {
    pub content_type: &'static str,
    pub bytes: Arc<[u8]>,
    /// Strong validator derived from the bytes
    pub etag: String,
}

impl CachedIcon {
    fn new(bytes: Vec<u8>) -> Self {
        let digest = Sha256::digest(&bytes);
        let etag = format!("{:x}", digest)[..16].to_string();
        Self {
            content_type: sniff_image_type(&bytes).unwrap_or("application/octet-stream"),
            bytes: bytes.into(),
            etag,
        }
    }
}

/// Bounded per-feed icon cache.
///
/// Entries are dropped when their feed is deleted or its icon changes, and
/// the least recently served icon goes first once capacity is reached.
///
/// `generation` moves on every eviction. A caller that read icon bytes from
/// storage outside the lock passes the generation it saw before the read to
/// [`insert_if_current`](Self::insert_if_current); if anything was evicted in
/// between, the bytes may be stale and are not cached.
pub(crate) struct IconCache {
    entries: LruCache<i64, CachedIcon>,
    generation: u64,
}

impl IconCache {
    /// A capacity of 0 is treated as 1.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            generation: 0,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Cache `bytes` unless an eviction happened since `seen_generation`.
    /// The icon is returned either way.
    pub(crate) fn insert_if_current(
        &mut self,
        feed_id: i64,
        bytes: Vec<u8>,
        seen_generation: u64,
    ) -> CachedIcon {
        if seen_generation != self.generation {
            return CachedIcon::new(bytes);
        }
        self.insert(feed_id, bytes)
    }

    pub(crate) fn get(&mut self, feed_id: i64) -> Option<CachedIcon> {
        self.entries.get(&feed_id).cloned()
    }

    pub(crate) fn insert(&mut self, feed_id: i64, bytes: Vec<u8>) -> CachedIcon {
        let icon = CachedIcon::new(bytes);
        self.entries.put(feed_id, icon.clone());
        icon
    }

    pub(crate) fn evict(&mut self, feed_id: i64) {
        self.entries.pop(&feed_id);
        self.generation = self.generation.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
