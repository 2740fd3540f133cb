//! Local cache tier - O(1) per-device volatile cache
//!
//! Synchronous under the hood (DashMap), always reachable, cleared on
//! device reset. Never the sole source of truth for cross-device data,
//! but always written first so the UI stays responsive while the durable
//! tiers converge.

use crate::codec::{self, TierKind};
use crate::error::Result;
use crate::model::{Principal, Record, RecordKey};
use crate::tier::{Envelope, Location, TierAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

struct CacheEntry {
    bytes: Vec<u8>,
    updated_at: DateTime<Utc>,
}

/// Cache hit/miss statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub item_count: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Per-device volatile cache adapter
pub struct LocalCacheAdapter {
    entries: DashMap<RecordKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalCacheAdapter {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Device reset: drop everything. Durable tiers repopulate on read.
    pub fn clear(&self) {
        self.entries.clear();
        info!("Local cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            item_count: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn decode_entry(&self, entry: &CacheEntry) -> Result<Envelope> {
        let record = codec::decode(&entry.bytes, TierKind::LocalCache)?;
        Ok(Envelope {
            record,
            updated_at: Some(entry.updated_at),
            location: Location::LocalCache,
        })
    }
}

impl Default for LocalCacheAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TierAdapter for LocalCacheAdapter {
    fn kind(&self) -> TierKind {
        TierKind::LocalCache
    }

    async fn reachable(&self) -> bool {
        true
    }

    async fn put(&self, record: &Record) -> Result<Location> {
        let bytes = codec::encode(record, TierKind::LocalCache)?;
        let key = record.key();
        debug!(key = %key, size = bytes.len(), "Cached record");
        self.entries.insert(
            key,
            CacheEntry {
                bytes,
                updated_at: record.updated_at(),
            },
        );
        Ok(Location::LocalCache)
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Envelope>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache hit");
                Ok(Some(self.decode_entry(&entry)?))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
                Ok(None)
            }
        }
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_by_owner(&self, owner: &Principal) -> Result<Vec<Envelope>> {
        let mut result = Vec::new();
        for entry in self.entries.iter() {
            let envelope = self.decode_entry(&entry)?;
            if envelope.record.owner() == owner {
                result.push(envelope);
            }
        }
        Ok(result)
    }

    async fn list_public(&self) -> Result<Vec<Envelope>> {
        let mut result = Vec::new();
        for entry in self.entries.iter() {
            let envelope = self.decode_entry(&entry)?;
            if envelope.record.is_public() {
                result.push(envelope);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difficulty, Quest, QuestId, Visibility};

    fn quest(owner: &str, visibility: Visibility) -> Quest {
        Quest {
            id: QuestId::generate(),
            title: "cache test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            difficulty: Difficulty::Easy,
            requirements: vec![],
            reward: String::new(),
            visibility,
            owner: Principal::new(owner),
            event_window: None,
            participant_limit: 0,
            participants: Default::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let cache = LocalCacheAdapter::new();
        let record = Record::Quest(quest("0xa", Visibility::Public));
        let key = record.key();

        assert!(cache.get(&key).await.unwrap().is_none());

        cache.put(&record).await.unwrap();
        let envelope = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(envelope.record, record);
        assert!(envelope.updated_at.is_some());

        cache.delete(&key).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn listings_partition_by_owner_and_visibility() {
        let cache = LocalCacheAdapter::new();
        cache
            .put(&Record::Quest(quest("0xa", Visibility::Public)))
            .await
            .unwrap();
        cache
            .put(&Record::Quest(quest("0xa", Visibility::InviteOnly)))
            .await
            .unwrap();
        cache
            .put(&Record::Quest(quest("0xb", Visibility::Public)))
            .await
            .unwrap();

        assert_eq!(
            cache.list_by_owner(&Principal::new("0xa")).await.unwrap().len(),
            2
        );
        assert_eq!(cache.list_public().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clear_empties_the_device() {
        let cache = LocalCacheAdapter::new();
        let record = Record::Quest(quest("0xa", Visibility::Public));
        cache.put(&record).await.unwrap();

        cache.clear();
        assert!(cache.get(&record.key()).await.unwrap().is_none());
    }
}
