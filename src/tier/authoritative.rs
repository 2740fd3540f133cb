//! Authoritative store tier
//!
//! Row-oriented collaborator scoped by partition key = principal, with a
//! mirror partition for public quests and optimistic concurrency via the
//! last-updated timestamp column. Source of truth when reachable; when it
//! is not, the coordinator degrades to cache-only with a pending-sync
//! marker and reconciliation converges later.

use crate::codec::{self, TierKind};
use crate::error::{Result, SyncError};
use crate::model::{Principal, Record, RecordKey};
use crate::tier::{Envelope, Location, TierAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Partition that mirrors publicly visible quests.
pub const PUBLIC_PARTITION: &str = "~public";

/// A stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub partition: String,
    pub key: String,
    pub bytes: Vec<u8>,
    /// Optimistic concurrency column: writes carrying an older timestamp
    /// than the stored row are superseded, not applied.
    pub updated_at: DateTime<Utc>,
}

/// Row-oriented network store collaborator.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    async fn read(&self, partition: &str, key: &str) -> Result<Option<Row>>;

    /// Write a row. Returns `false` when the stored row is newer and the
    /// write was superseded.
    async fn write(&self, row: Row) -> Result<bool>;

    async fn delete(&self, partition: &str, key: &str) -> Result<()>;

    async fn list_partition(&self, partition: &str) -> Result<Vec<Row>>;

    async fn reachable(&self) -> bool;
}

/// In-memory authoritative store with a togglable reachability flag,
/// simulating the sometimes-offline network store.
pub struct MemoryAuthoritativeStore {
    rows: DashMap<(String, String), Row>,
    online: AtomicBool,
}

impl MemoryAuthoritativeStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.online.store(reachable, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TierUnreachable(
                "authoritative store offline".into(),
            ))
        }
    }
}

impl Default for MemoryAuthoritativeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthoritativeStore for MemoryAuthoritativeStore {
    async fn read(&self, partition: &str, key: &str) -> Result<Option<Row>> {
        self.ensure_online()?;
        Ok(self
            .rows
            .get(&(partition.to_string(), key.to_string()))
            .map(|r| r.clone()))
    }

    async fn write(&self, row: Row) -> Result<bool> {
        self.ensure_online()?;
        let map_key = (row.partition.clone(), row.key.clone());
        if let Some(existing) = self.rows.get(&map_key) {
            if existing.updated_at > row.updated_at {
                return Ok(false);
            }
        }
        self.rows.insert(map_key, row);
        Ok(true)
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<()> {
        self.ensure_online()?;
        self.rows.remove(&(partition.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_partition(&self, partition: &str) -> Result<Vec<Row>> {
        self.ensure_online()?;
        Ok(self
            .rows
            .iter()
            .filter(|e| e.key().0 == partition)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Adapter fronting the row-oriented collaborator.
pub struct AuthoritativeAdapter {
    store: Arc<dyn AuthoritativeStore>,
}

impl AuthoritativeAdapter {
    pub fn new(store: Arc<dyn AuthoritativeStore>) -> Self {
        Self { store }
    }

    /// Keyed read scoped to a known owner partition. Used when the index
    /// supplies the owner for an invite-only or event quest.
    pub async fn get_owned(&self, owner: &Principal, key: &RecordKey) -> Result<Option<Envelope>> {
        match self.store.read(owner.as_str(), &key.storage_key()).await? {
            Some(row) => Ok(Some(self.decode_row(row)?)),
            None => Ok(None),
        }
    }

    /// Remove a record row from the owner's partition (the public mirror
    /// is handled by the trait-level delete).
    pub async fn delete_owned(&self, owner: &Principal, key: &RecordKey) -> Result<()> {
        self.store.delete(owner.as_str(), &key.storage_key()).await
    }

    fn decode_row(&self, row: Row) -> Result<Envelope> {
        let record = codec::decode(&row.bytes, TierKind::Authoritative)?;
        Ok(Envelope {
            record,
            updated_at: Some(row.updated_at),
            location: Location::Authoritative {
                partition: row.partition,
            },
        })
    }
}

#[async_trait]
impl TierAdapter for AuthoritativeAdapter {
    fn kind(&self) -> TierKind {
        TierKind::Authoritative
    }

    async fn reachable(&self) -> bool {
        self.store.reachable().await
    }

    async fn put(&self, record: &Record) -> Result<Location> {
        let bytes = codec::encode(record, TierKind::Authoritative)?;
        let partition = record.owner().as_str().to_string();
        let key = record.key().storage_key();
        let updated_at = record.updated_at();

        let applied = self
            .store
            .write(Row {
                partition: partition.clone(),
                key: key.clone(),
                bytes: bytes.clone(),
                updated_at,
            })
            .await?;
        if !applied {
            debug!(key = %key, "Write superseded by a newer row");
        }

        // Public quests mirror into the shared partition so global
        // listings stay a single partition scan.
        if record.is_public() {
            self.store
                .write(Row {
                    partition: PUBLIC_PARTITION.to_string(),
                    key,
                    bytes,
                    updated_at,
                })
                .await?;
        } else if matches!(record, Record::Quest(_)) {
            // A quest that was public before may have left a mirror row
            // behind. Clear it so the downgrade takes effect in listings.
            self.store.delete(PUBLIC_PARTITION, &key).await?;
        }

        Ok(Location::Authoritative { partition })
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Envelope>> {
        // Keys embed no partition. Progress keys name their principal;
        // everything else resolves through the public mirror here, and
        // through `get_owned` when the caller holds an owner hint.
        let storage_key = key.storage_key();
        if let RecordKey::Progress(principal, _) = key {
            if let Some(row) = self.store.read(principal.as_str(), &storage_key).await? {
                return Ok(Some(self.decode_row(row)?));
            }
            return Ok(None);
        }

        match self.store.read(PUBLIC_PARTITION, &storage_key).await? {
            Some(row) => Ok(Some(self.decode_row(row)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let storage_key = key.storage_key();
        if let RecordKey::Progress(principal, _) = key {
            self.store.delete(principal.as_str(), &storage_key).await?;
            return Ok(());
        }
        self.store.delete(PUBLIC_PARTITION, &storage_key).await
    }

    async fn list_by_owner(&self, owner: &Principal) -> Result<Vec<Envelope>> {
        let rows = self.store.list_partition(owner.as_str()).await?;
        rows.into_iter().map(|r| self.decode_row(r)).collect()
    }

    async fn list_public(&self) -> Result<Vec<Envelope>> {
        let rows = self.store.list_partition(PUBLIC_PARTITION).await?;
        rows.into_iter().map(|r| self.decode_row(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difficulty, Quest, QuestId, Visibility};

    fn quest(owner: &str, visibility: Visibility) -> Quest {
        Quest {
            id: QuestId::generate(),
            title: "auth test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            difficulty: Difficulty::Hard,
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
    async fn public_quests_mirror_into_shared_partition() {
        let store = Arc::new(MemoryAuthoritativeStore::new());
        let adapter = AuthoritativeAdapter::new(store.clone());

        let q = quest("0xa", Visibility::Public);
        adapter.put(&Record::Quest(q.clone())).await.unwrap();

        // Reachable via public mirror and via owner partition.
        assert!(adapter.get(&RecordKey::Quest(q.id)).await.unwrap().is_some());
        assert!(adapter
            .get_owned(&Principal::new("0xa"), &RecordKey::Quest(q.id))
            .await
            .unwrap()
            .is_some());
        assert_eq!(adapter.list_public().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scoped_quests_stay_in_owner_partition() {
        let adapter = AuthoritativeAdapter::new(Arc::new(MemoryAuthoritativeStore::new()));

        let q = quest("0xa", Visibility::InviteOnly);
        adapter.put(&Record::Quest(q.clone())).await.unwrap();

        assert!(adapter.get(&RecordKey::Quest(q.id)).await.unwrap().is_none());
        assert!(adapter
            .get_owned(&Principal::new("0xa"), &RecordKey::Quest(q.id))
            .await
            .unwrap()
            .is_some());
        assert!(adapter.list_public().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn visibility_downgrade_clears_public_mirror() {
        let store = Arc::new(MemoryAuthoritativeStore::new());
        let adapter = AuthoritativeAdapter::new(store.clone());

        let mut q = quest("0xa", Visibility::Public);
        adapter.put(&Record::Quest(q.clone())).await.unwrap();
        assert_eq!(adapter.list_public().await.unwrap().len(), 1);

        q.visibility = Visibility::InviteOnly;
        q.updated_at = q.updated_at + chrono::Duration::seconds(5);
        adapter.put(&Record::Quest(q.clone())).await.unwrap();

        assert!(adapter.list_public().await.unwrap().is_empty());
        assert!(adapter.get(&RecordKey::Quest(q.id)).await.unwrap().is_none());
        assert!(adapter
            .get_owned(&Principal::new("0xa"), &RecordKey::Quest(q.id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_write_is_superseded() {
        let store = Arc::new(MemoryAuthoritativeStore::new());
        let adapter = AuthoritativeAdapter::new(store.clone());

        let mut q = quest("0xa", Visibility::Public);
        q.title = "new".to_string();
        adapter.put(&Record::Quest(q.clone())).await.unwrap();

        // A write with an older timestamp does not clobber the row.
        let mut stale = q.clone();
        stale.title = "old".to_string();
        stale.updated_at = q.updated_at - chrono::Duration::seconds(30);
        adapter.put(&Record::Quest(stale)).await.unwrap();

        let envelope = adapter.get(&RecordKey::Quest(q.id)).await.unwrap().unwrap();
        match envelope.record {
            Record::Quest(got) => assert_eq!(got.title, "new"),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_store_degrades_with_error() {
        let store = Arc::new(MemoryAuthoritativeStore::new());
        let adapter = AuthoritativeAdapter::new(store.clone());
        store.set_reachable(false);

        assert!(!adapter.reachable().await);
        let err = adapter
            .put(&Record::Quest(quest("0xa", Visibility::Public)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TierUnreachable(_)));
    }
}
