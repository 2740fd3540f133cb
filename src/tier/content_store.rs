//! Content-addressed store tier
//!
//! The collaborator is append-only and hash-addressed: `put(bytes)` returns
//! a `sha256-<hex>` address, `get(hash)` returns the bytes, and there is no
//! delete or update. "Updating" a record therefore means writing a new blob
//! and moving the adapter's id-to-hash pointer; the old blob remains
//! retrievable. Deletion is advisory: the pointer goes away, the blob stays
//! addressable. That staleness window is accepted, not a bug.

use crate::codec::{self, TierKind};
use crate::error::{Result, SyncError};
use crate::model::{Principal, Record, RecordKey};
use crate::tier::{Envelope, Location, TierAdapter};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Hash-addressed blob collaborator consumed by the adapter.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes, returning their content address.
    async fn put(&self, data: &[u8]) -> Result<String>;

    /// Fetch bytes by content address.
    async fn get(&self, hash: &str) -> Result<Vec<u8>>;

    /// Whether the store is currently reachable.
    async fn reachable(&self) -> bool;
}

/// File-backed content store
///
/// Blobs land under `<root>/blobs/<first 4 hash chars>/<hash>` for better
/// filesystem distribution.
pub struct FsContentStore {
    root_dir: PathBuf,
}

impl FsContentStore {
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;
        info!(path = %root_dir.display(), "Initialized content store");
        Ok(Self { root_dir })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        let hash_part = hash.strip_prefix("sha256-").unwrap_or(hash);
        let subdir = &hash_part[..4.min(hash_part.len())];
        self.root_dir.join("blobs").join(subdir).join(hash)
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, data: &[u8]) -> Result<String> {
        let hash = codec::content_hash(data);
        let path = self.blob_path(&hash);

        // Content-addressed: an existing blob is already this content.
        if fs::metadata(&path).await.is_ok() {
            debug!(hash = %hash, "Blob already exists");
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;

        debug!(hash = %hash, size = data.len(), "Stored blob");
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        if fs::metadata(&path).await.is_err() {
            return Err(SyncError::NotFound(hash.to_string()));
        }
        let data = fs::read(&path).await?;

        // Verify the address still matches the content.
        let computed = codec::content_hash(&data);
        if computed != hash {
            return Err(SyncError::HashMismatch {
                expected: hash.to_string(),
                actual: computed,
            });
        }
        Ok(data)
    }

    async fn reachable(&self) -> bool {
        true
    }
}

/// In-memory content store with a togglable reachability flag (for tests
/// and for simulating an unreachable shared store).
pub struct MemoryContentStore {
    blobs: DashMap<String, Vec<u8>>,
    online: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.online.store(reachable, Ordering::SeqCst);
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8]) -> Result<String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::TierUnreachable("content store offline".into()));
        }
        let hash = codec::content_hash(data);
        self.blobs.insert(hash.clone(), data.to_vec());
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::TierUnreachable("content store offline".into()));
        }
        self.blobs
            .get(hash)
            .map(|b| b.clone())
            .ok_or_else(|| SyncError::NotFound(hash.to_string()))
    }

    async fn reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Adapter fronting the hash-addressed collaborator.
///
/// Keeps an id-to-latest-hash pointer map so keyed `get` works against a
/// store that only understands content addresses. Reads surface
/// `updated_at = None`: the content tier carries no authoritative
/// timestamp, so merges treat it as presence-only.
pub struct ContentStoreAdapter {
    store: Arc<dyn ContentStore>,
    pointers: DashMap<RecordKey, String>,
}

impl ContentStoreAdapter {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            pointers: DashMap::new(),
        }
    }

    /// Current content address for a key, if any.
    pub fn pointer(&self, key: &RecordKey) -> Option<String> {
        self.pointers.get(key).map(|h| h.clone())
    }

    /// Re-seat a pointer from an index location hint (recovery path).
    pub fn restore_pointer(&self, key: RecordKey, hash: String) {
        self.pointers.insert(key, hash);
    }

    /// Fetch a record at an explicit content address, bypassing pointers.
    /// Old addresses remain valid after updates; that is the point of an
    /// immutable tier.
    pub async fn get_at(&self, hash: &str) -> Result<Envelope> {
        let bytes = self.store.get(hash).await?;
        let record = codec::decode(&bytes, TierKind::ContentStore)?;
        Ok(Envelope {
            record,
            updated_at: None,
            location: Location::ContentStore {
                hash: hash.to_string(),
            },
        })
    }
}

#[async_trait]
impl TierAdapter for ContentStoreAdapter {
    fn kind(&self) -> TierKind {
        TierKind::ContentStore
    }

    async fn reachable(&self) -> bool {
        self.store.reachable().await
    }

    async fn put(&self, record: &Record) -> Result<Location> {
        let bytes = codec::encode(record, TierKind::ContentStore)?;
        let hash = self.store.put(&bytes).await?;
        let key = record.key();

        let old = self.pointers.insert(key.clone(), hash.clone());
        if let Some(old_hash) = old {
            if old_hash != hash {
                debug!(key = %key, old = %old_hash, new = %hash, "Moved content pointer");
            }
        }

        Ok(Location::ContentStore { hash })
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Envelope>> {
        let hash = match self.pointers.get(key) {
            Some(h) => h.clone(),
            None => return Ok(None),
        };
        match self.get_at(&hash).await {
            Ok(envelope) => Ok(Some(envelope)),
            Err(SyncError::NotFound(_)) => {
                warn!(key = %key, hash = %hash, "Dangling content pointer");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        // Advisory only. The blob stays addressable by hash.
        self.pointers.remove(key);
        debug!(key = %key, "Removed content pointer (blob retained)");
        Ok(())
    }

    async fn list_by_owner(&self, owner: &Principal) -> Result<Vec<Envelope>> {
        let hashes: Vec<String> = self.pointers.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for hash in hashes {
            let envelope = self.get_at(&hash).await?;
            if envelope.record.owner() == owner {
                result.push(envelope);
            }
        }
        Ok(result)
    }

    async fn list_public(&self) -> Result<Vec<Envelope>> {
        let hashes: Vec<String> = self.pointers.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for hash in hashes {
            let envelope = self.get_at(&hash).await?;
            if envelope.record.is_public() {
                result.push(envelope);
            }
        }
        Ok(result)
    }
}
