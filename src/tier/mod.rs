//! Storage tiers
//!
//! Three backends with different consistency and availability properties,
//! behind one adapter contract:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Sync Coordinator                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  LocalCacheAdapter    - fast, volatile, always reachable         │
//! │  ContentStoreAdapter  - immutable, hash-addressed, shared        │
//! │  AuthoritativeAdapter - mutable, query-capable, may be offline   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Adapters are injected instances, never process-wide singletons; tests
//! substitute in-memory collaborators for each one.

pub mod authoritative;
pub mod content_store;
pub mod local_cache;

pub use authoritative::{AuthoritativeAdapter, AuthoritativeStore, MemoryAuthoritativeStore, Row};
pub use content_store::{ContentStore, ContentStoreAdapter, FsContentStore, MemoryContentStore};
pub use local_cache::{CacheStats, LocalCacheAdapter};

use crate::codec::TierKind;
use crate::error::Result;
use crate::model::{Principal, Record, RecordKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a record landed within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "kebab-case")]
pub enum Location {
    LocalCache,
    /// Content-addressed blob; a new hash on every content change.
    ContentStore { hash: String },
    /// Keyed row scoped by partition.
    Authoritative { partition: String },
}

impl Location {
    pub fn kind(&self) -> TierKind {
        match self {
            Location::LocalCache => TierKind::LocalCache,
            Location::ContentStore { .. } => TierKind::ContentStore,
            Location::Authoritative { .. } => TierKind::Authoritative,
        }
    }
}

/// A record as read back from a tier.
///
/// `updated_at` is `None` for tiers that carry no authoritative timestamp
/// (the content store); the merge falls back to presence-wins there.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub record: Record,
    pub updated_at: Option<DateTime<Utc>>,
    pub location: Location,
}

/// Uniform contract across the three storage tiers.
#[async_trait]
pub trait TierAdapter: Send + Sync {
    /// Which tier this adapter fronts.
    fn kind(&self) -> TierKind;

    /// Health probe used by the coordinator to decide fallback order.
    async fn reachable(&self) -> bool;

    /// Store a record, returning where it landed.
    async fn put(&self, record: &Record) -> Result<Location>;

    /// Fetch a record by key.
    async fn get(&self, key: &RecordKey) -> Result<Option<Envelope>>;

    /// Remove a record. Advisory for immutable tiers.
    async fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Finite, restartable listing of everything in the owner's partition.
    async fn list_by_owner(&self, owner: &Principal) -> Result<Vec<Envelope>>;

    /// Listing of publicly replicated records.
    async fn list_public(&self) -> Result<Vec<Envelope>>;
}
