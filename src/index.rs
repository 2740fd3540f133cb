//! Quest index - short-code and location directory
//!
//! Maps quest identifier to short code, owning principal, visibility and
//! last-known tier locations. Entries are weak references for lookup only;
//! the index never acts as a source of truth for entity content. The whole
//! directory can be rebuilt from whichever tiers are reachable, which is
//! the recovery path when the index itself is stale or missing.
//!
//! All mutation goes through `register`/`unregister`/`rebuild` behind a
//! single index-wide lock; updates are infrequent relative to reads.
//! Entries are persisted to sled (MessagePack values) so the directory
//! survives restarts; tests use the in-memory mode.

use crate::codec::{self, TierKind};
use crate::error::{Result, SyncError};
use crate::model::{Principal, QuestId, RecordKey, Visibility};
use crate::tier::{Location, TierAdapter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Directory entry for one quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub quest_id: QuestId,
    pub code: String,
    pub owner: Principal,
    pub visibility: Visibility,
    /// Last-known tier locations, at most one per tier.
    pub locations: Vec<Location>,
    pub updated_at: DateTime<Utc>,
    /// Set when a durable tier missed the last write; cleared by
    /// reconciliation once the write converges.
    pub pending: bool,
    /// Tombstone: the quest was deleted while the authoritative tier was
    /// unreachable. Reconciliation replays the delete, then unregisters.
    #[serde(default)]
    pub deleted: bool,
}

/// Default cap on candidates surfaced for an ambiguous code.
const DEFAULT_MAX_CANDIDATES: usize = 8;

/// Identifier-or-code reference accepted by `resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestRef {
    Id(QuestId),
    Code(String),
}

impl From<QuestId> for QuestRef {
    fn from(id: QuestId) -> Self {
        QuestRef::Id(id)
    }
}

/// Quest directory with optional sled persistence.
pub struct IndexManager {
    entries: RwLock<HashMap<QuestId, IndexEntry>>,
    tree: Option<sled::Tree>,
    code_len: usize,
    max_candidates: usize,
}

impl IndexManager {
    /// In-memory index (tests, ephemeral devices).
    pub fn new_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tree: None,
            code_len: codec::SHORT_CODE_LEN,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }

    /// Open a sled-backed index, loading any persisted entries.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree("quest_index")?;

        let mut entries = HashMap::new();
        for item in tree.iter() {
            let (_, value) = item?;
            match rmp_serde::from_slice::<IndexEntry>(&value) {
                Ok(entry) => {
                    entries.insert(entry.quest_id, entry);
                }
                Err(e) => warn!(error = %e, "Skipping undecodable index entry"),
            }
        }

        info!(
            path = %path.as_ref().display(),
            entries = entries.len(),
            "Opened quest index"
        );

        Ok(Self {
            entries: RwLock::new(entries),
            tree: Some(tree),
            code_len: codec::SHORT_CODE_LEN,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        })
    }

    pub fn with_code_len(mut self, len: usize) -> Self {
        self.code_len = len;
        self
    }

    /// Cap the candidate list surfaced on an ambiguous code.
    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max.max(2);
        self
    }

    /// Sled-backed index, sized from configuration.
    pub fn open_with_config(config: &crate::config::Config) -> Result<Self> {
        Ok(Self::open(config.index_db_path())?
            .with_code_len(config.short_code_len)
            .with_max_candidates(config.max_ambiguous_candidates))
    }

    fn persist(&self, entry: &IndexEntry) -> Result<()> {
        if let Some(tree) = &self.tree {
            let value = rmp_serde::to_vec(entry)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            tree.insert(entry.quest_id.0.as_bytes(), value)?;
        }
        Ok(())
    }

    fn persist_remove(&self, id: &QuestId) -> Result<()> {
        if let Some(tree) = &self.tree {
            tree.remove(id.0.as_bytes())?;
        }
        Ok(())
    }

    /// Register (or refresh) a quest, returning its short code.
    pub async fn register(
        &self,
        quest_id: QuestId,
        owner: Principal,
        visibility: Visibility,
        updated_at: DateTime<Utc>,
        locations: Vec<Location>,
    ) -> Result<String> {
        let code = codec::short_code_of_len(&quest_id, self.code_len);
        let mut entries = self.entries.write().await;

        let entry = entries.entry(quest_id).or_insert_with(|| IndexEntry {
            quest_id,
            code: code.clone(),
            owner: owner.clone(),
            visibility,
            locations: Vec::new(),
            updated_at,
            pending: false,
            deleted: false,
        });

        entry.owner = owner;
        entry.visibility = visibility;
        entry.updated_at = updated_at;
        // A re-save after a deferred delete reinstates the quest.
        entry.deleted = false;
        for location in locations {
            Self::upsert_location(&mut entry.locations, location);
        }

        let snapshot = entry.clone();
        drop(entries);
        self.persist(&snapshot)?;

        debug!(quest = %quest_id, code = %code, "Registered quest");
        Ok(code)
    }

    fn upsert_location(locations: &mut Vec<Location>, location: Location) {
        locations.retain(|l| l.kind() != location.kind());
        locations.push(location);
    }

    /// Remove a quest from the directory.
    pub async fn unregister(&self, quest_id: &QuestId) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(quest_id);
        drop(entries);
        self.persist_remove(quest_id)?;
        debug!(quest = %quest_id, "Unregistered quest");
        Ok(())
    }

    /// Flag a quest as awaiting durable-tier convergence.
    pub async fn mark_pending(&self, quest_id: &QuestId) -> Result<()> {
        self.set_pending(quest_id, true).await
    }

    /// Clear the pending flag after reconciliation converged.
    pub async fn clear_pending(&self, quest_id: &QuestId) -> Result<()> {
        self.set_pending(quest_id, false).await
    }

    /// Tombstone a quest whose authoritative delete was deferred. The
    /// entry rides the pending queue until reconciliation replays the
    /// delete and unregisters it.
    pub async fn mark_deleted(&self, quest_id: &QuestId) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(quest_id) {
            entry.deleted = true;
            entry.pending = true;
            let snapshot = entry.clone();
            drop(entries);
            self.persist(&snapshot)?;
        }
        Ok(())
    }

    /// Quests tombstoned by a deferred delete; excluded from resolution
    /// and listings so an undeleted durable row cannot resurface.
    pub async fn deleted_ids(&self) -> std::collections::HashSet<QuestId> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.deleted)
            .map(|e| e.quest_id)
            .collect()
    }

    async fn set_pending(&self, quest_id: &QuestId, pending: bool) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(quest_id) {
            entry.pending = pending;
            let snapshot = entry.clone();
            drop(entries);
            self.persist(&snapshot)?;
        }
        Ok(())
    }

    /// Resolve an identifier or short code to a directory entry.
    ///
    /// An ambiguous short code never silently picks a winner: all
    /// candidates are surfaced, ordered by (requesting principal's own
    /// entries, then most recently updated).
    pub async fn resolve(
        &self,
        quest_ref: &QuestRef,
        requester: Option<&Principal>,
    ) -> Result<IndexEntry> {
        let entries = self.entries.read().await;
        match quest_ref {
            QuestRef::Id(id) => entries
                .get(id)
                .filter(|e| !e.deleted)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(id.to_string())),
            QuestRef::Code(code) => {
                let mut candidates: Vec<IndexEntry> = entries
                    .values()
                    .filter(|e| &e.code == code && !e.deleted)
                    .cloned()
                    .collect();

                match candidates.len() {
                    0 => Err(SyncError::NotFound(code.clone())),
                    1 => Ok(candidates.swap_remove(0)),
                    _ => {
                        candidates.sort_by(|a, b| {
                            let a_own = requester.map(|p| &a.owner == p).unwrap_or(false);
                            let b_own = requester.map(|p| &b.owner == p).unwrap_or(false);
                            b_own
                                .cmp(&a_own)
                                .then(b.updated_at.cmp(&a.updated_at))
                        });
                        candidates.truncate(self.max_candidates);
                        Err(SyncError::Ambiguous {
                            code: code.clone(),
                            candidates,
                        })
                    }
                }
            }
        }
    }

    /// Entries still flagged pending, for the reconciliation pass.
    pub async fn pending_entries(&self) -> Vec<IndexEntry> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.pending)
            .cloned()
            .collect()
    }

    /// Stable, sorted view of the whole directory.
    pub async fn snapshot(&self) -> Vec<IndexEntry> {
        let mut all: Vec<IndexEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.quest_id);
        all
    }

    /// Reconstruct the directory from scratch out of every reachable
    /// tier's listings. Idempotent: running it twice yields the same
    /// index. `owners` names the principals whose partitions to scan in
    /// addition to the global listings.
    pub async fn rebuild(
        &self,
        tiers: &[Arc<dyn TierAdapter>],
        owners: &[Principal],
    ) -> Result<usize> {
        let mut fresh: HashMap<QuestId, IndexEntry> = HashMap::new();

        for tier in tiers {
            if !tier.reachable().await {
                debug!(tier = %tier.kind(), "Skipping unreachable tier during rebuild");
                continue;
            }

            let mut envelopes = tier.list_public().await?;
            for owner in owners {
                envelopes.extend(tier.list_by_owner(owner).await?);
            }

            for envelope in envelopes {
                let quest = match &envelope.record {
                    crate::model::Record::Quest(q) => q.clone(),
                    _ => continue,
                };

                let entry = fresh.entry(quest.id).or_insert_with(|| IndexEntry {
                    quest_id: quest.id,
                    code: codec::short_code_of_len(&quest.id, self.code_len),
                    owner: quest.owner.clone(),
                    visibility: quest.visibility,
                    locations: Vec::new(),
                    updated_at: quest.updated_at,
                    pending: false,
                    deleted: false,
                });

                Self::upsert_location(&mut entry.locations, envelope.location.clone());
                // Tiers without timestamps never advance the entry clock.
                if let Some(seen) = envelope.updated_at {
                    if seen > entry.updated_at {
                        entry.updated_at = seen;
                        entry.owner = quest.owner;
                        entry.visibility = quest.visibility;
                    }
                }
            }
        }

        let count = fresh.len();
        let mut entries = self.entries.write().await;
        *entries = fresh;

        if let Some(tree) = &self.tree {
            tree.clear()?;
            for entry in entries.values() {
                let value = rmp_serde::to_vec(entry)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                tree.insert(entry.quest_id.0.as_bytes(), value)?;
            }
        }

        info!(entries = count, "Rebuilt quest index");
        Ok(count)
    }

    /// Resolve the best location hint for fetching a quest record.
    pub fn content_hash_hint(entry: &IndexEntry) -> Option<String> {
        entry.locations.iter().find_map(|l| match l {
            Location::ContentStore { hash } => Some(hash.clone()),
            _ => None,
        })
    }

    /// The record key this entry points at.
    pub fn record_key(entry: &IndexEntry) -> RecordKey {
        RecordKey::Quest(entry.quest_id)
    }

    /// Which tiers hold a copy, per the last-known locations.
    pub fn tier_kinds(entry: &IndexEntry) -> Vec<TierKind> {
        entry.locations.iter().map(|l| l.kind()).collect()
    }
}
