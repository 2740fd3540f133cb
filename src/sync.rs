//! Sync coordinator - fan-out reads and write-through across tiers
//!
//! ## Read path
//!
//! Reads fan out to every reachable tier concurrently and merge per
//! record key. First-writer-wins is not the rule: the winner is the view
//! with the latest `updated_at`, falling back to presence-wins for tiers
//! that carry no timestamp (the content store). The merged winner is
//! written back into the local cache so the next read is a hit.
//!
//! ## Write path
//!
//! Writes land in the local cache first (the operation never fails while
//! the cache succeeded), then the content store, then the authoritative
//! store. An unreachable durable tier marks the quest's index entry
//! pending instead of failing the operation; reconciliation converges
//! later. Two devices for the same principal may observe a brief period
//! of divergent state, resolved by the last-updated-wins merge on the
//! next read.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::index::{IndexEntry, IndexManager, QuestRef};
use crate::model::{
    Badge, BadgeId, Principal, Progress, Quest, QuestId, Record, RecordKey,
};
use crate::tier::{
    AuthoritativeAdapter, ContentStoreAdapter, Envelope, LocalCacheAdapter, TierAdapter,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Outcome of a write across the durable tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Short code for quests, empty otherwise.
    pub code: String,
    /// Whether any durable tier missed the write.
    pub pending: bool,
}

/// Orchestrates reads and writes across the three tier adapters.
pub struct SyncCoordinator {
    cache: Arc<LocalCacheAdapter>,
    content: Arc<ContentStoreAdapter>,
    authoritative: Arc<AuthoritativeAdapter>,
    index: Arc<IndexManager>,
    store_timeout: Duration,
}

impl SyncCoordinator {
    pub fn new(
        cache: Arc<LocalCacheAdapter>,
        content: Arc<ContentStoreAdapter>,
        authoritative: Arc<AuthoritativeAdapter>,
        index: Arc<IndexManager>,
        config: &Config,
    ) -> Self {
        Self {
            cache,
            content,
            authoritative,
            index,
            store_timeout: config.store_timeout(),
        }
    }

    pub fn index(&self) -> &Arc<IndexManager> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<LocalCacheAdapter> {
        &self.cache
    }

    /// All three adapters as trait objects (index rebuild input).
    pub fn tiers(&self) -> Vec<Arc<dyn TierAdapter>> {
        vec![
            self.cache.clone(),
            self.content.clone(),
            self.authoritative.clone(),
        ]
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Save a quest through all tiers its visibility replicates to.
    ///
    /// Returns the quest's short code and whether any durable tier is
    /// still pending.
    pub async fn save_quest(&self, quest: &Quest) -> Result<WriteReceipt> {
        let record = Record::Quest(quest.clone());

        // Local cache first: responsiveness, and the op never fails past
        // this point on tier unreachability alone.
        let mut locations = vec![self.cache.put(&record).await?];
        let mut pending = false;

        // Invite-only and event quests stay out of the shared content
        // store; their partition is the owner's alone.
        if quest.is_public() {
            match self.put_with_timeout(&*self.content, &record).await {
                Ok(location) => locations.push(location),
                Err(e) if e.is_recoverable() => {
                    warn!(quest = %quest.id, error = %e, "Content store missed write, marking pending");
                    pending = true;
                }
                Err(e) => return Err(e),
            }
        }

        match self.put_with_timeout(&*self.authoritative, &record).await {
            Ok(location) => locations.push(location),
            Err(e) if e.is_recoverable() => {
                warn!(quest = %quest.id, error = %e, "Authoritative store missed write, marking pending");
                pending = true;
            }
            Err(e) => return Err(e),
        }

        let code = self
            .index
            .register(
                quest.id,
                quest.owner.clone(),
                quest.visibility,
                quest.updated_at,
                locations,
            )
            .await?;
        if pending {
            self.index.mark_pending(&quest.id).await?;
        }

        info!(quest = %quest.id, code = %code, pending = pending, "Saved quest");
        Ok(WriteReceipt { code, pending })
    }

    /// Delete a quest from every reachable tier.
    ///
    /// Authoritative-store and index removal are authoritative; the
    /// content store only drops its pointer (old blobs stay addressable
    /// by hash, an accepted staleness window).
    pub async fn delete_quest(&self, quest_ref: &QuestRef, requester: &Principal) -> Result<()> {
        let entry = self.index.resolve(quest_ref, Some(requester)).await?;
        let key = RecordKey::Quest(entry.quest_id);

        self.cache.delete(&key).await?;
        self.content.delete(&key).await?;

        match self.authoritative.delete(&key).await {
            Ok(()) => {
                self.authoritative.delete_owned(&entry.owner, &key).await?;
                self.index.unregister(&entry.quest_id).await?;
                info!(quest = %entry.quest_id, "Deleted quest");
            }
            Err(e) if e.is_recoverable() => {
                // Tombstone instead of unregistering, so reconciliation
                // replays the delete once the store is reachable and the
                // undeleted row cannot resurface in the meantime.
                self.index.mark_deleted(&entry.quest_id).await?;
                warn!(quest = %entry.quest_id, error = %e, "Authoritative delete deferred");
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Replay a deferred quest deletion against the authoritative tier.
    /// Returns whether the tombstone was cleared.
    pub async fn purge_quest(&self, entry: &IndexEntry) -> Result<bool> {
        if !self.authoritative.reachable().await {
            return Ok(false);
        }
        let key = RecordKey::Quest(entry.quest_id);
        self.authoritative.delete(&key).await?;
        self.authoritative.delete_owned(&entry.owner, &key).await?;
        self.index.unregister(&entry.quest_id).await?;
        info!(quest = %entry.quest_id, "Replayed deferred delete");
        Ok(true)
    }

    /// Write any non-quest record (progress, badge) through cache and the
    /// authoritative tier, marking the related quest pending on misses.
    pub async fn save_record(&self, record: &Record, related_quest: &QuestId) -> Result<bool> {
        self.cache.put(record).await?;

        match self.put_with_timeout(&*self.authoritative, record).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_recoverable() => {
                warn!(key = %record.key(), error = %e, "Durable write missed, marking pending");
                self.index.mark_pending(related_quest).await.ok();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn put_with_timeout(&self, tier: &dyn TierAdapter, record: &Record) -> Result<crate::tier::Location> {
        match timeout(self.store_timeout, tier.put(record)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::TierUnreachable(format!(
                "{} write timed out",
                tier.kind()
            ))),
        }
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Fetch a quest by identifier or short code, merged across tiers.
    pub async fn get_quest(
        &self,
        quest_ref: &QuestRef,
        requester: Option<&Principal>,
    ) -> Result<Quest> {
        let entry = self.index.resolve(quest_ref, requester).await?;
        let key = RecordKey::Quest(entry.quest_id);

        let (cached, content, authoritative) = tokio::join!(
            self.cache.get(&key),
            self.get_from_content(&entry, &key),
            self.get_from_authoritative(&entry, &key),
        );

        let mut views = Vec::new();
        if let Ok(Some(envelope)) = cached {
            views.push(envelope);
        }
        views.extend(content);
        views.extend(authoritative);

        let winner = merge_views(views).ok_or_else(|| {
            SyncError::NotFound(entry.quest_id.to_string())
        })?;

        // Read repair: the merged winner becomes the next cache hit.
        self.cache.put(&winner.record).await?;

        match winner.record {
            Record::Quest(quest) => Ok(quest),
            other => Err(SyncError::Internal(format!(
                "index pointed at non-quest record {}",
                other.key()
            ))),
        }
    }

    async fn get_from_content(&self, entry: &IndexEntry, key: &RecordKey) -> Option<Envelope> {
        if !self.content.reachable().await {
            return None;
        }
        match self.content.get(key).await {
            Ok(Some(envelope)) => Some(envelope),
            Ok(None) => {
                // Pointer lost (fresh process); recover it from the index
                // location hint.
                let hash = IndexManager::content_hash_hint(entry)?;
                match self.content.get_at(&hash).await {
                    Ok(envelope) => {
                        self.content.restore_pointer(key.clone(), hash);
                        Some(envelope)
                    }
                    Err(e) => {
                        debug!(key = %key, error = %e, "Content hint fetch failed");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Content read failed");
                None
            }
        }
    }

    async fn get_from_authoritative(&self, entry: &IndexEntry, key: &RecordKey) -> Option<Envelope> {
        if !self.authoritative.reachable().await {
            return None;
        }
        let direct = self.authoritative.get(key).await.ok().flatten();
        if direct.is_some() {
            return direct;
        }
        self.authoritative
            .get_owned(&entry.owner, key)
            .await
            .ok()
            .flatten()
    }

    /// All public quests, merged and de-duplicated across reachable tiers.
    pub async fn get_public_quests(&self) -> Result<Vec<Quest>> {
        let envelopes = self.fan_out_listings(None).await;
        let mut quests = collect_quests(envelopes);
        let tombstoned = self.index.deleted_ids().await;
        quests.retain(|q| !tombstoned.contains(&q.id));
        Ok(quests)
    }

    /// Everything in one principal's partition, merged across tiers.
    pub async fn get_quests_by_owner(&self, owner: &Principal) -> Result<Vec<Quest>> {
        let envelopes = self.fan_out_listings(Some(owner)).await;
        let mut quests = collect_quests(envelopes);
        let tombstoned = self.index.deleted_ids().await;
        quests.retain(|q| !tombstoned.contains(&q.id));
        Ok(quests)
    }

    async fn fan_out_listings(&self, owner: Option<&Principal>) -> Vec<Envelope> {
        let mut futures = Vec::new();
        for tier in self.tiers() {
            let owner = owner.cloned();
            futures.push(async move {
                if !tier.reachable().await {
                    return Vec::new();
                }
                let listed = match &owner {
                    Some(principal) => tier.list_by_owner(principal).await,
                    None => tier.list_public().await,
                };
                match listed {
                    Ok(envelopes) => envelopes,
                    Err(e) => {
                        debug!(tier = %tier.kind(), error = %e, "Listing failed");
                        Vec::new()
                    }
                }
            });
        }

        futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    // ========================================================================
    // Participation
    // ========================================================================

    /// Join a quest: creates the principal's progress record and adds the
    /// principal to the quest roster. Join is the precondition for any
    /// progress.
    pub async fn join_quest(&self, principal: &Principal, quest_ref: &QuestRef) -> Result<Progress> {
        let mut quest = self.get_quest(quest_ref, Some(principal)).await?;

        if quest.participants.contains(principal) {
            // Already on the roster. Self-heal a lost progress record
            // rather than failing the rejoin.
            if let Some(existing) = self.get_progress(principal, &quest.id).await? {
                return Ok(existing);
            }
            let progress = Progress::new(principal.clone(), quest.id);
            self.save_record(&Record::Progress(progress.clone()), &quest.id)
                .await?;
            return Ok(progress);
        }
        if !quest.has_capacity() {
            return Err(SyncError::InvalidTransition(format!(
                "quest {} is at its participant limit",
                quest.id
            )));
        }
        if let Some(window) = &quest.event_window {
            if !window.contains(Utc::now()) {
                return Err(SyncError::InvalidTransition(format!(
                    "quest {} is outside its event window",
                    quest.id
                )));
            }
        }

        let progress = Progress::new(principal.clone(), quest.id);
        self.save_record(&Record::Progress(progress.clone()), &quest.id)
            .await?;

        quest.participants.insert(principal.clone());
        quest.updated_at = Utc::now();
        self.save_quest(&quest).await?;

        info!(principal = %principal, quest = %quest.id, "Joined quest");
        Ok(progress)
    }

    /// Leave a quest: removes the progress record and roster entry.
    pub async fn leave_quest(&self, principal: &Principal, quest_ref: &QuestRef) -> Result<()> {
        let mut quest = self.get_quest(quest_ref, Some(principal)).await?;
        let key = RecordKey::Progress(principal.clone(), quest.id);

        self.cache.delete(&key).await?;
        if let Err(e) = self.authoritative.delete(&key).await {
            if !e.is_recoverable() {
                return Err(e);
            }
            warn!(key = %key, error = %e, "Progress delete deferred");
        }

        if quest.participants.remove(principal) {
            quest.updated_at = Utc::now();
            self.save_quest(&quest).await?;
        }

        info!(principal = %principal, quest = %quest.id, "Left quest");
        Ok(())
    }

    /// Merged progress view for one (principal, quest).
    pub async fn get_progress(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
    ) -> Result<Option<Progress>> {
        let key = RecordKey::Progress(principal.clone(), *quest_id);

        let (cached, authoritative) = tokio::join!(self.cache.get(&key), async {
            if self.authoritative.reachable().await {
                self.authoritative.get(&key).await.ok().flatten()
            } else {
                None
            }
        });

        let mut views = Vec::new();
        if let Ok(Some(envelope)) = cached {
            views.push(envelope);
        }
        views.extend(authoritative);

        match merge_views(views) {
            Some(envelope) => match envelope.record {
                Record::Progress(progress) => {
                    self.cache.put(&Record::Progress(progress.clone())).await?;
                    Ok(Some(progress))
                }
                other => Err(SyncError::Internal(format!(
                    "progress key resolved to {}",
                    other.key()
                ))),
            },
            None => Ok(None),
        }
    }

    /// Mark one requirement done. Requires a prior join.
    pub async fn set_requirement_done(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
        requirement_index: u32,
    ) -> Result<Progress> {
        let quest = self
            .get_quest(&QuestRef::Id(*quest_id), Some(principal))
            .await?;
        if requirement_index >= quest.requirement_count() {
            return Err(SyncError::InvalidTransition(format!(
                "requirement {requirement_index} out of range for quest {quest_id}"
            )));
        }

        let mut progress = self
            .get_progress(principal, quest_id)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidTransition(format!(
                    "{principal} has not joined quest {quest_id}"
                ))
            })?;

        // Set semantics: marking twice is a no-op, never a duplicate.
        if progress.completed.insert(requirement_index) {
            progress.updated_at = Utc::now();
            self.save_record(&Record::Progress(progress.clone()), quest_id)
                .await?;
        }

        Ok(progress)
    }

    // ========================================================================
    // Badges
    // ========================================================================

    /// Persist a badge through cache and the authoritative tier.
    ///
    /// When every durable tier misses, the badge is held in the local
    /// cache flagged unconfirmed-persisted and the quest marked pending;
    /// reconciliation retries. The badge is never dropped.
    pub async fn persist_badge(&self, badge: &Badge) -> Result<Badge> {
        let mut stored = badge.clone();
        let durable = self
            .save_record(&Record::Badge(stored.clone()), &badge.source_quest)
            .await?;

        if !durable {
            stored.confirmed_persisted = false;
            self.cache.put(&Record::Badge(stored.clone())).await?;
            warn!(
                badge = %stored.id,
                quest = %stored.source_quest,
                "Badge held unconfirmed-persisted pending reconciliation"
            );
        }

        Ok(stored)
    }

    /// The non-revoked badge for (principal, quest), if any, checked
    /// against the local cache and, when reachable, the authoritative
    /// store.
    pub async fn badge_for_quest(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
    ) -> Result<Option<Badge>> {
        let badges = self.get_badges(principal).await?;
        Ok(badges
            .into_iter()
            .find(|b| &b.source_quest == quest_id && !b.revoked))
    }

    /// All badges owned by a principal, merged across tiers.
    pub async fn get_badges(&self, principal: &Principal) -> Result<Vec<Badge>> {
        let envelopes = self.fan_out_listings(Some(principal)).await;
        let merged = merge_all(envelopes);

        Ok(merged
            .into_iter()
            .filter_map(|envelope| match envelope.record {
                Record::Badge(badge) => Some(badge),
                _ => None,
            })
            .collect())
    }

    /// Badges held locally that never reached a durable tier.
    pub async fn unconfirmed_badges(&self, principal: &Principal) -> Result<Vec<Badge>> {
        let envelopes = self.cache.list_by_owner(principal).await?;
        Ok(envelopes
            .into_iter()
            .filter_map(|envelope| match envelope.record {
                Record::Badge(badge) if !badge.confirmed_persisted => Some(badge),
                _ => None,
            })
            .collect())
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Pick the winning view of one record.
///
/// Last-updated-timestamp wins; a timestamped view beats an untimestamped
/// one; with no timestamps at all, presence wins (first view returned).
pub fn merge_views(views: Vec<Envelope>) -> Option<Envelope> {
    views.into_iter().reduce(|best, candidate| {
        match (best.updated_at, candidate.updated_at) {
            (Some(a), Some(b)) if b > a => candidate,
            (None, Some(_)) => candidate,
            _ => best,
        }
    })
}

/// Merge and de-duplicate a fan-out listing by record key.
pub fn merge_all(envelopes: Vec<Envelope>) -> Vec<Envelope> {
    let mut grouped: HashMap<RecordKey, Vec<Envelope>> = HashMap::new();
    for envelope in envelopes {
        grouped.entry(envelope.record.key()).or_default().push(envelope);
    }

    let mut merged: Vec<Envelope> = grouped
        .into_values()
        .filter_map(merge_views)
        .collect();
    merged.sort_by_key(|e| e.record.key());
    merged
}

fn collect_quests(envelopes: Vec<Envelope>) -> Vec<Quest> {
    merge_all(envelopes)
        .into_iter()
        .filter_map(|envelope| match envelope.record {
            Record::Quest(quest) => Some(quest),
            _ => None,
        })
        .collect()
}

/// Convenience constructor for a freshly earned badge.
pub fn badge_for(principal: &Principal, quest: &Quest) -> Badge {
    let now = Utc::now();
    Badge {
        id: BadgeId::generate(),
        owner: principal.clone(),
        source_quest: quest.id,
        rarity: quest.difficulty.rarity(),
        earned_at: now,
        ledger_ref: None,
        revoked: false,
        confirmed_persisted: true,
        updated_at: now,
    }
}
