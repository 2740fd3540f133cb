//! Background reconciliation
//!
//! Convergence for everything the write path deferred: quests whose
//! durable writes missed (pending index entries), badges held in the
//! local cache unconfirmed-persisted, and completion flows abandoned
//! mid-ledger-call. Runs as a periodic task; each pass is idempotent and
//! tolerant of tiers that are still unreachable.

use crate::completion::CompletionMachine;
use crate::error::Result;
use crate::model::{Record, RecordKey};
use crate::sync::SyncCoordinator;
use crate::tier::TierAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Quests whose durable tiers converged this pass.
    pub quests_converged: usize,
    /// Quests still awaiting an unreachable tier.
    pub quests_still_pending: usize,
    /// Deferred deletions replayed against the authoritative tier.
    pub deletes_replayed: usize,
    /// Badges that reached a durable tier this pass.
    pub badges_confirmed: usize,
    /// Cancelled completion flows resolved from badge records.
    pub flows_resolved: usize,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    coordinator: Arc<SyncCoordinator>,
    machine: Option<Arc<CompletionMachine>>,
}

impl Reconciler {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            machine: None,
        }
    }

    /// Also resolve abandoned completion flows each pass.
    pub fn with_machine(mut self, machine: Arc<CompletionMachine>) -> Self {
        self.machine = Some(machine);
        self
    }

    /// One reconciliation pass. Per-quest failures are logged and do not
    /// abort the pass.
    pub async fn run_once(&self) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        for entry in self.coordinator.index().pending_entries().await {
            if entry.deleted {
                match self.coordinator.purge_quest(&entry).await {
                    Ok(true) => stats.deletes_replayed += 1,
                    Ok(false) => stats.quests_still_pending += 1,
                    Err(e) => {
                        stats.quests_still_pending += 1;
                        warn!(quest = %entry.quest_id, error = %e, "Delete replay failed");
                    }
                }
                continue;
            }
            match self.converge_quest(&entry.quest_id).await {
                Ok(true) => stats.quests_converged += 1,
                Ok(false) => stats.quests_still_pending += 1,
                Err(e) => {
                    stats.quests_still_pending += 1;
                    warn!(quest = %entry.quest_id, error = %e, "Reconciliation skipped quest");
                }
            }
        }

        // Badges surface through their quest's pending marker; retry them
        // after the quest itself converged.
        for entry in self.coordinator.index().snapshot().await {
            if entry.pending {
                continue;
            }
            stats.badges_confirmed += self.retry_badges(&entry.quest_id).await;
        }

        if let Some(machine) = &self.machine {
            for (principal, quest_id) in machine.cancelled_flows() {
                match machine.resolve_cancelled(&principal, &quest_id).await {
                    Ok(true) => stats.flows_resolved += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(quest = %quest_id, error = %e, "Cancelled flow left unresolved");
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Re-push one pending quest (and its participants' records) from the
    /// local cache to the durable tiers. Returns whether it converged.
    async fn converge_quest(&self, quest_id: &crate::model::QuestId) -> Result<bool> {
        let key = RecordKey::Quest(*quest_id);
        let quest = match self.coordinator.cache().get(&key).await? {
            Some(envelope) => match envelope.record {
                Record::Quest(quest) => quest,
                other => {
                    warn!(key = %key, "Pending entry resolved to {}", other.key());
                    return Ok(false);
                }
            },
            None => {
                // Nothing local to converge from; the next full read will
                // repopulate the cache and re-mark if still divergent.
                warn!(quest = %quest_id, "Pending quest missing from cache");
                return Ok(false);
            }
        };

        let receipt = self.coordinator.save_quest(&quest).await?;
        if receipt.pending {
            debug!(quest = %quest_id, "Durable tier still unreachable");
            return Ok(false);
        }

        for participant in &quest.participants {
            let progress_key = RecordKey::Progress(participant.clone(), *quest_id);
            if let Some(envelope) = self.coordinator.cache().get(&progress_key).await? {
                self.coordinator
                    .save_record(&envelope.record, quest_id)
                    .await?;
            }
        }

        self.coordinator.index().clear_pending(quest_id).await?;
        info!(quest = %quest_id, "Quest converged");
        Ok(true)
    }

    /// Retry every unconfirmed badge held by this quest's participants.
    async fn retry_badges(&self, quest_id: &crate::model::QuestId) -> usize {
        let key = RecordKey::Quest(*quest_id);
        let quest = match self.coordinator.cache().get(&key).await {
            Ok(Some(envelope)) => match envelope.record {
                Record::Quest(quest) => quest,
                _ => return 0,
            },
            _ => return 0,
        };

        let mut confirmed = 0;
        for participant in &quest.participants {
            let held = match self.coordinator.unconfirmed_badges(participant).await {
                Ok(held) => held,
                Err(e) => {
                    warn!(principal = %participant, error = %e, "Unconfirmed badge scan failed");
                    continue;
                }
            };
            for mut badge in held {
                badge.confirmed_persisted = true;
                match self.coordinator.persist_badge(&badge).await {
                    Ok(stored) if stored.confirmed_persisted => {
                        info!(badge = %stored.id, "Badge reached a durable tier");
                        confirmed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(badge = %badge.id, error = %e, "Badge retry failed");
                    }
                }
            }
        }
        confirmed
    }
}

/// Spawn the periodic reconciliation task.
pub fn spawn_reconcile_task(
    reconciler: Arc<Reconciler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Reconciliation task started");
        loop {
            ticker.tick().await;
            match reconciler.run_once().await {
                Ok(stats) if stats.is_noop() => {}
                Ok(stats) => info!(
                    converged = stats.quests_converged,
                    still_pending = stats.quests_still_pending,
                    deletes = stats.deletes_replayed,
                    badges = stats.badges_confirmed,
                    flows = stats.flows_resolved,
                    "Reconciliation pass complete"
                ),
                Err(e) => warn!(error = %e, "Reconciliation pass failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::{IndexManager, QuestRef};
    use crate::model::{
        Difficulty, Principal, Quest, QuestId, Requirement, RequirementKind, Visibility,
    };
    use crate::sync::badge_for;
    use crate::tier::{
        AuthoritativeAdapter, ContentStoreAdapter, LocalCacheAdapter, MemoryAuthoritativeStore,
        MemoryContentStore,
    };
    use chrono::Utc;

    struct Fixture {
        coordinator: Arc<SyncCoordinator>,
        reconciler: Reconciler,
        auth_store: Arc<MemoryAuthoritativeStore>,
        content_store: Arc<MemoryContentStore>,
    }

    fn fixture() -> Fixture {
        let auth_store = Arc::new(MemoryAuthoritativeStore::new());
        let content_store = Arc::new(MemoryContentStore::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::new(LocalCacheAdapter::new()),
            Arc::new(ContentStoreAdapter::new(content_store.clone())),
            Arc::new(AuthoritativeAdapter::new(auth_store.clone())),
            Arc::new(IndexManager::new_memory()),
            &Config::default(),
        ));
        Fixture {
            reconciler: Reconciler::new(coordinator.clone()),
            coordinator,
            auth_store,
            content_store,
        }
    }

    fn quest() -> Quest {
        Quest {
            id: QuestId::generate(),
            title: "reconcile test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            difficulty: Difficulty::Easy,
            requirements: vec![Requirement {
                index: 0,
                kind: RequirementKind::Manual,
                description: "step 0".to_string(),
                config: Default::default(),
            }],
            reward: String::new(),
            visibility: Visibility::Public,
            owner: Principal::new("0xowner"),
            event_window: None,
            participant_limit: 0,
            participants: Default::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn noop_pass_reports_nothing() {
        let fx = fixture();
        let stats = fx.reconciler.run_once().await.unwrap();
        assert!(stats.is_noop());
    }

    #[tokio::test]
    async fn pending_quest_converges_when_stores_recover() {
        let fx = fixture();
        fx.auth_store.set_reachable(false);
        fx.content_store.set_reachable(false);

        let q = quest();
        let receipt = fx.coordinator.save_quest(&q).await.unwrap();
        assert!(receipt.pending);

        // Stores still down: the pass makes no progress but keeps the marker.
        let stats = fx.reconciler.run_once().await.unwrap();
        assert_eq!(stats.quests_still_pending, 1);
        assert_eq!(fx.coordinator.index().pending_entries().await.len(), 1);

        fx.auth_store.set_reachable(true);
        fx.content_store.set_reachable(true);
        let stats = fx.reconciler.run_once().await.unwrap();
        assert_eq!(stats.quests_converged, 1);
        assert!(fx.coordinator.index().pending_entries().await.is_empty());

        // The record is durably readable without the cache's help.
        fx.coordinator.cache().clear();
        let fetched = fx
            .coordinator
            .get_quest(&QuestRef::Id(q.id), None)
            .await
            .unwrap();
        assert_eq!(fetched.id, q.id);
    }

    #[tokio::test]
    async fn participant_progress_repushed_on_convergence() {
        let fx = fixture();
        let q = quest();
        fx.coordinator.save_quest(&q).await.unwrap();

        let player = Principal::new("0xplayer");
        fx.coordinator
            .join_quest(&player, &QuestRef::Id(q.id))
            .await
            .unwrap();

        fx.auth_store.set_reachable(false);
        fx.coordinator
            .set_requirement_done(&player, &q.id, 0)
            .await
            .unwrap();
        assert_eq!(fx.coordinator.index().pending_entries().await.len(), 1);

        fx.auth_store.set_reachable(true);
        let stats = fx.reconciler.run_once().await.unwrap();
        assert_eq!(stats.quests_converged, 1);

        // Authoritative view now carries the marked requirement.
        fx.coordinator.cache().clear();
        let progress = fx
            .coordinator
            .get_progress(&player, &q.id)
            .await
            .unwrap()
            .unwrap();
        assert!(progress.completed.contains(&0));
    }

    #[tokio::test]
    async fn deferred_delete_replayed_after_recovery() {
        let fx = fixture();
        let q = quest();
        fx.coordinator.save_quest(&q).await.unwrap();

        fx.auth_store.set_reachable(false);
        fx.coordinator
            .delete_quest(&QuestRef::Id(q.id), &Principal::new("0xowner"))
            .await
            .unwrap();

        // The undeleted mirror row must not resurface once the store is
        // back but before the replay runs.
        fx.auth_store.set_reachable(true);
        assert!(fx.coordinator.get_public_quests().await.unwrap().is_empty());
        assert!(matches!(
            fx.coordinator.get_quest(&QuestRef::Id(q.id), None).await,
            Err(crate::error::SyncError::NotFound(_))
        ));

        let stats = fx.reconciler.run_once().await.unwrap();
        assert_eq!(stats.deletes_replayed, 1);

        assert!(fx.coordinator.get_public_quests().await.unwrap().is_empty());
        assert!(fx.coordinator.index().pending_entries().await.is_empty());
        assert!(fx.coordinator.index().deleted_ids().await.is_empty());

        // Idempotent: a second pass is a no-op.
        assert!(fx.reconciler.run_once().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn unconfirmed_badge_retried_until_durable() {
        let fx = fixture();
        let mut q = quest();
        let player = Principal::new("0xplayer");
        q.participants.insert(player.clone());
        fx.coordinator.save_quest(&q).await.unwrap();

        fx.auth_store.set_reachable(false);
        let badge = badge_for(&player, &q);
        let stored = fx.coordinator.persist_badge(&badge).await.unwrap();
        assert!(!stored.confirmed_persisted);

        fx.auth_store.set_reachable(true);
        let stats = fx.reconciler.run_once().await.unwrap();
        assert_eq!(stats.badges_confirmed, 1);
        assert!(fx
            .coordinator
            .unconfirmed_badges(&player)
            .await
            .unwrap()
            .is_empty());

        let fetched = fx
            .coordinator
            .badge_for_quest(&player, &q.id)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.confirmed_persisted);
    }
}
