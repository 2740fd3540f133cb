//! Completion state machine
//!
//! Per (principal, quest) progression:
//!
//! ```text
//! NotJoined → Joined → InProgress(k of n) → ReadyToComplete
//!                                               │ complete()
//!                                               ▼
//!                   CompletionFailed ◄─── Completing ───► Completed
//!                          │ (retryable)                     │ reset()
//!                          └────────► ReadyToComplete        ▼
//!                                                          Joined
//! ```
//!
//! The `ReadyToComplete → Completing` edge is guarded by a compare-and-set
//! on the badge uniqueness invariant: before the ledger is invoked, the
//! machine checks the local cache and, if reachable, the authoritative
//! store for a non-revoked badge. Operations against the same
//! (principal, quest) pair are serialized through an in-process keyed
//! mutex, so two concurrent `complete` calls cannot both pass the check
//! before either has persisted.
//!
//! A ledger call cancelled by the caller leaves a `Completing` marker with
//! a cancelled flag rather than silently reverting: the mint may have
//! succeeded despite the cancellation signal, and reconciliation resolves
//! the ambiguity from the badge records.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::ledger::{CompletionProof, Ledger};
use crate::model::{Badge, LedgerRef, Principal, QuestId, Record};
use crate::sync::{badge_for, SyncCoordinator};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type FlowKey = (Principal, QuestId);

/// Observable state of one (principal, quest) flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionState {
    NotJoined,
    Joined,
    InProgress { done: u32, total: u32 },
    ReadyToComplete,
    /// A ledger call is (or may still be) in flight. `cancelled` means the
    /// caller abandoned the call and the outcome is ambiguous until
    /// reconciliation resolves it.
    Completing { cancelled: bool },
    /// Last attempt failed; retry from `ReadyToComplete`.
    CompletionFailed,
    Completed,
}

#[derive(Debug, Clone)]
struct FlightMarker {
    cancelled: bool,
}

/// Drives quest completion against the ledger collaborator.
pub struct CompletionMachine {
    coordinator: Arc<SyncCoordinator>,
    ledger: Arc<dyn Ledger>,
    ledger_timeout: Duration,
    /// Serializes same-key flows; different keys proceed in parallel.
    locks: DashMap<FlowKey, Arc<tokio::sync::Mutex<()>>>,
    /// In-flight (or abandoned) ledger calls.
    in_flight: DashMap<FlowKey, FlightMarker>,
    /// Last failure per flow, cleared on the next attempt.
    failures: DashMap<FlowKey, String>,
}

impl CompletionMachine {
    pub fn new(coordinator: Arc<SyncCoordinator>, ledger: Arc<dyn Ledger>, config: &Config) -> Self {
        Self {
            coordinator,
            ledger,
            ledger_timeout: config.ledger_timeout(),
            locks: DashMap::new(),
            in_flight: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &FlowKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop a flow's mutex entry once the map holds the only reference.
    /// `remove_if` runs under the shard lock, so a concurrent caller that
    /// already cloned the Arc keeps the strong count above one and the
    /// entry survives.
    fn evict_idle_lock(&self, key: &FlowKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Derive the current state from progress, badge and flight records.
    pub async fn state(&self, principal: &Principal, quest_id: &QuestId) -> Result<CompletionState> {
        let key = (principal.clone(), *quest_id);

        if let Some(marker) = self.in_flight.get(&key) {
            return Ok(CompletionState::Completing {
                cancelled: marker.cancelled,
            });
        }

        if self
            .coordinator
            .badge_for_quest(principal, quest_id)
            .await?
            .is_some()
        {
            return Ok(CompletionState::Completed);
        }

        let progress = match self.coordinator.get_progress(principal, quest_id).await? {
            Some(p) => p,
            None => return Ok(CompletionState::NotJoined),
        };

        if self.failures.contains_key(&key) {
            return Ok(CompletionState::CompletionFailed);
        }

        let quest = self
            .coordinator
            .get_quest(&crate::index::QuestRef::Id(*quest_id), Some(principal))
            .await?;
        let total = quest.requirement_count();
        let done = progress.completed.len() as u32;

        Ok(match done {
            0 => CompletionState::Joined,
            d if d >= total && total > 0 => CompletionState::ReadyToComplete,
            d => CompletionState::InProgress { done: d, total },
        })
    }

    /// Complete a quest: CAS-guarded ledger mint, then badge persistence.
    ///
    /// On `LedgerTimeout`/`LedgerReverted` the flow reverts to
    /// `ReadyToComplete` with nothing persisted. When the mint succeeded
    /// but every durable tier missed, the badge is held in the local
    /// cache unconfirmed and `PersistencePartial` surfaces so the caller
    /// knows reconciliation still owes a durable write.
    pub async fn complete(&self, principal: &Principal, quest_id: &QuestId) -> Result<Badge> {
        let key = (principal.clone(), *quest_id);
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.complete_locked(principal, quest_id, &key).await
        };
        drop(lock);
        self.evict_idle_lock(&key);
        result
    }

    async fn complete_locked(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
        key: &FlowKey,
    ) -> Result<Badge> {
        self.failures.remove(key);

        if let Some(marker) = self.in_flight.get(key) {
            // An earlier call never reported back; its mint may have
            // landed. Reconciliation must resolve before a retry.
            return Err(SyncError::InvalidTransition(format!(
                "completion already in flight for quest {quest_id} (cancelled: {})",
                marker.cancelled
            )));
        }

        let progress = self
            .coordinator
            .get_progress(principal, quest_id)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidTransition(format!("{principal} has not joined quest {quest_id}"))
            })?;

        let quest = self
            .coordinator
            .get_quest(&crate::index::QuestRef::Id(*quest_id), Some(principal))
            .await?;
        let total = quest.requirement_count();
        let done = progress.completed.len() as u32;
        if total == 0 || done < total {
            return Err(SyncError::InvalidTransition(format!(
                "quest {quest_id} has {done} of {total} requirements met"
            )));
        }

        // CAS guard on the uniqueness invariant, under the keyed lock.
        if let Some(existing) = self.coordinator.badge_for_quest(principal, quest_id).await? {
            debug!(badge = %existing.id, "Badge already exists, rejecting completion");
            return Err(SyncError::UniquenessViolation {
                principal: principal.to_string(),
                quest: quest_id.to_string(),
            });
        }

        let proof = CompletionProof {
            completed: progress.completed.iter().copied().collect(),
            attestation: None,
        };

        self.in_flight.insert(key.clone(), FlightMarker { cancelled: false });
        let flight = FlightGuard {
            machine: self,
            key: key.clone(),
            armed: true,
        };

        let confirmation = match self.run_ledger(principal, quest_id, &proof).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                // Known-failed outcome: safe to revert to ReadyToComplete.
                flight.finish();
                self.failures.insert(key.clone(), e.to_string());
                warn!(quest = %quest_id, error = %e, "Completion reverted");
                return Err(e);
            }
        };

        let mut badge = badge_for(principal, &quest);
        badge.ledger_ref = Some(LedgerRef {
            token_id: confirmation.token_id,
            tx_ref: confirmation.tx_ref,
        });

        let stored = self.coordinator.persist_badge(&badge).await?;
        flight.finish();

        info!(
            principal = %principal,
            quest = %quest_id,
            badge = %stored.id,
            confirmed = stored.confirmed_persisted,
            "Quest completed"
        );

        if !stored.confirmed_persisted {
            return Err(SyncError::PersistencePartial {
                badge: stored.id.to_string(),
                detail: "held in local cache awaiting reconciliation".to_string(),
            });
        }
        Ok(stored)
    }

    async fn run_ledger(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
        proof: &CompletionProof,
    ) -> Result<crate::ledger::Confirmation> {
        let handle = self
            .ledger
            .submit_completion(principal, quest_id, proof)
            .await?;
        // The bound is enforced here too; a collaborator that ignores the
        // timeout argument still cannot hold the flow open.
        match tokio::time::timeout(
            self.ledger_timeout,
            self.ledger.await_confirmation(&handle, self.ledger_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::LedgerTimeout(self.ledger_timeout)),
        }
    }

    /// Creator- or self-initiated reset: `Completed → Joined`.
    ///
    /// Revokes the stored badge record but does not retract the mint;
    /// that is the separate, explicit `revoke_badge`.
    pub async fn reset(&self, principal: &Principal, quest_id: &QuestId) -> Result<()> {
        let key = (principal.clone(), *quest_id);
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.reset_locked(principal, quest_id, &key).await
        };
        drop(lock);
        self.evict_idle_lock(&key);
        result
    }

    async fn reset_locked(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
        key: &FlowKey,
    ) -> Result<()> {
        let mut badge = self
            .coordinator
            .badge_for_quest(principal, quest_id)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidTransition(format!(
                    "no badge to reset for quest {quest_id}"
                ))
            })?;

        badge.revoked = true;
        badge.updated_at = Utc::now();
        self.coordinator
            .save_record(&Record::Badge(badge.clone()), quest_id)
            .await?;

        if let Some(mut progress) = self.coordinator.get_progress(principal, quest_id).await? {
            progress.completed.clear();
            progress.updated_at = Utc::now();
            self.coordinator
                .save_record(&Record::Progress(progress), quest_id)
                .await?;
        }

        self.failures.remove(key);
        info!(principal = %principal, quest = %quest_id, badge = %badge.id, "Reset to Joined");
        Ok(())
    }

    /// Explicit, user-initiated retraction of the mint itself.
    pub async fn revoke_badge(&self, principal: &Principal, quest_id: &QuestId) -> Result<()> {
        let key = (principal.clone(), *quest_id);
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.revoke_locked(principal, quest_id).await
        };
        drop(lock);
        self.evict_idle_lock(&key);
        result
    }

    async fn revoke_locked(&self, principal: &Principal, quest_id: &QuestId) -> Result<()> {
        let mut badge = self
            .coordinator
            .badge_for_quest(principal, quest_id)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidTransition(format!("no badge to revoke for quest {quest_id}"))
            })?;

        if let Some(ledger_ref) = &badge.ledger_ref {
            self.ledger.submit_revoke(&ledger_ref.token_id).await?;
        }

        badge.revoked = true;
        badge.updated_at = Utc::now();
        self.coordinator
            .save_record(&Record::Badge(badge.clone()), quest_id)
            .await?;

        info!(principal = %principal, quest = %quest_id, badge = %badge.id, "Badge revoked");
        Ok(())
    }

    /// Flag an abandoned ledger call so reconciliation can resolve it.
    /// Public for callers that cancel the `complete` future externally.
    pub fn mark_cancelled(&self, principal: &Principal, quest_id: &QuestId) {
        let key = (principal.clone(), *quest_id);
        if let Some(mut marker) = self.in_flight.get_mut(&key) {
            marker.cancelled = true;
        } else {
            self.in_flight.insert(key, FlightMarker { cancelled: true });
        }
    }

    /// Resolve a cancelled `Completing` marker from the badge records:
    /// the mint either landed (flow is `Completed`) or it did not (flow
    /// reverts to `ReadyToComplete`). Returns `true` when a marker was
    /// resolved.
    pub async fn resolve_cancelled(&self, principal: &Principal, quest_id: &QuestId) -> Result<bool> {
        let key = (principal.clone(), *quest_id);
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.resolve_cancelled_locked(principal, quest_id, &key).await
        };
        drop(lock);
        self.evict_idle_lock(&key);
        result
    }

    async fn resolve_cancelled_locked(
        &self,
        principal: &Principal,
        quest_id: &QuestId,
        key: &FlowKey,
    ) -> Result<bool> {
        let cancelled = match self.in_flight.get(key) {
            Some(marker) => marker.cancelled,
            None => return Ok(false),
        };
        if !cancelled {
            // Still legitimately in flight; leave it alone.
            return Ok(false);
        }

        let outcome = self.coordinator.badge_for_quest(principal, quest_id).await?;
        self.in_flight.remove(key);
        match outcome {
            Some(badge) => {
                info!(badge = %badge.id, "Cancelled completion had in fact minted");
            }
            None => {
                debug!(quest = %quest_id, "Cancelled completion never minted, back to ReadyToComplete");
            }
        }
        Ok(true)
    }

    /// Flows whose markers are flagged cancelled (reconciliation input).
    pub fn cancelled_flows(&self) -> Vec<(Principal, QuestId)> {
        self.in_flight
            .iter()
            .filter(|e| e.value().cancelled)
            .map(|e| e.key().clone())
            .collect()
    }
}

/// Clears the in-flight marker on the success/known-failure paths; a drop
/// without `finish` means the caller abandoned the future mid-call, which
/// flips the marker to cancelled instead of removing it.
struct FlightGuard<'a> {
    machine: &'a CompletionMachine,
    key: FlowKey,
    armed: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self) {
        self.machine.in_flight.remove(&self.key);
        self.armed = false;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(mut marker) = self.machine.in_flight.get_mut(&self.key) {
                marker.cancelled = true;
                warn!(
                    principal = %self.key.0,
                    quest = %self.key.1,
                    "Completion abandoned mid-flight, flagged for reconciliation"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexManager, QuestRef};
    use crate::ledger::{Confirmation, TxHandle};
    use crate::model::{Difficulty, Quest, Requirement, RequirementKind, Visibility};
    use crate::tier::{
        AuthoritativeAdapter, ContentStoreAdapter, LocalCacheAdapter, MemoryAuthoritativeStore,
        MemoryContentStore,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum LedgerMode {
        Mint,
        Revert,
        Timeout,
    }

    struct MockLedger {
        mode: Mutex<LedgerMode>,
        confirm_delay: Duration,
        mints: AtomicU32,
        revokes: AtomicU32,
    }

    impl MockLedger {
        fn new() -> Self {
            Self {
                mode: Mutex::new(LedgerMode::Mint),
                confirm_delay: Duration::ZERO,
                mints: AtomicU32::new(0),
                revokes: AtomicU32::new(0),
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                confirm_delay: delay,
                ..Self::new()
            }
        }

        fn set_mode(&self, mode: LedgerMode) {
            *self.mode.lock().unwrap() = mode;
        }
    }

    #[async_trait]
    impl Ledger for MockLedger {
        async fn submit_completion(
            &self,
            _principal: &Principal,
            quest: &QuestId,
            _proof: &CompletionProof,
        ) -> Result<TxHandle> {
            Ok(TxHandle(format!("tx-{quest}")))
        }

        async fn await_confirmation(
            &self,
            handle: &TxHandle,
            timeout: Duration,
        ) -> Result<Confirmation> {
            tokio::time::sleep(self.confirm_delay).await;
            match *self.mode.lock().unwrap() {
                LedgerMode::Mint => {
                    let n = self.mints.fetch_add(1, Ordering::SeqCst);
                    Ok(Confirmation {
                        token_id: format!("tok-{n}"),
                        tx_ref: handle.0.clone(),
                    })
                }
                LedgerMode::Revert => Err(SyncError::LedgerReverted("mock revert".to_string())),
                LedgerMode::Timeout => Err(SyncError::LedgerTimeout(timeout)),
            }
        }

        async fn submit_revoke(&self, _token_id: &str) -> Result<()> {
            self.revokes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        machine: Arc<CompletionMachine>,
        coordinator: Arc<SyncCoordinator>,
        ledger: Arc<MockLedger>,
        auth_store: Arc<MemoryAuthoritativeStore>,
    }

    fn fixture_with_ledger(ledger: Arc<MockLedger>) -> Fixture {
        let auth_store = Arc::new(MemoryAuthoritativeStore::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::new(LocalCacheAdapter::new()),
            Arc::new(ContentStoreAdapter::new(Arc::new(MemoryContentStore::new()))),
            Arc::new(AuthoritativeAdapter::new(auth_store.clone())),
            Arc::new(IndexManager::new_memory()),
            &Config::default(),
        ));
        let machine = Arc::new(CompletionMachine::new(
            coordinator.clone(),
            ledger.clone(),
            &Config::default(),
        ));
        Fixture {
            machine,
            coordinator,
            ledger,
            auth_store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_ledger(Arc::new(MockLedger::new()))
    }

    fn quest(requirement_count: u32) -> Quest {
        Quest {
            id: QuestId::generate(),
            title: "completion test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            difficulty: Difficulty::Medium,
            requirements: (0..requirement_count)
                .map(|index| Requirement {
                    index,
                    kind: RequirementKind::Manual,
                    description: format!("step {index}"),
                    config: Default::default(),
                })
                .collect(),
            reward: String::new(),
            visibility: Visibility::Public,
            owner: Principal::new("0xowner"),
            event_window: None,
            participant_limit: 0,
            participants: Default::default(),
            updated_at: Utc::now(),
        }
    }

    const PLAYER: &str = "0xplayer";

    /// Save a two-requirement quest and walk the player to ReadyToComplete.
    async fn walk_to_ready(fx: &Fixture) -> (Principal, QuestId) {
        let q = quest(2);
        let quest_id = q.id;
        fx.coordinator.save_quest(&q).await.unwrap();

        let player = Principal::new(PLAYER);
        fx.coordinator
            .join_quest(&player, &QuestRef::Id(quest_id))
            .await
            .unwrap();
        fx.coordinator
            .set_requirement_done(&player, &quest_id, 0)
            .await
            .unwrap();
        fx.coordinator
            .set_requirement_done(&player, &quest_id, 1)
            .await
            .unwrap();
        (player, quest_id)
    }

    #[tokio::test]
    async fn states_track_the_full_walk() {
        let fx = fixture();
        let q = quest(2);
        let quest_id = q.id;
        fx.coordinator.save_quest(&q).await.unwrap();
        let player = Principal::new(PLAYER);

        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::NotJoined
        );

        fx.coordinator
            .join_quest(&player, &QuestRef::Id(quest_id))
            .await
            .unwrap();
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Joined
        );

        fx.coordinator
            .set_requirement_done(&player, &quest_id, 0)
            .await
            .unwrap();
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::InProgress { done: 1, total: 2 }
        );

        fx.coordinator
            .set_requirement_done(&player, &quest_id, 1)
            .await
            .unwrap();
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::ReadyToComplete
        );

        let badge = fx.machine.complete(&player, &quest_id).await.unwrap();
        assert_eq!(badge.source_quest, quest_id);
        assert!(badge.ledger_ref.is_some());
        assert!(badge.confirmed_persisted);
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Completed
        );
        assert_eq!(fx.ledger.mints.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn complete_requires_join_and_all_requirements() {
        let fx = fixture();
        let q = quest(2);
        let quest_id = q.id;
        fx.coordinator.save_quest(&q).await.unwrap();
        let player = Principal::new(PLAYER);

        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition(_)));

        fx.coordinator
            .join_quest(&player, &QuestRef::Id(quest_id))
            .await
            .unwrap();
        fx.coordinator
            .set_requirement_done(&player, &quest_id, 0)
            .await
            .unwrap();

        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition(_)));
        assert_eq!(fx.ledger.mints.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_complete_hits_the_uniqueness_guard() {
        let fx = fixture();
        let (player, quest_id) = walk_to_ready(&fx).await;

        fx.machine.complete(&player, &quest_id).await.unwrap();
        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::UniquenessViolation { .. }));
        assert_eq!(fx.ledger.mints.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_completes_mint_exactly_once() {
        let fx = fixture_with_ledger(Arc::new(MockLedger::with_delay(Duration::from_millis(50))));
        let (player, quest_id) = walk_to_ready(&fx).await;

        let a = {
            let machine = fx.machine.clone();
            let player = player.clone();
            tokio::spawn(async move { machine.complete(&player, &quest_id).await })
        };
        let b = {
            let machine = fx.machine.clone();
            let player = player.clone();
            tokio::spawn(async move { machine.complete(&player, &quest_id).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(SyncError::UniquenessViolation { .. })
        )));
        assert_eq!(fx.ledger.mints.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.coordinator.get_badges(&player).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn revert_leaves_flow_retryable() {
        let fx = fixture();
        fx.ledger.set_mode(LedgerMode::Revert);
        let (player, quest_id) = walk_to_ready(&fx).await;

        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::LedgerReverted(_)));
        assert!(fx
            .coordinator
            .badge_for_quest(&player, &quest_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::CompletionFailed
        );

        // The retry clears the failure and succeeds.
        fx.ledger.set_mode(LedgerMode::Mint);
        fx.machine.complete(&player, &quest_id).await.unwrap();
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Completed
        );
    }

    #[tokio::test]
    async fn timeout_persists_nothing() {
        let fx = fixture();
        fx.ledger.set_mode(LedgerMode::Timeout);
        let (player, quest_id) = walk_to_ready(&fx).await;

        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::LedgerTimeout(_)));
        assert!(fx
            .coordinator
            .badge_for_quest(&player, &quest_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn durable_miss_holds_badge_unconfirmed() {
        let fx = fixture();
        let (player, quest_id) = walk_to_ready(&fx).await;

        fx.auth_store.set_reachable(false);
        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::PersistencePartial { .. }));

        // The mint happened and the badge survives in the cache.
        assert_eq!(fx.ledger.mints.load(Ordering::SeqCst), 1);
        let held = fx.coordinator.unconfirmed_badges(&player).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].source_quest, quest_id);
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Completed
        );
    }

    #[tokio::test]
    async fn reset_revokes_badge_and_returns_to_joined() {
        let fx = fixture();
        let (player, quest_id) = walk_to_ready(&fx).await;
        fx.machine.complete(&player, &quest_id).await.unwrap();

        fx.machine.reset(&player, &quest_id).await.unwrap();
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Joined
        );
        // Reset revokes the record, not the mint.
        assert_eq!(fx.ledger.revokes.load(Ordering::SeqCst), 0);

        // The flow can be walked and completed again.
        fx.coordinator
            .set_requirement_done(&player, &quest_id, 0)
            .await
            .unwrap();
        fx.coordinator
            .set_requirement_done(&player, &quest_id, 1)
            .await
            .unwrap();
        fx.machine.complete(&player, &quest_id).await.unwrap();
        assert_eq!(fx.ledger.mints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn revoke_badge_retracts_the_mint() {
        let fx = fixture();
        let (player, quest_id) = walk_to_ready(&fx).await;
        fx.machine.complete(&player, &quest_id).await.unwrap();

        fx.machine.revoke_badge(&player, &quest_id).await.unwrap();
        assert_eq!(fx.ledger.revokes.load(Ordering::SeqCst), 1);
        assert!(fx
            .coordinator
            .badge_for_quest(&player, &quest_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn idle_flow_locks_are_evicted() {
        let fx = fixture();
        let (player, quest_id) = walk_to_ready(&fx).await;

        fx.machine.complete(&player, &quest_id).await.unwrap();
        assert!(fx.machine.locks.is_empty());

        // Failed attempts do not leave entries behind either.
        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::UniquenessViolation { .. }));
        assert!(fx.machine.locks.is_empty());

        fx.machine.reset(&player, &quest_id).await.unwrap();
        assert!(fx.machine.locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_marker_resolves_from_badge_records() {
        let fx = fixture();
        let (player, quest_id) = walk_to_ready(&fx).await;

        // Abandoned call that never minted: resolves back to ready.
        fx.machine.mark_cancelled(&player, &quest_id);
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Completing { cancelled: true }
        );
        assert!(fx
            .machine
            .resolve_cancelled(&player, &quest_id)
            .await
            .unwrap());
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::ReadyToComplete
        );

        // A retry while a cancelled marker is outstanding is rejected.
        fx.machine.mark_cancelled(&player, &quest_id);
        let err = fx.machine.complete(&player, &quest_id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition(_)));
        fx.machine
            .resolve_cancelled(&player, &quest_id)
            .await
            .unwrap();

        // Abandoned call whose mint did land: resolves to Completed.
        fx.machine.complete(&player, &quest_id).await.unwrap();
        fx.machine.mark_cancelled(&player, &quest_id);
        assert!(fx
            .machine
            .resolve_cancelled(&player, &quest_id)
            .await
            .unwrap());
        assert_eq!(
            fx.machine.state(&player, &quest_id).await.unwrap(),
            CompletionState::Completed
        );
    }
}
