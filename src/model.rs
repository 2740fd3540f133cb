//! Entity model: quests, requirements, progress, badges
//!
//! Records are partitioned by the owning principal (wallet-style address).
//! Quest and badge identifiers are UUIDv7 so they sort by creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Wallet-style identity that owns quests, progress and badges.
/// Doubles as the data partition key across tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque, time-ordered quest identifier. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestId(pub Uuid);

impl QuestId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for QuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Badge identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BadgeId(pub Uuid);

impl BadgeId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for BadgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who can discover and join a quest, and which tiers it replicates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// Replicated to the content store and authoritative store.
    Public,
    /// Scoped to the owning principal's partition.
    InviteOnly,
    /// Invite-scoped with an event window.
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Epic,
}

impl Difficulty {
    /// Badge rarity is derived from quest difficulty, never stored
    /// independently.
    pub fn rarity(&self) -> Rarity {
        match self {
            Difficulty::Easy => Rarity::Common,
            Difficulty::Medium => Rarity::Uncommon,
            Difficulty::Hard => Rarity::Rare,
            Difficulty::Epic => Rarity::Legendary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Legendary,
}

/// How a requirement is attested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequirementKind {
    /// Self-attested by the participant.
    Manual,
    /// Attested by membership in an external group.
    GroupMembership,
}

/// A single completion requirement within a quest.
///
/// Indices are stable for the lifetime of the quest; reordering is not
/// supported (delete-and-recreate only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub index: u32,
    pub kind: RequirementKind,
    pub description: String,
    /// Kind-specific configuration (e.g. group id for membership checks).
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Optional start/end window for event quests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl EventWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.starts_at && at <= self.ends_at
    }
}

/// A user-created task with completion requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    pub id: QuestId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: Difficulty,
    /// Ordered; indices must match positions and stay stable.
    pub requirements: Vec<Requirement>,
    /// Free-form reward descriptor shown to participants.
    pub reward: String,
    pub visibility: Visibility,
    pub owner: Principal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_window: Option<EventWindow>,
    /// 0 = unlimited participants.
    #[serde(default)]
    pub participant_limit: u32,
    /// Principals that have joined. Denormalized onto the quest so the
    /// limit can be enforced without a cross-partition scan.
    #[serde(default)]
    pub participants: BTreeSet<Principal>,
    pub updated_at: DateTime<Utc>,
}

impl Quest {
    /// Whether this quest replicates beyond the owner's partition.
    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    pub fn requirement_count(&self) -> u32 {
        self.requirements.len() as u32
    }

    /// Whether another principal may still join.
    pub fn has_capacity(&self) -> bool {
        self.participant_limit == 0 || (self.participants.len() as u32) < self.participant_limit
    }
}

/// Per-(principal, quest) participation state.
///
/// Exists only after a join; join is a precondition for progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub principal: Principal,
    pub quest_id: QuestId,
    /// Completed requirement indices. Set semantics: an index appears once.
    pub completed: BTreeSet<u32>,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn new(principal: Principal, quest_id: QuestId) -> Self {
        let now = Utc::now();
        Self {
            principal,
            quest_id,
            completed: BTreeSet::new(),
            joined_at: now,
            notes: None,
            updated_at: now,
        }
    }
}

/// Reference into the external ledger for a minted badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRef {
    pub token_id: String,
    pub tx_ref: String,
}

/// Non-transferable completion token earned by finishing a quest.
///
/// At most one non-revoked badge exists per (owner, source_quest); the
/// completion machine upholds this even under partial ledger failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Badge {
    pub id: BadgeId,
    pub owner: Principal,
    pub source_quest: QuestId,
    pub rarity: Rarity,
    pub earned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_ref: Option<LedgerRef>,
    /// Revoked badges stay on record but no longer count toward uniqueness.
    #[serde(default)]
    pub revoked: bool,
    /// False while the badge lives only in the local cache awaiting a
    /// durable tier (ledger succeeded, storage did not).
    #[serde(default = "default_true")]
    pub confirmed_persisted: bool,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Key for any record stored in a tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKey {
    Quest(QuestId),
    Progress(Principal, QuestId),
    Badge(BadgeId),
}

impl RecordKey {
    /// Storage key string, namespaced by record type.
    pub fn storage_key(&self) -> String {
        match self {
            RecordKey::Quest(id) => format!("quest:{id}"),
            RecordKey::Progress(p, q) => format!("progress:{p}:{q}"),
            RecordKey::Badge(id) => format!("badge:{id}"),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// The unit the tiers store and the coordinator merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Quest(Quest),
    Progress(Progress),
    Badge(Badge),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Quest(q) => RecordKey::Quest(q.id),
            Record::Progress(p) => RecordKey::Progress(p.principal.clone(), p.quest_id),
            Record::Badge(b) => RecordKey::Badge(b.id),
        }
    }

    pub fn owner(&self) -> &Principal {
        match self {
            Record::Quest(q) => &q.owner,
            Record::Progress(p) => &p.principal,
            Record::Badge(b) => &b.owner,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Record::Quest(q) => q.updated_at,
            Record::Progress(p) => p.updated_at,
            Record::Badge(b) => b.updated_at,
        }
    }

    /// Whether this record replicates to the shared/public listings.
    pub fn is_public(&self) -> bool {
        match self {
            Record::Quest(q) => q.is_public(),
            // Progress and badges always stay in the owner's partition.
            Record::Progress(_) | Record::Badge(_) => false,
        }
    }
}
