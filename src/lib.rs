//! Quest Sync Core - State synchronization for quest and badge records
//!
//! Keeps quest definitions, participant progress, and earned badges
//! consistent across three storage tiers with very different guarantees,
//! and drives idempotent badge minting against an external ledger.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────────┐      ┌────────────────┐
//!            │ CompletionMachine ───▶ │ Ledger (trait) │
//!            └───────┬────────┘      └────────────────┘
//!                    │
//!            ┌───────▼────────┐      ┌──────────────┐
//!            │ SyncCoordinator │ ◀──▶ │ IndexManager │
//!            └───────┬────────┘      └──────────────┘
//!        ┌───────────┼──────────────┐
//!        ▼           ▼              ▼
//!  ┌──────────┐ ┌────────────┐ ┌──────────────┐
//!  │ LocalCache│ │ContentStore│ │Authoritative │
//!  │ (volatile)│ │(append-only│ │(partitioned, │
//!  │           │ │ by-hash)   │ │ flaky)       │
//!  └──────────┘ └────────────┘ └──────────────┘
//! ```
//!
//! ## Tier Guarantees
//!
//! | Tier | Durability | Timestamps | Reachability |
//! |------|-----------|------------|--------------|
//! | Local cache | none (process-lifetime) | yes | always |
//! | Content store | append-only, by hash | no | usually |
//! | Authoritative | durable, partitioned | yes | intermittent |
//!
//! Reads fan out and merge on last-updated-wins (presence wins when no
//! view carries a timestamp). Writes go cache-first; a durable miss marks
//! the record pending and background reconciliation converges it later.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.quest-sync/
//! ├── blobs/           # Content-addressed envelopes
//! │   └── sha2/56-...  # First 4 chars of hash as subdirs
//! ├── index.sled/      # Short-code discovery index
//! └── config.toml      # Configuration
//! ```

pub mod codec;
pub mod completion;
pub mod config;
pub mod error;
pub mod index;
pub mod ledger;
pub mod model;
pub mod reconcile;
pub mod sync;
pub mod tier;

// Re-exports
pub use codec::TierKind;
pub use completion::{CompletionMachine, CompletionState};
pub use config::Config;
pub use error::{Result, SyncError};
pub use index::{IndexEntry, IndexManager, QuestRef};
pub use ledger::{CompletionProof, Confirmation, Ledger, TxHandle};
pub use model::{
    Badge, BadgeId, Difficulty, EventWindow, LedgerRef, Principal, Progress, Quest, QuestId,
    Rarity, Record, RecordKey, Requirement, RequirementKind, Visibility,
};
pub use reconcile::{spawn_reconcile_task, ReconcileStats, Reconciler};
pub use sync::{SyncCoordinator, WriteReceipt};
pub use tier::{AuthoritativeAdapter, ContentStoreAdapter, Envelope, LocalCacheAdapter, TierAdapter};
