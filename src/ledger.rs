//! Ledger collaborator interface
//!
//! The external, append-only system that actually mints (and burns)
//! badges. Only its request/confirmation surface is consumed here; the
//! contract logic itself is out of scope. Confirmation can legitimately
//! take much longer than a store round-trip, so callers bound it with the
//! ledger timeout, never the store timeout.

use crate::error::Result;
use crate::model::{Principal, QuestId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque handle for a submitted completion transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle(pub String);

/// A confirmed mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub token_id: String,
    pub tx_ref: String,
}

/// Completion proof forwarded to the ledger (opaque to this engine).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionProof {
    /// Requirement indices attested complete.
    pub completed: Vec<u32>,
    /// Collaborator-specific attestation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<String>,
}

/// The consumed minting collaborator.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a completion for minting.
    async fn submit_completion(
        &self,
        principal: &Principal,
        quest: &QuestId,
        proof: &CompletionProof,
    ) -> Result<TxHandle>;

    /// Await confirmation of a submitted transaction.
    ///
    /// Errors map onto `LedgerTimeout` / `LedgerReverted`.
    async fn await_confirmation(
        &self,
        handle: &TxHandle,
        timeout: Duration,
    ) -> Result<Confirmation>;

    /// Explicitly retract a minted token. Separate from badge revocation:
    /// resetting a quest revokes the badge record without touching the
    /// mint.
    async fn submit_revoke(&self, token_id: &str) -> Result<()>;
}
