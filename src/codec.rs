//! Tier-aware entity codec and short-code derivation
//!
//! The local cache and the authoritative store take the canonical JSON
//! record. The content store has no secondary lookup, so its encoding is
//! an envelope embedding the full record graph plus denormalized owner,
//! visibility and short code. Content-store bytes carry no authoritative
//! timestamp for merge purposes; the coordinator treats them as
//! presence-only.

use crate::error::{Result, SyncError};
use crate::model::{Principal, QuestId, Record};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default short-code length. Eight characters over a 32-glyph alphabet
/// gives ~1.1e12 codes; collisions are still legal and surfaced as
/// `Ambiguous` at resolve time.
pub const SHORT_CODE_LEN: usize = 8;

/// Code alphabet with visually confusable glyphs removed (no 0/O, 1/I/l).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Which tier an encoding targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    LocalCache,
    ContentStore,
    Authoritative,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TierKind::LocalCache => "local-cache",
            TierKind::ContentStore => "content-store",
            TierKind::Authoritative => "authoritative",
        };
        f.write_str(s)
    }
}

/// Self-describing envelope for content-store blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentEnvelope {
    /// Denormalized owner for partition scans without a lookup service.
    owner: Principal,
    /// Denormalized visibility, "public" blobs show up in global listings.
    visibility: String,
    /// Short code embedded so index rebuilds need only the blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    record: Record,
}

/// Encode a record into the given tier's native bytes.
pub fn encode(record: &Record, tier: TierKind) -> Result<Vec<u8>> {
    match tier {
        TierKind::LocalCache | TierKind::Authoritative => {
            Ok(serde_json::to_vec(record)?)
        }
        TierKind::ContentStore => {
            let code = match record {
                Record::Quest(q) => Some(short_code(&q.id)),
                _ => None,
            };
            let envelope = ContentEnvelope {
                owner: record.owner().clone(),
                visibility: if record.is_public() { "public" } else { "scoped" }.to_string(),
                code,
                record: record.clone(),
            };
            Ok(serde_json::to_vec(&envelope)?)
        }
    }
}

/// Decode tier-native bytes back into a record.
pub fn decode(bytes: &[u8], tier: TierKind) -> Result<Record> {
    match tier {
        TierKind::LocalCache | TierKind::Authoritative => {
            Ok(serde_json::from_slice(bytes)?)
        }
        TierKind::ContentStore => {
            let envelope: ContentEnvelope = serde_json::from_slice(bytes)
                .map_err(|e| SyncError::Serialization(format!("content envelope: {e}")))?;
            Ok(envelope.record)
        }
    }
}

/// Derive the deterministic, human-shareable short code for a quest.
///
/// SHA-256 of the identifier bytes mapped onto the unambiguous alphabet.
/// Same identifier always yields the same code; different identifiers may
/// collide with low but non-zero probability, and resolve-time callers
/// must handle a multi-match result.
pub fn short_code(id: &QuestId) -> String {
    short_code_of_len(id, SHORT_CODE_LEN)
}

/// Short code with an explicit length (configuration may size the code
/// space against expected quest volume).
pub fn short_code_of_len(id: &QuestId, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.0.as_bytes());
    let digest = hasher.finalize();

    digest
        .iter()
        .take(len)
        .map(|b| CODE_ALPHABET[*b as usize % CODE_ALPHABET.len()] as char)
        .collect()
}

/// Content address for a blob, same scheme as the content collaborator.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}
