//! Persisted record shapes for the six collections the engine reads and
//! writes (spec §3, §6).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokenizer_types::{Bitstring256, InternalId, MultihashSha256, Timestamp, TokenizerId};

/// `-1` denotes an unpinned batch/query; any other value is a pin level.
pub const UNPINNED: i32 = -1;

/// The option set applied to a batch version at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchVersionOptions {
    /// Bytes in a batch id. Must be ≥ 8.
    pub batch_id_size: u32,
    /// Bytes of per-token KEK salt. Must be ≥ 8.
    pub batch_salt_size: u32,
    /// Max tokens per batch. 1..=256.
    pub batch_token_count: u16,
    /// Batch lifetime in milliseconds.
    pub ttl_ms: i64,
}

/// An immutable, monotonically-numbered HMAC-key/parameter generation for a
/// tokenizer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchVersion {
    /// Globally unique, monotonically increasing.
    pub id: u64,
    /// The tokenizer this version belongs to.
    pub tokenizer_id: TokenizerId,
    /// Immutable once created.
    pub options: BatchVersionOptions,
}

/// The option set applied to the *next* auto-created batch version. Exactly
/// one record exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextOptions {
    /// Options to apply on the next `ensureForTokenizer` auto-creation.
    pub options: BatchVersionOptions,
}

/// A record of an assurance check that failed, kept so a later
/// `setMinAssuranceForResolution` call can verify it's still current.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssuranceFailure {
    /// The batch the failing resolution attempt was against.
    pub batch_id: Vec<u8>,
    /// `entity.batchInvalidationCount` as observed at failure time.
    pub batch_invalidation_count: u64,
    /// When the failure was recorded.
    pub date: Timestamp,
}

/// The internal-identifier anchor record: one per distinct real-world entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Never revealed outside the system.
    pub internal_id: InternalId,
    /// Present once at least one registration has occurred.
    pub external_id_hash: Option<MultihashSha256>,
    /// Monotonically non-decreasing; advances only via §4.5's protocol.
    pub batch_invalidation_count: u64,
    /// `pinLevelKey -> batchId`, where `-1` is the unpinned pin level.
    pub open_batch: HashMap<i32, Vec<u8>>,
    /// Default 2.
    pub min_assurance_for_resolution: i32,
    /// Set when a resolution is rejected for insufficient assurance.
    pub last_assurance_failed_token_resolution: Option<AssuranceFailure>,
    /// Set whenever `invalidateUnpinnedBatches` succeeds.
    pub last_batch_invalidation_date: Option<Timestamp>,
    /// Only ever advances forward (`$max` semantics).
    pub expires: Timestamp,
    /// Record creation time.
    pub created: Timestamp,
    /// Last-modified time.
    pub updated: Timestamp,
}

impl Entity {
    /// A freshly minted entity with the given id and expiry, default
    /// assurance, and no open batches.
    pub fn new(internal_id: InternalId, expires: Timestamp) -> Self {
        let now = tokenizer_types::now();
        Self {
            internal_id,
            external_id_hash: None,
            batch_invalidation_count: 0,
            open_batch: HashMap::new(),
            min_assurance_for_resolution: 2,
            last_assurance_failed_token_resolution: None,
            last_batch_invalidation_date: None,
            expires,
            created: now,
            updated: now,
        }
    }
}

/// A batch of token slots sharing one HMAC key-wrap salt regime and one
/// expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBatch {
    /// `batchIdSize` random bytes, unique.
    pub id: Vec<u8>,
    /// The owning entity.
    pub internal_id: InternalId,
    /// The batch-version id used to manufacture every token in this batch.
    pub batch_version: u64,
    /// Bit `i` set iff the token at index `i` has been pairwise-resolved by
    /// any requester.
    pub resolved_list: Bitstring256,
    /// `base64url(requester) -> per-requester resolution bitstring`.
    pub resolution: HashMap<String, Bitstring256>,
    /// Total slots in this batch.
    pub max_token_count: u16,
    /// Monotonically non-increasing; doubles as a CAS row version.
    pub remaining_token_count: u16,
    pub expires: Timestamp,
    /// Snapshot of the owning entity's generation at creation time.
    pub batch_invalidation_count: u64,
    /// `-1` denotes unpinned.
    pub min_assurance_for_resolution: i32,
    pub created: Timestamp,
    pub updated: Timestamp,
}

impl TokenBatch {
    /// True when `minAssuranceForResolution == -1`.
    pub fn is_unpinned(&self) -> bool {
        self.min_assurance_for_resolution == UNPINNED
    }
}

/// Encodes a requester identifier the way `resolution` map keys are encoded.
pub fn encode_requester(requester: &str) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(requester.as_bytes())
}

/// One document registered under an external identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Shared by every registration for the same real-world entity.
    pub internal_id: InternalId,
    /// Half of the unique compound key.
    pub external_id_hash: MultihashSha256,
    /// Half of the unique compound key.
    pub document_hash: MultihashSha256,
    pub tokenizer_id: TokenizerId,
    /// Opaque; produced by the external content-encryption collaborator.
    pub jwe: Vec<u8>,
    /// `hmac(creator)` values added via `$addToSet` semantics.
    pub creator_hash: HashSet<Vec<u8>>,
    pub expires: Timestamp,
    pub created: Timestamp,
    pub updated: Timestamp,
}

/// A stable, per-requester pseudonym for one internal id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseToken {
    pub internal_id: InternalId,
    pub requester: String,
    /// Opaque 16-byte value handed back to the requester.
    pub value: [u8; 16],
    /// Absent for historical records created before `expires` was tracked.
    pub expires: Option<Timestamp>,
    pub created: Timestamp,
    pub updated: Timestamp,
}
