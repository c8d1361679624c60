//! Opaque identifiers shared across the tokenization engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TokenizerError, TokenizerResult};

/// 16-byte opaque handle for an entity, never revealed outside the system.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalId(#[serde(with = "hex_array_16")] pub [u8; 16]);

impl InternalId {
    /// Generate a fresh random internal id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::rng(), &mut bytes);
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl TryFrom<&[u8]> for InternalId {
    type Error = TokenizerError;

    fn try_from(value: &[u8]) -> TokenizerResult<Self> {
        let array: [u8; 16] = value
            .try_into()
            .map_err(|_| TokenizerError::invalid_argument("internalId", "must be 16 bytes"))?;
        Ok(Self(array))
    }
}

impl fmt::Debug for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternalId({})", hex::encode(self.0))
    }
}

/// A sha2-256 digest tagged with a multihash prefix, as produced by
/// `HmacSigner::hash` calls over external ids and canonicalized documents.
///
/// Layout: `[0x12, 0x20] || digest` — code `0x12` (sha2-256), length `0x20` (32).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultihashSha256(Vec<u8>);

const SHA2_256_MULTIHASH_CODE: u8 = 0x12;
const SHA2_256_DIGEST_LEN: u8 = 0x20;

impl MultihashSha256 {
    /// Wrap a raw 32-byte sha2-256 digest with its multihash tag.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        let mut tagged = Vec::with_capacity(2 + digest.len());
        tagged.push(SHA2_256_MULTIHASH_CODE);
        tagged.push(SHA2_256_DIGEST_LEN);
        tagged.extend_from_slice(&digest);
        Self(tagged)
    }

    /// The tagged byte representation used as a store key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MultihashSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultihashSha256({})", hex::encode(&self.0))
    }
}

/// Identifier of the tokenizer (HMAC key holder) that produced a batch version.
pub type TokenizerId = String;

/// Monotonically increasing batch-version identifier.
pub type BatchVersionId = u64;

mod hex_array_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}
