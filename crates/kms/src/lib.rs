//! The HMAC/key-wrap key-management backend is, per the spec, an external
//! collaborator: a KMS that holds HMAC keys and signs on demand. This crate
//! defines the capability the rest of the engine consumes — an explicit
//! [`HmacSigner`] passed around as a value, never a global singleton (spec
//! §9 "Ambient HMAC handle") — plus a dev/test in-memory implementation.

#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use auto_impl::auto_impl;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokenizer_types::{MultihashSha256, TokenizerError, TokenizerId, TokenizerResult};

type HmacSha256 = Hmac<Sha256>;

/// A bound HMAC capability for exactly one tokenizer.
///
/// Implementations are expected to call out to an external KMS; the core
/// never inspects key material, only the signatures this trait returns.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait HmacSigner: Send + Sync {
    /// The stable identifier of the tokenizer this signer is bound to.
    fn tokenizer_id(&self) -> &TokenizerId;

    /// Produce `HMAC-SHA256(key, data)`.
    async fn sign(&self, data: &[u8]) -> TokenizerResult<[u8; 32]>;

    /// Hash `data` to a tagged sha2-256 multihash, used for `externalIdHash`
    /// and `documentHash` (spec §4.7). Hashing, unlike key-wrap KEK
    /// derivation, does not need to be keyed, but routing it through the
    /// same capability keeps all cryptographic operations behind one trait.
    async fn hash(&self, data: &[u8]) -> TokenizerResult<MultihashSha256> {
        use sha2::Digest;
        let digest: [u8; 32] = Sha256::digest(data).into();
        Ok(MultihashSha256::from_digest(digest))
    }
}

/// Looks up the *current* tokenizer for this deployment (spec §2 item 1).
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait TokenizerProvider: Send + Sync {
    /// Return the signer for the currently active tokenizer.
    async fn current(&self) -> TokenizerResult<Arc<dyn HmacSigner>>;
}

/// An in-memory HMAC signer for tests and local development.
///
/// Never use this in production — the key lives in process memory with no
/// rotation and no access control, which is precisely what the external KMS
/// collaborator exists to avoid.
pub struct InMemoryHmacSigner {
    tokenizer_id: TokenizerId,
    key: Vec<u8>,
}

impl InMemoryHmacSigner {
    /// Construct a signer bound to `tokenizer_id` using `key` as the raw
    /// HMAC key material.
    pub fn new(tokenizer_id: impl Into<TokenizerId>, key: Vec<u8>) -> Self {
        Self {
            tokenizer_id: tokenizer_id.into(),
            key,
        }
    }
}

#[async_trait]
impl HmacSigner for InMemoryHmacSigner {
    fn tokenizer_id(&self) -> &TokenizerId {
        &self.tokenizer_id
    }

    async fn sign(&self, data: &[u8]) -> TokenizerResult<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| TokenizerError::internal(InvalidKeyLength(e.to_string())))?;
        mac.update(data);
        let result = mac.finalize().into_bytes();
        Ok(result.into())
    }
}

/// A [`TokenizerProvider`] that always returns the same signer.
pub struct StaticTokenizerProvider {
    signer: Arc<dyn HmacSigner>,
}

impl StaticTokenizerProvider {
    /// Wrap a signer as a provider that never rotates.
    pub fn new(signer: Arc<dyn HmacSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl TokenizerProvider for StaticTokenizerProvider {
    async fn current(&self) -> TokenizerResult<Arc<dyn HmacSigner>> {
        Ok(self.signer.clone())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid HMAC key length: {0}")]
struct InvalidKeyLength(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signs_deterministically() {
        let signer = InMemoryHmacSigner::new("tok-1", b"secret-key-material".to_vec());
        let a = signer.sign(b"hello").await.unwrap();
        let b = signer.sign(b"hello").await.unwrap();
        assert_eq!(a, b);
        let c = signer.sign(b"hello2").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn hash_is_tagged_and_stable() {
        let signer = InMemoryHmacSigner::new("tok-1", b"secret-key-material".to_vec());
        let h1 = signer.hash(b"external-id").await.unwrap();
        let h2 = signer.hash(b"external-id").await.unwrap();
        assert_eq!(h1.as_bytes(), h2.as_bytes());
        assert_eq!(h1.as_bytes()[0], 0x12);
        assert_eq!(h1.as_bytes()[1], 0x20);
        assert_eq!(h1.as_bytes().len(), 34);
    }
}
