//! The JWE-based document encryption primitive is, per the spec, an external
//! collaborator (a key-agreement / content-encryption library). This crate
//! defines the [`ContentEncryptor`] capability the core treats as opaque,
//! plus a dev AES-256-GCM implementation standing in for it in tests.
//!
//! A production deployment swaps in a real JWE library behind the same
//! trait; the core never inspects ciphertext shape.

#![warn(missing_docs)]

use async_trait::async_trait;
use auto_impl::auto_impl;
use tokenizer_types::{TokenizerError, TokenizerResult};

/// An opaque recipient key. For the dev implementation this is a raw
/// AES-256 key; a real JWE backend would hold a public key or key reference.
#[derive(Clone)]
pub struct RecipientKey(pub [u8; 32]);

/// One encryption "layer": the set of recipients who can decrypt it.
#[derive(Clone)]
pub struct RecipientSet(pub Vec<RecipientKey>);

/// Encrypts a document for one or more recipients, returning an opaque blob.
///
/// The core treats the result as opaque bytes to be stored verbatim in
/// `Registration::jwe`; it never decrypts or inspects it.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait ContentEncryptor: Send + Sync {
    /// Encrypt `plaintext` for the given recipient set.
    async fn encrypt(
        &self,
        recipients: &RecipientSet,
        plaintext: &[u8],
    ) -> TokenizerResult<Vec<u8>>;
}

/// Encrypt `plaintext` through a chain of recipient sets, producing nested
/// envelopes with the innermost (first) set encrypted first, then the
/// result re-encrypted for each subsequent set (spec §4.7: "a chain of sets
/// that produces nested envelopes, innermost first").
pub async fn encrypt_chain(
    encryptor: &dyn ContentEncryptor,
    chain: &[RecipientSet],
    plaintext: &[u8],
) -> TokenizerResult<Vec<u8>> {
    if chain.is_empty() {
        return Err(TokenizerError::invalid_argument(
            "recipientChain",
            "must contain at least one recipient set",
        ));
    }
    let mut current = plaintext.to_vec();
    for recipients in chain {
        current = encryptor.encrypt(recipients, &current).await?;
    }
    Ok(current)
}

/// A dev AES-256-GCM implementation of [`ContentEncryptor`].
///
/// Encrypts for the first recipient in the set only — a real multi-recipient
/// JWE would wrap one content-encryption key per recipient; that fan-out is
/// the external collaborator's concern, not the core's.
#[derive(Default)]
pub struct AesGcmContentEncryptor;

impl AesGcmContentEncryptor {
    /// Construct the dev encryptor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContentEncryptor for AesGcmContentEncryptor {
    async fn encrypt(
        &self,
        recipients: &RecipientSet,
        plaintext: &[u8],
    ) -> TokenizerResult<Vec<u8>> {
        use aes_gcm::aead::{Aead, KeyInit};
        use aes_gcm::{Aes256Gcm, Key, Nonce};

        let recipient = recipients
            .0
            .first()
            .ok_or_else(|| TokenizerError::invalid_argument("recipients", "must be non-empty"))?;

        let key = Key::<Aes256Gcm>::from_slice(&recipient.0);
        let cipher = Aes256Gcm::new(key);

        let mut nonce_bytes = [0u8; 12];
        rand::Rng::fill(&mut rand::rng(), &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| TokenizerError::internal(EncryptionFailure))?;

        let mut out = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("content encryption failed")]
struct EncryptionFailure;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> RecipientKey {
        RecipientKey([byte; 32])
    }

    #[tokio::test]
    async fn encrypts_single_layer() {
        let encryptor = AesGcmContentEncryptor::new();
        let set = RecipientSet(vec![key(1)]);
        let blob = encryptor.encrypt(&set, b"hello world").await.unwrap();
        assert!(blob.len() > 12);
    }

    #[tokio::test]
    async fn chain_nests_layers() {
        let encryptor = AesGcmContentEncryptor::new();
        let chain = vec![RecipientSet(vec![key(1)]), RecipientSet(vec![key(2)])];
        let inner_only = encrypt_chain(&encryptor, &chain[..1], b"doc").await.unwrap();
        let nested = encrypt_chain(&encryptor, &chain, b"doc").await.unwrap();
        // The outer layer re-encrypts the inner ciphertext, so lengths differ
        // from a single-layer encryption of the same plaintext and the
        // result is not simply the inner blob.
        assert_ne!(inner_only, nested);
    }

    #[tokio::test]
    async fn rejects_empty_chain() {
        let encryptor = AesGcmContentEncryptor::new();
        let err = encrypt_chain(&encryptor, &[], b"doc").await.unwrap_err();
        assert!(matches!(err, TokenizerError::InvalidArgument { .. }));
    }
}
