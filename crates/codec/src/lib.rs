//! The `ConcealedIdToken` wire format.
//!
//! A token is an authenticated, key-wrapped, fixed-structure blob binding a
//! batch id and index to a batch-version-specific key derived per token from
//! a random salt. See [`encode`] and [`decode`] for the full transformation.

#![warn(missing_docs)]

use std::sync::Arc;

use aes_kw::KekAes256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokenizer_kms::HmacSigner;
use tokenizer_types::{InvalidTokenReason, TokenizerError, TokenizerResult};

/// Minimum key-wrap input length in bytes (before the 8-byte wrap overhead);
/// enforced by rounding the natural payload length up to a multiple of 8.
const MIN_KEY_WRAP_INPUT_LEN: usize = 24;

/// Parameters a decoded token is checked against; supplied by the caller
/// after looking up the referenced batch version (spec §4.1 "Parse").
#[derive(Clone, Copy, Debug)]
pub struct BatchVersionParams {
    /// `batchVersion.options.batchIdSize`.
    pub batch_id_size: usize,
    /// `batchVersion.options.batchSaltSize`.
    pub batch_salt_size: usize,
}

/// Resolves a batch version id, as encoded in a token, to the parameters
/// needed to parse it and the HMAC signer bound to its owning tokenizer.
///
/// Implemented by the batch-version registry; kept as a narrow trait here so
/// the codec doesn't depend on `tokenizer-core`.
#[async_trait]
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait BatchVersionResolver: Send + Sync {
    /// Resolve `batch_version` or fail with `NotFound` if unknown.
    async fn resolve(&self, batch_version: u64) -> TokenizerResult<(BatchVersionParams, Arc<dyn HmacSigner>)>;
}

/// The cleartext fields of a token, as recovered by [`decode`] or assembled
/// before calling [`encode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenFields {
    /// `batchVersion.id`.
    pub batch_version: u64,
    /// The batch's random id.
    pub batch_id: Vec<u8>,
    /// The index of this token within its batch (0..255).
    pub index: u8,
    /// Opaque attribute bytes, authenticated under the wrap and also
    /// transmitted in the clear.
    pub attributes: Vec<u8>,
}

/// The wire envelope: `{type, payload, meta}`, base58-encoded fields,
/// serialized with a compact binary encoding.
#[derive(Serialize, Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<String>,
}

const ENVELOPE_TYPE: &str = "ConcealedIdToken";

/// Error produced while encoding or decoding a token.
///
/// Every variant maps onto [`tokenizer_types::TokenizerError::InvalidToken`];
/// the codec never returns any other error kind (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Envelope tag, shape, or length didn't match expectations.
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    /// The token named a batch version the caller doesn't recognize.
    #[error("unknown batch version")]
    UnknownBatchVersion,
    /// AES key-wrap integrity check failed.
    #[error("key-wrap integrity failure")]
    IntegrityFailure,
    /// Unwrapped attributes didn't match the cleartext attributes.
    #[error("attribute mismatch")]
    AttributeMismatch,
}

impl From<CodecError> for TokenizerError {
    fn from(err: CodecError) -> Self {
        let reason = match err {
            CodecError::Malformed(_) => InvalidTokenReason::Malformed,
            CodecError::UnknownBatchVersion => InvalidTokenReason::UnknownBatchVersion,
            CodecError::IntegrityFailure => InvalidTokenReason::IntegrityFailure,
            CodecError::AttributeMismatch => InvalidTokenReason::AttributeMismatch,
        };
        TokenizerError::InvalidToken(reason)
    }
}

fn round_up_to_multiple_of_8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// Derive the key-encryption key: `HMAC_K(uint16_be(V) || S)`.
async fn derive_kek(signer: &dyn HmacSigner, batch_version: u64, salt: &[u8]) -> TokenizerResult<[u8; 32]> {
    let v: u16 = batch_version
        .try_into()
        .map_err(|_| TokenizerError::invalid_argument("batchVersion", "must fit in u16"))?;
    let mut input = Vec::with_capacity(2 + salt.len());
    input.extend_from_slice(&v.to_be_bytes());
    input.extend_from_slice(salt);
    signer.sign(&input).await
}

/// Encode `fields` into a wire token, using `signer` for KEK derivation.
///
/// `batch_salt_size` comes from the batch version's options; padding is
/// generated to round the key-wrap input up to the smallest multiple of 8
/// that is at least 24 bytes.
pub async fn encode(
    signer: &dyn HmacSigner,
    fields: &TokenFields,
    batch_salt_size: usize,
) -> TokenizerResult<Vec<u8>> {
    let mut salt = vec![0u8; batch_salt_size];
    rand::Rng::fill(&mut rand::rng(), salt.as_mut_slice());

    let unpadded_len = fields.batch_id.len() + 1 + fields.attributes.len();
    let padded_len = round_up_to_multiple_of_8(unpadded_len).max(MIN_KEY_WRAP_INPUT_LEN);
    let pad_len = padded_len - unpadded_len;

    let mut plaintext = Vec::with_capacity(padded_len);
    plaintext.extend_from_slice(&fields.batch_id);
    plaintext.push(fields.index);
    plaintext.extend_from_slice(&fields.attributes);
    plaintext.extend(std::iter::repeat_n(0u8, pad_len));

    let kek_bytes = derive_kek(signer, fields.batch_version, &salt).await?;
    let kek = KekAes256::new(&kek_bytes.into());
    let wrapped = kek
        .wrap_vec(&plaintext)
        .map_err(|_| TokenizerError::from(CodecError::IntegrityFailure))?;

    let mut payload = Vec::with_capacity(2 + salt.len() + wrapped.len());
    let v: u16 = fields
        .batch_version
        .try_into()
        .map_err(|_| TokenizerError::invalid_argument("batchVersion", "must fit in u16"))?;
    payload.extend_from_slice(&v.to_be_bytes());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&wrapped);

    let envelope = Envelope {
        kind: ENVELOPE_TYPE,
        payload: bs58::encode(&payload).into_string(),
        meta: if fields.attributes.is_empty() {
            None
        } else {
            Some(bs58::encode(&fields.attributes).into_string())
        },
    };

    postcard::to_allocvec(&envelope)
        .map_err(|e| TokenizerError::internal(PostcardFailure(e.to_string())))
}

/// Decode and authenticate a wire token, returning its cleartext fields.
///
/// `lookup_batch_version` resolves the version id encoded in the token to
/// the `batchIdSize`/`batchSaltSize` parameters needed to parse it, and
/// must also resolve the signer bound to that version's tokenizer.
pub async fn decode(
    token: &[u8],
    resolver: &dyn BatchVersionResolver,
) -> TokenizerResult<TokenFields> {
    let envelope: Envelope = postcard::from_bytes(token)
        .map_err(|_| TokenizerError::from(CodecError::Malformed("not a valid envelope")))?;
    if envelope.kind != ENVELOPE_TYPE {
        return Err(CodecError::Malformed("unexpected envelope type").into());
    }

    let payload = bs58::decode(&envelope.payload)
        .into_vec()
        .map_err(|_| TokenizerError::from(CodecError::Malformed("payload is not valid base58")))?;
    let clear_attributes = match &envelope.meta {
        Some(meta) => bs58::decode(meta)
            .into_vec()
            .map_err(|_| TokenizerError::from(CodecError::Malformed("meta is not valid base58")))?,
        None => Vec::new(),
    };

    if payload.len() < 2 {
        return Err(CodecError::Malformed("payload too short").into());
    }
    let batch_version = u16::from_be_bytes([payload[0], payload[1]]) as u64;

    let (params, signer) = resolver
        .resolve(batch_version)
        .await
        .map_err(|_| TokenizerError::from(CodecError::UnknownBatchVersion))?;

    let salt_start = 2;
    let salt_end = salt_start + params.batch_salt_size;
    if payload.len() < salt_end {
        return Err(CodecError::Malformed("payload shorter than declared salt size").into());
    }
    let salt = &payload[salt_start..salt_end];
    let wrapped = &payload[salt_end..];

    let expected_unpadded = params.batch_id_size + 1 + clear_attributes.len();
    let expected_wrapped_len = round_up_to_multiple_of_8(expected_unpadded).max(MIN_KEY_WRAP_INPUT_LEN) + 8;
    if wrapped.len() != expected_wrapped_len {
        return Err(CodecError::Malformed("wrap length does not match declared sizes").into());
    }

    let kek_bytes = derive_kek(signer.as_ref(), batch_version, salt).await?;
    let kek = KekAes256::new(&kek_bytes.into());
    let plaintext = kek.unwrap_vec(wrapped).map_err(|_| {
        tracing::debug!(batch_version, "key-wrap unwrap failed integrity check");
        TokenizerError::from(CodecError::IntegrityFailure)
    })?;

    let batch_id = plaintext
        .get(..params.batch_id_size)
        .ok_or(CodecError::Malformed("unwrapped payload too short for batch id"))?
        .to_vec();
    let index = *plaintext
        .get(params.batch_id_size)
        .ok_or(CodecError::Malformed("unwrapped payload missing index byte"))?;
    let attr_start = params.batch_id_size + 1;
    let attr_end = attr_start + clear_attributes.len();
    let unwrapped_attributes = plaintext
        .get(attr_start..attr_end)
        .ok_or(CodecError::Malformed("unwrapped payload too short for attributes"))?;

    if unwrapped_attributes.ct_eq(&clear_attributes).unwrap_u8() != 1 {
        return Err(CodecError::AttributeMismatch.into());
    }

    Ok(TokenFields {
        batch_version,
        batch_id,
        index,
        attributes: clear_attributes,
    })
}

#[derive(Debug, thiserror::Error)]
#[error("failed to serialize token envelope: {0}")]
struct PostcardFailure(String);

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizer_kms::InMemoryHmacSigner;

    fn signer() -> InMemoryHmacSigner {
        InMemoryHmacSigner::new("tok-1", b"0123456789abcdef0123456789abcdef".to_vec())
    }

    struct FixedResolver {
        params: BatchVersionParams,
        signer: Arc<dyn HmacSigner>,
    }

    #[async_trait]
    impl BatchVersionResolver for FixedResolver {
        async fn resolve(&self, _batch_version: u64) -> TokenizerResult<(BatchVersionParams, Arc<dyn HmacSigner>)> {
            Ok((self.params, self.signer.clone()))
        }
    }

    struct UnknownResolver;

    #[async_trait]
    impl BatchVersionResolver for UnknownResolver {
        async fn resolve(&self, _batch_version: u64) -> TokenizerResult<(BatchVersionParams, Arc<dyn HmacSigner>)> {
            Err(TokenizerError::NotFound("batchVersion"))
        }
    }

    #[tokio::test]
    async fn round_trips_without_attributes() {
        let signer = signer();
        let fields = TokenFields {
            batch_version: 3,
            batch_id: vec![7u8; 12],
            index: 42,
            attributes: Vec::new(),
        };
        let token = encode(&signer, &fields, 16).await.unwrap();

        let resolver = FixedResolver {
            params: BatchVersionParams {
                batch_id_size: 12,
                batch_salt_size: 16,
            },
            signer: Arc::new(signer),
        };
        let decoded = decode(&token, &resolver).await.unwrap();

        assert_eq!(decoded, fields);
    }

    #[tokio::test]
    async fn round_trips_with_attributes() {
        let signer = signer();
        let fields = TokenFields {
            batch_version: 1,
            batch_id: vec![1, 2, 3, 4, 5, 6, 7, 8],
            index: 0,
            attributes: vec![9, 9, 9],
        };
        let token = encode(&signer, &fields, 8).await.unwrap();

        let resolver = FixedResolver {
            params: BatchVersionParams {
                batch_id_size: 8,
                batch_salt_size: 8,
            },
            signer: Arc::new(signer),
        };
        let decoded = decode(&token, &resolver).await.unwrap();

        assert_eq!(decoded, fields);
    }

    #[tokio::test]
    async fn tampering_with_payload_fails_integrity() {
        let signer = signer();
        let fields = TokenFields {
            batch_version: 1,
            batch_id: vec![1u8; 8],
            index: 5,
            attributes: Vec::new(),
        };
        let token = encode(&signer, &fields, 8).await.unwrap();
        let mut envelope: Envelope = postcard::from_bytes(&token).unwrap();
        let mut payload = bs58::decode(&envelope.payload).into_vec().unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        envelope.payload = bs58::encode(&payload).into_string();
        let tampered = postcard::to_allocvec(&envelope).unwrap();

        let resolver = FixedResolver {
            params: BatchVersionParams {
                batch_id_size: 8,
                batch_salt_size: 8,
            },
            signer: Arc::new(signer),
        };
        let err = decode(&tampered, &resolver).await.unwrap_err();
        assert_matches::assert_matches!(
            err,
            TokenizerError::InvalidToken(InvalidTokenReason::IntegrityFailure)
        );
    }

    #[tokio::test]
    async fn tampering_with_clear_attributes_fails_attribute_check() {
        let signer = signer();
        let fields = TokenFields {
            batch_version: 1,
            batch_id: vec![1u8; 8],
            index: 5,
            attributes: vec![1, 2, 3],
        };
        let token = encode(&signer, &fields, 8).await.unwrap();
        let mut envelope: Envelope = postcard::from_bytes(&token).unwrap();
        let meta = envelope.meta.expect("non-empty attributes encode a meta field");
        let mut attributes = bs58::decode(&meta).into_vec().unwrap();
        attributes[0] ^= 0xFF;
        envelope.meta = Some(bs58::encode(&attributes).into_string());
        let tampered = postcard::to_allocvec(&envelope).unwrap();

        let resolver = FixedResolver {
            params: BatchVersionParams {
                batch_id_size: 8,
                batch_salt_size: 8,
            },
            signer: Arc::new(signer),
        };
        let err = decode(&tampered, &resolver).await.unwrap_err();
        assert_matches::assert_matches!(
            err,
            TokenizerError::InvalidToken(InvalidTokenReason::AttributeMismatch)
        );
    }

    #[tokio::test]
    async fn unknown_batch_version_is_rejected() {
        let fields = TokenFields {
            batch_version: 9,
            batch_id: vec![1u8; 8],
            index: 0,
            attributes: Vec::new(),
        };
        let token = encode(&signer(), &fields, 8).await.unwrap();
        let err = decode(&token, &UnknownResolver).await.unwrap_err();
        assert_matches::assert_matches!(
            err,
            TokenizerError::InvalidToken(InvalidTokenReason::UnknownBatchVersion)
        );
    }

    proptest::proptest! {
        #[test]
        fn round_trips_for_arbitrary_shapes(
            batch_id in proptest::collection::vec(proptest::num::u8::ANY, 8..16),
            salt_size in 8usize..16,
            index in proptest::num::u8::ANY,
            attributes in proptest::collection::vec(proptest::num::u8::ANY, 0..20),
        ) {
            tokio_test::block_on(async {
                let signer = signer();
                let fields = TokenFields {
                    batch_version: 1,
                    batch_id: batch_id.clone(),
                    index,
                    attributes: attributes.clone(),
                };
                let token = encode(&signer, &fields, salt_size).await.unwrap();
                let resolver = FixedResolver {
                    params: BatchVersionParams {
                        batch_id_size: batch_id.len(),
                        batch_salt_size: salt_size,
                    },
                    signer: Arc::new(signer),
                };
                let decoded = decode(&token, &resolver).await.unwrap();
                proptest::prop_assert_eq!(decoded, fields);
                Ok(())
            })?;
        }
    }
}
