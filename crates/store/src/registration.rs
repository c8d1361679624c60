//! Storage for `registration` records (spec §3 "Registration", §4.7).

use async_trait::async_trait;
use auto_impl::auto_impl;
use dashmap::DashMap;
use tokenizer_types::{MultihashSha256, Timestamp, TokenizerError, TokenizerResult};

use crate::model::Registration;

/// Storage for registration records, keyed by the compound
/// `(externalIdHash, documentHash)`.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait RegistrationStore: Send + Sync {
    /// Fetch by compound key. `NotFound` if absent or expired.
    async fn get_by_hashes(
        &self,
        external_id_hash: &MultihashSha256,
        document_hash: &MultihashSha256,
    ) -> TokenizerResult<Registration>;

    /// Optimistic refresh (§4.7 step 2): conditional `{externalIdHash,
    /// documentHash}` → `expires`, `updated`, and `$addToSet` onto
    /// `creatorHash` if `creator_hash` is given. Returns `None` if no
    /// matching record exists (caller falls through to insert).
    async fn refresh(
        &self,
        external_id_hash: &MultihashSha256,
        document_hash: &MultihashSha256,
        new_expires: Timestamp,
        creator_hash: Option<Vec<u8>>,
    ) -> TokenizerResult<Option<Registration>>;

    /// Insert a new registration. `Duplicate` on compound-key conflict
    /// (§4.7 step 3: "on duplicate conflict loop to refresh").
    async fn insert_new(&self, registration: Registration) -> TokenizerResult<()>;
}

/// An in-memory `RegistrationStore` backed by `dashmap`.
#[derive(Default)]
pub struct InMemoryRegistrationStore {
    by_hashes: DashMap<(Vec<u8>, Vec<u8>), Registration>,
}

impl InMemoryRegistrationStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(external_id_hash: &MultihashSha256, document_hash: &MultihashSha256) -> (Vec<u8>, Vec<u8>) {
    (
        external_id_hash.as_bytes().to_vec(),
        document_hash.as_bytes().to_vec(),
    )
}

#[async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn get_by_hashes(
        &self,
        external_id_hash: &MultihashSha256,
        document_hash: &MultihashSha256,
    ) -> TokenizerResult<Registration> {
        let registration = self
            .by_hashes
            .get(&key(external_id_hash, document_hash))
            .map(|r| r.value().clone())
            .ok_or(TokenizerError::NotFound("registration"))?;
        if tokenizer_types::is_expired(registration.expires) {
            return Err(TokenizerError::NotFound("registration"));
        }
        Ok(registration)
    }

    async fn refresh(
        &self,
        external_id_hash: &MultihashSha256,
        document_hash: &MultihashSha256,
        new_expires: Timestamp,
        creator_hash: Option<Vec<u8>>,
    ) -> TokenizerResult<Option<Registration>> {
        let Some(mut registration) = self.by_hashes.get_mut(&key(external_id_hash, document_hash)) else {
            return Ok(None);
        };
        registration.expires = new_expires;
        registration.updated = tokenizer_types::now();
        if let Some(hash) = creator_hash {
            registration.creator_hash.insert(hash);
        }
        Ok(Some(registration.value().clone()))
    }

    async fn insert_new(&self, registration: Registration) -> TokenizerResult<()> {
        let k = key(&registration.external_id_hash, &registration.document_hash);
        match self.by_hashes.entry(k) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TokenizerError::Duplicate("registration".to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(registration);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizer_types::InternalId;

    fn registration() -> Registration {
        let now = tokenizer_types::now();
        Registration {
            internal_id: InternalId::random(),
            external_id_hash: MultihashSha256::from_digest([1u8; 32]),
            document_hash: MultihashSha256::from_digest([2u8; 32]),
            tokenizer_id: "tok-1".to_string(),
            jwe: vec![0xAA; 4],
            creator_hash: Default::default(),
            expires: now + chrono::Duration::minutes(1),
            created: now,
            updated: now,
        }
    }

    #[tokio::test]
    async fn refresh_returns_none_when_absent() {
        let store = InMemoryRegistrationStore::new();
        let r = registration();
        let result = store
            .refresh(&r.external_id_hash, &r.document_hash, tokenizer_types::now(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn refresh_extends_expiry_and_adds_creator() {
        let store = InMemoryRegistrationStore::new();
        let r = registration();
        store.insert_new(r.clone()).await.unwrap();

        let new_expires = r.expires + chrono::Duration::minutes(5);
        let refreshed = store
            .refresh(
                &r.external_id_hash,
                &r.document_hash,
                new_expires,
                Some(vec![7u8; 4]),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.expires, new_expires);
        assert!(refreshed.creator_hash.contains(&vec![7u8; 4]));
    }

    #[tokio::test]
    async fn rejects_duplicate_compound_key() {
        let store = InMemoryRegistrationStore::new();
        let r = registration();
        store.insert_new(r.clone()).await.unwrap();
        let err = store.insert_new(r).await.unwrap_err();
        assert!(matches!(err, TokenizerError::Duplicate(_)));
    }
}
