//! Storage for `pairwiseToken` records (spec §3 "PairwiseToken", §4.8).

use async_trait::async_trait;
use auto_impl::auto_impl;
use dashmap::DashMap;
use tokenizer_types::{InternalId, Timestamp, TokenizerError, TokenizerResult};

use crate::model::PairwiseToken;

/// Storage for pairwise-pseudonym records, keyed by `(internalId,
/// requester)`. Lookup by `value` is gated behind an optional index (§4.8:
/// "without the index, such queries are rejected") — modeled here as a
/// constructor flag rather than a config lookup, since the store shouldn't
/// need to know about `TokenizerConfig`.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait PairwiseTokenStore: Send + Sync {
    /// Fetch by `(internalId, requester)`. `NotFound` if absent.
    async fn get(&self, internal_id: &InternalId, requester: &str) -> TokenizerResult<PairwiseToken>;

    /// Reverse lookup by opaque `value`. `NotAllowed` if the store wasn't
    /// built with the value index enabled.
    async fn resolve_by_value(&self, value: &[u8; 16]) -> TokenizerResult<PairwiseToken>;

    /// Refresh `expires` for an existing record. Returns whether one
    /// existed.
    async fn refresh_expires(
        &self,
        internal_id: &InternalId,
        requester: &str,
        new_expires: Option<Timestamp>,
    ) -> TokenizerResult<bool>;

    /// Insert a new record. `Duplicate` on `(internalId, requester)`
    /// conflict (§4.8: "on duplicate conflict (another resolver created it),
    /// loop and get").
    async fn insert_new(&self, token: PairwiseToken) -> TokenizerResult<()>;
}

/// An in-memory `PairwiseTokenStore` backed by `dashmap`.
pub struct InMemoryPairwiseTokenStore {
    by_key: DashMap<(InternalId, String), PairwiseToken>,
    value_index_enabled: bool,
}

impl InMemoryPairwiseTokenStore {
    /// An empty store. `value_index_enabled` mirrors the
    /// `ensurePairwiseTokenValueIndex` configuration option.
    pub fn new(value_index_enabled: bool) -> Self {
        Self {
            by_key: DashMap::new(),
            value_index_enabled,
        }
    }
}

#[async_trait]
impl PairwiseTokenStore for InMemoryPairwiseTokenStore {
    async fn get(&self, internal_id: &InternalId, requester: &str) -> TokenizerResult<PairwiseToken> {
        self.by_key
            .get(&(*internal_id, requester.to_string()))
            .map(|t| t.value().clone())
            .ok_or(TokenizerError::NotFound("pairwiseToken"))
    }

    async fn resolve_by_value(&self, value: &[u8; 16]) -> TokenizerResult<PairwiseToken> {
        if !self.value_index_enabled {
            return Err(TokenizerError::NotAllowed(
                tokenizer_types::NotAllowedReason::QueryDisabled("ensurePairwiseTokenValueIndex"),
            ));
        }
        self.by_key
            .iter()
            .find(|entry| &entry.value().value == value)
            .map(|entry| entry.value().clone())
            .ok_or(TokenizerError::NotFound("pairwiseToken"))
    }

    async fn refresh_expires(
        &self,
        internal_id: &InternalId,
        requester: &str,
        new_expires: Option<Timestamp>,
    ) -> TokenizerResult<bool> {
        let Some(mut token) = self.by_key.get_mut(&(*internal_id, requester.to_string())) else {
            return Ok(false);
        };
        token.expires = new_expires;
        token.updated = tokenizer_types::now();
        Ok(true)
    }

    async fn insert_new(&self, token: PairwiseToken) -> TokenizerResult<()> {
        let k = (token.internal_id, token.requester.clone());
        match self.by_key.entry(k) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TokenizerError::Duplicate("pairwiseToken".to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(internal_id: InternalId) -> PairwiseToken {
        let now = tokenizer_types::now();
        PairwiseToken {
            internal_id,
            requester: "R".to_string(),
            value: [7u8; 16],
            expires: Some(now + chrono::Duration::minutes(1)),
            created: now,
            updated: now,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = InMemoryPairwiseTokenStore::new(false);
        let id = InternalId::random();
        store.insert_new(token(id)).await.unwrap();
        let fetched = store.get(&id, "R").await.unwrap();
        assert_eq!(fetched.value, [7u8; 16]);
    }

    #[tokio::test]
    async fn value_lookup_rejected_without_index() {
        let store = InMemoryPairwiseTokenStore::new(false);
        let id = InternalId::random();
        store.insert_new(token(id)).await.unwrap();
        let err = store.resolve_by_value(&[7u8; 16]).await.unwrap_err();
        assert!(matches!(err, TokenizerError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn value_lookup_succeeds_with_index() {
        let store = InMemoryPairwiseTokenStore::new(true);
        let id = InternalId::random();
        store.insert_new(token(id)).await.unwrap();
        let fetched = store.resolve_by_value(&[7u8; 16]).await.unwrap();
        assert_eq!(fetched.internal_id, id);
    }

    #[tokio::test]
    async fn rejects_duplicate_key() {
        let store = InMemoryPairwiseTokenStore::new(false);
        let id = InternalId::random();
        store.insert_new(token(id)).await.unwrap();
        let err = store.insert_new(token(id)).await.unwrap_err();
        assert!(matches!(err, TokenizerError::Duplicate(_)));
    }
}
