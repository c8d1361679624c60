//! Storage for `tokenBatch` records (spec §3 "TokenBatch", §4.3/§4.4).

use async_trait::async_trait;
use auto_impl::auto_impl;
use dashmap::DashMap;
use tokenizer_types::{Bitstring256, TokenizerError, TokenizerResult};

use crate::model::TokenBatch;

/// Storage for token-batch records.
///
/// `remainingTokenCount` and `resolvedList` both double as row versions for
/// compare-and-swap conditional updates, as described in §4.3's "Rationale
/// for monotone counter".
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait TokenBatchStore: Send + Sync {
    /// Fetch by id. `NotFound` if absent or expired.
    async fn get(&self, id: &[u8]) -> TokenizerResult<TokenBatch>;

    /// Insert a freshly created batch. `Duplicate` on id conflict (spec
    /// §4.3 step (a)(3): "On unique-batch-id conflict... surface
    /// `Duplicate`").
    async fn insert_new(&self, batch: TokenBatch) -> TokenizerResult<()>;

    /// Conditional update `{id, internalId, remainingTokenCount = observed}`
    /// → `remainingTokenCount = observed - claimed` (§4.3 step (b)). Returns
    /// whether the condition matched.
    async fn claim(
        &self,
        id: &[u8],
        internal_id: &tokenizer_types::InternalId,
        observed_remaining: u16,
        claimed: u16,
    ) -> TokenizerResult<bool>;

    /// Mark `index` resolved for `requester` (§4.4 step 7): conditional
    /// update keyed on the observed `resolvedList` bytes, setting the new
    /// global list and the requester's per-requester bitstring. Returns
    /// whether the condition matched (false means another resolver raced
    /// ahead and the caller should retry from a fresh read).
    async fn mark_resolved(
        &self,
        id: &[u8],
        observed_resolved_list: Bitstring256,
        new_resolved_list: Bitstring256,
        encoded_requester: String,
        new_requester_bitstring: Bitstring256,
    ) -> TokenizerResult<bool>;
}

/// An in-memory `TokenBatchStore` backed by `dashmap`.
#[derive(Default)]
pub struct InMemoryTokenBatchStore {
    batches: DashMap<Vec<u8>, TokenBatch>,
}

impl InMemoryTokenBatchStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenBatchStore for InMemoryTokenBatchStore {
    async fn get(&self, id: &[u8]) -> TokenizerResult<TokenBatch> {
        let batch = self
            .batches
            .get(id)
            .map(|b| b.value().clone())
            .ok_or(TokenizerError::NotFound("tokenBatch"))?;
        if tokenizer_types::is_expired(batch.expires) {
            return Err(TokenizerError::NotFound("tokenBatch"));
        }
        Ok(batch)
    }

    async fn insert_new(&self, batch: TokenBatch) -> TokenizerResult<()> {
        match self.batches.entry(batch.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TokenizerError::Duplicate("Duplicate token batch.".to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(batch);
                Ok(())
            }
        }
    }

    async fn claim(
        &self,
        id: &[u8],
        internal_id: &tokenizer_types::InternalId,
        observed_remaining: u16,
        claimed: u16,
    ) -> TokenizerResult<bool> {
        let Some(mut batch) = self.batches.get_mut(id) else {
            return Ok(false);
        };
        if batch.internal_id != *internal_id || batch.remaining_token_count != observed_remaining {
            return Ok(false);
        }
        batch.remaining_token_count = observed_remaining.saturating_sub(claimed);
        batch.updated = tokenizer_types::now();
        Ok(true)
    }

    async fn mark_resolved(
        &self,
        id: &[u8],
        observed_resolved_list: Bitstring256,
        new_resolved_list: Bitstring256,
        encoded_requester: String,
        new_requester_bitstring: Bitstring256,
    ) -> TokenizerResult<bool> {
        let Some(mut batch) = self.batches.get_mut(id) else {
            return Ok(false);
        };
        if batch.resolved_list != observed_resolved_list {
            return Ok(false);
        }
        batch.resolved_list = new_resolved_list;
        batch.resolution.insert(encoded_requester, new_requester_bitstring);
        batch.updated = tokenizer_types::now();
        Ok(true)
    }
}
