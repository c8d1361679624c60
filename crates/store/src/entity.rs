//! Storage for `entity` records (spec §3 "Entity", §4.3/§4.5/§4.6).

use async_trait::async_trait;
use auto_impl::auto_impl;
use dashmap::DashMap;
use tokenizer_types::{InternalId, Timestamp, TokenizerError, TokenizerResult};

use crate::model::{AssuranceFailure, Entity};

/// Storage for entity records, including the conditional updates §4.3–§4.6
/// depend on for compare-and-swap semantics without transactions.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait EntityStore: Send + Sync {
    /// Fetch an entity. `NotFound` if absent or expired.
    async fn get(&self, internal_id: &InternalId) -> TokenizerResult<Entity>;

    /// Insert if absent, else advance `expires` via `$max` semantics.
    /// Returns the resulting record.
    async fn upsert_advance_expires(
        &self,
        internal_id: &InternalId,
        new_expires: Timestamp,
    ) -> TokenizerResult<Entity>;

    /// Advance `expires` via `$max` semantics on an existing entity,
    /// conditional on `batchInvalidationCount == expected` when `expected`
    /// is `Some` — the same condition `set_open_batch` is gated on, so a
    /// caller can pass both calls the same snapshot and have them succeed
    /// or fail together (§4.3 step (a)(3)). Returns whether the condition
    /// matched; `false` if the entity doesn't exist.
    async fn advance_expires_if_matches(
        &self,
        internal_id: &InternalId,
        new_expires: Timestamp,
        expected_batch_invalidation_count: Option<u64>,
    ) -> TokenizerResult<bool>;

    /// Set `openBatch[pin_level] = batch_id`, conditional on
    /// `batchInvalidationCount == expected` when `expected` is `Some`
    /// (required for unpinned pin levels, per §4.3 step (a)(3)). Returns
    /// whether the condition matched.
    async fn set_open_batch(
        &self,
        internal_id: &InternalId,
        pin_level: i32,
        batch_id: Vec<u8>,
        expected_batch_invalidation_count: Option<u64>,
    ) -> TokenizerResult<bool>;

    /// Clear `openBatch[pin_level]` conditional on it still equalling
    /// `expected_batch_id`, and on `batchInvalidationCount == expected`
    /// when given. Returns whether the clear applied.
    async fn clear_open_batch_if_matches(
        &self,
        internal_id: &InternalId,
        pin_level: i32,
        expected_batch_id: &[u8],
        expected_batch_invalidation_count: Option<u64>,
    ) -> TokenizerResult<bool>;

    /// `invalidateUnpinnedBatches` (§4.5): conditional increment of
    /// `batchInvalidationCount`, matching `{batchInvalidationCount =
    /// observed, minAssuranceForResolution = observed_assurance}`, with an
    /// optional simultaneous assurance-level change. Returns whether it
    /// applied.
    async fn increment_batch_invalidation_count(
        &self,
        internal_id: &InternalId,
        observed_batch_invalidation_count: u64,
        observed_min_assurance: i32,
        new_min_assurance: Option<i32>,
    ) -> TokenizerResult<bool>;

    /// `setMinAssuranceForResolution` / `updateEntityWithNoValidTokenBatches`
    /// (§4.6): conditional update matching `batchInvalidationCount ==
    /// observed`. Returns whether it applied.
    async fn set_min_assurance_for_resolution(
        &self,
        internal_id: &InternalId,
        observed_batch_invalidation_count: u64,
        new_level: i32,
    ) -> TokenizerResult<bool>;

    /// Record an assurance-check failure (§4.4 step 8). Best-effort; never
    /// surfaces as a user-visible failure on its own.
    async fn record_assurance_failure(
        &self,
        internal_id: &InternalId,
        failure: AssuranceFailure,
    ) -> TokenizerResult<()>;
}

/// An in-memory `EntityStore` backed by `dashmap`, giving per-key atomicity
/// for every conditional update.
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: DashMap<InternalId, Entity>,
}

impl InMemoryEntityStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, internal_id: &InternalId) -> TokenizerResult<Entity> {
        let entity = self
            .entities
            .get(internal_id)
            .map(|e| e.value().clone())
            .ok_or(TokenizerError::NotFound("entity"))?;
        if tokenizer_types::is_expired(entity.expires) {
            return Err(TokenizerError::NotFound("entity"));
        }
        Ok(entity)
    }

    async fn upsert_advance_expires(
        &self,
        internal_id: &InternalId,
        new_expires: Timestamp,
    ) -> TokenizerResult<Entity> {
        let mut entry = self
            .entities
            .entry(*internal_id)
            .or_insert_with(|| Entity::new(*internal_id, new_expires));
        entry.expires = tokenizer_types::max(entry.expires, new_expires);
        entry.updated = tokenizer_types::now();
        Ok(entry.value().clone())
    }

    async fn advance_expires_if_matches(
        &self,
        internal_id: &InternalId,
        new_expires: Timestamp,
        expected_batch_invalidation_count: Option<u64>,
    ) -> TokenizerResult<bool> {
        let Some(mut entity) = self.entities.get_mut(internal_id) else {
            return Ok(false);
        };
        if let Some(expected) = expected_batch_invalidation_count
            && entity.batch_invalidation_count != expected
        {
            return Ok(false);
        }
        entity.expires = tokenizer_types::max(entity.expires, new_expires);
        entity.updated = tokenizer_types::now();
        Ok(true)
    }

    async fn set_open_batch(
        &self,
        internal_id: &InternalId,
        pin_level: i32,
        batch_id: Vec<u8>,
        expected_batch_invalidation_count: Option<u64>,
    ) -> TokenizerResult<bool> {
        let Some(mut entity) = self.entities.get_mut(internal_id) else {
            return Ok(false);
        };
        if let Some(expected) = expected_batch_invalidation_count
            && entity.batch_invalidation_count != expected
        {
            return Ok(false);
        }
        entity.open_batch.insert(pin_level, batch_id);
        entity.updated = tokenizer_types::now();
        Ok(true)
    }

    async fn clear_open_batch_if_matches(
        &self,
        internal_id: &InternalId,
        pin_level: i32,
        expected_batch_id: &[u8],
        expected_batch_invalidation_count: Option<u64>,
    ) -> TokenizerResult<bool> {
        let Some(mut entity) = self.entities.get_mut(internal_id) else {
            return Ok(false);
        };
        if let Some(expected) = expected_batch_invalidation_count
            && entity.batch_invalidation_count != expected
        {
            return Ok(false);
        }
        match entity.open_batch.get(&pin_level) {
            Some(current) if current.as_slice() == expected_batch_id => {
                entity.open_batch.remove(&pin_level);
                entity.updated = tokenizer_types::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_batch_invalidation_count(
        &self,
        internal_id: &InternalId,
        observed_batch_invalidation_count: u64,
        observed_min_assurance: i32,
        new_min_assurance: Option<i32>,
    ) -> TokenizerResult<bool> {
        let Some(mut entity) = self.entities.get_mut(internal_id) else {
            return Ok(false);
        };
        if entity.batch_invalidation_count != observed_batch_invalidation_count
            || entity.min_assurance_for_resolution != observed_min_assurance
        {
            return Ok(false);
        }
        entity.batch_invalidation_count += 1;
        entity.last_batch_invalidation_date = Some(tokenizer_types::now());
        if let Some(level) = new_min_assurance {
            entity.min_assurance_for_resolution = level;
        }
        entity.updated = tokenizer_types::now();
        Ok(true)
    }

    async fn set_min_assurance_for_resolution(
        &self,
        internal_id: &InternalId,
        observed_batch_invalidation_count: u64,
        new_level: i32,
    ) -> TokenizerResult<bool> {
        let Some(mut entity) = self.entities.get_mut(internal_id) else {
            return Ok(false);
        };
        if entity.batch_invalidation_count != observed_batch_invalidation_count {
            return Ok(false);
        }
        entity.min_assurance_for_resolution = new_level;
        entity.updated = tokenizer_types::now();
        Ok(true)
    }

    async fn record_assurance_failure(
        &self,
        internal_id: &InternalId,
        failure: AssuranceFailure,
    ) -> TokenizerResult<()> {
        if let Some(mut entity) = self.entities.get_mut(internal_id) {
            entity.last_assurance_failed_token_resolution = Some(failure);
            entity.updated = tokenizer_types::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_advances_expires_forward_only() {
        let store = InMemoryEntityStore::new();
        let id = InternalId::random();
        let t1 = tokenizer_types::now();
        let t0 = t1 - chrono::Duration::seconds(10);

        let entity = store.upsert_advance_expires(&id, t1).await.unwrap();
        assert_eq!(entity.expires, t1);

        // A smaller expires must not move it backward.
        let entity = store.upsert_advance_expires(&id, t0).await.unwrap();
        assert_eq!(entity.expires, t1);
    }

    #[tokio::test]
    async fn open_batch_set_and_clear_respect_invalidation_count() {
        let store = InMemoryEntityStore::new();
        let id = InternalId::random();
        store.upsert_advance_expires(&id, tokenizer_types::now()).await.unwrap();

        let applied = store
            .set_open_batch(&id, -1, vec![1, 2, 3], Some(0))
            .await
            .unwrap();
        assert!(applied);

        // Stale expectation fails.
        let applied = store
            .clear_open_batch_if_matches(&id, -1, &[1, 2, 3], Some(1))
            .await
            .unwrap();
        assert!(!applied);

        let applied = store
            .clear_open_batch_if_matches(&id, -1, &[1, 2, 3], Some(0))
            .await
            .unwrap();
        assert!(applied);
    }

    #[tokio::test]
    async fn advance_expires_if_matches_rejects_stale_invalidation_count() {
        let store = InMemoryEntityStore::new();
        let id = InternalId::random();
        let t1 = tokenizer_types::now();
        store.upsert_advance_expires(&id, t1).await.unwrap();

        let t2 = t1 + chrono::Duration::seconds(10);
        let applied = store.advance_expires_if_matches(&id, t2, Some(1)).await.unwrap();
        assert!(!applied);
        assert_eq!(store.get(&id).await.unwrap().expires, t1);

        let applied = store.advance_expires_if_matches(&id, t2, Some(0)).await.unwrap();
        assert!(applied);
        assert_eq!(store.get(&id).await.unwrap().expires, t2);
    }

    #[tokio::test]
    async fn invalidation_is_conditional_on_observed_state() {
        let store = InMemoryEntityStore::new();
        let id = InternalId::random();
        store.upsert_advance_expires(&id, tokenizer_types::now()).await.unwrap();

        let applied = store
            .increment_batch_invalidation_count(&id, 0, 2, None)
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(store.get(&id).await.unwrap().batch_invalidation_count, 1);

        // Stale observed count is rejected.
        let applied = store
            .increment_batch_invalidation_count(&id, 0, 2, None)
            .await
            .unwrap();
        assert!(!applied);
    }
}
