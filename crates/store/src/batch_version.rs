//! Raw storage for `batchVersion` and the `NextOptions` singleton.
//!
//! The LRU front-cache described in spec §4.2 lives above this trait, in
//! `tokenizer_core::batch_version::BatchVersionRegistry` — this crate only
//! models the authoritative store.

use async_trait::async_trait;
use auto_impl::auto_impl;
use dashmap::DashMap;
use tokenizer_types::{TokenizerError, TokenizerResult};

use crate::model::{BatchVersion, BatchVersionOptions, NextOptions};

/// Storage for batch-version records and the singleton `NextOptions`.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait BatchVersionStore: Send + Sync {
    /// Highest `id` across every tokenizer, if any records exist.
    async fn highest_id(&self) -> TokenizerResult<Option<u64>>;

    /// Highest `id` for the given tokenizer, if it has any version.
    async fn highest_id_for_tokenizer(&self, tokenizer_id: &str) -> TokenizerResult<Option<u64>>;

    /// Insert a newly allocated version. `Duplicate` on id conflict.
    async fn insert_new(&self, version: BatchVersion) -> TokenizerResult<()>;

    /// Fetch by id. `NotFound` if absent.
    async fn get_by_id(&self, id: u64) -> TokenizerResult<BatchVersion>;

    /// Fetch the highest-id version for a tokenizer. `NotFound` if it has
    /// none.
    async fn get_highest_for_tokenizer(&self, tokenizer_id: &str) -> TokenizerResult<BatchVersion>;

    /// The pending options for the next auto-created version, if set.
    async fn get_next_options(&self) -> TokenizerResult<Option<BatchVersionOptions>>;

    /// Replace the singleton. Returns whether a record previously existed.
    async fn set_next_options(&self, options: BatchVersionOptions) -> TokenizerResult<bool>;
}

/// An in-memory `BatchVersionStore` backed by `dashmap`.
#[derive(Default)]
pub struct InMemoryBatchVersionStore {
    by_id: DashMap<u64, BatchVersion>,
    next_options: DashMap<(), NextOptions>,
}

impl InMemoryBatchVersionStore {
    /// An empty store with no versions and no `NextOptions` set.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchVersionStore for InMemoryBatchVersionStore {
    async fn highest_id(&self) -> TokenizerResult<Option<u64>> {
        Ok(self.by_id.iter().map(|entry| *entry.key()).max())
    }

    async fn highest_id_for_tokenizer(&self, tokenizer_id: &str) -> TokenizerResult<Option<u64>> {
        Ok(self
            .by_id
            .iter()
            .filter(|entry| entry.value().tokenizer_id == tokenizer_id)
            .map(|entry| entry.value().id)
            .max())
    }

    async fn insert_new(&self, version: BatchVersion) -> TokenizerResult<()> {
        match self.by_id.entry(version.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TokenizerError::Duplicate("batch version id".to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(version);
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: u64) -> TokenizerResult<BatchVersion> {
        self.by_id
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TokenizerError::NotFound("batchVersion"))
    }

    async fn get_highest_for_tokenizer(&self, tokenizer_id: &str) -> TokenizerResult<BatchVersion> {
        self.by_id
            .iter()
            .filter(|entry| entry.value().tokenizer_id == tokenizer_id)
            .max_by_key(|entry| entry.value().id)
            .map(|entry| entry.value().clone())
            .ok_or(TokenizerError::NotFound("batchVersion"))
    }

    async fn get_next_options(&self) -> TokenizerResult<Option<BatchVersionOptions>> {
        Ok(self.next_options.get(&()).map(|v| v.options))
    }

    async fn set_next_options(&self, options: BatchVersionOptions) -> TokenizerResult<bool> {
        let existed = self.next_options.contains_key(&());
        self.next_options.insert((), NextOptions { options });
        Ok(existed)
    }
}
