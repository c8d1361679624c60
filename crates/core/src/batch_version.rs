//! The batch-version registry (spec §4.2): an LRU-cached front for
//! `tokenizer_store::BatchVersionStore`, plus the creation-race protocol for
//! `ensureForTokenizer`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use tokenizer_codec::{BatchVersionParams, BatchVersionResolver};
use tokenizer_kms::{HmacSigner, TokenizerProvider};
use tokenizer_store::{BatchVersion, BatchVersionOptions, BatchVersionStore};
use tokenizer_types::{Timestamp, TokenizerError, TokenizerId, TokenizerResult};

use hashlink::LruCache;

/// Advisory cache capacity (spec §4.2: "capacity ≈100").
const CACHE_CAPACITY: usize = 100;
/// Advisory cache TTL (spec §4.2: "24-hour TTL").
const CACHE_TTL: Duration = Duration::hours(24);

#[derive(Clone)]
struct CacheEntry {
    version: BatchVersion,
    inserted_at: Timestamp,
}

enum CacheKey {
    ById(u64),
    ByTokenizer(TokenizerId),
}

impl CacheKey {
    fn as_string(&self) -> String {
        match self {
            Self::ById(id) => format!("id:{id}"),
            Self::ByTokenizer(tokenizer_id) => format!("tokenizerId:{tokenizer_id}"),
        }
    }
}

/// An LRU front-cache over the authoritative [`BatchVersionStore`].
///
/// All correctness decisions re-read the store; the cache is purely an
/// advisory fast path (spec §5: "the cache is an advisory fast path; all
/// correctness decisions re-read authoritative data").
pub struct BatchVersionRegistry {
    store: Arc<dyn BatchVersionStore>,
    provider: Arc<dyn TokenizerProvider>,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl BatchVersionRegistry {
    /// Build a registry over `store`, resolving the active tokenizer via
    /// `provider`.
    pub fn new(store: Arc<dyn BatchVersionStore>, provider: Arc<dyn TokenizerProvider>) -> Self {
        Self {
            store,
            provider,
            cache: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        }
    }

    fn cache_get(&self, key: &CacheKey) -> Option<BatchVersion> {
        let mut cache = self.cache.lock();
        let k = key.as_string();
        match cache.get(&k) {
            Some(entry) if tokenizer_types::now() - entry.inserted_at < CACHE_TTL => {
                Some(entry.version.clone())
            }
            Some(_) => {
                cache.remove(&k);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, version: &BatchVersion) {
        let entry = CacheEntry {
            version: version.clone(),
            inserted_at: tokenizer_types::now(),
        };
        let mut cache = self.cache.lock();
        cache.insert(CacheKey::ById(version.id).as_string(), entry.clone());
        cache.insert(
            CacheKey::ByTokenizer(version.tokenizer_id.clone()).as_string(),
            entry.clone(),
        );
        cache.insert(
            format!("{}:{}", version.id, version.tokenizer_id),
            entry,
        );
    }

    /// Fetch by id, authoritative store on cache miss.
    pub async fn get_by_id(&self, id: u64) -> TokenizerResult<BatchVersion> {
        if let Some(v) = self.cache_get(&CacheKey::ById(id)) {
            return Ok(v);
        }
        let version = self.store.get_by_id(id).await?;
        self.cache_put(&version);
        Ok(version)
    }

    /// Fetch the highest-id version for a tokenizer, authoritative store on
    /// cache miss.
    pub async fn get_for_tokenizer(&self, tokenizer_id: &str) -> TokenizerResult<BatchVersion> {
        if let Some(v) = self.cache_get(&CacheKey::ByTokenizer(tokenizer_id.to_string())) {
            return Ok(v);
        }
        let version = self.store.get_highest_for_tokenizer(tokenizer_id).await?;
        self.cache_put(&version);
        Ok(version)
    }

    /// Returns the current batch version for `tokenizer_id`, creating one
    /// from the pending `NextOptions` singleton if none exists yet (spec
    /// §4.2 creation protocol).
    pub async fn ensure_for_tokenizer(&self, tokenizer_id: &str) -> TokenizerResult<BatchVersion> {
        if let Ok(existing) = self.get_for_tokenizer(tokenizer_id).await {
            return Ok(existing);
        }

        for _ in 0..ENSURE_MAX_ATTEMPTS {
            let (highest, highest_for_tokenizer) = tokio::try_join!(
                self.store.highest_id(),
                self.store.highest_id_for_tokenizer(tokenizer_id),
            )?;

            if highest_for_tokenizer.is_some() {
                // Another writer created one concurrently; read it back.
                return self.get_for_tokenizer(tokenizer_id).await;
            }

            let next_id = highest.map(|id| id + 1).unwrap_or(0);
            let options = self
                .store
                .get_next_options()
                .await?
                .ok_or(TokenizerError::NotFound("batchVersionOptions"))?;

            let version = BatchVersion {
                id: next_id,
                tokenizer_id: tokenizer_id.to_string(),
                options,
            };

            match self.store.insert_new(version.clone()).await {
                Ok(()) => {
                    self.cache_put(&version);
                    return Ok(version);
                }
                Err(TokenizerError::Duplicate(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        Err(TokenizerError::InvalidState(
            "could not allocate a batch version after retrying".to_string(),
        ))
    }

    /// Replace the pending `NextOptions` singleton.
    pub async fn set_options(&self, options: BatchVersionOptions) -> TokenizerResult<bool> {
        self.store.set_next_options(options).await
    }

    /// The pending `NextOptions` singleton, if set.
    pub async fn get_options(&self) -> TokenizerResult<Option<BatchVersionOptions>> {
        self.store.get_next_options().await
    }
}

const ENSURE_MAX_ATTEMPTS: u32 = 5;

#[async_trait]
impl BatchVersionResolver for BatchVersionRegistry {
    async fn resolve(
        &self,
        batch_version: u64,
    ) -> TokenizerResult<(BatchVersionParams, Arc<dyn HmacSigner>)> {
        let version = self.get_by_id(batch_version).await?;
        let signer = self.provider.current().await?;
        if signer.tokenizer_id() != &version.tokenizer_id {
            return Err(TokenizerError::NotFound("batchVersion"));
        }
        Ok((
            BatchVersionParams {
                batch_id_size: version.options.batch_id_size as usize,
                batch_salt_size: version.options.batch_salt_size as usize,
            },
            signer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizer_kms::{InMemoryHmacSigner, StaticTokenizerProvider};
    use tokenizer_store::InMemoryBatchVersionStore;

    fn registry() -> (BatchVersionRegistry, Arc<InMemoryBatchVersionStore>) {
        let store = Arc::new(InMemoryBatchVersionStore::new());
        let signer = Arc::new(InMemoryHmacSigner::new("tok-1", b"0123456789abcdef".to_vec()));
        let provider = Arc::new(StaticTokenizerProvider::new(signer));
        let registry = BatchVersionRegistry::new(store.clone(), provider);
        (registry, store)
    }

    fn opts() -> BatchVersionOptions {
        BatchVersionOptions {
            batch_id_size: 16,
            batch_salt_size: 16,
            batch_token_count: 100,
            ttl_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn ensure_creates_first_version_from_next_options() {
        let (registry, _store) = registry();
        registry.set_options(opts()).await.unwrap();

        let version = registry.ensure_for_tokenizer("tok-1").await.unwrap();
        assert_eq!(version.id, 0);
        assert_eq!(version.tokenizer_id, "tok-1");

        // Calling again returns the same version rather than allocating a new one.
        let again = registry.ensure_for_tokenizer("tok-1").await.unwrap();
        assert_eq!(again.id, 0);
    }

    #[tokio::test]
    async fn ensure_allocates_the_next_free_id_for_a_new_tokenizer() {
        let (registry, store) = registry();
        registry.set_options(opts()).await.unwrap();
        store
            .insert_new(BatchVersion {
                id: 0,
                tokenizer_id: "tok-other".to_string(),
                options: opts(),
            })
            .await
            .unwrap();

        let version = registry.ensure_for_tokenizer("tok-1").await.unwrap();
        assert_eq!(version.id, 1);
    }

    #[tokio::test]
    async fn resolver_rejects_a_version_from_a_different_tokenizer() {
        let (registry, store) = registry();
        store
            .insert_new(BatchVersion {
                id: 0,
                tokenizer_id: "someone-else".to_string(),
                options: opts(),
            })
            .await
            .unwrap();

        let err = BatchVersionResolver::resolve(&registry, 0).await.unwrap_err();
        assert!(matches!(err, TokenizerError::NotFound(_)));
    }
}
