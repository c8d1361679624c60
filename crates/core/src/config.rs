//! Runtime configuration (spec §6 "Configuration options").

use serde::{Deserialize, Serialize};
use tokenizer_store::BatchVersionOptions;

/// Options applied to a batch version auto-created by
/// [`crate::batch_version::BatchVersionRegistry::ensure_for_tokenizer`] when
/// none exists yet for a tokenizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultVersionOptions {
    /// Bytes in a batch id. Must be ≥ 8.
    pub batch_id_size: u32,
    /// Bytes of per-token KEK salt. Must be ≥ 8.
    pub batch_salt_size: u32,
    /// Max tokens per batch. 1..=256.
    pub batch_token_count: u16,
    /// Batch lifetime in milliseconds.
    pub ttl_ms: i64,
}

impl From<DefaultVersionOptions> for BatchVersionOptions {
    fn from(opts: DefaultVersionOptions) -> Self {
        Self {
            batch_id_size: opts.batch_id_size,
            batch_salt_size: opts.batch_salt_size,
            batch_token_count: opts.batch_token_count,
            ttl_ms: opts.ttl_ms,
        }
    }
}

impl Default for DefaultVersionOptions {
    fn default() -> Self {
        Self {
            batch_id_size: 16,
            batch_salt_size: 16,
            batch_token_count: 100,
            ttl_ms: 3_600_000,
        }
    }
}

/// The engine's runtime configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Max parallel token-codec invocations per `createTokens` call.
    pub token_creation_concurrency: usize,
    /// Options for an auto-created batch version.
    pub default_version_options: DefaultVersionOptions,
    /// Enables reverse pairwise-token lookups by `value`.
    pub ensure_pairwise_token_value_index: bool,
    /// Enables store-side TTL indices. The in-memory reference store has
    /// none to enable; a persistent backend would read this at `migrate`
    /// time.
    pub auto_remove_expired_records: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            token_creation_concurrency: tokenizer_tasks::DEFAULT_CONCURRENCY,
            default_version_options: DefaultVersionOptions::default(),
            ensure_pairwise_token_value_index: false,
            auto_remove_expired_records: true,
        }
    }
}
