//! Module-level DB-ready event (spec §9 design note).
//!
//! A persistent backend would create indices here on startup; the in-memory
//! reference store has none to create.

use tokenizer_types::TokenizerResult;

use crate::{
    BatchVersionStore, EntityStore, PairwiseTokenStore, RegistrationStore, TokenBatchStore,
};

/// Run once at startup, before any store operation is issued.
pub async fn migrate(
    _batch_versions: &dyn BatchVersionStore,
    _entities: &dyn EntityStore,
    _token_batches: &dyn TokenBatchStore,
    _registrations: &dyn RegistrationStore,
    _pairwise_tokens: &dyn PairwiseTokenStore,
) -> TokenizerResult<()> {
    tracing::info!("store migration complete (no-op for the in-memory backend)");
    Ok(())
}
