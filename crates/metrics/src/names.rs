//! Metric name constants, collected in one place so emitters and any future
//! dashboard stay in sync without grepping call sites.

/// Counter: token batches manufactured.
pub const BATCHES_CREATED_TOTAL: &str = "tokenizer.batches_created_total";
/// Counter: individual tokens manufactured.
pub const TOKENS_CREATED_TOTAL: &str = "tokenizer.tokens_created_total";
/// Counter: token resolution attempts, labeled `outcome`.
pub const TOKENS_RESOLVED_TOTAL: &str = "tokenizer.tokens_resolved_total";
/// Counter: unpinned batches invalidated.
pub const BATCHES_INVALIDATED_TOTAL: &str = "tokenizer.batches_invalidated_total";
/// Counter: pairwise token lookups, labeled `outcome`.
pub const PAIRWISE_LOOKUPS_TOTAL: &str = "tokenizer.pairwise_lookups_total";
/// Histogram: wall-clock time of a `create_tokens` call, in seconds.
pub const CREATE_TOKENS_DURATION_SECONDS: &str = "tokenizer.create_tokens_duration_seconds";
