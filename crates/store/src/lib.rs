//! Per-collection document-store traits and an in-memory reference
//! implementation (spec §6 "Persisted collections").
//!
//! Each collection gets its own narrow trait rather than one generic
//! key/value abstraction, because the conditional-update predicates in
//! spec §4.3–§4.8 are collection-specific (which fields gate a compare-and-
//! swap, which fields it sets) and forcing them through a single `Encode`/
//! `Decode`/`Key`/`Value` style interface would hide that shape rather than
//! express it.

#![warn(missing_docs)]

mod batch_version;
mod entity;
mod migrate;
mod model;
mod pairwise;
mod registration;
mod token_batch;

pub use batch_version::{BatchVersionStore, InMemoryBatchVersionStore};
pub use entity::{EntityStore, InMemoryEntityStore};
pub use migrate::migrate;
pub use model::{
    encode_requester, AssuranceFailure, BatchVersion, BatchVersionOptions, Entity, NextOptions,
    PairwiseToken, Registration, TokenBatch, UNPINNED,
};
pub use pairwise::{InMemoryPairwiseTokenStore, PairwiseTokenStore};
pub use registration::{InMemoryRegistrationStore, RegistrationStore};
pub use token_batch::{InMemoryTokenBatchStore, TokenBatchStore};
