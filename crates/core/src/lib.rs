//! The batch-version registry and the resolution/lifecycle orchestrator:
//! the engine's core logic, wired against the store, codec, kms, and crypto
//! collaborators defined in the other crates.

#![warn(missing_docs)]

mod batch_version;
mod config;
mod metrics;
mod orchestrator;

pub use batch_version::BatchVersionRegistry;
pub use config::{DefaultVersionOptions, TokenizerConfig};
pub use orchestrator::{
    Orchestrator, PairwiseResolution, RegisterAndCreateResult, RegisterDocumentOptions,
    RegistrationExpectation,
};
