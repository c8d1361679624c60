//! Error taxonomy shared by every layer of the tokenization engine.
//!
//! Kinds mirror the spec's taxonomy: `NotFound`, `Duplicate`, `InvalidState`,
//! `NotAllowed`, `InvalidToken`, `InvalidArgument`. Internal-cause chains are
//! preserved via `#[source]` but are not part of the public message — callers
//! match on the outer variant, not the chain.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type TokenizerResult<T> = Result<T, TokenizerError>;

/// Reasons a `NotAllowed` error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotAllowedReason {
    /// The token has already been resolved by a different requester.
    AlreadyUsed,
    /// The owning unpinned batch has been invalidated since this token was issued.
    Invalidated,
    /// The entity was invalidated while a coupled registration/creation call
    /// was still in flight against it.
    BatchInvalidated,
    /// The caller's level of assurance is below the effective minimum.
    AssuranceTooLow,
    /// The requested query requires a configuration flag that isn't enabled.
    QueryDisabled(&'static str),
}

impl std::fmt::Display for NotAllowedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyUsed => write!(f, "alreadyUsed"),
            Self::Invalidated => write!(f, "invalidated"),
            Self::BatchInvalidated => write!(f, "batchInvalidated"),
            Self::AssuranceTooLow => write!(f, "assuranceTooLow"),
            Self::QueryDisabled(flag) => write!(f, "queryDisabled: {flag} is not enabled"),
        }
    }
}

/// Reasons token parsing/authentication failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidTokenReason {
    /// The envelope tag, shape, or length didn't match what was expected.
    Malformed,
    /// The batch version referenced by the token is unknown.
    UnknownBatchVersion,
    /// AES key-wrap unwrap failed its integrity check.
    IntegrityFailure,
    /// The unwrapped attributes didn't match the cleartext attributes.
    AttributeMismatch,
}

impl std::fmt::Display for InvalidTokenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed token"),
            Self::UnknownBatchVersion => write!(f, "unknown batch version"),
            Self::IntegrityFailure => write!(f, "integrity check failed"),
            Self::AttributeMismatch => write!(f, "attribute mismatch"),
        }
    }
}

/// The engine's top-level error type.
#[derive(Debug, Error)]
pub enum TokenizerError {
    /// No matching record (or the record has expired by wall-clock).
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// Unique-key conflict; usually retried internally, surfaced only when
    /// retries are exhausted.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// An optimistic-concurrency precondition failed; the caller can retry
    /// with fresh reads.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation is not allowed for the given reason.
    #[error("not allowed: {0}")]
    NotAllowed(NotAllowedReason),

    /// Token parse, size, integrity, or authenticated-attribute mismatch.
    #[error("invalid token: {0}")]
    InvalidToken(InvalidTokenReason),

    /// Shape/size/range violation at the API boundary.
    #[error("invalid argument: {field}: {reason}")]
    InvalidArgument {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// An infrastructure failure from a store or external collaborator.
    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TokenizerError {
    /// Build an `InvalidArgument` error.
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an arbitrary error as `Internal`.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(Box::new(err))
    }

    /// True for errors that a caller can retry after re-reading fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Duplicate(_) | Self::InvalidState(_))
    }
}
