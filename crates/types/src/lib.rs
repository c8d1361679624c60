//! Shared identifiers, bitstrings, timestamps, and the error taxonomy used
//! throughout the tokenization engine.

#![warn(missing_docs)]

mod bitstring;
mod error;
mod ids;
mod time;

pub use bitstring::{BITSTRING_BITS, Bitstring256};
pub use error::{InvalidTokenReason, NotAllowedReason, TokenizerError, TokenizerResult};
pub use ids::{BatchVersionId, InternalId, MultihashSha256, TokenizerId};
pub use time::{EXPIRY_GRACE, is_expired, max, now, Timestamp};
