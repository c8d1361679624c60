//! Timestamp helpers.
//!
//! Every persisted record carries `created`/`updated` and (except
//! `BatchVersion` and `PairwiseToken`) `expires` timestamps. We use
//! `chrono::DateTime<Utc>` rather than `std::time::SystemTime` because the
//! store layer needs a serializable, totally-ordered type for `$max`
//! semantics on conditional updates.

use chrono::{DateTime, Duration, Utc};

/// A point in time, serialized as RFC 3339 by `serde`.
pub type Timestamp = DateTime<Utc>;

/// The grace window a store must keep expired records around before
/// expunging them, so in-flight reads don't race expungement (spec §3).
pub const EXPIRY_GRACE: Duration = Duration::hours(24);

/// Current time. Thin wrapper so call sites read like the rest of the API
/// rather than reaching for `chrono` directly.
pub fn now() -> Timestamp {
    Utc::now()
}

/// `a.max(b)`, matching the store's `$max` conditional-update semantics for
/// monotonically-advancing `expires` fields.
pub fn max(a: Timestamp, b: Timestamp) -> Timestamp {
    if a >= b { a } else { b }
}

/// Whether a record with the given `expires` should be treated as absent.
/// Readers must apply this even if the store hasn't yet expunged the row.
pub fn is_expired(expires: Timestamp) -> bool {
    expires <= now()
}
