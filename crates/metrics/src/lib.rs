//! Metrics facade shared by every other crate in the workspace.
//!
//! This crate does not install a recorder — as a library rather than a
//! hosted service, it has no opinion on where metrics end up (Prometheus,
//! StatsD, a test-only in-memory snapshot). Call sites use the
//! [`metrics`] macros directly; whatever embeds the engine installs a
//! recorder with `metrics::set_global_recorder` before traffic starts, or
//! leaves metrics as a no-op.

/// Re-export of the core `metrics` facade so dependents only need this one
/// crate in scope.
pub use metrics;

pub mod names;
