//! Orchestrator metrics, emitted at the events SPEC_FULL names.

use tokenizer_metrics::metrics::{counter, histogram};
use tokenizer_metrics::names;

pub(crate) fn inc_batches_created() {
    counter!(names::BATCHES_CREATED_TOTAL).increment(1);
}

pub(crate) fn inc_tokens_created(count: u64) {
    counter!(names::TOKENS_CREATED_TOTAL).increment(count);
}

pub(crate) fn record_create_tokens_duration(seconds: f64) {
    histogram!(names::CREATE_TOKENS_DURATION_SECONDS).record(seconds);
}

pub(crate) fn inc_tokens_resolved(outcome: &'static str) {
    counter!(names::TOKENS_RESOLVED_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn inc_batches_invalidated() {
    counter!(names::BATCHES_INVALIDATED_TOTAL).increment(1);
}

pub(crate) fn inc_pairwise_lookups(outcome: &'static str) {
    counter!(names::PAIRWISE_LOOKUPS_TOTAL, "outcome" => outcome).increment(1);
}
