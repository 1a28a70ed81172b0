//! Metric names and recording helpers.
//!
//! Counters only; callers install whatever exporter suits their deployment.

use metrics::{counter, describe_counter};

/// Register metric descriptions with the installed recorder. Call once at
/// startup, after the exporter is installed.
pub fn describe_metrics() {
    describe_counter!(
        "turnstile_reservations_total",
        "Successful unit reservations, labeled by strategy"
    );
    describe_counter!(
        "turnstile_confirmations_total",
        "Successful hold confirmations, labeled by strategy"
    );
    describe_counter!(
        "turnstile_balance_deductions_total",
        "Successful balance deductions, labeled by strategy"
    );
    describe_counter!(
        "turnstile_balance_credits_total",
        "Successful balance credits, labeled by strategy"
    );
    describe_counter!(
        "turnstile_conflicts_total",
        "Operations lost to a concurrent committer, labeled by operation"
    );
    describe_counter!(
        "turnstile_lock_timeouts_total",
        "Lock acquisitions abandoned at the wait deadline"
    );
    describe_counter!("turnstile_cache_hits_total", "View cache hits");
    describe_counter!("turnstile_cache_misses_total", "View cache misses");
    describe_counter!(
        "turnstile_tokens_issued_total",
        "Queue tokens issued, labeled by initial status"
    );
    describe_counter!(
        "turnstile_tokens_promoted_total",
        "Waiting tokens promoted to active"
    );
    describe_counter!(
        "turnstile_tokens_expired_total",
        "Live tokens moved to expired"
    );
    describe_counter!(
        "turnstile_holds_released_total",
        "Lapsed holds returned to the pool by the sweeper"
    );
}

pub(crate) fn record_reservation(strategy: &'static str) {
    counter!("turnstile_reservations_total", "strategy" => strategy).increment(1);
}

pub(crate) fn record_confirmation(strategy: &'static str) {
    counter!("turnstile_confirmations_total", "strategy" => strategy).increment(1);
}

pub(crate) fn record_deduction(strategy: &'static str) {
    counter!("turnstile_balance_deductions_total", "strategy" => strategy).increment(1);
}

pub(crate) fn record_credit(strategy: &'static str) {
    counter!("turnstile_balance_credits_total", "strategy" => strategy).increment(1);
}

pub(crate) fn record_conflict(operation: &'static str) {
    counter!("turnstile_conflicts_total", "operation" => operation).increment(1);
}

pub(crate) fn record_lock_timeout() {
    counter!("turnstile_lock_timeouts_total").increment(1);
}

pub(crate) fn record_cache_hit() {
    counter!("turnstile_cache_hits_total").increment(1);
}

pub(crate) fn record_cache_miss() {
    counter!("turnstile_cache_misses_total").increment(1);
}

pub(crate) fn record_token_issued(status: &'static str) {
    counter!("turnstile_tokens_issued_total", "status" => status).increment(1);
}

pub(crate) fn record_tokens_promoted(count: u64) {
    counter!("turnstile_tokens_promoted_total").increment(count);
}

pub(crate) fn record_token_expired() {
    counter!("turnstile_tokens_expired_total").increment(1);
}

pub(crate) fn record_hold_released() {
    counter!("turnstile_holds_released_total").increment(1);
}
