#![forbid(unsafe_code)]

//! Process-wide monotonic counters.

use std::sync::atomic::{AtomicU64, Ordering};

static RERUNS_SENT_TOTAL: AtomicU64 = AtomicU64::new(0);
static RERUNS_COALESCED_TOTAL: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DROPPED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Rerun requests handed to the transport.
#[must_use]
pub fn reruns_sent_total() -> u64 {
    RERUNS_SENT_TOTAL.load(Ordering::Relaxed)
}

/// Rerun requests replaced by a newer one before being sent.
#[must_use]
pub fn reruns_coalesced_total() -> u64 {
    RERUNS_COALESCED_TOTAL.load(Ordering::Relaxed)
}

/// Inbound messages discarded for arriving out of order.
#[must_use]
pub fn messages_dropped_total() -> u64 {
    MESSAGES_DROPPED_TOTAL.load(Ordering::Relaxed)
}

pub(crate) fn record_rerun_sent() {
    RERUNS_SENT_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_rerun_coalesced() {
    RERUNS_COALESCED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_message_dropped() {
    MESSAGES_DROPPED_TOTAL.fetch_add(1, Ordering::Relaxed);
}
