//! Process-wide counters for discovery, health checking, dispatch and ingestion.
//! Counters are plain relaxed atomics; `snapshot()` feeds `syrupnet status` and
//! the coordinator's periodic debug line.
use std::sync::atomic::{AtomicU64, Ordering};

static PROBES_SENT: AtomicU64 = AtomicU64::new(0);
static PROBES_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static DUPLICATE_IDENTITIES: AtomicU64 = AtomicU64::new(0);
static IDENTITY_MISMATCHES: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static RECONNECT_SUCCESSES: AtomicU64 = AtomicU64::new(0);
static DISPATCH_SENT: AtomicU64 = AtomicU64::new(0);
static DISPATCH_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static DISPATCH_FAILED: AtomicU64 = AtomicU64::new(0);
static FILES_INGESTED: AtomicU64 = AtomicU64::new(0);
static LINES_DROPPED: AtomicU64 = AtomicU64::new(0);

pub fn inc_probes_sent() {
    PROBES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_probes_accepted() {
    PROBES_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicate_identities() {
    DUPLICATE_IDENTITIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_identity_mismatches() {
    IDENTITY_MISMATCHES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_successes() {
    RECONNECT_SUCCESSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dispatch_sent() {
    DISPATCH_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dispatch_succeeded() {
    DISPATCH_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dispatch_failed() {
    DISPATCH_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_files_ingested() {
    FILES_INGESTED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_lines_dropped(n: u64) {
    LINES_DROPPED.fetch_add(n, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub probes_sent: u64,
    pub probes_accepted: u64,
    pub duplicate_identities: u64,
    pub identity_mismatches: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub dispatch_sent: u64,
    pub dispatch_succeeded: u64,
    pub dispatch_failed: u64,
    pub files_ingested: u64,
    pub lines_dropped: u64,
}

impl Snapshot {
    /// Share of sent dispatches that were accepted, in percent.
    pub fn dispatch_success_rate(&self) -> Option<f64> {
        if self.dispatch_sent == 0 {
            None
        } else {
            Some(self.dispatch_succeeded as f64 * 100.0 / self.dispatch_sent as f64)
        }
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        probes_sent: PROBES_SENT.load(Ordering::Relaxed),
        probes_accepted: PROBES_ACCEPTED.load(Ordering::Relaxed),
        duplicate_identities: DUPLICATE_IDENTITIES.load(Ordering::Relaxed),
        identity_mismatches: IDENTITY_MISMATCHES.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        reconnect_successes: RECONNECT_SUCCESSES.load(Ordering::Relaxed),
        dispatch_sent: DISPATCH_SENT.load(Ordering::Relaxed),
        dispatch_succeeded: DISPATCH_SUCCEEDED.load(Ordering::Relaxed),
        dispatch_failed: DISPATCH_FAILED.load(Ordering::Relaxed),
        files_ingested: FILES_INGESTED.load(Ordering::Relaxed),
        lines_dropped: LINES_DROPPED.load(Ordering::Relaxed),
    }
}
