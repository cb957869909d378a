//! Journal statistics.
//!
//! All counters are atomic and can be read while handles are active.
//!
//! ```rust,ignore
//! let snapshot = journal.stats().snapshot();
//! println!("committed: {}", snapshot.transactions_committed);
//! println!("admission waits: {}", snapshot.admission_waits);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Journal statistics and metrics.
#[derive(Debug, Default)]
pub struct JournalStats {
    // Handle counters
    handles_started: AtomicU64,
    handles_stopped: AtomicU64,

    // Transaction counters
    transactions_created: AtomicU64,
    transactions_committed: AtomicU64,
    commit_requests: AtomicU64,

    // Copy-on-write
    frozen_copies: AtomicU64,
    alloc_retries: AtomicU64,

    // Blocking waits
    admission_waits: AtomicU64,
    space_waits: AtomicU64,
    shadow_waits: AtomicU64,
    barriers_raised: AtomicU64,

    // Log space
    log_blocks_used: AtomicU64,
}

impl JournalStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_handle_start(&self) {
        self.handles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handle_stop(&self) {
        self.handles_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_created(&self) {
        self.transactions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_committed(&self, log_blocks: u64) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        self.log_blocks_used.fetch_add(log_blocks, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_request(&self) {
        self.commit_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frozen_copy(&self) {
        self.frozen_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_alloc_retry(&self) {
        self.alloc_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_admission_wait(&self) {
        self.admission_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_space_wait(&self) {
        self.space_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shadow_wait(&self) {
        self.shadow_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_barrier(&self) {
        self.barriers_raised.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of handles started (nested starts excluded).
    pub fn handles_started(&self) -> u64 {
        self.handles_started.load(Ordering::Relaxed)
    }

    /// Returns the number of handles fully stopped.
    pub fn handles_stopped(&self) -> u64 {
        self.handles_stopped.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions created.
    pub fn transactions_created(&self) -> u64 {
        self.transactions_created.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions whose commit completed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of frozen copies taken.
    pub fn frozen_copies(&self) -> u64 {
        self.frozen_copies.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            handles_started: self.handles_started.load(Ordering::Relaxed),
            handles_stopped: self.handles_stopped.load(Ordering::Relaxed),
            transactions_created: self.transactions_created.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            commit_requests: self.commit_requests.load(Ordering::Relaxed),
            frozen_copies: self.frozen_copies.load(Ordering::Relaxed),
            alloc_retries: self.alloc_retries.load(Ordering::Relaxed),
            admission_waits: self.admission_waits.load(Ordering::Relaxed),
            space_waits: self.space_waits.load(Ordering::Relaxed),
            shadow_waits: self.shadow_waits.load(Ordering::Relaxed),
            barriers_raised: self.barriers_raised.load(Ordering::Relaxed),
            log_blocks_used: self.log_blocks_used.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of journal statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Handles started.
    pub handles_started: u64,
    /// Handles fully stopped.
    pub handles_stopped: u64,
    /// Transactions created.
    pub transactions_created: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Distinct commit requests recorded.
    pub commit_requests: u64,
    /// Frozen copies taken for committing transactions.
    pub frozen_copies: u64,
    /// Failed copy allocations that were retried.
    pub alloc_retries: u64,
    /// Times admission blocked on a barrier, a locked transaction or the
    /// credit ceiling.
    pub admission_waits: u64,
    /// Times admission blocked on log space.
    pub space_waits: u64,
    /// Times write access blocked on log I/O.
    pub shadow_waits: u64,
    /// Barriers raised.
    pub barriers_raised: u64,
    /// Log blocks charged by completed commits.
    pub log_blocks_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = JournalStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_and_snapshot() {
        let stats = JournalStats::new();
        stats.record_handle_start();
        stats.record_handle_start();
        stats.record_handle_stop();
        stats.record_transaction_created();
        stats.record_transaction_committed(5);
        stats.record_frozen_copy();
        stats.record_shadow_wait();

        let snap = stats.snapshot();
        assert_eq!(snap.handles_started, 2);
        assert_eq!(snap.handles_stopped, 1);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.log_blocks_used, 5);
        assert_eq!(snap.frozen_copies, 1);
        assert_eq!(snap.shadow_waits, 1);
        assert_eq!(stats.handles_started(), 2);
    }
}
