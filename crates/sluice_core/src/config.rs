//! Journal configuration.

use crate::error::{JournalError, JournalResult};
use std::time::Duration;

/// Configuration for opening a journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Maximum credits (roughly, distinct blocks) one transaction may hold.
    pub max_transaction_credits: u32,

    /// How long a transaction may run before a stopping handle requests
    /// its commit.
    pub commit_interval: Duration,

    /// Outstanding credits at which a stopping handle requests a commit.
    pub commit_threshold: u32,

    /// Size of the log area in blocks.
    pub log_blocks: u64,

    /// Log blocks never handed out to transactions.
    pub reserved_log_blocks: u64,

    /// Attempts made to allocate a block copy before giving up.
    pub alloc_attempts: u32,

    /// Initial pause between allocation attempts; doubles every retry.
    pub alloc_backoff: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_transaction_credits: 1024,
            commit_interval: Duration::from_secs(5),
            commit_threshold: 1024,
            log_blocks: 8192,
            reserved_log_blocks: 32,
            alloc_attempts: 5,
            alloc_backoff: Duration::from_millis(1),
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-transaction credit ceiling.
    ///
    /// The commit threshold is clamped to the new ceiling.
    #[must_use]
    pub const fn max_transaction_credits(mut self, credits: u32) -> Self {
        self.max_transaction_credits = credits;
        if self.commit_threshold > credits {
            self.commit_threshold = credits;
        }
        self
    }

    /// Sets the commit interval.
    #[must_use]
    pub const fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Sets the outstanding-credit level that triggers a commit.
    #[must_use]
    pub const fn commit_threshold(mut self, credits: u32) -> Self {
        self.commit_threshold = credits;
        self
    }

    /// Sets the log size in blocks.
    #[must_use]
    pub const fn log_blocks(mut self, blocks: u64) -> Self {
        self.log_blocks = blocks;
        self
    }

    /// Sets the number of reserved log blocks.
    #[must_use]
    pub const fn reserved_log_blocks(mut self, blocks: u64) -> Self {
        self.reserved_log_blocks = blocks;
        self
    }

    /// Sets the allocation retry policy.
    #[must_use]
    pub const fn alloc_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.alloc_attempts = attempts;
        self.alloc_backoff = backoff;
        self
    }

    /// Space estimate for a log with `free` unused blocks.
    ///
    /// The reserve is never handed out and one eighth of the remainder is
    /// kept back as a margin for descriptor and commit blocks.
    #[must_use]
    pub const fn space_left(&self, free: u64) -> u64 {
        if free <= self.reserved_log_blocks {
            return 0;
        }
        let left = free - self.reserved_log_blocks;
        left - (left >> 3)
    }

    /// Checks that the configuration can admit at least one full transaction.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> JournalResult<()> {
        if self.max_transaction_credits == 0 {
            return Err(JournalError::invalid_config(
                "max_transaction_credits must be positive",
            ));
        }
        if self.commit_threshold == 0 || self.commit_threshold > self.max_transaction_credits {
            return Err(JournalError::invalid_config(format!(
                "commit_threshold must be in 1..={}",
                self.max_transaction_credits
            )));
        }
        if self.alloc_attempts == 0 {
            return Err(JournalError::invalid_config("alloc_attempts must be positive"));
        }
        let usable = self.space_left(self.log_blocks);
        if usable < u64::from(self.max_transaction_credits) {
            return Err(JournalError::invalid_config(format!(
                "log of {} blocks leaves {usable} usable, below one transaction of {}",
                self.log_blocks, self.max_transaction_credits
            )));
        }
        Ok(())
    }
}
