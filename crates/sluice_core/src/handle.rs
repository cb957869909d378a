//! Transaction handles.

use crate::error::{JournalError, JournalResult};
use crate::transaction::Transaction;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// State shared by a handle and its nested references.
#[derive(Debug)]
pub(crate) struct HandleState {
    pub(crate) transaction: Option<Arc<Transaction>>,
    /// Credits not yet consumed.
    pub(crate) credits: u32,
    /// Credits charged to the transaction on this handle's behalf.
    pub(crate) reserved: u32,
    pub(crate) ref_count: u32,
    pub(crate) sync: bool,
}

/// What the last reference to a handle leaves behind.
pub(crate) struct Released {
    pub(crate) transaction: Option<Arc<Transaction>>,
    pub(crate) reserved: u32,
    pub(crate) unused: u32,
    pub(crate) sync: bool,
}

/// A caller's lease on credits inside one transaction.
///
/// Obtained from [`Journal::start_handle`](crate::Journal::start_handle) and
/// returned with [`Journal::stop`](crate::Journal::stop). A handle dropped
/// without being stopped releases its credits but never requests a commit.
pub struct Handle {
    inner: Arc<Mutex<HandleState>>,
    stopped: bool,
}

impl Handle {
    pub(crate) fn new(transaction: Arc<Transaction>, credits: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandleState {
                transaction: Some(transaction),
                credits,
                reserved: credits,
                ref_count: 1,
                sync: false,
            })),
            stopped: false,
        }
    }

    /// Another reference to the same handle state.
    pub(crate) fn nested(&self) -> Self {
        self.inner.lock().ref_count += 1;
        Self {
            inner: Arc::clone(&self.inner),
            stopped: false,
        }
    }

    /// Credits left to consume.
    #[must_use]
    pub fn credits(&self) -> u32 {
        self.inner.lock().credits
    }

    /// Credits charged to the transaction for this handle.
    #[must_use]
    pub fn reserved_credits(&self) -> u32 {
        self.inner.lock().reserved
    }

    /// Transaction the handle is bound to.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner.lock().transaction.as_ref().map(|t| t.tid())
    }

    /// Number of nested references sharing this handle.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.lock().ref_count
    }

    /// Requests that stopping the handle wait for its transaction to commit.
    pub fn set_sync(&self, sync: bool) {
        self.inner.lock().sync = sync;
    }

    /// Whether stopping will wait for the commit.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.inner.lock().sync
    }

    pub(crate) fn transaction(&self) -> JournalResult<Arc<Transaction>> {
        self.inner
            .lock()
            .transaction
            .clone()
            .ok_or_else(|| JournalError::invalid_operation("handle is not bound to a transaction"))
    }

    pub(crate) fn consume_credit(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        if inner.credits == 0 {
            return Err(JournalError::CreditsExhausted);
        }
        inner.credits -= 1;
        Ok(())
    }

    pub(crate) fn return_credit(&self) {
        let mut inner = self.inner.lock();
        inner.credits = inner.credits.saturating_add(1);
    }

    pub(crate) fn add_credits(&self, more: u32) {
        let mut inner = self.inner.lock();
        inner.credits = inner.credits.saturating_add(more);
        inner.reserved = inner.reserved.saturating_add(more);
    }

    /// Detaches the handle from its transaction for a restart.
    pub(crate) fn unbind(&self) -> Option<Released> {
        let mut inner = self.inner.lock();
        let transaction = inner.transaction.take()?;
        Some(Released {
            transaction: Some(transaction),
            reserved: std::mem::take(&mut inner.reserved),
            unused: std::mem::take(&mut inner.credits),
            sync: inner.sync,
        })
    }

    pub(crate) fn bind(&self, transaction: Arc<Transaction>, credits: u32) {
        let mut inner = self.inner.lock();
        inner.transaction = Some(transaction);
        inner.credits = credits;
        inner.reserved = credits;
    }

    /// Drops this reference. Returns the leftovers if it was the last one.
    pub(crate) fn release(&mut self) -> Option<Released> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        let mut inner = self.inner.lock();
        inner.ref_count = inner.ref_count.saturating_sub(1);
        if inner.ref_count > 0 {
            return None;
        }
        Some(Released {
            transaction: inner.transaction.take(),
            reserved: std::mem::take(&mut inner.reserved),
            unused: std::mem::take(&mut inner.credits),
            sync: inner.sync,
        })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(released) = self.release() {
            if let Some(transaction) = released.transaction {
                warn!(tid = %transaction.tid(), "handle dropped without stop");
                transaction.release_handle(released.reserved, released.unused);
            }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Handle")
            .field("transaction", &inner.transaction.as_ref().map(|t| t.tid()))
            .field("credits", &inner.credits)
            .field("ref_count", &inner.ref_count)
            .field("sync", &inner.sync)
            .finish()
    }
}
