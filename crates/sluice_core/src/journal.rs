//! The journal: running and committing transactions, admission, barriers.

use crate::block::{BlockArena, BlockRef};
use crate::collab::Collaborators;
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::handle::{Handle, Released};
use crate::stats::JournalStats;
use crate::transaction::Transaction;
use crate::types::{TransactionId, TransactionState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use sluice_blockdev::{BlockDevice, BlockNr};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Everything guarded by the log-state lock.
pub(crate) struct LogState {
    pub(crate) running: Option<Arc<Transaction>>,
    pub(crate) committing: Option<Arc<Transaction>>,
    /// Outstanding credits of the committing transaction when it was claimed.
    pub(crate) committing_credits: u32,
    /// Next transaction ID to hand out.
    pub(crate) sequence: u64,
    pub(crate) commit_request: TransactionId,
    pub(crate) commit_sequence: TransactionId,
    pub(crate) barrier_count: u32,
    pub(crate) free_blocks: u64,
    pub(crate) abort_error: Option<Arc<JournalError>>,
    pub(crate) closed: bool,
}

/// A write-ahead-log transaction manager.
///
/// The journal owns at most one running and one committing transaction.
/// Callers group their block updates into [`Handle`]s; handles are admitted
/// into the running transaction while it has credit and log space left.
/// An external commit engine claims the running transaction with
/// [`Journal::begin_commit`] and reports back through
/// [`Journal::finish_commit`].
///
/// Lock order: log state, then a transaction's handle account. Separately:
/// block arena, then a block, then a transaction's lists. A handle's own lock
/// is always innermost.
pub struct Journal {
    pub(crate) config: JournalConfig,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) collab: Collaborators,
    pub(crate) state: Mutex<LogState>,
    /// Admission waiters: barrier lowered, transaction changed, abort.
    pub(crate) wait_transaction_locked: Condvar,
    /// Log space released or a commit finished.
    pub(crate) wait_space: Condvar,
    /// A commit finished.
    pub(crate) wait_commit: Condvar,
    pub(crate) blocks: BlockArena,
    pub(crate) stats: JournalStats,
    aborted: AtomicBool,
}

impl Journal {
    /// Opens a journal over `device`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidConfig`] if the configuration cannot
    /// admit a full transaction.
    pub fn open(
        config: JournalConfig,
        device: Arc<dyn BlockDevice>,
        collab: Collaborators,
    ) -> JournalResult<Self> {
        config.validate()?;
        debug!(
            max_credits = config.max_transaction_credits,
            log_blocks = config.log_blocks,
            block_size = device.block_size(),
            "journal opened"
        );
        Ok(Self {
            state: Mutex::new(LogState {
                running: None,
                committing: None,
                committing_credits: 0,
                sequence: 1,
                commit_request: TransactionId::default(),
                commit_sequence: TransactionId::default(),
                barrier_count: 0,
                free_blocks: config.log_blocks,
                abort_error: None,
                closed: false,
            }),
            config,
            device,
            collab,
            wait_transaction_locked: Condvar::new(),
            wait_space: Condvar::new(),
            wait_commit: Condvar::new(),
            blocks: BlockArena::default(),
            stats: JournalStats::new(),
            aborted: AtomicBool::new(false),
        })
    }

    /// Configuration the journal was opened with.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Statistics.
    #[must_use]
    pub fn stats(&self) -> &JournalStats {
        &self.stats
    }

    /// Underlying block device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Starts a handle reserving `credits` in the running transaction.
    ///
    /// Blocks while a barrier is raised, while the running transaction is
    /// being claimed for commit, while it lacks room for `credits`, or while
    /// the log is short of space.
    ///
    /// # Errors
    ///
    /// [`JournalError::TooManyCredits`] if `credits` exceeds the per-
    /// transaction maximum, [`JournalError::Aborted`] once the journal has
    /// aborted.
    pub fn start_handle(&self, credits: u32) -> JournalResult<Handle> {
        let max = self.config.max_transaction_credits;
        if credits > max {
            return Err(JournalError::TooManyCredits {
                requested: credits,
                max,
            });
        }
        let transaction = self.admit(credits)?;
        self.stats.record_handle_start();
        trace!(tid = %transaction.tid(), credits, "handle started");
        Ok(Handle::new(transaction, credits))
    }

    /// Takes another reference to `handle` for a nested operation.
    ///
    /// Each reference must be stopped; credits are released by the last.
    #[must_use]
    pub fn start_nested(&self, handle: &Handle) -> Handle {
        handle.nested()
    }

    fn admit(&self, credits: u32) -> JournalResult<Arc<Transaction>> {
        let max = self.config.max_transaction_credits;
        let mut state = self.state.lock();
        loop {
            if self.is_aborted() {
                return Err(JournalError::Aborted);
            }
            if state.closed {
                return Err(JournalError::invalid_operation("journal is closed"));
            }

            let transaction = match state.running.clone() {
                Some(running) => running,
                None => self.new_transaction(&mut state),
            };

            if state.barrier_count > 0 {
                self.stats.record_admission_wait();
                trace!("admission waiting for barrier");
                self.wait_transaction_locked.wait(&mut state);
                continue;
            }

            if transaction.state() == TransactionState::Locked {
                self.stats.record_admission_wait();
                trace!(tid = %transaction.tid(), "admission waiting for locked transaction");
                self.wait_transaction_locked.wait(&mut state);
                continue;
            }

            let mut account = transaction.account.lock();
            if u64::from(account.outstanding_credits) + u64::from(credits) > u64::from(max) {
                drop(account);
                self.stats.record_admission_wait();
                debug!(tid = %transaction.tid(), credits, "transaction full, requesting commit");
                self.note_commit_request(&mut state, transaction.tid());
                while !self.is_aborted()
                    && state
                        .running
                        .as_ref()
                        .is_some_and(|running| Arc::ptr_eq(running, &transaction))
                {
                    self.wait_transaction_locked.wait(&mut state);
                }
                continue;
            }

            let needed = self.space_needed(&state);
            let left = self.config.space_left(state.free_blocks);
            if left < needed {
                drop(account);
                self.stats.record_space_wait();
                debug!(left, needed, "admission waiting for log space");
                let checkpointer = Arc::clone(&self.collab.checkpointer);
                MutexGuard::unlocked(&mut state, || checkpointer.request_space(needed - left));
                if !self.is_aborted()
                    && self.config.space_left(state.free_blocks) < self.space_needed(&state)
                {
                    self.wait_space.wait(&mut state);
                }
                continue;
            }

            account.outstanding_credits += credits;
            account.handle_count += 1;
            account.handles_started += 1;
            drop(account);
            return Ok(transaction);
        }
    }

    /// Low-water mark for admission.
    fn space_needed(&self, state: &LogState) -> u64 {
        u64::from(self.config.max_transaction_credits) + u64::from(state.committing_credits)
    }

    fn new_transaction(&self, state: &mut LogState) -> Arc<Transaction> {
        let tid = TransactionId::new(state.sequence);
        state.sequence += 1;
        let transaction = Arc::new(Transaction::new(tid, self.config.commit_interval));
        state.running = Some(Arc::clone(&transaction));
        self.stats.record_transaction_created();
        debug!(%tid, "transaction created");
        transaction
    }

    /// Adds `more` credits to the handle in place.
    ///
    /// # Errors
    ///
    /// [`JournalError::NeedsRestart`] if the transaction is no longer
    /// running or cannot grow by `more`; the caller should
    /// [`restart`](Self::restart) the handle.
    pub fn extend(&self, handle: &Handle, more: u32) -> JournalResult<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let transaction = handle.transaction()?;
        let state = self.state.lock();
        if transaction.state() != TransactionState::Running {
            return Err(JournalError::NeedsRestart);
        }
        let mut account = transaction.account.lock();
        let Some(wanted) = account
            .outstanding_credits
            .checked_add(more)
            .filter(|&wanted| wanted <= self.config.max_transaction_credits)
        else {
            trace!(tid = %transaction.tid(), more, "extend refused: transaction too big");
            return Err(JournalError::NeedsRestart);
        };
        if u64::from(wanted) > self.config.space_left(state.free_blocks) {
            trace!(tid = %transaction.tid(), wanted, "extend refused: log space");
            return Err(JournalError::NeedsRestart);
        }
        account.outstanding_credits = wanted;
        drop(account);
        drop(state);
        handle.add_credits(more);
        Ok(())
    }

    /// Moves the handle into a fresh admission with `credits`.
    ///
    /// The handle's unused credits are returned, a commit of its current
    /// transaction is requested, and admission runs again.
    ///
    /// # Errors
    ///
    /// [`JournalError::TooManyCredits`] if `credits` is over the maximum;
    /// admission errors otherwise. After an admission error the handle is
    /// unbound and only [`stop`](Self::stop) is valid.
    pub fn restart(&self, handle: &Handle, credits: u32) -> JournalResult<()> {
        let max = self.config.max_transaction_credits;
        if credits > max {
            return Err(JournalError::TooManyCredits {
                requested: credits,
                max,
            });
        }
        let Some(Released {
            transaction: Some(transaction),
            reserved,
            unused,
            ..
        }) = handle.unbind()
        else {
            return Err(JournalError::invalid_operation(
                "handle is not bound to a transaction",
            ));
        };
        let tid = transaction.tid();
        transaction.release_handle(reserved, unused);
        {
            let mut state = self.state.lock();
            self.wait_transaction_locked.notify_all();
            self.note_commit_request(&mut state, tid);
        }
        debug!(%tid, credits, "handle restarting");

        let transaction = self.admit(credits)?;
        handle.bind(transaction, credits);
        Ok(())
    }

    /// Stops a handle.
    ///
    /// Nested references only drop their count. The last reference returns
    /// unused credits, and requests a commit if the handle is synchronous,
    /// the transaction reached the commit threshold, or its commit interval
    /// elapsed. A synchronous stop then waits for that commit.
    ///
    /// # Errors
    ///
    /// [`JournalError::Aborted`] if the journal has aborted; bookkeeping is
    /// released regardless.
    pub fn stop(&self, mut handle: Handle) -> JournalResult<()> {
        let Some(released) = handle.release() else {
            return Ok(());
        };
        self.stats.record_handle_stop();
        let Some(transaction) = released.transaction else {
            return if self.is_aborted() {
                Err(JournalError::Aborted)
            } else {
                Ok(())
            };
        };

        let tid = transaction.tid();
        let outstanding = transaction.release_handle(released.reserved, released.unused);
        trace!(%tid, unused = released.unused, "handle stopped");

        let mut wait = false;
        if released.sync
            || outstanding >= self.config.commit_threshold
            || transaction.is_expired()
        {
            let mut state = self.state.lock();
            self.note_commit_request(&mut state, tid);
            wait = released.sync && self.collab.commit_engine.is_attached();
        }

        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        if wait {
            self.wait_commit(tid)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit requests
    // ------------------------------------------------------------------

    /// Records a commit request and tells the engine, with the lock dropped.
    fn note_commit_request(&self, state: &mut MutexGuard<'_, LogState>, tid: TransactionId) -> bool {
        if state.commit_request >= tid || state.commit_sequence >= tid {
            return false;
        }
        state.commit_request = tid;
        self.stats.record_commit_request();
        debug!(%tid, "commit requested");
        let engine = Arc::clone(&self.collab.commit_engine);
        MutexGuard::unlocked(state, || engine.commit_requested(tid));
        true
    }

    /// Asks the commit engine to commit `tid`.
    ///
    /// Returns whether a new request was recorded; repeated requests, and
    /// requests for transactions already committed, return `false`.
    pub fn request_commit(&self, tid: TransactionId) -> bool {
        let mut state = self.state.lock();
        self.note_commit_request(&mut state, tid)
    }

    /// Blocks until `tid` has committed.
    ///
    /// # Errors
    ///
    /// [`JournalError::Aborted`] if the journal aborts first,
    /// [`JournalError::InvalidOperation`] if `tid` was never issued.
    pub fn wait_commit(&self, tid: TransactionId) -> JournalResult<()> {
        let mut state = self.state.lock();
        if tid.as_u64() >= state.sequence {
            return Err(JournalError::invalid_operation(format!(
                "{tid} was never started"
            )));
        }
        loop {
            if state.commit_sequence >= tid {
                return Ok(());
            }
            if self.is_aborted() {
                return Err(JournalError::Aborted);
            }
            self.wait_commit.wait(&mut state);
        }
    }

    /// Commits the running transaction, or the committing one if nothing is
    /// running, and waits for it.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] without an attached commit engine,
    /// [`JournalError::Aborted`] if the journal aborts.
    pub fn force_commit(&self) -> JournalResult<()> {
        if !self.collab.commit_engine.is_attached() {
            return Err(JournalError::invalid_operation(
                "force_commit requires an attached commit engine",
            ));
        }
        let tid = {
            let mut state = self.state.lock();
            if self.is_aborted() {
                return Err(JournalError::Aborted);
            }
            let tid = state
                .running
                .as_ref()
                .or(state.committing.as_ref())
                .map(|t| t.tid());
            if let Some(tid) = tid {
                self.note_commit_request(&mut state, tid);
            }
            tid
        };
        match tid {
            Some(tid) => self.wait_commit(tid),
            None => Ok(()),
        }
    }

    /// ID of the running transaction if its commit interval has elapsed.
    #[must_use]
    pub fn expired_transaction(&self) -> Option<TransactionId> {
        let state = self.state.lock();
        state
            .running
            .as_ref()
            .filter(|t| Instant::now() >= t.expires())
            .map(|t| t.tid())
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Stops new handles from starting and waits for running ones to stop.
    pub fn raise_barrier(&self) {
        let running = {
            let mut state = self.state.lock();
            state.barrier_count += 1;
            state.running.clone()
        };
        self.stats.record_barrier();
        debug!("barrier raised");
        if let Some(transaction) = running {
            transaction.wait_for_updates();
        }
    }

    /// Lowers a barrier raised with [`raise_barrier`](Self::raise_barrier).
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] if no barrier is raised.
    pub fn lower_barrier(&self) -> JournalResult<()> {
        let mut state = self.state.lock();
        if state.barrier_count == 0 {
            return Err(JournalError::invalid_operation("no barrier is raised"));
        }
        state.barrier_count -= 1;
        if state.barrier_count == 0 {
            debug!("barrier lowered");
            self.wait_transaction_locked.notify_all();
        }
        Ok(())
    }

    /// Raises a barrier that is lowered when the guard drops.
    pub fn barrier(&self) -> BarrierGuard<'_> {
        self.raise_barrier();
        BarrierGuard { journal: self }
    }

    // ------------------------------------------------------------------
    // Abort, space, lifecycle
    // ------------------------------------------------------------------

    /// Latches the journal into the aborted state and wakes every waiter.
    ///
    /// The first error is kept; later calls only re-wake waiters.
    pub fn abort(&self, error: JournalError) {
        {
            let mut state = self.state.lock();
            if state.abort_error.is_none() {
                warn!(%error, "journal aborted");
                state.abort_error = Some(Arc::new(error));
            }
            self.aborted.store(true, Ordering::SeqCst);
            self.wait_transaction_locked.notify_all();
            self.wait_space.notify_all();
            self.wait_commit.notify_all();
        }
        for block in self.blocks.all() {
            drop(block.state.lock());
            block.io_done.notify_all();
        }
    }

    /// Whether the journal has aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The error that aborted the journal.
    #[must_use]
    pub fn abort_error(&self) -> Option<Arc<JournalError>> {
        self.state.lock().abort_error.clone()
    }

    /// Returns `blocks` of log space reclaimed by the checkpointer.
    pub fn release_log_space(&self, blocks: u64) {
        let mut state = self.state.lock();
        state.free_blocks = (state.free_blocks + blocks).min(self.config.log_blocks);
        trace!(blocks, free = state.free_blocks, "log space released");
        self.wait_space.notify_all();
    }

    /// Closes the journal.
    ///
    /// New handles fail from here on. If a commit engine is attached, the
    /// running transaction is committed and waited for.
    ///
    /// # Errors
    ///
    /// [`JournalError::Aborted`] if the journal aborted.
    pub fn close(&self) -> JournalResult<()> {
        {
            let mut state = self.state.lock();
            state.closed = true;
            self.wait_transaction_locked.notify_all();
        }
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        if self.collab.commit_engine.is_attached() {
            self.force_commit()?;
        }
        debug!("journal closed");
        Ok(())
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Returns the tracked block for `blocknr`, creating its descriptor.
    ///
    /// The bytes are read from the device on first write access.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] if `blocknr` is past the device.
    pub fn get_block(&self, blocknr: BlockNr) -> JournalResult<BlockRef> {
        let block_count = self.device.block_count();
        if blocknr >= block_count {
            return Err(JournalError::invalid_operation(format!(
                "block {blocknr} is past the end of a {block_count}-block device"
            )));
        }
        Ok(self
            .blocks
            .get_or_insert(blocknr, self.device.block_size()))
    }

    /// Number of tracked block descriptors.
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Reads the block from the device if its bytes are not current.
    pub(crate) fn load(&self, block: &BlockRef) -> JournalResult<()> {
        let result = {
            let mut state = block.state.lock();
            if state.uptodate {
                return Ok(());
            }
            let result = self.device.read_block(block.blocknr(), &mut state.data);
            if result.is_ok() {
                state.uptodate = true;
            }
            result
        };
        result.map_err(|err| {
            warn!(blocknr = block.blocknr(), %err, "block read failed");
            let err = Arc::new(err);
            self.abort(JournalError::IoFailure(Arc::clone(&err)));
            JournalError::IoFailure(err)
        })
    }

    /// Allocates a copy buffer, backing off while the allocator is dry.
    pub(crate) fn allocate_copy(&self, len: usize) -> JournalResult<Vec<u8>> {
        let attempts = self.config.alloc_attempts;
        let mut backoff = self.config.alloc_backoff;
        for attempt in 1..=attempts {
            match self.collab.allocator.allocate(len) {
                Some(buf) if buf.len() == len => return Ok(buf),
                Some(buf) => warn!(len, got = buf.len(), "allocator returned a mis-sized buffer"),
                None => {}
            }
            if attempt < attempts {
                self.stats.record_alloc_retry();
                trace!(len, attempt, ?backoff, "copy allocation failed, backing off");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }
        }
        warn!(len, attempts, "copy allocation failed");
        Err(JournalError::OutOfMemory { len })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// The running transaction.
    #[must_use]
    pub fn running_transaction(&self) -> Option<Arc<Transaction>> {
        self.state.lock().running.clone()
    }

    /// The committing transaction.
    #[must_use]
    pub fn committing_transaction(&self) -> Option<Arc<Transaction>> {
        self.state.lock().committing.clone()
    }

    /// Highest transaction whose commit completed.
    #[must_use]
    pub fn commit_sequence(&self) -> TransactionId {
        self.state.lock().commit_sequence
    }

    /// Highest transaction whose commit was requested.
    #[must_use]
    pub fn commit_request(&self) -> TransactionId {
        self.state.lock().commit_request
    }

    /// Number of raised barriers.
    #[must_use]
    pub fn barrier_count(&self) -> u32 {
        self.state.lock().barrier_count
    }

    /// Unused log blocks.
    #[must_use]
    pub fn free_log_blocks(&self) -> u64 {
        self.state.lock().free_blocks
    }

    /// Log blocks admission may still hand out.
    #[must_use]
    pub fn space_left(&self) -> u64 {
        self.config.space_left(self.state.lock().free_blocks)
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Journal")
            .field("running", &state.running.as_ref().map(|t| t.tid()))
            .field("committing", &state.committing.as_ref().map(|t| t.tid()))
            .field("commit_sequence", &state.commit_sequence)
            .field("barrier_count", &state.barrier_count)
            .field("free_blocks", &state.free_blocks)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Lowers its barrier when dropped.
#[must_use = "the barrier is lowered as soon as the guard is dropped"]
pub struct BarrierGuard<'j> {
    journal: &'j Journal,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.journal.lower_barrier() {
            warn!(%err, "barrier guard found no raised barrier");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::CommitEngine;
    use parking_lot::Mutex as PlMutex;
    use sluice_blockdev::MemoryDevice;
    use std::time::Duration;

    fn open(config: JournalConfig) -> Journal {
        let device = Arc::new(MemoryDevice::new(64, 128));
        Journal::open(config, device, Collaborators::default()).unwrap()
    }

    #[derive(Default)]
    struct Requests(PlMutex<Vec<TransactionId>>);

    impl CommitEngine for Requests {
        fn commit_requested(&self, tid: TransactionId) {
            self.0.lock().push(tid);
        }
    }

    #[test]
    fn open_rejects_invalid_config() {
        let device = Arc::new(MemoryDevice::new(64, 8));
        let err = Journal::open(
            JournalConfig::new().max_transaction_credits(0),
            device,
            Collaborators::default(),
        )
        .unwrap_err();
        assert!(matches!(err, JournalError::InvalidConfig { .. }));
    }

    #[test]
    fn first_handle_creates_transaction() {
        let journal = open(JournalConfig::default());
        assert!(journal.running_transaction().is_none());

        let handle = journal.start_handle(10).unwrap();
        let running = journal.running_transaction().unwrap();
        assert_eq!(running.tid(), TransactionId::new(1));
        assert_eq!(handle.transaction_id(), Some(running.tid()));
        assert_eq!(running.outstanding_credits(), 10);
        assert_eq!(running.handle_count(), 1);

        journal.stop(handle).unwrap();
        assert_eq!(running.outstanding_credits(), 0);
        assert_eq!(running.handle_count(), 0);
    }

    #[test]
    fn too_many_credits() {
        let journal = open(JournalConfig::new().max_transaction_credits(100));
        let err = journal.start_handle(101).unwrap_err();
        assert!(matches!(
            err,
            JournalError::TooManyCredits {
                requested: 101,
                max: 100
            }
        ));
    }

    #[test]
    fn handles_share_running_transaction() {
        let journal = open(JournalConfig::default());
        let a = journal.start_handle(3).unwrap();
        let b = journal.start_handle(4).unwrap();
        assert_eq!(a.transaction_id(), b.transaction_id());
        let running = journal.running_transaction().unwrap();
        assert_eq!(
            running.outstanding_credits(),
            a.reserved_credits() + b.reserved_credits()
        );
        journal.stop(a).unwrap();
        journal.stop(b).unwrap();
    }

    #[test]
    fn nested_handles_release_once() {
        let journal = open(JournalConfig::default());
        let outer = journal.start_handle(8).unwrap();
        let inner = journal.start_nested(&outer);
        assert_eq!(outer.ref_count(), 2);
        let running = journal.running_transaction().unwrap();

        journal.stop(inner).unwrap();
        assert_eq!(running.handle_count(), 1);
        assert_eq!(running.outstanding_credits(), 8);

        journal.stop(outer).unwrap();
        assert_eq!(running.handle_count(), 0);
        assert_eq!(running.outstanding_credits(), 0);
        assert_eq!(journal.stats().snapshot().handles_stopped, 1);
    }

    #[test]
    fn extend_within_limits() {
        let journal = open(JournalConfig::new().max_transaction_credits(100));
        let handle = journal.start_handle(40).unwrap();
        journal.extend(&handle, 50).unwrap();
        assert_eq!(handle.credits(), 90);
        assert_eq!(journal.running_transaction().unwrap().outstanding_credits(), 90);

        let err = journal.extend(&handle, 11).unwrap_err();
        assert!(matches!(err, JournalError::NeedsRestart));
        journal.stop(handle).unwrap();
    }

    #[test]
    fn extend_past_u32_needs_restart() {
        let journal = open(JournalConfig::new().max_transaction_credits(100));
        let handle = journal.start_handle(40).unwrap();

        let err = journal.extend(&handle, u32::MAX - 10).unwrap_err();
        assert!(matches!(err, JournalError::NeedsRestart));
        assert_eq!(handle.credits(), 40);
        assert_eq!(handle.reserved_credits(), 40);
        assert_eq!(journal.running_transaction().unwrap().outstanding_credits(), 40);
        journal.stop(handle).unwrap();
    }

    #[test]
    fn admission_of_huge_handles_does_not_wrap() {
        let big = 3_000_000_000;
        let journal = open(
            JournalConfig::new()
                .max_transaction_credits(u32::MAX - 1)
                .log_blocks(1 << 34),
        );
        let first = journal.start_handle(big).unwrap();
        let running = journal.running_transaction().unwrap();

        std::thread::scope(|scope| {
            let second = scope.spawn(|| journal.start_handle(big));
            std::thread::sleep(Duration::from_millis(50));
            assert!(!second.is_finished(), "second handle must wait for room");
            journal.abort(JournalError::invalid_operation("stop waiting"));
            assert!(matches!(second.join().unwrap(), Err(JournalError::Aborted)));
        });
        assert_eq!(running.outstanding_credits(), big);
        assert_eq!(running.handle_count(), 1);
        drop(first);
    }

    #[test]
    fn mis_sized_copy_buffers_count_as_failures() {
        struct Short;
        impl crate::collab::BufferAllocator for Short {
            fn allocate(&self, len: usize) -> Option<Vec<u8>> {
                Some(vec![0; len / 2])
            }
        }

        let device = Arc::new(MemoryDevice::new(64, 128));
        let journal = Journal::open(
            JournalConfig::default().alloc_retry(3, Duration::from_micros(10)),
            device,
            Collaborators::default().with_allocator(Arc::new(Short)),
        )
        .unwrap();
        assert!(matches!(
            journal.allocate_copy(64),
            Err(JournalError::OutOfMemory { len: 64 })
        ));
        assert_eq!(journal.stats().snapshot().alloc_retries, 2);
    }

    #[test]
    fn extend_refused_when_locked() {
        let journal = open(JournalConfig::default());
        let handle = journal.start_handle(1).unwrap();
        journal
            .running_transaction()
            .unwrap()
            .set_state(TransactionState::Locked);
        assert!(matches!(
            journal.extend(&handle, 1),
            Err(JournalError::NeedsRestart)
        ));
        journal.stop(handle).unwrap();
    }

    #[test]
    fn restart_rebinds_and_requests_commit() {
        let engine = Arc::new(Requests::default());
        let device = Arc::new(MemoryDevice::new(64, 128));
        let journal = Journal::open(
            JournalConfig::default(),
            device,
            Collaborators::default().with_commit_engine(engine.clone()),
        )
        .unwrap();

        let handle = journal.start_handle(5).unwrap();
        handle.consume_credit().unwrap();
        journal.restart(&handle, 7).unwrap();

        // Nobody claimed the transaction, so the handle lands in it again.
        let running = journal.running_transaction().unwrap();
        assert_eq!(handle.transaction_id(), Some(running.tid()));
        assert_eq!(handle.credits(), 7);
        assert_eq!(running.outstanding_credits(), 1 + 7);
        assert_eq!(running.consumed_credits(), 1);
        assert_eq!(engine.0.lock().as_slice(), &[running.tid()]);
        journal.stop(handle).unwrap();
    }

    #[test]
    fn commit_requests_are_idempotent() {
        let engine = Arc::new(Requests::default());
        let device = Arc::new(MemoryDevice::new(64, 128));
        let journal = Journal::open(
            JournalConfig::default(),
            device,
            Collaborators::default().with_commit_engine(engine.clone()),
        )
        .unwrap();

        assert!(journal.request_commit(TransactionId::new(1)));
        assert!(!journal.request_commit(TransactionId::new(1)));
        assert!(journal.request_commit(TransactionId::new(2)));
        assert_eq!(journal.commit_request(), TransactionId::new(2));
        assert_eq!(engine.0.lock().len(), 2);
    }

    #[test]
    fn stop_requests_commit_at_threshold() {
        let journal = open(
            JournalConfig::new()
                .max_transaction_credits(100)
                .commit_threshold(10),
        );
        let handle = journal.start_handle(10).unwrap();
        for _ in 0..10 {
            handle.consume_credit().unwrap();
        }
        let tid = handle.transaction_id().unwrap();
        journal.stop(handle).unwrap();
        assert_eq!(journal.commit_request(), tid);
    }

    #[test]
    fn stop_requests_commit_after_interval() {
        let journal = open(JournalConfig::new().commit_interval(Duration::ZERO));
        let handle = journal.start_handle(1).unwrap();
        let tid = handle.transaction_id().unwrap();
        assert_eq!(journal.expired_transaction(), Some(tid));
        journal.stop(handle).unwrap();
        assert_eq!(journal.commit_request(), tid);
    }

    #[test]
    fn sync_stop_without_engine_does_not_block() {
        let journal = open(JournalConfig::default());
        let handle = journal.start_handle(1).unwrap();
        handle.set_sync(true);
        let tid = handle.transaction_id().unwrap();
        journal.stop(handle).unwrap();
        assert_eq!(journal.commit_request(), tid);
    }

    #[test]
    fn barrier_counts_and_guard() {
        let journal = open(JournalConfig::default());
        journal.raise_barrier();
        journal.raise_barrier();
        assert_eq!(journal.barrier_count(), 2);
        journal.lower_barrier().unwrap();
        journal.lower_barrier().unwrap();
        assert!(journal.lower_barrier().is_err());

        {
            let _guard = journal.barrier();
            assert_eq!(journal.barrier_count(), 1);
        }
        assert_eq!(journal.barrier_count(), 0);
    }

    #[test]
    fn abort_fails_fast() {
        let journal = open(JournalConfig::default());
        let handle = journal.start_handle(1).unwrap();
        journal.abort(JournalError::invalid_operation("first"));
        journal.abort(JournalError::invalid_operation("second"));

        assert!(journal.is_aborted());
        assert!(journal.abort_error().unwrap().to_string().contains("first"));
        assert!(matches!(journal.start_handle(1), Err(JournalError::Aborted)));
        assert!(matches!(journal.stop(handle), Err(JournalError::Aborted)));
        assert_eq!(journal.running_transaction().unwrap().handle_count(), 0);
    }

    #[test]
    fn closed_journal_refuses_handles() {
        let journal = open(JournalConfig::default());
        journal.close().unwrap();
        assert!(journal.is_closed());
        assert!(matches!(
            journal.start_handle(1),
            Err(JournalError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn force_commit_needs_engine() {
        let journal = open(JournalConfig::default());
        assert!(matches!(
            journal.force_commit(),
            Err(JournalError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn wait_commit_rejects_future_tid() {
        let journal = open(JournalConfig::default());
        assert!(journal.wait_commit(TransactionId::new(5)).is_err());
    }

    #[test]
    fn get_block_bounds() {
        let journal = open(JournalConfig::default());
        let a = journal.get_block(3).unwrap();
        let b = journal.get_block(3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(journal.cached_blocks(), 1);
        assert!(journal.get_block(128).is_err());
    }

    #[test]
    fn release_log_space_is_capped() {
        let journal = open(JournalConfig::default());
        journal.release_log_space(1_000_000);
        assert_eq!(journal.free_log_blocks(), journal.config().log_blocks);
    }
}
