//! The interface a commit engine drives.
//!
//! A commit runs in three steps:
//!
//! 1. [`Journal::begin_commit`] locks the running transaction, waits for its
//!    handles to stop and returns a [`CommitClaim`].
//! 2. The engine walks the claim's blocks in [`COMMIT_ORDER`]: ordered data
//!    is written home ([`CommitClaim::start_data_io`] /
//!    [`CommitClaim::end_data_io`]), metadata is written to the log
//!    ([`CommitClaim::start_log_io`] / [`CommitClaim::end_log_io`]).
//! 3. [`Journal::finish_commit`] hands every block to its next transaction
//!    or to the checkpointer and publishes the new commit sequence.

use crate::block::{BlockRef, BlockState};
use crate::error::{JournalError, JournalResult};
use crate::journal::Journal;
use crate::lists::{file, refile, unfile};
use crate::transaction::Transaction;
use crate::types::{Role, TransactionId, TransactionState};
use bytes::Bytes;
use sluice_blockdev::{BlockNr, DeviceError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Order in which a commit visits its role lists.
pub const COMMIT_ORDER: [Role; 7] = [
    Role::SyncData,
    Role::Locked,
    Role::Metadata,
    Role::Shadow,
    Role::IO,
    Role::LogControl,
    Role::Forget,
];

/// A transaction claimed for commit.
///
/// Only one claim exists at a time. Dropping a claim without passing it to
/// [`Journal::finish_commit`] leaves the transaction committing forever.
#[must_use = "a claimed transaction must be finished"]
pub struct CommitClaim<'j> {
    journal: &'j Journal,
    transaction: Arc<Transaction>,
    logged: u64,
}

impl Journal {
    /// Claims the running transaction for commit.
    ///
    /// Returns `None` if nothing is running.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] if another commit is in progress,
    /// [`JournalError::Aborted`] once the journal aborted.
    pub fn begin_commit(&self) -> JournalResult<Option<CommitClaim<'_>>> {
        let transaction = {
            let state = self.state.lock();
            if self.is_aborted() {
                return Err(JournalError::Aborted);
            }
            if state.committing.is_some() {
                return Err(JournalError::invalid_operation(
                    "a commit is already in progress",
                ));
            }
            let Some(running) = state.running.clone() else {
                return Ok(None);
            };
            if running.state() == TransactionState::Locked {
                return Err(JournalError::invalid_operation(
                    "the running transaction is already being claimed",
                ));
            }
            running.set_state(TransactionState::Locked);
            running
        };
        let tid = transaction.tid();
        debug!(%tid, "transaction locked");

        transaction.wait_for_updates();

        // Reserved blocks nobody dirtied do not belong in the commit.
        let aborted = self.is_aborted();
        for blocknr in transaction.blocks(Role::Reserved) {
            let Some(block) = self.blocks.get(blocknr) else {
                continue;
            };
            let mut state = block.state.lock();
            if state.is_owned_by(&transaction) && state.role == Role::Reserved {
                state.committed = None;
                state.frozen = None;
                refile(blocknr, &mut state, aborted);
            }
        }

        {
            let mut state = self.state.lock();
            state.running = None;
            state.committing = Some(Arc::clone(&transaction));
            state.committing_credits = transaction.outstanding_credits();
            self.wait_transaction_locked.notify_all();
        }
        debug!(
            %tid,
            blocks = transaction.nr_blocks(),
            metadata = transaction.nr_metadata(),
            "commit started"
        );

        Ok(Some(CommitClaim {
            journal: self,
            transaction,
            logged: 0,
        }))
    }

    /// Completes a commit.
    ///
    /// On success every block is either handed to the transaction that
    /// touched it during the commit, given a checkpoint entry if it is still
    /// dirty, or released. An `Err` outcome aborts the journal.
    ///
    /// # Errors
    ///
    /// [`JournalError::Aborted`] if `outcome` is an error or the journal
    /// aborted while the commit ran; the device error is kept as the abort
    /// cause.
    pub fn finish_commit(
        &self,
        claim: CommitClaim<'_>,
        outcome: Result<(), DeviceError>,
    ) -> JournalResult<()> {
        let transaction = claim.transaction;
        let tid = transaction.tid();

        if let Err(err) = outcome {
            warn!(%tid, %err, "commit failed");
            self.abort(JournalError::from(err));
        }
        let aborted = self.is_aborted();

        let mut checkpointed = Vec::new();
        let mut dropped = Vec::new();
        for role in COMMIT_ORDER {
            for blocknr in transaction.blocks(role) {
                let Some(block) = self.blocks.get(blocknr) else {
                    continue;
                };
                let mut state = block.state.lock();
                if !state.is_owned_by(&transaction) {
                    continue;
                }
                match role {
                    Role::IO | Role::LogControl => unfile(blocknr, &mut state, aborted),
                    _ => {
                        if let Some(old) =
                            complete_block(blocknr, &mut state, tid, aborted, &mut checkpointed)
                        {
                            dropped.push((old, blocknr));
                        }
                    }
                }
                drop(state);
                block.io_done.notify_all();
            }
        }

        {
            let mut state = self.state.lock();
            if !aborted {
                let used = claim.logged + 1;
                state.free_blocks = state.free_blocks.saturating_sub(used);
                state.commit_sequence = tid;
                self.stats.record_transaction_committed(used);
            }
            state.committing = None;
            state.committing_credits = 0;
            self.wait_commit.notify_all();
            self.wait_space.notify_all();
            self.wait_transaction_locked.notify_all();
        }

        for (old, blocknr) in dropped {
            self.collab.checkpointer.forget_block(old, blocknr);
        }
        if aborted {
            return Err(JournalError::Aborted);
        }

        debug!(%tid, logged = claim.logged, checkpointed = checkpointed.len(), "commit finished");
        self.collab
            .checkpointer
            .transaction_committed(tid, &checkpointed);
        Ok(())
    }
}

/// Final bookkeeping for one block of a finished commit.
///
/// Returns a stale checkpoint entry that was dropped.
fn complete_block(
    blocknr: BlockNr,
    state: &mut BlockState,
    tid: TransactionId,
    aborted: bool,
    checkpointed: &mut Vec<BlockNr>,
) -> Option<TransactionId> {
    if state.committed.is_some() {
        if let Some(frozen) = state.frozen.take() {
            state.committed = Some(frozen);
        }
    }
    state.frozen = None;

    let stale = state.checkpoint.take().filter(|&old| old != tid);

    if state.freed && state.next.is_none() {
        state.freed = false;
        state.dirty = false;
        state.journal_dirty = false;
    }

    if state.journal_dirty && !aborted {
        state.checkpoint = Some(tid);
        checkpointed.push(blocknr);
    }

    refile(blocknr, state, aborted);
    stale
}

impl<'j> CommitClaim<'j> {
    /// ID of the claimed transaction.
    #[must_use]
    pub fn tid(&self) -> TransactionId {
        self.transaction.tid()
    }

    /// The claimed transaction.
    #[must_use]
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Log blocks charged to this commit so far.
    #[must_use]
    pub fn logged_blocks(&self) -> u64 {
        self.logged
    }

    /// Snapshot of the claimed blocks in [`COMMIT_ORDER`].
    #[must_use]
    pub fn walk(&self) -> Vec<(Role, BlockRef)> {
        let mut blocks = Vec::new();
        for role in COMMIT_ORDER {
            for blocknr in self.transaction.blocks(role) {
                if let Some(block) = self.journal.blocks.get(blocknr) {
                    blocks.push((role, block));
                }
            }
        }
        blocks
    }

    /// Blocks of one role, in filing order.
    #[must_use]
    pub fn blocks(&self, role: Role) -> Vec<BlockRef> {
        self.transaction
            .blocks(role)
            .into_iter()
            .filter_map(|blocknr| self.journal.blocks.get(blocknr))
            .collect()
    }

    fn expect_role(&self, state: &BlockState, block: &BlockRef, roles: &[Role]) -> JournalResult<()> {
        if state.is_owned_by(&self.transaction) && roles.contains(&state.role) {
            return Ok(());
        }
        Err(JournalError::invalid_operation(format!(
            "block {} is {} in {:?}, expected one of {roles:?} in {}",
            block.blocknr(),
            state.role,
            state.owner.as_ref().map(|t| t.tid()),
            self.tid()
        )))
    }

    /// Locks an ordered data block for writeback and returns its bytes.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] unless the block is sync data of
    /// this commit.
    pub fn start_data_io(&self, block: &BlockRef) -> JournalResult<Bytes> {
        let mut state = block.state.lock();
        self.expect_role(&state, block, &[Role::SyncData])?;
        file(
            block.blocknr(),
            &mut state,
            &self.transaction,
            Role::Locked,
            self.journal.is_aborted(),
        );
        Ok(Bytes::copy_from_slice(&state.data))
    }

    /// Records that an ordered data block reached home.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] unless the block is locked for
    /// writeback by this commit.
    pub fn end_data_io(&self, block: &BlockRef) -> JournalResult<()> {
        let mut state = block.state.lock();
        self.expect_role(&state, block, &[Role::Locked])?;
        if state.next.is_none() {
            state.dirty = false;
        }
        refile(block.blocknr(), &mut state, self.journal.is_aborted());
        trace!(blocknr = block.blocknr(), "ordered data written");
        Ok(())
    }

    /// Moves a metadata block into flight and returns the bytes to log.
    ///
    /// The bytes are the frozen copy if a running transaction already took
    /// write access, else the current contents.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] unless the block is metadata of
    /// this commit.
    pub fn start_log_io(&mut self, block: &BlockRef) -> JournalResult<Bytes> {
        let mut state = block.state.lock();
        self.expect_role(&state, block, &[Role::Metadata])?;
        let bytes = state.committing_view();
        file(
            block.blocknr(),
            &mut state,
            &self.transaction,
            Role::Shadow,
            self.journal.is_aborted(),
        );
        self.logged += 1;
        Ok(bytes)
    }

    /// Records that a block's log write completed and wakes its waiters.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] unless the block is in flight for
    /// this commit.
    pub fn end_log_io(&self, block: &BlockRef) -> JournalResult<()> {
        {
            let mut state = block.state.lock();
            self.expect_role(&state, block, &[Role::Shadow])?;
            file(
                block.blocknr(),
                &mut state,
                &self.transaction,
                Role::Forget,
                self.journal.is_aborted(),
            );
        }
        block.io_done.notify_all();
        Ok(())
    }

    /// Files a log descriptor block written by this commit.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] if the block belongs to a
    /// transaction.
    pub fn file_log_control(&mut self, block: &BlockRef) -> JournalResult<()> {
        self.file_scratch(block, Role::LogControl)?;
        self.logged += 1;
        Ok(())
    }

    /// Files a temporary log I/O buffer of this commit.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] if the block belongs to a
    /// transaction.
    pub fn file_io(&mut self, block: &BlockRef) -> JournalResult<()> {
        self.file_scratch(block, Role::IO)
    }

    fn file_scratch(&self, block: &BlockRef, role: Role) -> JournalResult<()> {
        let mut state = block.state.lock();
        if state.owner.is_some() && !state.is_owned_by(&self.transaction) {
            return Err(JournalError::invalid_operation(format!(
                "block {} belongs to another transaction",
                block.blocknr()
            )));
        }
        state.uptodate = true;
        file(
            block.blocknr(),
            &mut state,
            &self.transaction,
            role,
            self.journal.is_aborted(),
        );
        Ok(())
    }
}

impl fmt::Debug for CommitClaim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitClaim")
            .field("tid", &self.tid())
            .field("logged", &self.logged)
            .finish_non_exhaustive()
    }
}
