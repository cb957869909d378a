//! Block access under a handle: write access, copy-on-write, dirtying and
//! forgetting.

use crate::block::{BlockRef, BlockState};
use crate::error::{JournalError, JournalResult};
use crate::handle::Handle;
use crate::journal::Journal;
use crate::lists::{file, unfile};
use crate::types::{Role, TransactionId, TransactionState};
use bytes::Bytes;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::trace;

impl Journal {
    /// Prepares `block` for modification under `handle`.
    ///
    /// If the committing transaction still needs the block's current bytes,
    /// they are preserved as a frozen copy first. Waits while the block's
    /// bytes are being written to the log.
    ///
    /// # Errors
    ///
    /// [`JournalError::Aborted`], [`JournalError::IoFailure`] if the block
    /// could not be read, [`JournalError::OutOfMemory`] if no copy could be
    /// allocated.
    pub fn get_write_access(&self, handle: &Handle, block: &BlockRef) -> JournalResult<()> {
        self.do_get_write_access(handle, block, false)
    }

    /// Write access that also keeps a copy of the last committed bytes.
    ///
    /// Used by callers that must be able to fall back to the committed state
    /// of a block, such as allocation bitmaps.
    ///
    /// # Errors
    ///
    /// As [`get_write_access`](Self::get_write_access).
    pub fn get_undo_access(&self, handle: &Handle, block: &BlockRef) -> JournalResult<()> {
        self.do_get_write_access(handle, block, true)?;

        let mut spare: Option<Vec<u8>> = None;
        let mut state = block.state.lock();
        loop {
            if state.committed.is_some() {
                return Ok(());
            }
            match spare.take() {
                Some(mut buf) => {
                    buf.copy_from_slice(&state.data);
                    state.committed = Some(Bytes::from(buf));
                    return Ok(());
                }
                None => {
                    let len = state.data.len();
                    spare = Some(MutexGuard::unlocked(&mut state, || self.allocate_copy(len))?);
                }
            }
        }
    }

    fn do_get_write_access(
        &self,
        handle: &Handle,
        block: &BlockRef,
        force_copy: bool,
    ) -> JournalResult<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let transaction = handle.transaction()?;
        self.load(block)?;

        let blocknr = block.blocknr();
        let mut spare: Option<Vec<u8>> = None;
        let mut state = block.state.lock();
        check_live(&state)?;

        loop {
            if self.is_aborted() {
                return Err(JournalError::Aborted);
            }

            if state.is_owned_by(&transaction) || state.is_next(&transaction) {
                break;
            }
            // First touch by this transaction.
            state.modified = false;

            if state.frozen.is_some() {
                state.next = Some(Arc::clone(&transaction));
                break;
            }

            if let Some(owner) = state.owner.clone() {
                if owner.state() != TransactionState::Locked {
                    return Err(JournalError::invalid_operation(format!(
                        "block {blocknr} is held by {}, which is not committing",
                        owner.tid()
                    )));
                }

                if state.role == Role::Shadow {
                    self.stats.record_shadow_wait();
                    trace!(blocknr, "waiting for log I/O");
                    block.io_done.wait(&mut state);
                    continue;
                }

                if state.role.needs_preimage() || force_copy {
                    let Some(mut buf) = spare.take() else {
                        let len = state.data.len();
                        spare = Some(MutexGuard::unlocked(&mut state, || {
                            self.allocate_copy(len)
                        })?);
                        continue;
                    };
                    buf.copy_from_slice(&state.data);
                    state.frozen = Some(Bytes::from(buf));
                    self.stats.record_frozen_copy();
                    trace!(blocknr, owner = %owner.tid(), "froze block for commit");
                }
                state.next = Some(Arc::clone(&transaction));
                break;
            }

            file(blocknr, &mut state, &transaction, Role::Reserved, self.is_aborted());
            break;
        }
        drop(state);

        self.collab
            .revoke_table
            .cancel_revoke(transaction.tid(), blocknr);
        Ok(())
    }

    /// Prepares a newly allocated block for use under `handle`.
    ///
    /// The old contents are irrelevant and are not read from the device.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] if another transaction holds the
    /// block for anything other than forgetting it.
    pub fn get_create_access(&self, handle: &Handle, block: &BlockRef) -> JournalResult<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let transaction = handle.transaction()?;
        let blocknr = block.blocknr();

        let mut state = block.state.lock();
        check_live(&state)?;
        if state.next.is_some() && !state.is_next(&transaction) {
            return Err(JournalError::invalid_operation(format!(
                "block {blocknr} is already claimed by another transaction"
            )));
        }

        match state.owner.clone() {
            None => {
                state.modified = false;
                state.dirty = false;
                file(blocknr, &mut state, &transaction, Role::Reserved, self.is_aborted());
            }
            Some(owner) if Arc::ptr_eq(&owner, &transaction) => {}
            Some(owner)
                if owner.state() == TransactionState::Locked && state.role == Role::Forget =>
            {
                if !state.is_next(&transaction) {
                    state.modified = false;
                    state.next = Some(Arc::clone(&transaction));
                }
            }
            Some(owner) => {
                return Err(JournalError::invalid_operation(format!(
                    "block {blocknr} is still in use by {}",
                    owner.tid()
                )));
            }
        }

        if !state.uptodate {
            state.data.fill(0);
            state.uptodate = true;
        }
        state.freed = false;
        drop(state);

        self.collab
            .revoke_table
            .cancel_revoke(transaction.tid(), blocknr);
        Ok(())
    }

    /// Records that `block` was modified under `handle`.
    ///
    /// The first modification in a transaction consumes one of the handle's
    /// credits.
    ///
    /// # Errors
    ///
    /// [`JournalError::CreditsExhausted`] if the handle has no credits left,
    /// [`JournalError::InvalidOperation`] without prior write access.
    pub fn mark_dirty(&self, handle: &Handle, block: &BlockRef) -> JournalResult<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let transaction = handle.transaction()?;
        let blocknr = block.blocknr();

        let mut state = block.state.lock();
        check_live(&state)?;
        let owned = state.is_owned_by(&transaction);
        if !owned && !state.is_next(&transaction) {
            return Err(JournalError::invalid_operation(format!(
                "block {blocknr} was dirtied without write access"
            )));
        }

        if !state.modified {
            handle.consume_credit()?;
            state.modified = true;
        }

        state.journal_dirty = true;
        if !owned {
            // Still held by the committing transaction; refiled to us when
            // that commit finishes.
            return Ok(());
        }
        if state.role != Role::Metadata {
            file(blocknr, &mut state, &transaction, Role::Metadata, self.is_aborted());
        }
        Ok(())
    }

    /// Files a data block for ordered writeback before the commit record.
    ///
    /// Blocks the log already holds as metadata are left alone.
    ///
    /// # Errors
    ///
    /// [`JournalError::Aborted`].
    pub fn file_sync_data(&self, handle: &Handle, block: &BlockRef) -> JournalResult<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let transaction = handle.transaction()?;
        let blocknr = block.blocknr();

        let mut state = block.state.lock();
        check_live(&state)?;
        match state.owner.clone() {
            None => {
                state.ordered = true;
                file(blocknr, &mut state, &transaction, Role::SyncData, self.is_aborted());
            }
            Some(owner) if Arc::ptr_eq(&owner, &transaction) => {
                if matches!(state.role, Role::SyncData | Role::Locked | Role::Reserved) {
                    state.ordered = true;
                    if state.role == Role::Reserved {
                        file(blocknr, &mut state, &transaction, Role::SyncData, self.is_aborted());
                    }
                }
            }
            Some(_) => {
                if matches!(state.role, Role::SyncData | Role::Locked) {
                    state.ordered = true;
                    state.next = Some(Arc::clone(&transaction));
                } else {
                    trace!(blocknr, "not stealing journaled block for ordered data");
                }
            }
        }
        Ok(())
    }

    /// Drops a block the caller has deleted.
    ///
    /// A block first modified in this transaction never reaches the log,
    /// and the handle gets its credit back.
    ///
    /// # Errors
    ///
    /// [`JournalError::InvalidOperation`] for a block holding undo data.
    pub fn forget(&self, handle: &Handle, block: &BlockRef) -> JournalResult<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        let transaction = handle.transaction()?;
        let blocknr = block.blocknr();
        let aborted = self.is_aborted();

        let mut state = block.state.lock();
        check_live(&state)?;
        if state.committed.is_some() {
            return Err(JournalError::invalid_operation(format!(
                "block {blocknr} holds undo data and cannot be forgotten"
            )));
        }

        let touched = state.is_owned_by(&transaction) || state.is_next(&transaction);
        let was_modified = touched && state.modified;

        match state.owner.clone() {
            Some(owner) if Arc::ptr_eq(&owner, &transaction) => {
                state.modified = false;
                clear_dirty(&mut state);
                if state.checkpoint.is_some() {
                    file(blocknr, &mut state, &transaction, Role::Forget, aborted);
                } else {
                    unfile(blocknr, &mut state, aborted);
                }
                trace!(blocknr, tid = %transaction.tid(), "forgot block");
            }
            Some(owner) => {
                if state.is_next(&transaction) {
                    state.next = None;
                    state.modified = false;
                }
                if state.next.is_none() {
                    state.freed = true;
                }
                trace!(blocknr, owner = %owner.tid(), "forgot block held by commit");
            }
            None => {
                clear_dirty(&mut state);
                if state.checkpoint.is_some() {
                    file(blocknr, &mut state, &transaction, Role::Forget, aborted);
                }
            }
        }
        drop(state);

        if was_modified {
            handle.return_credit();
        }
        Ok(())
    }

    /// Lets the cache drop `block`'s descriptor if the journal no longer
    /// needs it.
    ///
    /// Returns `false` for blocks that are dirty, being written, held by a
    /// transaction or waiting for one. A clean block whose only tie is a
    /// checkpoint entry drops that entry. On `true` the descriptor must not
    /// be used again; [`get_block`](Self::get_block) creates a fresh one.
    pub fn try_release(&self, block: &BlockRef) -> bool {
        let mut dropped = None;
        let released = self.blocks.release_if(block, |state| {
            if state.dirty
                || state.journal_dirty
                || matches!(state.role, Role::Locked | Role::Shadow)
                || state.owner.is_some()
                || state.next.is_some()
            {
                return false;
            }
            dropped = state.checkpoint.take();
            true
        });
        if let Some(tid) = dropped {
            self.collab.checkpointer.forget_block(tid, block.blocknr());
        }
        released
    }

    /// Removes the checkpoint entry `tid` holds on `block` once the
    /// checkpointer wrote it home.
    pub fn checkpoint_complete(&self, block: &BlockRef, tid: TransactionId) {
        let mut state = block.state.lock();
        if state.checkpoint == Some(tid) {
            state.checkpoint = None;
            trace!(blocknr = block.blocknr(), %tid, "checkpoint entry removed");
        }
    }
}

fn check_live(state: &BlockState) -> JournalResult<()> {
    if state.released {
        return Err(JournalError::invalid_operation(
            "block descriptor was released",
        ));
    }
    Ok(())
}

fn clear_dirty(state: &mut BlockState) {
    state.dirty = false;
    state.journal_dirty = false;
}
