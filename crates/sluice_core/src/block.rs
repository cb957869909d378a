//! Tracked blocks.
//!
//! A [`TrackedBlock`] is the journal's descriptor for one in-memory copy of
//! a device block: its bytes plus everything the journal needs to know about
//! which transaction holds it and in which role.

use crate::transaction::Transaction;
use crate::types::{Role, TransactionId};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use sluice_blockdev::BlockNr;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Shared reference to a tracked block.
pub type BlockRef = Arc<TrackedBlock>;

/// Journal metadata and buffer for one device block.
pub struct TrackedBlock {
    blocknr: BlockNr,
    pub(crate) state: Mutex<BlockState>,
    /// Signalled when log I/O on this block completes.
    pub(crate) io_done: Condvar,
}

/// Everything guarded by the per-block lock.
pub(crate) struct BlockState {
    pub(crate) data: Vec<u8>,
    pub(crate) uptodate: bool,
    /// Page-cache dirty.
    pub(crate) dirty: bool,
    /// Dirty, but owned by the log until checkpoint.
    pub(crate) journal_dirty: bool,
    pub(crate) owner: Option<Arc<Transaction>>,
    pub(crate) next: Option<Arc<Transaction>>,
    pub(crate) role: Role,
    pub(crate) frozen: Option<Bytes>,
    pub(crate) committed: Option<Bytes>,
    pub(crate) modified: bool,
    pub(crate) freed: bool,
    pub(crate) ordered: bool,
    pub(crate) checkpoint: Option<TransactionId>,
    /// Set once the descriptor has left the arena.
    pub(crate) released: bool,
}

impl BlockState {
    fn new(block_size: usize) -> Self {
        Self {
            data: vec![0; block_size],
            uptodate: false,
            dirty: false,
            journal_dirty: false,
            owner: None,
            next: None,
            role: Role::None,
            frozen: None,
            committed: None,
            modified: false,
            freed: false,
            ordered: false,
            checkpoint: None,
            released: false,
        }
    }

    pub(crate) fn is_owned_by(&self, transaction: &Arc<Transaction>) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| Arc::ptr_eq(owner, transaction))
    }

    pub(crate) fn is_next(&self, transaction: &Arc<Transaction>) -> bool {
        self.next
            .as_ref()
            .is_some_and(|next| Arc::ptr_eq(next, transaction))
    }

    /// Bytes a committing transaction must write for this block.
    pub(crate) fn committing_view(&self) -> Bytes {
        match &self.frozen {
            Some(frozen) => frozen.clone(),
            None => Bytes::copy_from_slice(&self.data),
        }
    }
}

impl TrackedBlock {
    pub(crate) fn new(blocknr: BlockNr, block_size: usize) -> Self {
        Self {
            blocknr,
            state: Mutex::new(BlockState::new(block_size)),
            io_done: Condvar::new(),
        }
    }

    /// Device block number.
    #[must_use]
    pub fn blocknr(&self) -> BlockNr {
        self.blocknr
    }

    /// Runs `f` over the current bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.state.lock().data)
    }

    /// Runs `f` over the current bytes mutably.
    ///
    /// Journaled blocks must only be written between
    /// [`Journal::get_write_access`](crate::Journal::get_write_access) and
    /// [`Journal::mark_dirty`](crate::Journal::mark_dirty).
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock();
        state.uptodate = true;
        f(&mut state.data)
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Transaction holding this block, if any.
    #[must_use]
    pub fn owner(&self) -> Option<TransactionId> {
        self.state.lock().owner.as_ref().map(|t| t.tid())
    }

    /// Transaction waiting to take this block over once the current owner
    /// commits.
    #[must_use]
    pub fn next_owner(&self) -> Option<TransactionId> {
        self.state.lock().next.as_ref().map(|t| t.tid())
    }

    /// The pre-image preserved for a committing transaction.
    #[must_use]
    pub fn frozen_copy(&self) -> Option<Bytes> {
        self.state.lock().frozen.clone()
    }

    /// The last committed bytes, kept for undo access.
    #[must_use]
    pub fn committed_copy(&self) -> Option<Bytes> {
        self.state.lock().committed.clone()
    }

    /// Bytes the committing transaction sees: the frozen copy if one exists,
    /// else the current bytes.
    #[must_use]
    pub fn committing_view(&self) -> Bytes {
        self.state.lock().committing_view()
    }

    /// Whether the owning transaction has modified this block.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    /// Whether the bytes are page-cache dirty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Whether the bytes are dirty and held back by the log.
    #[must_use]
    pub fn is_journal_dirty(&self) -> bool {
        self.state.lock().journal_dirty
    }

    /// Whether the bytes reflect the device or a full overwrite.
    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.state.lock().uptodate
    }

    /// Whether the block was deleted while a commit still held it.
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.state.lock().freed
    }

    /// Transaction whose checkpoint still covers this block.
    #[must_use]
    pub fn checkpoint_transaction(&self) -> Option<TransactionId> {
        self.state.lock().checkpoint
    }

    /// Marks the bytes page-cache dirty. Used for ordered data blocks, which
    /// the log never takes over.
    pub fn set_dirty(&self) {
        let mut state = self.state.lock();
        if state.role.is_log_tracked() {
            state.journal_dirty = true;
        } else {
            state.dirty = true;
        }
    }

    /// Records that the bytes reached their home location.
    ///
    /// Clears both dirty flags. The checkpoint entry stays until the
    /// checkpointer reports it through
    /// [`Journal::checkpoint_complete`](crate::Journal::checkpoint_complete).
    pub fn mark_clean(&self) {
        let mut state = self.state.lock();
        state.dirty = false;
        state.journal_dirty = false;
    }
}

impl fmt::Debug for TrackedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TrackedBlock")
            .field("blocknr", &self.blocknr)
            .field("role", &state.role)
            .field("owner", &state.owner.as_ref().map(|t| t.tid()))
            .field("next", &state.next.as_ref().map(|t| t.tid()))
            .field("frozen", &state.frozen.is_some())
            .field("modified", &state.modified)
            .finish_non_exhaustive()
    }
}

/// Every tracked block, by block number.
///
/// Lock order: the arena lock is taken before any block lock.
#[derive(Default)]
pub(crate) struct BlockArena {
    blocks: Mutex<HashMap<BlockNr, BlockRef>>,
}

impl BlockArena {
    pub(crate) fn get_or_insert(&self, blocknr: BlockNr, block_size: usize) -> BlockRef {
        self.blocks
            .lock()
            .entry(blocknr)
            .or_insert_with(|| Arc::new(TrackedBlock::new(blocknr, block_size)))
            .clone()
    }

    pub(crate) fn get(&self, blocknr: BlockNr) -> Option<BlockRef> {
        self.blocks.lock().get(&blocknr).cloned()
    }

    pub(crate) fn all(&self) -> Vec<BlockRef> {
        self.blocks.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Removes `block` if `release` approves it under the block lock.
    pub(crate) fn release_if(
        &self,
        block: &BlockRef,
        release: impl FnOnce(&mut BlockState) -> bool,
    ) -> bool {
        let mut blocks = self.blocks.lock();
        let mut state = block.state.lock();
        if !release(&mut state) {
            return false;
        }
        state.released = true;
        if blocks
            .get(&block.blocknr)
            .is_some_and(|current| Arc::ptr_eq(current, block))
        {
            blocks.remove(&block.blocknr);
        }
        true
    }
}
