//! Collaborator interfaces.
//!
//! The journal never writes the log, never writes blocks home and never
//! keeps revoke records. Those jobs belong to the subsystems behind these
//! traits. Every method is called without any journal lock held, so an
//! implementation may call back into the [`Journal`](crate::Journal).

use crate::types::TransactionId;
use sluice_blockdev::BlockNr;
use std::fmt;
use std::sync::Arc;

/// The subsystem that claims transactions and writes them to the log.
pub trait CommitEngine: Send + Sync {
    /// A commit of `tid` was requested. Must not block on that commit.
    fn commit_requested(&self, tid: TransactionId);

    /// Whether some thread will eventually act on commit requests.
    ///
    /// When this is false, synchronous stops do not wait and
    /// `force_commit` reports an invalid operation instead of blocking
    /// forever.
    fn is_attached(&self) -> bool {
        true
    }
}

/// The subsystem that reclaims log space once blocks reach home.
pub trait Checkpointer: Send + Sync {
    /// A commit completed; `blocks` now hold checkpoint entries for `tid`.
    fn transaction_committed(&self, tid: TransactionId, blocks: &[BlockNr]);

    /// Admission is short of log space. The checkpointer should free what
    /// it can and report it through
    /// [`Journal::release_log_space`](crate::Journal::release_log_space).
    fn request_space(&self, needed: u64);

    /// The checkpoint entry of `blocknr` in `tid` is no longer needed.
    fn forget_block(&self, tid: TransactionId, blocknr: BlockNr);
}

/// Revoke-record bookkeeping.
pub trait RevokeTable: Send + Sync {
    /// `blocknr` is being legitimately rewritten in `tid`.
    fn cancel_revoke(&self, tid: TransactionId, blocknr: BlockNr);
}

/// Source of memory for frozen and committed copies.
pub trait BufferAllocator: Send + Sync {
    /// Returns a zeroed buffer of `len` bytes, or `None` under memory pressure.
    fn allocate(&self, len: usize) -> Option<Vec<u8>>;
}

/// Commit engine that is not attached; requests are only recorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCommitEngine;

impl CommitEngine for NoCommitEngine {
    fn commit_requested(&self, _tid: TransactionId) {}

    fn is_attached(&self) -> bool {
        false
    }
}

/// Checkpointer that reclaims nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpointer;

impl Checkpointer for NoCheckpointer {
    fn transaction_committed(&self, _tid: TransactionId, _blocks: &[BlockNr]) {}

    fn request_space(&self, _needed: u64) {}

    fn forget_block(&self, _tid: TransactionId, _blocknr: BlockNr) {}
}

/// Revoke table with no records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRevokeTable;

impl RevokeTable for NoRevokeTable {
    fn cancel_revoke(&self, _tid: TransactionId, _blocknr: BlockNr) {}
}

/// Allocator backed by the global heap, failing instead of aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).ok()?;
        buf.resize(len, 0);
        Some(buf)
    }
}

/// The set of collaborators a journal is opened with.
#[derive(Clone)]
pub struct Collaborators {
    /// Commit engine.
    pub commit_engine: Arc<dyn CommitEngine>,
    /// Checkpointer.
    pub checkpointer: Arc<dyn Checkpointer>,
    /// Revoke table.
    pub revoke_table: Arc<dyn RevokeTable>,
    /// Copy allocator.
    pub allocator: Arc<dyn BufferAllocator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            commit_engine: Arc::new(NoCommitEngine),
            checkpointer: Arc::new(NoCheckpointer),
            revoke_table: Arc::new(NoRevokeTable),
            allocator: Arc::new(HeapAllocator),
        }
    }
}

impl Collaborators {
    /// Replaces the commit engine.
    #[must_use]
    pub fn with_commit_engine(mut self, engine: Arc<dyn CommitEngine>) -> Self {
        self.commit_engine = engine;
        self
    }

    /// Replaces the checkpointer.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    /// Replaces the revoke table.
    #[must_use]
    pub fn with_revoke_table(mut self, revoke_table: Arc<dyn RevokeTable>) -> Self {
        self.revoke_table = revoke_table;
        self
    }

    /// Replaces the copy allocator.
    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("commit_engine_attached", &self.commit_engine.is_attached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_zeroes() {
        let buf = HeapAllocator.allocate(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn heap_allocator_refuses_absurd_sizes() {
        assert!(HeapAllocator.allocate(usize::MAX).is_none());
    }

    #[test]
    fn default_engine_is_detached() {
        let collab = Collaborators::default();
        assert!(!collab.commit_engine.is_attached());
        assert!(format!("{collab:?}").contains("false"));
    }
}
