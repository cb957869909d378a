//! Recording collaborators.
//!
//! Implementations of the journal's collaborator traits that remember what
//! they were told, plus a checkpointer that can actually write committed
//! blocks home and hand log space back.

use parking_lot::Mutex;
use sluice_blockdev::{BlockNr, DeviceResult};
use sluice_core::{BufferAllocator, Checkpointer, Journal, RevokeTable, TransactionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Checkpointer that tracks committed blocks and writes them home on demand.
///
/// Attach the journal with [`attach`](Self::attach) before calling
/// [`checkpoint`](Self::checkpoint) from inside `request_space`.
#[derive(Debug, Default)]
pub struct RecordingCheckpointer {
    journal: Mutex<Weak<Journal>>,
    /// Serializes checkpoint passes.
    pass: Mutex<()>,
    pending: Mutex<VecDeque<(TransactionId, Vec<BlockNr>)>>,
    committed: Mutex<Vec<TransactionId>>,
    forgotten: Mutex<Vec<(TransactionId, BlockNr)>>,
    space_requests: AtomicU64,
    auto: AtomicBool,
}

impl RecordingCheckpointer {
    /// A checkpointer that only records.
    pub fn new() -> Self {
        Self::default()
    }

    /// A checkpointer that checkpoints whenever the journal asks for space.
    pub fn automatic() -> Self {
        let checkpointer = Self::default();
        checkpointer.auto.store(true, Ordering::SeqCst);
        checkpointer
    }

    /// Remembers the journal for automatic checkpoints.
    pub fn attach(&self, journal: &Arc<Journal>) {
        *self.journal.lock() = Arc::downgrade(journal);
    }

    /// Transactions reported committed, in order.
    pub fn committed(&self) -> Vec<TransactionId> {
        self.committed.lock().clone()
    }

    /// Checkpoint entries the journal dropped.
    pub fn forgotten(&self) -> Vec<(TransactionId, BlockNr)> {
        self.forgotten.lock().clone()
    }

    /// Blocks still waiting for checkpoint, by transaction.
    pub fn pending(&self) -> Vec<(TransactionId, Vec<BlockNr>)> {
        self.pending.lock().iter().cloned().collect()
    }

    /// Number of space requests received.
    pub fn space_requests(&self) -> u64 {
        self.space_requests.load(Ordering::SeqCst)
    }

    /// Writes every checkpointable block home.
    ///
    /// A block still held by a running transaction stays pending. Once
    /// nothing is pending the log space used so far is released. Returns the
    /// number of blocks written.
    ///
    /// # Errors
    ///
    /// The first device error; pending entries are kept.
    pub fn checkpoint(&self, journal: &Journal) -> DeviceResult<usize> {
        let _pass = self.pass.lock();
        let mut pending = std::mem::take(&mut *self.pending.lock());
        let mut written = 0;
        let mut result = Ok(());

        for (tid, blocks) in pending.iter_mut() {
            let tid = *tid;
            let mut kept = Vec::new();
            for &blocknr in blocks.iter() {
                if result.is_err() {
                    kept.push(blocknr);
                    continue;
                }
                let Ok(block) = journal.get_block(blocknr) else {
                    continue;
                };
                if block.checkpoint_transaction() != Some(tid) {
                    continue;
                }
                if block.owner().is_some() {
                    kept.push(blocknr);
                    continue;
                }
                if block.is_dirty() || block.is_journal_dirty() {
                    let bytes = block.read(<[u8]>::to_vec);
                    if let Err(err) = journal.device().write_block(blocknr, &bytes) {
                        result = Err(err);
                        kept.push(blocknr);
                        continue;
                    }
                    block.mark_clean();
                    written += 1;
                }
                journal.checkpoint_complete(&block, tid);
            }
            *blocks = kept;
        }
        pending.retain(|(_, blocks)| !blocks.is_empty());

        let drained = {
            let mut current = self.pending.lock();
            let newer = std::mem::take(&mut *current);
            pending.extend(newer);
            *current = pending;
            current.is_empty()
        };

        result?;
        journal.device().flush()?;
        if drained {
            let used = journal.config().log_blocks - journal.free_log_blocks();
            journal.release_log_space(used);
            debug!(written, released = used, "checkpoint drained log");
        }
        Ok(written)
    }
}

impl Checkpointer for RecordingCheckpointer {
    fn transaction_committed(&self, tid: TransactionId, blocks: &[BlockNr]) {
        self.committed.lock().push(tid);
        if !blocks.is_empty() {
            self.pending.lock().push_back((tid, blocks.to_vec()));
        }
    }

    fn request_space(&self, _needed: u64) {
        self.space_requests.fetch_add(1, Ordering::SeqCst);
        if !self.auto.load(Ordering::SeqCst) {
            return;
        }
        let Some(journal) = self.journal.lock().upgrade() else {
            return;
        };
        if let Err(err) = self.checkpoint(&journal) {
            warn!(%err, "automatic checkpoint failed");
        }
        // Entries held by the running transaction clear once it commits.
        if !self.pending.lock().is_empty() {
            if let Some(running) = journal.running_transaction() {
                journal.request_commit(running.tid());
            }
        }
    }

    fn forget_block(&self, tid: TransactionId, blocknr: BlockNr) {
        self.forgotten.lock().push((tid, blocknr));
        let mut pending = self.pending.lock();
        for (owner, blocks) in pending.iter_mut() {
            if *owner == tid {
                blocks.retain(|&b| b != blocknr);
            }
        }
        pending.retain(|(_, blocks)| !blocks.is_empty());
    }
}

/// Revoke table that records cancellations.
#[derive(Debug, Default)]
pub struct RecordingRevokeTable {
    cancelled: Mutex<Vec<(TransactionId, BlockNr)>>,
}

impl RecordingRevokeTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cancellation, in order.
    pub fn cancelled(&self) -> Vec<(TransactionId, BlockNr)> {
        self.cancelled.lock().clone()
    }
}

impl RevokeTable for RecordingRevokeTable {
    fn cancel_revoke(&self, tid: TransactionId, blocknr: BlockNr) {
        self.cancelled.lock().push((tid, blocknr));
    }
}

/// Allocator that fails its first `failures` requests.
#[derive(Debug)]
pub struct FlakyAllocator {
    failures: AtomicU32,
    calls: AtomicU64,
}

impl FlakyAllocator {
    /// Fails `failures` times, then allocates normally.
    pub fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU64::new(0),
        }
    }

    /// Never succeeds.
    pub fn exhausted() -> Self {
        Self::new(u32::MAX)
    }

    /// Number of allocation attempts seen.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BufferAllocator for FlakyAllocator {
    fn allocate(&self, len: usize) -> Option<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                (left > 0 && left != u32::MAX).then(|| left - 1)
            });
        match failing {
            Ok(_) => None,
            Err(u32::MAX) => None,
            Err(_) => Some(vec![0; len]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flaky_allocator_recovers() {
        let alloc = FlakyAllocator::new(2);
        assert!(alloc.allocate(8).is_none());
        assert!(alloc.allocate(8).is_none());
        assert_eq!(alloc.allocate(8).map(|b| b.len()), Some(8));
        assert_eq!(alloc.calls(), 3);
    }

    #[test]
    fn exhausted_allocator_never_recovers() {
        let alloc = FlakyAllocator::exhausted();
        for _ in 0..4 {
            assert!(alloc.allocate(8).is_none());
        }
    }

    #[test]
    fn forget_drops_pending_entries() {
        let cp = RecordingCheckpointer::new();
        let tid = TransactionId::new(3);
        cp.transaction_committed(tid, &[1, 2]);
        cp.forget_block(tid, 1);
        assert_eq!(cp.pending(), vec![(tid, vec![2])]);
        cp.forget_block(tid, 2);
        assert!(cp.pending().is_empty());
        assert_eq!(cp.committed(), vec![tid]);
        assert_eq!(cp.forgotten().len(), 2);
    }

    #[test]
    fn revoke_table_records() {
        let table = RecordingRevokeTable::new();
        table.cancel_revoke(TransactionId::new(1), 7);
        assert_eq!(table.cancelled(), vec![(TransactionId::new(1), 7)]);
    }
}
