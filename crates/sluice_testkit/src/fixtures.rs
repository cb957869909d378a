//! Test fixtures and journal helpers.
//!
//! Provides a journal wired to recording collaborators over a memory or
//! file device, committed either by hand or by a [`CommitDaemon`].

use crate::collab::{RecordingCheckpointer, RecordingRevokeTable};
use crate::daemon::{commit_once, CommitDaemon, CommitReport, CommitSignal, LogArea};
use parking_lot::Mutex;
use sluice_blockdev::{BlockDevice, BlockNr, FileDevice, MemoryDevice};
use sluice_core::{BlockRef, BufferAllocator, Collaborators, Journal, JournalConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Block size used by fixtures.
pub const TEST_BLOCK_SIZE: usize = 64;

/// Builder for [`TestJournal`].
#[derive(Clone)]
pub struct TestJournalBuilder {
    config: JournalConfig,
    data_blocks: u64,
    log_area_blocks: u64,
    allocator: Option<Arc<dyn BufferAllocator>>,
    daemon: bool,
    file: bool,
    auto_checkpoint: bool,
    poll_interval: Duration,
}

impl Default for TestJournalBuilder {
    fn default() -> Self {
        Self {
            config: JournalConfig::default()
                .max_transaction_credits(64)
                .log_blocks(1024)
                .reserved_log_blocks(8),
            data_blocks: 256,
            log_area_blocks: 64,
            allocator: None,
            daemon: false,
            file: false,
            auto_checkpoint: false,
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl TestJournalBuilder {
    /// Journal configuration.
    #[must_use]
    pub fn config(mut self, config: JournalConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of blocks available to tests, numbered from zero.
    #[must_use]
    pub fn data_blocks(mut self, blocks: u64) -> Self {
        self.data_blocks = blocks;
        self
    }

    /// Buffer allocator for frozen copies.
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Commit from a background daemon instead of by hand.
    #[must_use]
    pub fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }

    /// Back the journal with a file in a temporary directory.
    #[must_use]
    pub fn file(mut self) -> Self {
        self.file = true;
        self
    }

    /// Checkpoint whenever the journal runs short of log space.
    #[must_use]
    pub fn auto_checkpoint(mut self) -> Self {
        self.auto_checkpoint = true;
        self
    }

    /// Builds the fixture.
    pub fn build(self) -> TestJournal {
        let block_count = self.data_blocks + self.log_area_blocks;
        let mut memory = None;
        let mut temp_dir = None;
        let device: Arc<dyn BlockDevice> = if self.file {
            let dir = TempDir::new().expect("Failed to create temp directory");
            let path = dir.path().join("journal.img");
            let device = FileDevice::create(&path, TEST_BLOCK_SIZE, block_count)
                .expect("Failed to create file device");
            temp_dir = Some(dir);
            Arc::new(device)
        } else {
            let device = Arc::new(MemoryDevice::new(TEST_BLOCK_SIZE, block_count));
            memory = Some(Arc::clone(&device));
            device
        };

        let signal = Arc::new(if self.daemon {
            CommitSignal::attached()
        } else {
            CommitSignal::detached()
        });
        let checkpointer = Arc::new(if self.auto_checkpoint {
            RecordingCheckpointer::automatic()
        } else {
            RecordingCheckpointer::new()
        });
        let revokes = Arc::new(RecordingRevokeTable::new());

        let mut collab = Collaborators::default()
            .with_commit_engine(signal.clone())
            .with_checkpointer(checkpointer.clone())
            .with_revoke_table(revokes.clone());
        if let Some(allocator) = self.allocator {
            collab = collab.with_allocator(allocator);
        }

        let journal = Arc::new(
            Journal::open(self.config, device, collab).expect("Failed to open journal"),
        );
        checkpointer.attach(&journal);

        let log = LogArea::new(self.data_blocks, self.log_area_blocks);
        let daemon = self.daemon.then(|| {
            CommitDaemon::spawn(
                Arc::clone(&journal),
                Arc::clone(&signal),
                log.clone(),
                self.poll_interval,
            )
            .expect("Failed to spawn commit daemon")
        });

        TestJournal {
            journal,
            memory,
            signal,
            checkpointer,
            revokes,
            log: Mutex::new(log),
            data_blocks: self.data_blocks,
            daemon,
            _temp_dir: temp_dir,
        }
    }
}

/// A journal with recording collaborators and automatic cleanup.
pub struct TestJournal {
    /// The journal instance.
    pub journal: Arc<Journal>,
    /// The memory device, unless file-backed.
    pub memory: Option<Arc<MemoryDevice>>,
    /// The registered commit engine.
    pub signal: Arc<CommitSignal>,
    /// The registered checkpointer.
    pub checkpointer: Arc<RecordingCheckpointer>,
    /// The registered revoke table.
    pub revokes: Arc<RecordingRevokeTable>,
    log: Mutex<LogArea>,
    data_blocks: u64,
    daemon: Option<CommitDaemon>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestJournal {
    /// Builder with defaults: 64 credits per transaction, memory device,
    /// hand-driven commits.
    pub fn builder() -> TestJournalBuilder {
        TestJournalBuilder::default()
    }

    /// Memory-backed journal committed by hand.
    pub fn manual() -> Self {
        Self::builder().build()
    }

    /// Memory-backed journal committed by a background daemon.
    pub fn with_daemon() -> Self {
        Self::builder().daemon().build()
    }

    /// File-backed journal committed by hand.
    pub fn file() -> Self {
        Self::builder().file().build()
    }

    /// Number of blocks tests may use, numbered from zero.
    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }

    /// Log ring used by commits.
    pub fn log_area(&self) -> LogArea {
        self.log.lock().clone()
    }

    /// Path of the device image if file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("journal.img"))
    }

    /// The memory device.
    ///
    /// # Panics
    ///
    /// Panics for file-backed fixtures.
    pub fn memory(&self) -> &MemoryDevice {
        self.memory
            .as_deref()
            .expect("fixture is not memory-backed")
    }

    /// Descriptor for test block `blocknr`.
    ///
    /// # Panics
    ///
    /// Panics if `blocknr` lies in the log area.
    pub fn block(&self, blocknr: BlockNr) -> BlockRef {
        assert!(blocknr < self.data_blocks, "block {blocknr} is in the log area");
        self.journal.get_block(blocknr).expect("Failed to get block")
    }

    /// Commits the running transaction on this thread.
    ///
    /// # Panics
    ///
    /// Panics on a daemon fixture or if the commit fails.
    pub fn commit(&self) -> Option<CommitReport> {
        assert!(self.daemon.is_none(), "daemon fixtures commit in the background");
        commit_once(&self.journal, &mut self.log.lock()).expect("Failed to commit")
    }

    /// Commits on this thread and returns the journal's verdict.
    pub fn try_commit(&self) -> sluice_core::JournalResult<Option<CommitReport>> {
        commit_once(&self.journal, &mut self.log.lock())
    }

    /// Writes checkpointable blocks home; returns how many were written.
    ///
    /// # Panics
    ///
    /// Panics on a device error.
    pub fn checkpoint(&self) -> usize {
        self.checkpointer
            .checkpoint(&self.journal)
            .expect("Failed to checkpoint")
    }

    /// Bytes of `blocknr` on the device.
    pub fn on_disk(&self, blocknr: BlockNr) -> Vec<u8> {
        let mut buf = vec![0; self.journal.device().block_size()];
        self.journal
            .device()
            .read_block(blocknr, &mut buf)
            .expect("Failed to read block");
        buf
    }

    /// Stops the daemon, returning how many commits it ran.
    pub fn stop_daemon(&mut self) -> u64 {
        self.daemon.take().map_or(0, CommitDaemon::shutdown)
    }
}

impl std::ops::Deref for TestJournal {
    type Target = Journal;

    fn deref(&self) -> &Self::Target {
        &self.journal
    }
}

/// Runs a test with a hand-committed memory journal.
///
/// # Example
///
/// ```rust,ignore
/// use sluice_testkit::with_journal;
///
/// #[test]
/// fn my_test() {
///     with_journal(|fixture| {
///         let handle = fixture.start_handle(1).unwrap();
///         fixture.stop(handle).unwrap();
///     });
/// }
/// ```
pub fn with_journal<F, R>(f: F) -> R
where
    F: FnOnce(&TestJournal) -> R,
{
    let fixture = TestJournal::manual();
    f(&fixture)
}

/// Runs a test with a daemon-committed memory journal.
pub fn with_daemon_journal<F, R>(f: F) -> R
where
    F: FnOnce(&TestJournal) -> R,
{
    let fixture = TestJournal::with_daemon();
    f(&fixture)
}

/// Runs a test with a hand-committed file journal.
pub fn with_file_journal<F, R>(f: F) -> R
where
    F: FnOnce(&TestJournal) -> R,
{
    let fixture = TestJournal::file();
    f(&fixture)
}

/// Starts a handle, takes write access to `blocknr`, fills it with `byte`
/// and marks it dirty.
///
/// # Panics
///
/// Panics if any step fails.
pub fn write_block(fixture: &TestJournal, blocknr: BlockNr, byte: u8) {
    let handle = fixture.start_handle(1).expect("Failed to start handle");
    let block = fixture.block(blocknr);
    fixture
        .get_write_access(&handle, &block)
        .expect("Failed to get write access");
    block.write(|data| data.fill(byte));
    fixture
        .mark_dirty(&handle, &block)
        .expect("Failed to mark dirty");
    fixture.stop(handle).expect("Failed to stop handle");
}
