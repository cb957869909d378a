//! A reference commit engine.
//!
//! [`commit_once`] performs one full commit against a [`LogArea`] on the
//! journal's own device. [`CommitDaemon`] runs it on a background thread,
//! woken by a [`CommitSignal`] registered as the journal's commit engine.

use parking_lot::{Condvar, Mutex};
use sluice_blockdev::{BlockNr, DeviceError, DeviceResult};
use sluice_core::{CommitEngine, Journal, JournalError, JournalResult, Role, TransactionId};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A ring of device blocks that receives logged metadata.
#[derive(Debug, Clone)]
pub struct LogArea {
    start: BlockNr,
    len: u64,
    cursor: u64,
}

impl LogArea {
    /// Log ring of `len` blocks starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub fn new(start: BlockNr, len: u64) -> Self {
        assert!(len > 0, "log area must not be empty");
        Self {
            start,
            len,
            cursor: 0,
        }
    }

    /// First block of the ring.
    pub fn start(&self) -> BlockNr {
        self.start
    }

    /// Ring length in blocks.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always `false`; a log area holds at least one block.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `blocknr` lies inside the ring.
    pub fn contains(&self, blocknr: BlockNr) -> bool {
        blocknr >= self.start && blocknr < self.start + self.len
    }

    /// Next ring slot.
    pub fn next_block(&mut self) -> BlockNr {
        let blocknr = self.start + self.cursor % self.len;
        self.cursor += 1;
        blocknr
    }
}

/// Result of one [`commit_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    /// Committed transaction.
    pub tid: TransactionId,
    /// Ordered data blocks written home.
    pub data_blocks: usize,
    /// Metadata blocks written to the log.
    pub metadata_blocks: usize,
}

/// Commits the running transaction, if any.
///
/// Ordered data goes home first, then metadata goes to `log`, followed by a
/// commit block naming the transaction, then a device flush. The first
/// device error fails the commit and aborts the journal.
///
/// # Errors
///
/// Whatever [`Journal::begin_commit`] or [`Journal::finish_commit`] returns.
pub fn commit_once(journal: &Journal, log: &mut LogArea) -> JournalResult<Option<CommitReport>> {
    let Some(mut claim) = journal.begin_commit()? else {
        return Ok(None);
    };
    let tid = claim.tid();
    let device = Arc::clone(journal.device());
    let mut report = CommitReport {
        tid,
        data_blocks: 0,
        metadata_blocks: 0,
    };
    let mut failure: Option<DeviceError> = None;
    let mut note = |result: DeviceResult<()>| {
        if let Err(err) = result {
            failure.get_or_insert(err);
        }
    };

    let walk = claim.walk();
    for (role, block) in walk {
        match role {
            Role::SyncData => {
                let step = claim.start_data_io(&block).and_then(|bytes| {
                    note(device.write_block(block.blocknr(), &bytes));
                    claim.end_data_io(&block)
                });
                note(step.map_err(engine_error));
                report.data_blocks += 1;
            }
            Role::Metadata => {
                let target = log.next_block();
                let step = claim.start_log_io(&block).and_then(|bytes| {
                    note(device.write_block(target, &bytes));
                    claim.end_log_io(&block)
                });
                note(step.map_err(engine_error));
                report.metadata_blocks += 1;
            }
            _ => {}
        }
    }

    let commit_block = journal
        .get_block(log.next_block())
        .and_then(|block| {
            claim.file_log_control(&block)?;
            let record = block.write(|data| {
                let stamp = tid.as_u64().to_le_bytes();
                let n = stamp.len().min(data.len());
                data.fill(0);
                data[..n].copy_from_slice(&stamp[..n]);
                data.to_vec()
            });
            Ok((block.blocknr(), record))
        });
    match commit_block {
        Ok((blocknr, record)) => note(device.write_block(blocknr, &record)),
        Err(err) => note(Err(engine_error(err))),
    }
    note(device.flush());

    let outcome = failure.map_or(Ok(()), Err);
    trace!(%tid, logged = claim.logged_blocks(), failed = outcome.is_err(), "commit written");
    journal.finish_commit(claim, outcome)?;
    Ok(Some(report))
}

fn engine_error(err: JournalError) -> DeviceError {
    DeviceError::Io(io::Error::other(err.to_string()))
}

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
    requests: Vec<TransactionId>,
}

/// Why [`CommitSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A commit was requested.
    Requested,
    /// The poll interval elapsed.
    Timeout,
    /// The daemon should exit.
    Shutdown,
}

/// Commit engine that records requests and wakes a waiting committer.
#[derive(Debug)]
pub struct CommitSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
    attached: bool,
}

impl CommitSignal {
    /// A signal serviced by a [`CommitDaemon`].
    pub fn attached() -> Self {
        Self::new(true)
    }

    /// A signal nobody services; tests commit by hand.
    pub fn detached() -> Self {
        Self::new(false)
    }

    fn new(attached: bool) -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
            attached,
        }
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<TransactionId> {
        self.state.lock().requests.clone()
    }

    /// Waits up to `timeout` for a request or shutdown.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.pending && !state.shutdown {
            let _ = self.cond.wait_for(&mut state, timeout);
        }
        if state.shutdown {
            Wake::Shutdown
        } else if std::mem::take(&mut state.pending) {
            Wake::Requested
        } else {
            Wake::Timeout
        }
    }

    /// Tells the waiter to exit.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}

impl CommitEngine for CommitSignal {
    fn commit_requested(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        state.pending = true;
        state.requests.push(tid);
        self.cond.notify_all();
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Background thread committing on request and on commit-interval expiry.
///
/// Stops when dropped.
pub struct CommitDaemon {
    signal: Arc<CommitSignal>,
    thread: Option<JoinHandle<u64>>,
}

impl CommitDaemon {
    /// Starts the daemon.
    ///
    /// `signal` must be the commit engine `journal` was opened with.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn spawn(
        journal: Arc<Journal>,
        signal: Arc<CommitSignal>,
        mut log: LogArea,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let wake = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("sluice-commit".into())
            .spawn(move || {
                let mut commits = 0;
                loop {
                    let woke = wake.wait(poll_interval);
                    if woke == Wake::Shutdown {
                        break;
                    }
                    if journal.is_aborted() {
                        continue;
                    }
                    if woke == Wake::Timeout && journal.expired_transaction().is_none() {
                        continue;
                    }
                    match commit_once(&journal, &mut log) {
                        Ok(Some(report)) => {
                            commits += 1;
                            trace!(tid = %report.tid, "daemon committed");
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%err, "daemon commit failed"),
                    }
                }
                debug!(commits, "commit daemon stopped");
                commits
            })?;
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Stops the daemon and returns how many commits it ran.
    pub fn shutdown(mut self) -> u64 {
        self.stop()
    }

    fn stop(&mut self) -> u64 {
        self.signal.shutdown();
        self.thread
            .take()
            .and_then(|thread| thread.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for CommitDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CommitDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitDaemon")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_area_wraps() {
        let mut log = LogArea::new(10, 3);
        let slots: Vec<_> = (0..5).map(|_| log.next_block()).collect();
        assert_eq!(slots, vec![10, 11, 12, 10, 11]);
        assert!(log.contains(12));
        assert!(!log.contains(13));
    }

    #[test]
    fn signal_reports_requests_once() {
        let signal = CommitSignal::attached();
        signal.commit_requested(TransactionId::new(4));
        assert_eq!(signal.wait(Duration::from_millis(1)), Wake::Requested);
        assert_eq!(signal.wait(Duration::from_millis(1)), Wake::Timeout);
        assert_eq!(signal.requests(), vec![TransactionId::new(4)]);

        signal.shutdown();
        assert_eq!(signal.wait(Duration::from_secs(5)), Wake::Shutdown);
    }

    #[test]
    fn detached_signal_is_not_attached() {
        assert!(!CommitSignal::detached().is_attached());
        assert!(CommitSignal::attached().is_attached());
    }
}
