//! Transactions.

use crate::lists::TransactionLists;
use crate::types::{Role, TransactionId, TransactionState};
use parking_lot::{Condvar, Mutex};
use sluice_blockdev::BlockNr;
use std::fmt;
use std::time::{Duration, Instant};

/// Credit accounting guarded by the per-transaction handle lock.
#[derive(Debug, Default)]
pub(crate) struct HandleAccount {
    pub(crate) outstanding_credits: u32,
    /// Credits kept by handles that have stopped or restarted.
    pub(crate) consumed_credits: u32,
    pub(crate) handle_count: u32,
    pub(crate) handles_started: u64,
}

/// One commit epoch.
///
/// A transaction groups the updates of every handle admitted while it was
/// running. It is shared as `Arc<Transaction>` between the journal, the
/// handles bound to it and the blocks it holds.
pub struct Transaction {
    tid: TransactionId,
    start_time: Instant,
    expires: Instant,
    state: Mutex<TransactionState>,
    pub(crate) account: Mutex<HandleAccount>,
    /// Signalled when `handle_count` drops to zero.
    updates_done: Condvar,
    pub(crate) lists: Mutex<TransactionLists>,
}

impl Transaction {
    pub(crate) fn new(tid: TransactionId, commit_interval: Duration) -> Self {
        let start_time = Instant::now();
        Self {
            tid,
            start_time,
            expires: start_time + commit_interval,
            state: Mutex::new(TransactionState::Running),
            account: Mutex::new(HandleAccount::default()),
            updates_done: Condvar::new(),
            lists: Mutex::new(TransactionLists::default()),
        }
    }

    /// Transaction ID.
    #[must_use]
    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    /// When the transaction was created.
    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// When a stopping handle should request this transaction's commit.
    #[must_use]
    pub fn expires(&self) -> Instant {
        self.expires
    }

    /// Whether the commit interval has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Credits reserved by live handles plus credits consumed by stopped ones.
    #[must_use]
    pub fn outstanding_credits(&self) -> u32 {
        self.account.lock().outstanding_credits
    }

    /// Credits consumed by handles no longer bound to this transaction.
    ///
    /// `outstanding_credits` equals this plus the reservations of the live
    /// handles.
    #[must_use]
    pub fn consumed_credits(&self) -> u32 {
        self.account.lock().consumed_credits
    }

    /// Live handles bound to this transaction.
    #[must_use]
    pub fn handle_count(&self) -> u32 {
        self.account.lock().handle_count
    }

    /// Handles ever admitted into this transaction.
    #[must_use]
    pub fn handles_started(&self) -> u64 {
        self.account.lock().handles_started
    }

    /// Blocks filed under `role`, in filing order.
    #[must_use]
    pub fn blocks(&self, role: Role) -> Vec<BlockNr> {
        self.lists.lock().blocks(role)
    }

    /// Role `blocknr` is filed under, if it belongs to this transaction.
    #[must_use]
    pub fn role_of(&self, blocknr: BlockNr) -> Option<Role> {
        self.lists.lock().role_of(blocknr)
    }

    /// Number of blocks in the metadata list.
    #[must_use]
    pub fn nr_metadata(&self) -> usize {
        self.lists.lock().nr_metadata()
    }

    /// Number of blocks across all lists.
    #[must_use]
    pub fn nr_blocks(&self) -> usize {
        self.lists.lock().total()
    }

    /// Returns a stopped handle's unused credits and drops its update count.
    ///
    /// Returns the outstanding credits left afterwards.
    pub(crate) fn release_handle(&self, reserved: u32, unused: u32) -> u32 {
        let mut account = self.account.lock();
        account.outstanding_credits = account.outstanding_credits.saturating_sub(unused);
        account.consumed_credits = account
            .consumed_credits
            .saturating_add(reserved.saturating_sub(unused));
        account.handle_count = account.handle_count.saturating_sub(1);
        if account.handle_count == 0 {
            self.updates_done.notify_all();
        }
        account.outstanding_credits
    }

    /// Blocks until no handle is bound to this transaction.
    pub(crate) fn wait_for_updates(&self) {
        let mut account = self.account.lock();
        while account.handle_count > 0 {
            self.updates_done.wait(&mut account);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let account = self.account.lock();
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("state", &*self.state.lock())
            .field("outstanding_credits", &account.outstanding_credits)
            .field("handle_count", &account.handle_count)
            .finish_non_exhaustive()
    }
}
