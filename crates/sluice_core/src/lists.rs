//! Per-transaction role lists and the filing engine.
//!
//! Every tracked block sits in at most one list of at most one transaction.
//! The functions here are the only code that moves blocks between lists;
//! they run with the block lock held and take the owning transaction's list
//! lock internally, so list linkage and the block's `owner`/`role` fields
//! always change together.

use crate::block::BlockState;
use crate::transaction::Transaction;
use crate::types::Role;
use sluice_blockdev::BlockNr;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Blocks of one role, in insertion order.
#[derive(Debug, Default)]
pub(crate) struct RoleList {
    order: BTreeMap<u64, BlockNr>,
    index: HashMap<BlockNr, u64>,
    next_seq: u64,
}

impl RoleList {
    fn insert(&mut self, blocknr: BlockNr) -> bool {
        if self.index.contains_key(&blocknr) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, blocknr);
        self.index.insert(blocknr, seq);
        true
    }

    fn remove(&mut self, blocknr: BlockNr) -> bool {
        match self.index.remove(&blocknr) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn contains(&self, blocknr: BlockNr) -> bool {
        self.index.contains_key(&blocknr)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn iter(&self) -> impl Iterator<Item = BlockNr> + '_ {
        self.order.values().copied()
    }
}

/// The role lists of one transaction.
#[derive(Debug, Default)]
pub(crate) struct TransactionLists {
    lists: [RoleList; 8],
    nr_metadata: usize,
}

impl TransactionLists {
    pub(crate) fn link(&mut self, role: Role, blocknr: BlockNr) {
        let Some(idx) = role.list_index() else {
            return;
        };
        if self.lists[idx].insert(blocknr) && role == Role::Metadata {
            self.nr_metadata += 1;
        }
    }

    pub(crate) fn unlink(&mut self, role: Role, blocknr: BlockNr) -> bool {
        let Some(idx) = role.list_index() else {
            return false;
        };
        let removed = self.lists[idx].remove(blocknr);
        if removed && role == Role::Metadata {
            self.nr_metadata -= 1;
        }
        removed
    }

    pub(crate) fn blocks(&self, role: Role) -> Vec<BlockNr> {
        role.list_index()
            .map(|idx| self.lists[idx].iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn role_of(&self, blocknr: BlockNr) -> Option<Role> {
        Role::LISTED.into_iter().find(|role| {
            role.list_index()
                .is_some_and(|idx| self.lists[idx].contains(blocknr))
        })
    }

    pub(crate) fn len(&self, role: Role) -> usize {
        role.list_index().map_or(0, |idx| self.lists[idx].len())
    }

    pub(crate) fn total(&self) -> usize {
        self.lists.iter().map(RoleList::len).sum()
    }

    pub(crate) fn nr_metadata(&self) -> usize {
        self.nr_metadata
    }
}

/// Removes the block from its owner's list without clearing ownership.
///
/// Log-side dirtiness goes back to the page cache, or is dropped if the
/// journal has aborted.
fn temp_unlink(blocknr: BlockNr, state: &mut BlockState, aborted: bool) {
    if let Some(owner) = &state.owner {
        owner.lists.lock().unlink(state.role, blocknr);
    }
    state.role = Role::None;
    if aborted {
        state.journal_dirty = false;
    } else if state.journal_dirty {
        state.journal_dirty = false;
        state.dirty = true;
    }
}

/// Files the block into `transaction`'s list for `role`.
pub(crate) fn file(
    blocknr: BlockNr,
    state: &mut BlockState,
    transaction: &Arc<Transaction>,
    role: Role,
    aborted: bool,
) {
    if state.is_owned_by(transaction) && state.role == role {
        return;
    }

    let mut was_dirty = false;
    if role.is_log_tracked() {
        was_dirty = state.dirty || state.journal_dirty;
        state.dirty = false;
        state.journal_dirty = false;
    }

    if state.owner.is_some() {
        temp_unlink(blocknr, state, aborted);
    }

    transaction.lists.lock().link(role, blocknr);
    state.owner = Some(Arc::clone(transaction));
    state.role = role;

    if was_dirty {
        state.journal_dirty = true;
    }
}

/// Removes the block from all journal lists.
pub(crate) fn unfile(blocknr: BlockNr, state: &mut BlockState, aborted: bool) {
    temp_unlink(blocknr, state, aborted);
    state.owner = None;
    state.ordered = false;
}

/// Hands the block to its next transaction, or unfiles it if there is none.
pub(crate) fn refile(blocknr: BlockNr, state: &mut BlockState, aborted: bool) {
    let Some(next) = state.next.take() else {
        unfile(blocknr, state, aborted);
        return;
    };

    let was_dirty = state.journal_dirty;
    state.journal_dirty = false;
    temp_unlink(blocknr, state, aborted);

    let role = if state.freed {
        Role::Forget
    } else if state.ordered {
        Role::SyncData
    } else if state.modified {
        Role::Metadata
    } else {
        Role::Reserved
    };
    state.owner = None;
    file(blocknr, state, &next, role, aborted);

    if was_dirty && !aborted {
        state.journal_dirty = true;
    }
}
