//! Consistency checks over a journal.
//!
//! Each check returns a list of human-readable violations; an empty list
//! means the journal is consistent. Run them while no other thread is
//! touching the journal.

use sluice_blockdev::BlockNr;
use sluice_core::{Handle, Journal, Role, Transaction};
use std::sync::Arc;

/// Every block sits in at most one list, and that list matches the block's
/// owner and role.
pub fn check_membership(
    journal: &Journal,
    blocknrs: impl IntoIterator<Item = BlockNr>,
) -> Vec<String> {
    let transactions: Vec<Arc<Transaction>> = journal
        .running_transaction()
        .into_iter()
        .chain(journal.committing_transaction())
        .collect();
    let mut violations = Vec::new();

    for blocknr in blocknrs {
        let Ok(block) = journal.get_block(blocknr) else {
            violations.push(format!("block {blocknr} is past the device"));
            continue;
        };
        let owner = block.owner();
        let role = block.role();

        if owner.is_none() && role != Role::None {
            violations.push(format!("block {blocknr} has role {role} but no owner"));
        }
        if let Some(tid) = owner {
            if !transactions.iter().any(|t| t.tid() == tid) {
                violations.push(format!("block {blocknr} is owned by retired {tid}"));
            }
        }
        for transaction in &transactions {
            let listed = transaction.role_of(blocknr);
            let expected = (owner == Some(transaction.tid())).then_some(role);
            if listed != expected {
                violations.push(format!(
                    "block {blocknr}: {} lists it as {listed:?}, block says {expected:?}",
                    transaction.tid()
                ));
            }
        }
        if let Some(next) = block.next_owner() {
            if owner.is_none() {
                violations.push(format!("block {blocknr} waits for {next} without an owner"));
            }
            if owner == Some(next) {
                violations.push(format!("block {blocknr} has {next} as owner and next"));
            }
        }
    }
    violations
}

/// Credit accounting of `transaction` against its `live` handles.
///
/// Outstanding credits must equal the reservations of the live handles plus
/// what stopped handles consumed.
///
/// `live` must hold one entry per started handle still bound to the
/// transaction; nested references count once.
pub fn check_credits(journal: &Journal, transaction: &Transaction, live: &[&Handle]) -> Vec<String> {
    let mut violations = Vec::new();
    let tid = transaction.tid();
    let outstanding = transaction.outstanding_credits();
    let max = journal.config().max_transaction_credits;

    if outstanding > max {
        violations.push(format!("{tid} holds {outstanding} credits, max is {max}"));
    }
    let bound: Vec<_> = live
        .iter()
        .filter(|h| h.transaction_id() == Some(tid))
        .collect();
    if transaction.handle_count() as usize != bound.len() {
        violations.push(format!(
            "{tid} counts {} handles, {} are live",
            transaction.handle_count(),
            bound.len()
        ));
    }
    let reserved: u64 = bound.iter().map(|h| u64::from(h.reserved_credits())).sum();
    let consumed = transaction.consumed_credits();
    if reserved + u64::from(consumed) != u64::from(outstanding) {
        violations.push(format!(
            "{tid} holds {outstanding} credits; live handles reserve {reserved}, stopped ones consumed {consumed}"
        ));
    }
    for handle in bound {
        if handle.credits() > handle.reserved_credits() {
            violations.push(format!(
                "handle in {tid} has {} credits of {} reserved",
                handle.credits(),
                handle.reserved_credits()
            ));
        }
    }
    violations
}

/// Nothing committing, no barrier, no handle open.
pub fn check_quiescent(journal: &Journal) -> Vec<String> {
    let mut violations = Vec::new();
    if let Some(committing) = journal.committing_transaction() {
        violations.push(format!("{} is still committing", committing.tid()));
    }
    if journal.barrier_count() > 0 {
        violations.push(format!("{} barriers raised", journal.barrier_count()));
    }
    if let Some(running) = journal.running_transaction() {
        if running.handle_count() > 0 {
            violations.push(format!(
                "{} has {} open handles",
                running.tid(),
                running.handle_count()
            ));
        }
    }
    let stats = journal.stats();
    if stats.handles_started() != stats.handles_stopped() {
        violations.push(format!(
            "{} handles started, {} stopped",
            stats.handles_started(),
            stats.handles_stopped()
        ));
    }
    violations
}

/// Panics with every violation found.
///
/// # Panics
///
/// If `violations` is not empty.
#[track_caller]
pub fn assert_consistent(violations: Vec<String>) {
    assert!(
        violations.is_empty(),
        "journal inconsistent:\n  {}",
        violations.join("\n  ")
    );
}
