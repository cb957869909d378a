//! End-to-end journal scenarios.

use sluice_blockdev::DeviceError;
use sluice_core::{ErrorKind, JournalConfig, JournalError, Role, TransactionId};
use sluice_testkit::init_tracing;
use sluice_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SETTLE: Duration = Duration::from_millis(100);

fn fill(fixture: &TestJournal, blocknr: u64) -> Vec<u8> {
    fixture.block(blocknr).read(<[u8]>::to_vec)
}

#[test]
fn second_handle_waits_for_full_transaction_to_commit() {
    init_tracing();
    let fixture = TestJournal::builder()
        .config(JournalConfig::default().max_transaction_credits(100))
        .build();

    let a = fixture.start_handle(60).unwrap();
    let first = a.transaction_id().unwrap();

    thread::scope(|scope| {
        let b = scope.spawn(|| fixture.start_handle(60).unwrap());
        thread::sleep(SETTLE);
        assert!(!b.is_finished(), "second handle must wait for room");
        assert_eq!(fixture.signal.requests(), vec![first]);

        fixture.stop(a).unwrap();
        let report = fixture.commit().unwrap();
        assert_eq!(report.tid, first);

        let b = b.join().unwrap();
        assert_eq!(b.transaction_id(), Some(first.next()));
        fixture.stop(b).unwrap();
    });
    assert!(fixture.stats().snapshot().admission_waits >= 1);
}

#[test]
fn committing_transaction_sees_frozen_bytes() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 1, 0x11);
    let block = fixture.block(1);

    let mut claim = fixture.begin_commit().unwrap().unwrap();
    let t1 = claim.tid();

    let handle = fixture.start_handle(1).unwrap();
    let t2 = handle.transaction_id().unwrap();
    fixture.get_write_access(&handle, &block).unwrap();
    assert_eq!(block.frozen_copy().as_deref(), Some(&[0x11; TEST_BLOCK_SIZE][..]));
    block.write(|data| data.fill(0x22));
    fixture.mark_dirty(&handle, &block).unwrap();
    assert_eq!(block.owner(), Some(t1));
    assert_eq!(block.next_owner(), Some(t2));

    let logged = claim.start_log_io(&block).unwrap();
    assert!(logged.iter().all(|&b| b == 0x11));
    claim.end_log_io(&block).unwrap();
    fixture.finish_commit(claim, Ok(())).unwrap();

    assert_eq!(block.owner(), Some(t2));
    assert_eq!(block.role(), Role::Metadata);
    assert!(block.frozen_copy().is_none());
    assert_eq!(fixture.stats().frozen_copies(), 1);

    fixture.stop(handle).unwrap();
    fixture.commit();
    fixture.checkpoint();
    assert_eq!(fixture.on_disk(1), vec![0x22; TEST_BLOCK_SIZE]);
}

#[test]
fn forgotten_block_never_reaches_the_log() {
    let fixture = TestJournal::manual();
    let handle = fixture.start_handle(1).unwrap();
    let block = fixture.block(2);
    fixture.get_write_access(&handle, &block).unwrap();
    block.write(|data| data.fill(0x33));
    fixture.mark_dirty(&handle, &block).unwrap();
    assert_eq!(handle.credits(), 0);

    fixture.forget(&handle, &block).unwrap();
    assert_eq!(handle.credits(), 1);
    assert_eq!(block.owner(), None);
    fixture.stop(handle).unwrap();

    let report = fixture.commit().unwrap();
    assert_eq!(report.metadata_blocks, 0);
    assert_eq!(fixture.checkpoint(), 0);
    assert_eq!(fixture.on_disk(2), vec![0; TEST_BLOCK_SIZE]);
}

#[test]
fn forget_during_commit_frees_block() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 3, 0x44);
    let block = fixture.block(3);

    let mut claim = fixture.begin_commit().unwrap().unwrap();
    let handle = fixture.start_handle(1).unwrap();
    fixture.forget(&handle, &block).unwrap();
    assert!(block.is_freed());

    for block in claim.blocks(Role::Metadata) {
        claim.start_log_io(&block).unwrap();
        claim.end_log_io(&block).unwrap();
    }
    fixture.finish_commit(claim, Ok(())).unwrap();

    assert!(!block.is_freed());
    assert!(!block.is_dirty());
    assert_eq!(block.checkpoint_transaction(), None);
    assert!(fixture.checkpointer.pending().is_empty());
    fixture.stop(handle).unwrap();
}

#[test]
fn barrier_blocks_new_handles() {
    let fixture = TestJournal::manual();
    thread::scope(|scope| {
        let guard = fixture.barrier();
        let waiter = scope.spawn(|| fixture.start_handle(1));
        thread::sleep(SETTLE);
        assert!(!waiter.is_finished(), "admission must wait for the barrier");
        drop(guard);
        let handle = waiter.join().unwrap().unwrap();
        fixture.stop(handle).unwrap();
    });
    assert_eq!(fixture.barrier_count(), 0);
}

#[test]
fn barrier_waits_for_running_handles() {
    let fixture = TestJournal::manual();
    let handle = fixture.start_handle(1).unwrap();
    thread::scope(|scope| {
        let raiser = scope.spawn(|| fixture.raise_barrier());
        thread::sleep(SETTLE);
        assert!(!raiser.is_finished(), "barrier must wait for open handles");
        fixture.stop(handle).unwrap();
        raiser.join().unwrap();
    });
    assert_eq!(fixture.barrier_count(), 1);
    fixture.lower_barrier().unwrap();
    assert!(fixture.lower_barrier().is_err());
}

#[test]
fn abort_fails_everything_fast() {
    let fixture = TestJournal::manual();
    let handle = fixture.start_handle(2).unwrap();
    let block = fixture.block(5);

    thread::scope(|scope| {
        // Blocks: the running transaction has no room for a full handle.
        let waiter = scope.spawn(|| fixture.start_handle(64));
        thread::sleep(SETTLE);
        assert!(!waiter.is_finished());
        fixture.abort(JournalError::from(DeviceError::Injected { blocknr: 5 }));
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    });

    assert!(fixture.is_aborted());
    assert_eq!(
        fixture.abort_error().map(|e| e.kind()),
        Some(ErrorKind::IoFailure)
    );
    assert_eq!(
        fixture.get_write_access(&handle, &block).unwrap_err().kind(),
        ErrorKind::Aborted
    );
    assert_eq!(fixture.start_handle(1).unwrap_err().kind(), ErrorKind::Aborted);
    assert_eq!(fixture.stop(handle).unwrap_err().kind(), ErrorKind::Aborted);
    assert!(fixture.try_commit().is_err());
}

#[test]
fn abort_wakes_writer_waiting_for_log_io() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 4, 0x66);
    let block = fixture.block(4);

    let mut claim = fixture.begin_commit().unwrap().unwrap();
    claim.start_log_io(&block).unwrap();
    assert_eq!(block.role(), Role::Shadow);

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let handle = fixture.start_handle(1).unwrap();
            let result = fixture.get_write_access(&handle, &block);
            drop(handle);
            result
        });
        thread::sleep(SETTLE);
        assert!(!writer.is_finished(), "writer must wait for the log write");

        fixture.abort(JournalError::from(DeviceError::Injected { blocknr: 4 }));
        let err = writer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    });

    let err = fixture.finish_commit(claim, Ok(())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert_ne!(block.role(), Role::Shadow);
}

#[test]
fn abort_wakes_admission_behind_barrier() {
    let fixture = TestJournal::manual();
    let guard = fixture.barrier();

    thread::scope(|scope| {
        let waiter = scope.spawn(|| fixture.start_handle(1));
        thread::sleep(SETTLE);
        assert!(!waiter.is_finished(), "admission must wait for the barrier");

        fixture.abort(JournalError::from(DeviceError::Injected { blocknr: 0 }));
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    });

    assert_eq!(fixture.barrier_count(), 1);
    drop(guard);
    assert_eq!(fixture.barrier_count(), 0);
}

#[test]
fn failed_log_write_aborts_journal() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 6, 0x55);
    fixture.memory().fail_writes(fixture.log_area().start(), true);

    let err = fixture.try_commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert!(fixture.is_aborted());
    assert_eq!(
        fixture.abort_error().map(|e| e.kind()),
        Some(ErrorKind::IoFailure)
    );
    assert_eq!(fixture.commit_sequence(), TransactionId::default());
}

#[test]
fn writer_waits_for_log_io() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 4, 0x66);
    let block = fixture.block(4);

    let mut claim = fixture.begin_commit().unwrap().unwrap();
    claim.start_log_io(&block).unwrap();
    assert_eq!(block.role(), Role::Shadow);

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let handle = fixture.start_handle(1).unwrap();
            fixture.get_write_access(&handle, &block).unwrap();
            handle
        });
        thread::sleep(SETTLE);
        assert!(!writer.is_finished(), "writer must wait for the log write");

        claim.end_log_io(&block).unwrap();
        let handle = writer.join().unwrap();
        let t2 = handle.transaction_id();
        assert_eq!(block.next_owner(), t2);

        fixture.finish_commit(claim, Ok(())).unwrap();
        assert_eq!(block.owner(), t2);
        assert_eq!(block.role(), Role::Reserved);
        fixture.stop(handle).unwrap();
    });
    assert_eq!(fixture.stats().snapshot().shadow_waits, 1);
}

#[test]
fn copy_allocation_backs_off_and_recovers() {
    let allocator = Arc::new(FlakyAllocator::new(2));
    let fixture = TestJournal::builder()
        .config(
            JournalConfig::default()
                .max_transaction_credits(64)
                .log_blocks(1024)
                .reserved_log_blocks(8)
                .alloc_retry(5, Duration::from_millis(1)),
        )
        .allocator(allocator.clone())
        .build();
    write_block(&fixture, 7, 0x77);
    let block = fixture.block(7);
    let claim = fixture.begin_commit().unwrap().unwrap();

    let handle = fixture.start_handle(1).unwrap();
    fixture.get_write_access(&handle, &block).unwrap();
    assert!(block.frozen_copy().is_some());
    assert_eq!(allocator.calls(), 3);
    assert_eq!(fixture.stats().snapshot().alloc_retries, 2);

    fixture.stop(handle).unwrap();
    fixture.finish_commit(claim, Ok(())).unwrap();
}

#[test]
fn copy_allocation_gives_up() {
    let allocator = Arc::new(FlakyAllocator::exhausted());
    let fixture = TestJournal::builder()
        .config(
            JournalConfig::default()
                .max_transaction_credits(64)
                .log_blocks(1024)
                .reserved_log_blocks(8)
                .alloc_retry(3, Duration::from_millis(1)),
        )
        .allocator(allocator.clone())
        .build();
    write_block(&fixture, 7, 0x77);
    let block = fixture.block(7);
    let claim = fixture.begin_commit().unwrap().unwrap();

    let handle = fixture.start_handle(1).unwrap();
    let err = fixture.get_write_access(&handle, &block).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(allocator.calls(), 3);
    assert!(block.frozen_copy().is_none());
    assert_eq!(block.next_owner(), None);
    assert!(!fixture.is_aborted());

    fixture.stop(handle).unwrap();
    fixture.finish_commit(claim, Ok(())).unwrap();
}

#[test]
fn sync_stop_waits_for_daemon_commit() {
    let fixture = TestJournal::with_daemon();
    let handle = fixture.start_handle(1).unwrap();
    let tid = handle.transaction_id().unwrap();
    let block = fixture.block(8);
    fixture.get_write_access(&handle, &block).unwrap();
    block.write(|data| data.fill(0x88));
    fixture.mark_dirty(&handle, &block).unwrap();
    handle.set_sync(true);
    fixture.stop(handle).unwrap();

    assert!(fixture.commit_sequence() >= tid);
    assert!(fixture.checkpointer.committed().contains(&tid));
}

#[test]
fn force_commit_and_close_with_daemon() {
    let fixture = TestJournal::with_daemon();
    write_block(&fixture, 9, 0x99);
    let tid = fixture.running_transaction().unwrap().tid();

    fixture.force_commit().unwrap();
    assert_eq!(fixture.commit_sequence(), tid);

    write_block(&fixture, 10, 0xAA);
    fixture.close().unwrap();
    assert!(fixture.is_closed());
    assert_eq!(fixture.commit_sequence(), tid.next());
    assert_eq!(
        fixture.start_handle(1).unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );
}

#[test]
fn force_commit_needs_an_engine() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 1, 1);
    assert_eq!(
        fixture.force_commit().unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );
}

#[test]
fn admission_reclaims_log_space_through_checkpoint() {
    let fixture = TestJournal::builder()
        .config(
            JournalConfig::default()
                .max_transaction_credits(16)
                .log_blocks(40)
                .reserved_log_blocks(8),
        )
        .auto_checkpoint()
        .build();

    for round in 0..10u8 {
        let handle = fixture.start_handle(4).unwrap();
        for blocknr in 0..4 {
            let block = fixture.block(blocknr);
            fixture.get_write_access(&handle, &block).unwrap();
            block.write(|data| data.fill(round));
            fixture.mark_dirty(&handle, &block).unwrap();
        }
        fixture.stop(handle).unwrap();
        let report = fixture.commit().unwrap();
        assert_eq!(report.metadata_blocks, 4);
    }

    assert!(fixture.checkpointer.space_requests() > 0);
    assert!(fixture.stats().snapshot().space_waits > 0);
    fixture.checkpoint();
    for blocknr in 0..4 {
        assert_eq!(fixture.on_disk(blocknr), vec![9; TEST_BLOCK_SIZE]);
    }
    assert_eq!(fixture.free_log_blocks(), 40);
}

#[test]
fn ordered_data_is_written_home_by_commit() {
    let fixture = TestJournal::manual();
    let handle = fixture.start_handle(1).unwrap();
    let block = fixture.block(11);
    fixture.file_sync_data(&handle, &block).unwrap();
    block.write(|data| data.fill(0xBB));
    block.set_dirty();
    fixture.stop(handle).unwrap();

    let report = fixture.commit().unwrap();
    assert_eq!(report.data_blocks, 1);
    assert_eq!(report.metadata_blocks, 0);
    assert_eq!(fixture.on_disk(11), vec![0xBB; TEST_BLOCK_SIZE]);
    assert!(!block.is_dirty());
    assert_eq!(block.owner(), None);
}

#[test]
fn write_access_cancels_revokes() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 12, 1);
    let tid = fixture.running_transaction().unwrap().tid();
    assert_eq!(fixture.revokes.cancelled(), vec![(tid, 12)]);
}

#[test]
fn undo_access_keeps_committed_bytes() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 13, 0x10);
    fixture.commit();

    let handle = fixture.start_handle(1).unwrap();
    let block = fixture.block(13);
    fixture.get_undo_access(&handle, &block).unwrap();
    block.write(|data| data.fill(0x20));
    fixture.mark_dirty(&handle, &block).unwrap();
    assert_eq!(
        block.committed_copy().as_deref(),
        Some(&[0x10; TEST_BLOCK_SIZE][..])
    );
    assert_eq!(fill(&fixture, 13), vec![0x20; TEST_BLOCK_SIZE]);
    assert_eq!(
        fixture.forget(&handle, &block).unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );
    fixture.stop(handle).unwrap();
}

#[test]
fn released_descriptor_is_replaced() {
    let fixture = TestJournal::manual();
    write_block(&fixture, 14, 0x14);
    let block = fixture.block(14);
    assert!(!fixture.try_release(&block));

    fixture.commit();
    fixture.checkpoint();
    assert!(fixture.try_release(&block));

    let handle = fixture.start_handle(1).unwrap();
    assert_eq!(
        fixture.get_write_access(&handle, &block).unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );
    let fresh = fixture.block(14);
    assert!(!Arc::ptr_eq(&fresh, &block));
    fixture.get_write_access(&handle, &fresh).unwrap();
    assert_eq!(fill(&fixture, 14), vec![0x14; TEST_BLOCK_SIZE]);
    fixture.stop(handle).unwrap();
}

#[test]
fn file_backed_journal_round_trip() {
    with_file_journal(|fixture| {
        write_block(fixture, 15, 0xCC);
        fixture.commit().unwrap();
        assert_eq!(fixture.on_disk(15), vec![0; TEST_BLOCK_SIZE]);
        assert_eq!(fixture.checkpoint(), 1);
        assert_eq!(fixture.on_disk(15), vec![0xCC; TEST_BLOCK_SIZE]);
    });
}

#[test]
fn concurrent_updates_stay_consistent() {
    init_tracing();
    let mut fixture = TestJournal::builder().daemon().auto_checkpoint().build();
    let config = StressConfig::quick();
    let result = stress_concurrent_updates(&fixture, &config);
    result.print_summary("concurrent updates");
    assert_eq!(result.failed_ops, 0);

    fixture.force_commit().unwrap();
    fixture.stop_daemon();
    assert_consistent(check_quiescent(&fixture));
    assert_consistent(check_membership(&fixture, 0..config.block_count));
    assert_eq!(
        fixture.stats().handles_started(),
        (config.threads * config.operations) as u64
    );
}

#[test]
fn updates_survive_barrier_churn() {
    let mut fixture = TestJournal::builder().daemon().auto_checkpoint().build();
    let config = StressConfig {
        operations: 50,
        ..StressConfig::quick()
    };
    let result = stress_updates_with_barriers(&fixture, &config);
    assert_eq!(result.failed_ops, 0);

    fixture.force_commit().unwrap();
    fixture.stop_daemon();
    assert_consistent(check_quiescent(&fixture));
    assert!(fixture.stats().snapshot().barriers_raised > 0);
}
