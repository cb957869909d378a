//! Property tests: random operation scripts against a hand-committed journal.

use proptest::prelude::*;
use sluice_testkit::prelude::*;

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn scripts_leave_the_device_matching_the_model(ops in journal_script_strategy(8, 1, 40)) {
        let fixture = TestJournal::manual();
        let model = run_script(&fixture, &ops).unwrap();

        for (blocknr, expected) in model {
            if let Some(byte) = expected {
                let disk = fixture.on_disk(blocknr);
                prop_assert!(
                    disk.iter().all(|&b| b == byte),
                    "block {} should hold {:#x}", blocknr, byte
                );
            }
        }
        assert_consistent(check_quiescent(&fixture));
        assert_consistent(check_membership(&fixture, 0..8));
        prop_assert!(fixture.checkpointer.pending().is_empty());
        prop_assert_eq!(fixture.free_log_blocks(), fixture.config().log_blocks);
    }

    #[test]
    fn stopped_handles_release_unused_credits(credits in credits_strategy(64), used in 0u32..8) {
        let fixture = TestJournal::manual();
        let used = used.min(credits);
        let handle = fixture.start_handle(credits).unwrap();
        let running = fixture.running_transaction().unwrap();
        prop_assert_eq!(running.outstanding_credits(), credits);

        for blocknr in 0..u64::from(used) {
            let block = fixture.block(blocknr);
            fixture.get_write_access(&handle, &block).unwrap();
            fixture.mark_dirty(&handle, &block).unwrap();
        }
        prop_assert_eq!(handle.credits(), credits - used);
        assert_consistent(check_credits(&fixture, &running, &[&handle]));

        fixture.stop(handle).unwrap();
        prop_assert_eq!(running.outstanding_credits(), used);
        prop_assert_eq!(running.handle_count(), 0);
        prop_assert_eq!(running.consumed_credits(), used);
        assert_consistent(check_credits(&fixture, &running, &[]));
    }
}
