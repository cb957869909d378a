//! Property-based test generators.
//!
//! Provides proptest strategies for credit counts and journal operation
//! scripts, and a runner that replays a script against a fixture while
//! tracking the bytes each block should end up with on disk.

use crate::fixtures::TestJournal;
use crate::invariants::{assert_consistent, check_membership};
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use sluice_blockdev::BlockNr;
use sluice_core::{ErrorKind, JournalResult};
use std::collections::BTreeMap;

/// Strategy for a credit request between 1 and `max`.
pub fn credits_strategy(max: u32) -> impl Strategy<Value = u32> {
    1..=max
}

/// Strategy for a block number below `blocks`.
pub fn blocknr_strategy(blocks: u64) -> impl Strategy<Value = BlockNr> {
    0..blocks
}

/// One step of a journal script.
#[derive(Debug, Clone)]
pub enum JournalOp {
    /// One handle rewrites several blocks.
    Update {
        /// Distinct blocks to rewrite.
        blocks: Vec<BlockNr>,
        /// Fill byte.
        byte: u8,
    },
    /// Rewrite one block under undo access.
    Undo {
        /// Block to rewrite.
        block: BlockNr,
        /// Fill byte.
        byte: u8,
    },
    /// Overwrite one block without reading it.
    Create {
        /// Block to overwrite.
        block: BlockNr,
        /// Fill byte.
        byte: u8,
    },
    /// Write one block as ordered data.
    OrderedData {
        /// Block to write.
        block: BlockNr,
        /// Fill byte.
        byte: u8,
    },
    /// Delete one block.
    Forget {
        /// Block to forget.
        block: BlockNr,
    },
    /// Commit the running transaction.
    Commit,
    /// Write committed blocks home.
    Checkpoint,
}

/// Strategy for one operation on blocks below `blocks`.
pub fn journal_op_strategy(blocks: u64) -> impl Strategy<Value = JournalOp> {
    prop_oneof![
        4 => (prop::collection::btree_set(0..blocks, 1..4), any::<u8>())
            .prop_map(|(set, byte)| JournalOp::Update { blocks: set.into_iter().collect(), byte }),
        1 => (blocknr_strategy(blocks), any::<u8>())
            .prop_map(|(block, byte)| JournalOp::Undo { block, byte }),
        1 => (blocknr_strategy(blocks), any::<u8>())
            .prop_map(|(block, byte)| JournalOp::Create { block, byte }),
        1 => (blocknr_strategy(blocks), any::<u8>())
            .prop_map(|(block, byte)| JournalOp::OrderedData { block, byte }),
        1 => blocknr_strategy(blocks).prop_map(|block| JournalOp::Forget { block }),
        2 => Just(JournalOp::Commit),
        1 => Just(JournalOp::Checkpoint),
    ]
}

/// Strategy for a script of `min_ops..max_ops` operations.
pub fn journal_script_strategy(
    blocks: u64,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<JournalOp>> {
    prop::collection::vec(journal_op_strategy(blocks), min_ops..max_ops)
}

/// Expected on-disk bytes per block after a script; `None` once forgotten.
pub type DiskModel = BTreeMap<BlockNr, Option<u8>>;

/// Replays `ops` against a hand-committed fixture.
///
/// Membership is checked after every step. The script ends with a commit
/// and a checkpoint, so the returned model describes the device.
///
/// # Errors
///
/// The first journal error other than a refused forget of undo data.
pub fn run_script(fixture: &TestJournal, ops: &[JournalOp]) -> JournalResult<DiskModel> {
    let mut model = DiskModel::new();
    let touched = 0..fixture.data_blocks().min(64);

    for op in ops {
        match op {
            JournalOp::Update { blocks, byte } => {
                let credits = u32::try_from(blocks.len()).unwrap_or(u32::MAX);
                let handle = fixture.start_handle(credits)?;
                for &blocknr in blocks {
                    let block = fixture.block(blocknr);
                    fixture.get_write_access(&handle, &block)?;
                    block.write(|data| data.fill(*byte));
                    fixture.mark_dirty(&handle, &block)?;
                    model.insert(blocknr, Some(*byte));
                }
                fixture.stop(handle)?;
            }
            JournalOp::Undo { block: blocknr, byte } => {
                let handle = fixture.start_handle(1)?;
                let block = fixture.block(*blocknr);
                fixture.get_undo_access(&handle, &block)?;
                block.write(|data| data.fill(*byte));
                fixture.mark_dirty(&handle, &block)?;
                model.insert(*blocknr, Some(*byte));
                fixture.stop(handle)?;
            }
            JournalOp::Create { block: blocknr, byte } => {
                let handle = fixture.start_handle(1)?;
                let block = fixture.block(*blocknr);
                fixture.get_create_access(&handle, &block)?;
                block.write(|data| data.fill(*byte));
                fixture.mark_dirty(&handle, &block)?;
                model.insert(*blocknr, Some(*byte));
                fixture.stop(handle)?;
            }
            JournalOp::OrderedData { block: blocknr, byte } => {
                let handle = fixture.start_handle(1)?;
                let block = fixture.block(*blocknr);
                fixture.file_sync_data(&handle, &block)?;
                block.write(|data| data.fill(*byte));
                block.set_dirty();
                model.insert(*blocknr, Some(*byte));
                fixture.stop(handle)?;
            }
            JournalOp::Forget { block: blocknr } => {
                let handle = fixture.start_handle(1)?;
                let block = fixture.block(*blocknr);
                match fixture.forget(&handle, &block) {
                    Ok(()) => {
                        model.insert(*blocknr, None);
                    }
                    Err(err) if err.kind() == ErrorKind::InvalidOperation => {}
                    Err(err) => return Err(err),
                }
                fixture.stop(handle)?;
            }
            JournalOp::Commit => {
                fixture.try_commit()?;
            }
            JournalOp::Checkpoint => {
                fixture.checkpoint();
            }
        }
        assert_consistent(check_membership(fixture, touched.clone()));
    }

    fixture.try_commit()?;
    fixture.checkpoint();
    Ok(model)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn credits_in_range(credits in credits_strategy(16)) {
            prop_assert!((1..=16).contains(&credits));
        }

        #[test]
        fn updates_name_distinct_blocks(op in journal_op_strategy(8)) {
            if let JournalOp::Update { blocks, .. } = op {
                let mut sorted = blocks.clone();
                sorted.dedup();
                prop_assert_eq!(sorted.len(), blocks.len());
                prop_assert!(!blocks.is_empty());
            }
        }
    }

    #[test]
    fn scripted_updates_reach_disk() {
        let fixture = TestJournal::manual();
        let ops = vec![
            JournalOp::Update { blocks: vec![0, 1], byte: 1 },
            JournalOp::Commit,
            JournalOp::Update { blocks: vec![1], byte: 2 },
            JournalOp::OrderedData { block: 5, byte: 9 },
        ];
        let model = run_script(&fixture, &ops).unwrap();
        assert_eq!(model[&1], Some(2));
        for (blocknr, byte) in model {
            let byte = byte.unwrap();
            assert!(fixture.on_disk(blocknr).iter().all(|&b| b == byte));
        }
    }
}
