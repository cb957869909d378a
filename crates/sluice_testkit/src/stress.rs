//! Stress tests for the journal.
//!
//! These run many handles from many threads against a daemon-committed
//! fixture and verify the journal ends up consistent.

use crate::fixtures::TestJournal;
use sluice_blockdev::BlockNr;
use sluice_core::{Journal, JournalResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Blocks rewritten by each operation.
    pub blocks_per_op: usize,
    /// Number of distinct blocks shared by all threads.
    pub block_count: u64,
    /// Every n-th operation stops synchronously; 0 never does.
    pub sync_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 500,
            threads: 4,
            blocks_per_op: 3,
            block_count: 32,
            sync_every: 50,
        }
    }
}

impl StressConfig {
    /// A short run for unit tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            operations: 100,
            threads: 4,
            blocks_per_op: 2,
            block_count: 16,
            sync_every: 25,
        }
    }
}

fn update_blocks(journal: &Journal, blocks: &[BlockNr], byte: u8, sync: bool) -> JournalResult<()> {
    let credits = u32::try_from(blocks.len()).unwrap_or(u32::MAX);
    let handle = journal.start_handle(credits)?;
    handle.set_sync(sync);
    for &blocknr in blocks {
        let block = journal.get_block(blocknr)?;
        journal.get_write_access(&handle, &block)?;
        block.write(|data| data.fill(byte));
        journal.mark_dirty(&handle, &block)?;
    }
    journal.stop(handle)
}

fn pick_blocks(config: &StressConfig, thread: usize, op: usize) -> Vec<BlockNr> {
    let count = config.block_count.max(1);
    let mut blocks: Vec<BlockNr> = (0..config.blocks_per_op)
        .map(|i| ((thread * 7 + op * 3 + i * 5) as u64) % count)
        .collect();
    blocks.sort_unstable();
    blocks.dedup();
    blocks
}

/// Many threads rewriting overlapping blocks while the daemon commits.
pub fn stress_concurrent_updates(fixture: &TestJournal, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let journal = Arc::clone(&fixture.journal);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            scope.spawn(move || {
                for op in 0..config.operations {
                    let blocks = pick_blocks(config, t, op);
                    let sync = config.sync_every > 0 && op % config.sync_every == 0;
                    let byte = (op % 251) as u8;
                    match update_blocks(&journal, &blocks, byte, sync) {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Concurrent updates while one thread keeps raising and lowering barriers.
pub fn stress_updates_with_barriers(
    fixture: &TestJournal,
    config: &StressConfig,
) -> StressTestResult {
    let done = AtomicBool::new(false);
    let barriers = AtomicUsize::new(0);

    let result = thread::scope(|scope| {
        scope.spawn(|| {
            loop {
                let guard = fixture.barrier();
                thread::sleep(Duration::from_micros(200));
                drop(guard);
                barriers.fetch_add(1, Ordering::Relaxed);
                if done.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_micros(500));
            }
        });
        let result = stress_concurrent_updates(fixture, config);
        done.store(true, Ordering::SeqCst);
        result
    });
    tracing::debug!(barriers = barriers.load(Ordering::Relaxed), "barrier stress finished");
    result
}
