//! In-memory block device for testing.

use crate::device::{BlockDevice, BlockNr};
use crate::error::{DeviceError, DeviceResult};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory block device.
///
/// Suitable for unit and integration tests. Individual blocks can be made
/// to fail reads or writes so that callers can exercise their I/O error
/// paths.
///
/// # Thread Safety
///
/// This device is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use sluice_blockdev::{BlockDevice, MemoryDevice};
///
/// let device = MemoryDevice::new(64, 4);
/// assert_eq!(device.block_count(), 4);
/// assert_eq!(device.block_size(), 64);
/// ```
#[derive(Debug)]
pub struct MemoryDevice {
    block_size: usize,
    block_count: u64,
    data: RwLock<Vec<u8>>,
    failing_reads: RwLock<HashSet<BlockNr>>,
    failing_writes: RwLock<HashSet<BlockNr>>,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryDevice {
    /// Creates a zero-filled device.
    #[must_use]
    pub fn new(block_size: usize, block_count: u64) -> Self {
        let len = block_size * block_count as usize;
        Self {
            block_size,
            block_count,
            data: RwLock::new(vec![0u8; len]),
            failing_reads: RwLock::new(HashSet::new()),
            failing_writes: RwLock::new(HashSet::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent read of `blocknr` fail (or succeed again).
    pub fn fail_reads(&self, blocknr: BlockNr, fail: bool) {
        let mut set = self.failing_reads.write();
        if fail {
            set.insert(blocknr);
        } else {
            set.remove(&blocknr);
        }
    }

    /// Makes every subsequent write of `blocknr` fail (or succeed again).
    pub fn fail_writes(&self, blocknr: BlockNr, fail: bool) {
        let mut set = self.failing_writes.write();
        if fail {
            set.insert(blocknr);
        } else {
            set.remove(&blocknr);
        }
    }

    /// Returns a copy of one block, bypassing fault injection.
    ///
    /// Useful for asserting on device contents in tests.
    #[must_use]
    pub fn snapshot_block(&self, blocknr: BlockNr) -> Vec<u8> {
        let start = blocknr as usize * self.block_size;
        self.data.read()[start..start + self.block_size].to_vec()
    }

    /// Number of successful reads served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful writes served.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of flushes served.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, blocknr: BlockNr, buf: &mut [u8]) -> DeviceResult<()> {
        self.check_request(blocknr, buf.len())?;
        if self.failing_reads.read().contains(&blocknr) {
            return Err(DeviceError::Injected { blocknr });
        }

        let start = blocknr as usize * self.block_size;
        buf.copy_from_slice(&self.data.read()[start..start + self.block_size]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, blocknr: BlockNr, buf: &[u8]) -> DeviceResult<()> {
        self.check_request(blocknr, buf.len())?;
        if self.failing_writes.read().contains(&blocknr) {
            return Err(DeviceError::Injected { blocknr });
        }

        let start = blocknr as usize * self.block_size;
        self.data.write()[start..start + self.block_size].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        // Nothing is buffered
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
