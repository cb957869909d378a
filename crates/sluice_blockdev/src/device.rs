//! Block device trait definition.

use crate::error::{DeviceError, DeviceResult};

/// Device-relative block number.
pub type BlockNr = u64;

/// A fixed-size block store.
///
/// # Invariants
///
/// - `read_block` returns exactly the bytes last written by `write_block`
///   for that block (zeroes if it was never written)
/// - Buffers passed to either call are exactly `block_size()` bytes long
/// - `flush` makes all completed writes durable
///
/// # Implementors
///
/// - [`super::MemoryDevice`] - For testing
/// - [`super::FileDevice`] - For block images on a filesystem
pub trait BlockDevice: Send + Sync {
    /// Returns the size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Returns the number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Reads block `blocknr` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is out of range, `buf` has the wrong
    /// length, or the underlying I/O fails.
    fn read_block(&self, blocknr: BlockNr, buf: &mut [u8]) -> DeviceResult<()>;

    /// Writes `buf` to block `blocknr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is out of range, `buf` has the wrong
    /// length, or the underlying I/O fails.
    fn write_block(&self, blocknr: BlockNr, buf: &[u8]) -> DeviceResult<()>;

    /// Flushes completed writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> DeviceResult<()>;

    /// Validates a request against the device geometry.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfRange`] or [`DeviceError::BadBufferSize`].
    fn check_request(&self, blocknr: BlockNr, len: usize) -> DeviceResult<()> {
        let block_count = self.block_count();
        if blocknr >= block_count {
            return Err(DeviceError::OutOfRange {
                blocknr,
                block_count,
            });
        }
        let block_size = self.block_size();
        if len != block_size {
            return Err(DeviceError::BadBufferSize { len, block_size });
        }
        Ok(())
    }
}
