//! Error types for block device operations.

use std::io;
use thiserror::Error;

/// Result type for block device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur during block I/O.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The block number lies beyond the end of the device.
    #[error("block {blocknr} out of range: device has {block_count} blocks")]
    OutOfRange {
        /// The requested block.
        blocknr: u64,
        /// Number of blocks on the device.
        block_count: u64,
    },

    /// The caller's buffer does not match the device block size.
    #[error("buffer of {len} bytes does not match block size {block_size}")]
    BadBufferSize {
        /// Length of the caller's buffer.
        len: usize,
        /// Device block size.
        block_size: usize,
    },

    /// The device image is already locked by another process.
    #[error("device locked: another process has exclusive access")]
    Locked,

    /// A failure injected by a test device.
    #[error("injected failure on block {blocknr}")]
    Injected {
        /// The block whose request failed.
        blocknr: u64,
    },
}
