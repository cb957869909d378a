//! # Sluice Block Device
//!
//! Block I/O layer consumed by the sluice journal.
//!
//! Devices are **fixed-size block stores** addressed by device-relative
//! block number. They do not interpret block contents; the journal owns
//! all decisions about what is written where.
//!
//! ## Design Principles
//!
//! - Every request transfers exactly one block
//! - Devices must be `Send + Sync`; the journal shares one device across
//!   every thread that touches tracked blocks
//! - Out-of-range requests are errors, never silent truncation
//!
//! ## Available Devices
//!
//! - [`MemoryDevice`] - For testing, with fault injection
//! - [`FileDevice`] - A regular file holding a block image
//!
//! ## Example
//!
//! ```rust
//! use sluice_blockdev::{BlockDevice, MemoryDevice};
//!
//! let device = MemoryDevice::new(512, 16);
//! device.write_block(3, &[7u8; 512]).unwrap();
//!
//! let mut buf = vec![0u8; 512];
//! device.read_block(3, &mut buf).unwrap();
//! assert_eq!(buf, vec![7u8; 512]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod device;
mod error;
mod file;
mod memory;

pub use device::{BlockDevice, BlockNr};
pub use error::{DeviceError, DeviceResult};
pub use file::FileDevice;
pub use memory::MemoryDevice;
