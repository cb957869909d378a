//! # Sluice Core
//!
//! Write-ahead-log transaction manager for block-structured metadata.
//!
//! This crate provides:
//! - The [`Journal`]: owner of the running and committing transactions,
//!   admission control and the global update barrier
//! - [`Handle`]s: a caller's lease on credits inside the running transaction
//! - Tracked blocks with copy-on-write ("freeze") semantics so a commit in
//!   flight always sees the bytes it captured
//! - Per-transaction role lists consumed by an external commit engine
//!   through [`CommitClaim`]
//!
//! Block I/O, log encoding, recovery, checkpoint writeback and revoke
//! records belong to collaborators (see [`collab`]).
//!
//! ## Typical update
//!
//! ```rust
//! use sluice_blockdev::MemoryDevice;
//! use sluice_core::{Collaborators, Journal, JournalConfig};
//! use std::sync::Arc;
//!
//! let device = Arc::new(MemoryDevice::new(512, 64));
//! let journal = Journal::open(JournalConfig::default(), device, Collaborators::default()).unwrap();
//!
//! let handle = journal.start_handle(4).unwrap();
//! let block = journal.get_block(7).unwrap();
//! journal.get_write_access(&handle, &block).unwrap();
//! block.write(|data| data[0] = 0x42);
//! journal.mark_dirty(&handle, &block).unwrap();
//! journal.stop(handle).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod access;
mod block;
pub mod collab;
mod commit;
mod config;
mod error;
mod handle;
mod journal;
mod lists;
mod stats;
mod transaction;
mod types;

pub use block::{BlockRef, TrackedBlock};
pub use collab::{
    BufferAllocator, Checkpointer, Collaborators, CommitEngine, HeapAllocator, NoCheckpointer,
    NoCommitEngine, NoRevokeTable, RevokeTable,
};
pub use commit::{CommitClaim, COMMIT_ORDER};
pub use config::JournalConfig;
pub use error::{ErrorKind, JournalError, JournalResult};
pub use handle::Handle;
pub use journal::{BarrierGuard, Journal};
pub use sluice_blockdev::BlockNr;
pub use stats::{JournalStats, StatsSnapshot};
pub use transaction::Transaction;
pub use types::{Role, TransactionId, TransactionState};
