//! # Sluice Testkit
//!
//! Test utilities for the sluice journal.
//!
//! This crate provides:
//! - A reference commit daemon that drives [`sluice_core::CommitClaim`]s
//! - Recording collaborators: checkpointer, revoke table, flaky allocator
//! - Test fixtures over memory and file devices
//! - Invariant checks over a quiescent journal
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sluice_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_journal() {
//!     with_journal(|fixture| {
//!         let handle = fixture.start_handle(4).unwrap();
//!         // ... journaled updates
//!         fixture.stop(handle).unwrap();
//!         fixture.commit();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collab;
pub mod daemon;
pub mod fixtures;
pub mod generators;
pub mod invariants;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::collab::*;
    pub use crate::daemon::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::invariants::*;
    pub use crate::stress::*;
}

pub use collab::*;
pub use daemon::*;
pub use fixtures::*;
pub use generators::*;
pub use invariants::*;
pub use stress::*;

/// Installs a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
