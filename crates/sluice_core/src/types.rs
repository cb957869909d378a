//! Core type definitions for the journal.

use std::fmt;

/// Identifier of a transaction.
///
/// Transaction IDs come from the journal's sequence counter: they are
/// monotonically increasing and never reused within one journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the ID that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Lifecycle state of a transaction while the journal still owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting new handles.
    Running,
    /// Claimed by the commit engine; no new handle may join.
    Locked,
}

/// The list a tracked block is filed on inside its owning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Not on any list.
    None,
    /// Ordered data that must reach disk before the commit record.
    SyncData,
    /// Journaled metadata.
    Metadata,
    /// Already logged, or deleted; waiting for commit completion.
    Forget,
    /// Temporary log-side I/O buffer.
    IO,
    /// Bytes in flight to the log device; must not be modified.
    Shadow,
    /// Log descriptor/control block.
    LogControl,
    /// Write access taken but not yet modified.
    Reserved,
    /// Ordered data currently being written.
    Locked,
}

impl Role {
    /// Every role that implies list membership.
    pub const LISTED: [Role; 8] = [
        Role::SyncData,
        Role::Metadata,
        Role::Forget,
        Role::IO,
        Role::Shadow,
        Role::LogControl,
        Role::Reserved,
        Role::Locked,
    ];

    /// Index of this role's list, `None` for [`Role::None`].
    pub(crate) const fn list_index(self) -> Option<usize> {
        match self {
            Role::None => None,
            Role::SyncData => Some(0),
            Role::Metadata => Some(1),
            Role::Forget => Some(2),
            Role::IO => Some(3),
            Role::Shadow => Some(4),
            Role::LogControl => Some(5),
            Role::Reserved => Some(6),
            Role::Locked => Some(7),
        }
    }

    /// Whether blocks in this role are dirty-tracked by the log instead of
    /// the ordinary page-cache dirty flag.
    #[must_use]
    pub const fn is_log_tracked(self) -> bool {
        matches!(
            self,
            Role::Metadata | Role::Reserved | Role::Shadow | Role::Forget
        )
    }

    /// Whether a committing transaction still needs the pre-image of a
    /// block it holds in this role.
    #[must_use]
    pub const fn needs_preimage(self) -> bool {
        !matches!(self, Role::Forget | Role::None)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::None => "none",
            Role::SyncData => "sync-data",
            Role::Metadata => "metadata",
            Role::Forget => "forget",
            Role::IO => "io",
            Role::Shadow => "shadow",
            Role::LogControl => "log-control",
            Role::Reserved => "reserved",
            Role::Locked => "locked",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering() {
        let t1 = TransactionId::new(1);
        let t2 = t1.next();
        assert!(t1 < t2);
        assert_eq!(t2.as_u64(), 2);
    }

    #[test]
    fn transaction_id_display() {
        assert_eq!(format!("{}", TransactionId::new(42)), "tid:42");
    }

    #[test]
    fn list_indices_are_distinct() {
        let mut seen = [false; 8];
        for role in Role::LISTED {
            let idx = role.list_index().unwrap();
            assert!(!seen[idx]);
            seen[idx] = true;
        }
        assert_eq!(Role::None.list_index(), None);
    }

    #[test]
    fn preimage_policy() {
        for role in [
            Role::Metadata,
            Role::Reserved,
            Role::Shadow,
            Role::LogControl,
            Role::Locked,
        ] {
            assert!(role.needs_preimage(), "{role} should need a copy");
        }
        assert!(!Role::Forget.needs_preimage());
    }

    #[test]
    fn log_tracked_roles() {
        assert!(Role::Metadata.is_log_tracked());
        assert!(Role::Forget.is_log_tracked());
        assert!(!Role::SyncData.is_log_tracked());
        assert!(!Role::LogControl.is_log_tracked());
    }
}
