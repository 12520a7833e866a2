//! Core identifier types, the error taxonomy, and the crate-wide `Result`.

#![forbid(unsafe_code)]

use std::fmt;
use std::io;
use thiserror::Error;

pub mod checksum;

/// Result type used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Log sequence number: the byte offset of a record in the write-ahead log.
///
/// LSNs give a total order over WAL records and double as read cursors and
/// durability watermarks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Identifier of one atomic operation unit inside the WAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit:{}", self.0)
    }
}

/// Identifier of a file managed by the page cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

/// Zero-based index of a page inside a cache file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(pub u64);

/// Identity of a record: the cluster holding it plus its logical position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Cluster the record lives in.
    pub cluster_id: u32,
    /// Logical position inside the cluster; stable across in-place updates
    /// and relocations.
    pub position: u64,
}

impl RecordId {
    /// Creates a record identity from its components.
    pub fn new(cluster_id: u32, position: u64) -> Self {
        Self {
            cluster_id,
            position,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.position)
    }
}

/// Requested version meaning "skip the version check and bump the counter".
pub const VERSION_SKIP_CHECK: i32 = -1;

/// Requested version meaning "skip the version check, keep the counter".
pub const VERSION_NO_BUMP: i32 = -2;

/// Version reported when an update targets a position the cluster does not
/// track; the operation is a no-op, not an error.
pub const VERSION_UNTRACKED: i32 = -1;

/// Physical location and version of a record inside a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalPosition {
    /// Logical position inside the cluster.
    pub position: u64,
    /// Stored version counter; bumped on every successful write.
    pub version: i32,
    /// Caller-supplied record kind byte, opaque to the engine.
    pub record_kind: u8,
}

/// Lifecycle state of a storage instance.
///
/// Transitions happen only under the exclusive storage lock:
/// `Closed -> Opening -> Open -> Closing -> Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageStatus {
    /// Storage is not usable; `open` or `create` is required.
    Closed,
    /// `open`/`create` is in progress (recovery may be running).
    Opening,
    /// Storage accepts record and transaction operations.
    Open,
    /// `close` is in progress.
    Closing,
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StorageStatus::Closed => "closed",
            StorageStatus::Opening => "opening",
            StorageStatus::Open => "open",
            StorageStatus::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O failure in the cache, the WAL, or the configuration record.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid parameters or configuration, e.g. a duplicate cluster name.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("storage state error: {0}")]
    State(String),

    /// Version mismatch the conflict-resolution strategy refused to resolve.
    #[error("record {rid} was modified concurrently: stored version {stored}, requested {requested}")]
    ConcurrentModification {
        /// Record that failed the version check.
        rid: RecordId,
        /// Version currently stored in the cluster.
        stored: i32,
        /// Version the caller expected.
        requested: i32,
    },

    /// Persistent data failed a structural or checksum validation.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A WAL record could not be read because the log tail is truncated or
    /// torn. Distinct from [`StorageError::NotFound`] so recovery can stop
    /// cleanly instead of failing.
    #[error("write-ahead log is broken at {0}")]
    WalBroken(Lsn),

    /// The requested WAL position lies outside the readable log.
    #[error("no WAL record at {0}")]
    NotFound(Lsn),

    /// Malformed WAL structure discovered during replay or undo. This is an
    /// internal-consistency failure, not a user error.
    #[error("recovery inconsistency: {0}")]
    RecoveryInconsistency(String),

    /// A transactional entry point was invoked while the WAL is disabled.
    #[error("write-ahead log is disabled; transactions are not available")]
    WalUnavailable,
}
