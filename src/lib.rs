//! Lithic is a durable, crash-recoverable record storage engine.
//!
//! Records live in paginated clusters addressed by `#cluster:position`
//! identities and guarded by optimistic versioning. Every mutation is
//! written to a write-ahead log before its pages may reach disk, grouped
//! into atomic operation units; a storage reopened after a crash replays
//! the log from the last usable checkpoint and rolls back units the crash
//! left open.
//!
//! ```no_run
//! use lithic::storage::config::GlobalOptions;
//! use lithic::storage::engine::PaginatedStorage;
//!
//! # fn main() -> lithic::types::Result<()> {
//! let storage = PaginatedStorage::create("/tmp/accounts", GlobalOptions::default())?;
//! let id = storage.add_cluster("Account", None)?;
//! let (rid, version) = storage
//!     .create_record(Some(id), b"alice", 0)?
//!     .completed()
//!     .ok_or_else(|| lithic::types::StorageError::State("create failed".into()))?;
//! assert_eq!(version, 1);
//! let record = storage.read_record(rid)?;
//! assert!(record.is_some());
//! storage.close()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::config::GlobalOptions;
pub use storage::engine::{FreezeGuard, OperationOutcome, PaginatedStorage};
pub use storage::transaction::{ClientTransaction, StorageSession};
pub use types::{Lsn, RecordId, Result, StorageError, StorageStatus};
