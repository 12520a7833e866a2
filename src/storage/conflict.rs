//! Conflict-resolution strategies for optimistic version checks.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{RecordId, Result, StorageError};

/// Policy applied when an update or delete carries a version that does not
/// match the stored one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Reject the operation with a concurrent-modification error.
    #[default]
    Version,
    /// Accept the proposed content, overwriting the stored record.
    Content,
}

impl ConflictResolution {
    /// Resolves a version mismatch for `rid`.
    ///
    /// Returns the content to store when the strategy accepts the write, or
    /// the concurrent-modification error when it refuses. The caller applies
    /// the returned content with a skip-check version so resolution happens
    /// at most once per operation.
    pub fn resolve<'a>(
        &self,
        rid: RecordId,
        stored: i32,
        requested: i32,
        proposed: &'a [u8],
    ) -> Result<&'a [u8]> {
        match self {
            ConflictResolution::Version => Err(StorageError::ConcurrentModification {
                rid,
                stored,
                requested,
            }),
            ConflictResolution::Content => {
                warn!(
                    target: "storage.conflict",
                    rid = %rid,
                    stored,
                    requested,
                    "version conflict resolved by content overwrite"
                );
                Ok(proposed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_strategy_rejects() {
        let err = ConflictResolution::Version
            .resolve(RecordId::new(1, 2), 5, 3, b"data")
            .unwrap_err();
        match err {
            StorageError::ConcurrentModification {
                stored, requested, ..
            } => {
                assert_eq!(stored, 5);
                assert_eq!(requested, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn content_strategy_accepts_proposed_bytes() {
        let content = ConflictResolution::Content
            .resolve(RecordId::new(1, 2), 5, 3, b"data")
            .unwrap();
        assert_eq!(content, b"data");
    }
}
