//! Client-side transactions: an ordered batch of record operations that
//! the engine commits as one atomic unit.

#![forbid(unsafe_code)]

use crate::types::RecordId;

/// Positions at or above this value are provisional: assigned to records
/// created inside a transaction before the storage allocates real ones.
pub const PROVISIONAL_BASE: u64 = 1 << 63;

/// True when `rid` carries a provisional position.
pub fn is_provisional(rid: RecordId) -> bool {
    rid.position >= PROVISIONAL_BASE
}

/// One buffered record operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOperationKind {
    /// Create a record with the given content.
    Create {
        /// Record content.
        content: Vec<u8>,
        /// Caller-defined record kind byte.
        record_kind: u8,
    },
    /// Overwrite a record, subject to the optimistic version check.
    Update {
        /// New record content.
        content: Vec<u8>,
        /// Version the caller read, or a skip-check sentinel.
        version: i32,
        /// Caller-defined record kind byte.
        record_kind: u8,
    },
    /// Delete a record, subject to the optimistic version check.
    Delete {
        /// Version the caller read, or a skip-check sentinel.
        version: i32,
    },
}

/// A buffered operation and the record it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordOperation {
    /// Target record; provisional for in-transaction creates.
    pub rid: RecordId,
    /// The buffered operation.
    pub kind: RecordOperationKind,
}

/// The outcome of one operation in a committed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommittedRecord {
    /// Identity the client used, possibly provisional.
    pub requested: RecordId,
    /// Identity the record holds in the storage.
    pub actual: RecordId,
    /// Version stored after the commit; negative means deleted.
    pub version: i32,
}

/// Per-caller execution context. At most one transaction is bound to a
/// session at a time; commit and rollback check the handed-in transaction
/// against the bound one so stale or foreign handles are caught.
#[derive(Debug, Default)]
pub struct StorageSession {
    active: Option<u64>,
}

impl StorageSession {
    /// Creates a session with no bound transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier of the bound transaction, if any.
    pub fn active_transaction(&self) -> Option<u64> {
        self.active
    }

    pub(crate) fn bind(&mut self, id: u64) {
        self.active = Some(id);
    }

    pub(crate) fn unbind(&mut self) {
        self.active = None;
    }
}

/// An ordered batch of record operations committed atomically.
pub struct ClientTransaction {
    id: u64,
    operations: Vec<RecordOperation>,
    next_provisional: u64,
}

impl ClientTransaction {
    /// Creates an empty transaction with a client-chosen identifier.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            operations: Vec::new(),
            next_provisional: PROVISIONAL_BASE,
        }
    }

    /// Client identifier of the transaction.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffers a create targeting `cluster_id` and returns the provisional
    /// identity later operations in this transaction may refer to.
    pub fn create(&mut self, cluster_id: u32, content: Vec<u8>, record_kind: u8) -> RecordId {
        let rid = RecordId::new(cluster_id, self.next_provisional);
        self.next_provisional += 1;
        self.operations.push(RecordOperation {
            rid,
            kind: RecordOperationKind::Create {
                content,
                record_kind,
            },
        });
        rid
    }

    /// Buffers an update of `rid`.
    pub fn update(&mut self, rid: RecordId, content: Vec<u8>, version: i32, record_kind: u8) {
        self.operations.push(RecordOperation {
            rid,
            kind: RecordOperationKind::Update {
                content,
                version,
                record_kind,
            },
        });
    }

    /// Buffers a delete of `rid`.
    pub fn delete(&mut self, rid: RecordId, version: i32) {
        self.operations.push(RecordOperation {
            rid,
            kind: RecordOperationKind::Delete { version },
        });
    }

    /// Discards every buffered operation and provisional identity,
    /// reverting the transaction to its freshly created state.
    pub fn rollback(&mut self) {
        self.operations.clear();
        self.next_provisional = PROVISIONAL_BASE;
    }

    /// Buffered operations in the order they were issued.
    pub fn operations(&self) -> &[RecordOperation] {
        &self.operations
    }

    /// True when nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
