//! Atomic operation units.
//!
//! Every group of page mutations that must be all-or-nothing runs inside a
//! unit: a `UnitStart` record, any number of `PageUpdate` and `FileCreated`
//! records, and a closing `UnitEnd`. The unit a call belongs to travels in
//! an explicit [`OperationContext`] owned by the caller, so there is no
//! ambient per-thread state and units cannot leak across threads.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::primitives::wal::record::WalRecord;
use crate::primitives::wal::WriteAheadLog;
use crate::storage::page::DurablePage;
use crate::types::{FileId, Lsn, Result, StorageError, UnitId};

/// An open atomic operation unit.
#[derive(Clone, Copy, Debug)]
pub struct AtomicOperation {
    /// Identifier of the unit.
    pub unit: UnitId,
    /// LSN of the unit's start record.
    pub start_lsn: Lsn,
}

/// A unit that has been closed with an end record.
#[derive(Clone, Copy, Debug)]
pub struct CompletedOperation {
    /// Identifier of the unit.
    pub unit: UnitId,
    /// LSN of the unit's start record.
    pub start_lsn: Lsn,
    /// LSN of the unit's end record.
    pub end_lsn: Lsn,
    /// True when the unit ended in rollback.
    pub rollback: bool,
}

/// Caller-owned slot holding the unit a sequence of calls runs under.
#[derive(Default)]
pub struct OperationContext {
    active: Option<AtomicOperation>,
}

impl OperationContext {
    /// Creates a context with no active unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active unit, if one is open.
    pub fn active(&self) -> Option<&AtomicOperation> {
        self.active.as_ref()
    }
}

/// Allocates unit identifiers and writes unit records to the log.
pub struct AtomicOperationsManager {
    wal: Arc<WriteAheadLog>,
    next_unit: AtomicU64,
}

impl AtomicOperationsManager {
    /// Creates a manager issuing unit ids from `first_unit` upward. After
    /// recovery the caller passes one past the highest replayed unit so
    /// ids never collide inside the live log window.
    pub fn new(wal: Arc<WriteAheadLog>, first_unit: u64) -> Self {
        Self {
            wal,
            next_unit: AtomicU64::new(first_unit),
        }
    }

    /// Opens a unit in `ctx`. Nested units are refused.
    pub fn start(&self, ctx: &mut OperationContext) -> Result<AtomicOperation> {
        if let Some(active) = ctx.active {
            return Err(StorageError::State(format!(
                "atomic operation {} is already active",
                active.unit
            )));
        }
        let unit = UnitId(self.next_unit.fetch_add(1, Ordering::Relaxed));
        let start_lsn = self.wal.log(&WalRecord::UnitStart { unit })?;
        let operation = AtomicOperation { unit, start_lsn };
        ctx.active = Some(operation);
        trace!(target: "atomic.start", unit = unit.0, lsn = %start_lsn);
        Ok(operation)
    }

    /// Closes the active unit, logging its end record. `rollback` marks the
    /// unit as undone; the caller is responsible for reverting its pages.
    pub fn end(&self, ctx: &mut OperationContext, rollback: bool) -> Result<CompletedOperation> {
        let active = ctx
            .active
            .take()
            .ok_or_else(|| StorageError::State("no active atomic operation".into()))?;
        let end_lsn = self.wal.log(&WalRecord::UnitEnd {
            unit: active.unit,
            rollback,
        })?;
        trace!(
            target: "atomic.end",
            unit = active.unit.0,
            lsn = %end_lsn,
            rollback
        );
        Ok(CompletedOperation {
            unit: active.unit,
            start_lsn: active.start_lsn,
            end_lsn,
            rollback,
        })
    }

    /// Drains the page's accumulated change set into a `PageUpdate` record
    /// and stamps the new LSN on the page. Pages without changes log
    /// nothing and return `None`.
    pub fn log_page_update(
        &self,
        ctx: &OperationContext,
        page: &mut DurablePage,
    ) -> Result<Option<Lsn>> {
        let active = require_active(ctx)?;
        if !page.has_changes() {
            return Ok(None);
        }
        let prior_lsn = page.lsn();
        let changes = page.take_changes();
        let lsn = self.wal.log(&WalRecord::PageUpdate {
            unit: active.unit,
            file: page.file(),
            page: page.page(),
            prior_lsn,
            changes,
        })?;
        page.set_lsn(lsn);
        // The page remembers the start of the unit, not the update itself:
        // a fuzzy checkpoint must cut the log no later than the start of
        // any unit whose changes are still unflushed, or replay would meet
        // that unit's records without their start.
        page.pinned().note_change_lsn(active.start_lsn);
        page.pinned().mark_dirty();
        Ok(Some(lsn))
    }

    /// Logs a file creation inside the active unit.
    pub fn log_file_created(
        &self,
        ctx: &OperationContext,
        file: FileId,
        name: &str,
    ) -> Result<Lsn> {
        let active = require_active(ctx)?;
        self.wal.log(&WalRecord::FileCreated {
            unit: active.unit,
            file,
            name: name.to_owned(),
        })
    }
}

fn require_active(ctx: &OperationContext) -> Result<&AtomicOperation> {
    ctx.active()
        .ok_or_else(|| StorageError::State("no active atomic operation".into()))
}
