//! Record-level locks and the checkpoint modification gate.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};

use crate::types::RecordId;

/// Exclusive hold on one record.
pub type RecordWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;
/// Shared hold on one record.
pub type RecordReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Prune the lock table once it grows past this many idle entries.
const PRUNE_THRESHOLD: usize = 1024;

/// Per-record reader/writer locks, created on demand.
#[derive(Default)]
pub struct RecordLockManager {
    locks: Mutex<HashMap<RecordId, Arc<RwLock<()>>>>,
}

impl RecordLockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock for `rid`, blocking until free.
    pub fn lock_exclusive(&self, rid: RecordId) -> RecordWriteGuard {
        self.entry(rid).write_arc()
    }

    /// Acquires the shared lock for `rid`.
    pub fn lock_shared(&self, rid: RecordId) -> RecordReadGuard {
        self.entry(rid).read_arc()
    }

    fn entry(&self, rid: RecordId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(rid).or_default())
    }
}

#[derive(Default)]
struct GateState {
    prohibited: bool,
    active: usize,
}

/// Gate that lets checkpoints briefly exclude all record modifications.
///
/// Writers call [`ModificationLock::start`] and hold the returned guard for
/// the duration of the operation; a checkpoint calls
/// [`ModificationLock::prohibit`], which waits for in-flight writers to
/// drain and blocks new ones until the prohibition guard drops.
#[derive(Default)]
pub struct ModificationLock {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ModificationLock {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a modification, waiting while modifications are prohibited.
    pub fn start(&self) -> ModificationGuard<'_> {
        let mut state = self.state.lock();
        while state.prohibited {
            self.cond.wait(&mut state);
        }
        state.active += 1;
        ModificationGuard { gate: self }
    }

    /// Prohibits new modifications and waits for active ones to finish.
    pub fn prohibit(&self) -> ProhibitionGuard<'_> {
        let mut state = self.state.lock();
        while state.prohibited {
            self.cond.wait(&mut state);
        }
        state.prohibited = true;
        while state.active > 0 {
            self.cond.wait(&mut state);
        }
        ProhibitionGuard { gate: self }
    }
}

/// Active-modification token; dropping it lets a waiting prohibition proceed.
pub struct ModificationGuard<'a> {
    gate: &'a ModificationLock,
}

impl Drop for ModificationGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.gate.cond.notify_all();
        }
    }
}

/// Prohibition token; dropping it reopens the gate.
pub struct ProhibitionGuard<'a> {
    gate: &'a ModificationLock,
}

impl Drop for ProhibitionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.prohibited = false;
        self.gate.cond.notify_all();
    }
}
