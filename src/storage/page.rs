//! Change-tracked view over a cached page.
//!
//! Every mutation made through a [`DurablePage`] is mirrored into a
//! [`ChangeSet`] holding the before and after bytes, which the atomic
//! operation layer turns into a WAL record before the page may reach
//! disk. The first eight payload bytes hold the LSN of the last logged
//! change; zero means the page was never logged.

#![forbid(unsafe_code)]

use crate::primitives::wal::record::ChangeSet;
use crate::storage::cache::PinnedPage;
use crate::types::{FileId, Lsn, PageIndex};

/// Offset where caller data starts, past the page LSN.
pub const PAGE_DATA_OFFSET: usize = 8;

/// Pinned page plus the change set accumulated since the last WAL write.
pub struct DurablePage {
    pinned: PinnedPage,
    changes: ChangeSet,
}

impl DurablePage {
    /// Wraps a pinned page.
    pub fn new(pinned: PinnedPage) -> Self {
        Self {
            pinned,
            changes: ChangeSet::new(),
        }
    }

    /// File the page belongs to.
    pub fn file(&self) -> FileId {
        self.pinned.file()
    }

    /// Index of the page inside its file.
    pub fn page(&self) -> PageIndex {
        self.pinned.page()
    }

    /// LSN stamped on the page, if it was ever logged.
    pub fn lsn(&self) -> Option<Lsn> {
        let payload = self.pinned.payload();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&payload[..8]);
        let value = u64::from_be_bytes(raw);
        (value != 0).then_some(Lsn(value))
    }

    /// Stamps the page LSN. Not tracked as a change: the WAL record that
    /// carries the change set also records the prior LSN for undo.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        let mut payload = self.pinned.payload();
        payload[..8].copy_from_slice(&lsn.0.to_be_bytes());
        drop(payload);
        self.pinned.mark_dirty();
    }

    /// Copies `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.pinned.payload()[offset..offset + len].to_vec()
    }

    /// Reads a big-endian u16 at `offset`.
    pub fn read_u16(&self, offset: usize) -> u16 {
        let payload = self.pinned.payload();
        u16::from_be_bytes([payload[offset], payload[offset + 1]])
    }

    /// Reads a big-endian u32 at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let payload = self.pinned.payload();
        u32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ])
    }

    /// Reads a big-endian u64 at `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        let payload = self.pinned.payload();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&payload[offset..offset + 8]);
        u64::from_be_bytes(raw)
    }

    /// Reads a big-endian i32 at `offset`.
    pub fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    /// Writes `bytes` at `offset`, recording the previous contents.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        let mut payload = self.pinned.payload();
        let before = payload[offset..offset + bytes.len()].to_vec();
        if before == bytes {
            return;
        }
        payload[offset..offset + bytes.len()].copy_from_slice(bytes);
        drop(payload);
        self.changes.record(offset as u32, before, bytes.to_vec());
    }

    /// Writes a big-endian u16 at `offset`.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write(offset, &value.to_be_bytes());
    }

    /// Writes a big-endian u32 at `offset`.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write(offset, &value.to_be_bytes());
    }

    /// Writes a big-endian u64 at `offset`.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write(offset, &value.to_be_bytes());
    }

    /// Writes a big-endian i32 at `offset`.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.write(offset, &(value as u32).to_be_bytes());
    }

    /// True when unlogged changes have accumulated.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Takes the accumulated change set, leaving the page clean for the
    /// next logical write.
    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    /// The underlying pinned page.
    pub fn pinned(&self) -> &PinnedPage {
        &self.pinned
    }
}
