//! Logical record types stored in the write-ahead log and their wire format.
//!
//! Records are encoded with a one-byte kind tag followed by big-endian
//! fields. The framing layer in the parent module adds length and checksum
//! information; this module only deals with payload bytes.

#![forbid(unsafe_code)]

use smallvec::SmallVec;

use crate::types::{FileId, Lsn, PageIndex, Result, StorageError, UnitId};

const KIND_UNIT_START: u8 = 1;
const KIND_UNIT_END: u8 = 2;
const KIND_PAGE_UPDATE: u8 = 3;
const KIND_FILE_CREATED: u8 = 4;
const KIND_FULL_CHECKPOINT_START: u8 = 5;
const KIND_FULL_CHECKPOINT_END: u8 = 6;
const KIND_FUZZY_CHECKPOINT_START: u8 = 7;
const KIND_FUZZY_CHECKPOINT_END: u8 = 8;
const KIND_DIRTY_PAGES: u8 = 9;

/// One byte-range mutation of a page payload.
///
/// `before` and `after` always have the same length, so the entry can be
/// applied during redo and reverted during undo without shifting data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Offset of the mutated range inside the page payload.
    pub offset: u32,
    /// Bytes that occupied the range before the write.
    pub before: Vec<u8>,
    /// Bytes written into the range.
    pub after: Vec<u8>,
}

/// Ordered collection of byte-range mutations applied to a single page by a
/// single logical write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    entries: SmallVec<[ChangeEntry; 4]>,
}

impl ChangeSet {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one mutation. `before` and `after` must cover the same range.
    pub fn record(&mut self, offset: u32, before: Vec<u8>, after: Vec<u8>) {
        debug_assert_eq!(before.len(), after.len());
        self.entries.push(ChangeEntry {
            offset,
            before,
            after,
        });
    }

    /// Returns true when no mutations were recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded mutations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in application order.
    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    /// Replays the mutations onto `payload` (redo direction).
    pub fn apply(&self, payload: &mut [u8]) {
        for entry in &self.entries {
            let start = entry.offset as usize;
            payload[start..start + entry.after.len()].copy_from_slice(&entry.after);
        }
    }

    /// Reverts the mutations from `payload` (undo direction). Entries are
    /// walked backwards so overlapping writes unwind in the right order.
    pub fn revert(&self, payload: &mut [u8]) {
        for entry in self.entries.iter().rev() {
            let start = entry.offset as usize;
            payload[start..start + entry.before.len()].copy_from_slice(&entry.before);
        }
    }
}

/// One page listed by a [`WalRecord::DirtyPages`] record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyPage {
    /// File holding the dirty page.
    pub file: FileId,
    /// Index of the dirty page.
    pub page: PageIndex,
    /// LSN replay must resume from to cover the page's oldest unflushed
    /// change; points at the start of the unit that made it.
    pub lsn: Lsn,
}

/// A logical entry in the write-ahead log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalRecord {
    /// Opens an atomic operation unit.
    UnitStart {
        /// Unit being opened.
        unit: UnitId,
    },
    /// Closes an atomic operation unit.
    UnitEnd {
        /// Unit being closed.
        unit: UnitId,
        /// True when the unit was rolled back rather than committed.
        rollback: bool,
    },
    /// Byte-level delta of one page, written inside a unit.
    PageUpdate {
        /// Unit the update belongs to.
        unit: UnitId,
        /// File holding the page.
        file: FileId,
        /// Index of the page inside the file.
        page: PageIndex,
        /// LSN previously stamped on the page, if any. Undo restores it.
        prior_lsn: Option<Lsn>,
        /// The byte ranges that changed.
        changes: ChangeSet,
    },
    /// A cache file was created inside a unit.
    FileCreated {
        /// Unit the creation belongs to.
        unit: UnitId,
        /// Identifier assigned to the new file.
        file: FileId,
        /// Name the file was registered under.
        name: String,
    },
    /// Opens a full checkpoint.
    FullCheckpointStart {
        /// LSN of the previous checkpoint start, if one exists.
        previous: Option<Lsn>,
    },
    /// Closes a full checkpoint; everything before its start is flushed.
    FullCheckpointEnd,
    /// Opens a fuzzy checkpoint.
    FuzzyCheckpointStart {
        /// LSN of the previous checkpoint start, if one exists.
        previous: Option<Lsn>,
    },
    /// Closes a fuzzy checkpoint.
    FuzzyCheckpointEnd,
    /// Snapshot of the dirty-page table, logged with a fuzzy checkpoint.
    DirtyPages {
        /// Pages dirty at checkpoint time with their oldest change LSNs.
        pages: Vec<DirtyPage>,
    },
}

impl WalRecord {
    /// Unit this record belongs to, if it is a unit-scoped record.
    pub fn unit(&self) -> Option<UnitId> {
        match self {
            WalRecord::UnitStart { unit }
            | WalRecord::UnitEnd { unit, .. }
            | WalRecord::PageUpdate { unit, .. }
            | WalRecord::FileCreated { unit, .. } => Some(*unit),
            _ => None,
        }
    }

    /// Encodes the record into its payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            WalRecord::UnitStart { unit } => {
                out.push(KIND_UNIT_START);
                out.extend_from_slice(&unit.0.to_be_bytes());
            }
            WalRecord::UnitEnd { unit, rollback } => {
                out.push(KIND_UNIT_END);
                out.extend_from_slice(&unit.0.to_be_bytes());
                out.push(u8::from(*rollback));
            }
            WalRecord::PageUpdate {
                unit,
                file,
                page,
                prior_lsn,
                changes,
            } => {
                out.push(KIND_PAGE_UPDATE);
                out.extend_from_slice(&unit.0.to_be_bytes());
                out.extend_from_slice(&file.0.to_be_bytes());
                out.extend_from_slice(&page.0.to_be_bytes());
                encode_opt_lsn(&mut out, *prior_lsn);
                out.extend_from_slice(&(changes.entries.len() as u32).to_be_bytes());
                for entry in &changes.entries {
                    out.extend_from_slice(&entry.offset.to_be_bytes());
                    out.extend_from_slice(&(entry.before.len() as u32).to_be_bytes());
                    out.extend_from_slice(&entry.before);
                    out.extend_from_slice(&entry.after);
                }
            }
            WalRecord::FileCreated { unit, file, name } => {
                out.push(KIND_FILE_CREATED);
                out.extend_from_slice(&unit.0.to_be_bytes());
                out.extend_from_slice(&file.0.to_be_bytes());
                out.extend_from_slice(&(name.len() as u32).to_be_bytes());
                out.extend_from_slice(name.as_bytes());
            }
            WalRecord::FullCheckpointStart { previous } => {
                out.push(KIND_FULL_CHECKPOINT_START);
                encode_opt_lsn(&mut out, *previous);
            }
            WalRecord::FullCheckpointEnd => out.push(KIND_FULL_CHECKPOINT_END),
            WalRecord::FuzzyCheckpointStart { previous } => {
                out.push(KIND_FUZZY_CHECKPOINT_START);
                encode_opt_lsn(&mut out, *previous);
            }
            WalRecord::FuzzyCheckpointEnd => out.push(KIND_FUZZY_CHECKPOINT_END),
            WalRecord::DirtyPages { pages } => {
                out.push(KIND_DIRTY_PAGES);
                out.extend_from_slice(&(pages.len() as u32).to_be_bytes());
                for page in pages {
                    out.extend_from_slice(&page.file.0.to_be_bytes());
                    out.extend_from_slice(&page.page.0.to_be_bytes());
                    out.extend_from_slice(&page.lsn.0.to_be_bytes());
                }
            }
        }
        out
    }

    /// Decodes a record from its payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let kind = dec.u8()?;
        let record = match kind {
            KIND_UNIT_START => WalRecord::UnitStart {
                unit: UnitId(dec.u64()?),
            },
            KIND_UNIT_END => WalRecord::UnitEnd {
                unit: UnitId(dec.u64()?),
                rollback: dec.u8()? != 0,
            },
            KIND_PAGE_UPDATE => {
                let unit = UnitId(dec.u64()?);
                let file = FileId(dec.u32()?);
                let page = PageIndex(dec.u64()?);
                let prior_lsn = dec.opt_lsn()?;
                let count = dec.u32()? as usize;
                let mut changes = ChangeSet::new();
                for _ in 0..count {
                    let offset = dec.u32()?;
                    let len = dec.u32()? as usize;
                    let before = dec.bytes(len)?.to_vec();
                    let after = dec.bytes(len)?.to_vec();
                    changes.record(offset, before, after);
                }
                WalRecord::PageUpdate {
                    unit,
                    file,
                    page,
                    prior_lsn,
                    changes,
                }
            }
            KIND_FILE_CREATED => {
                let unit = UnitId(dec.u64()?);
                let file = FileId(dec.u32()?);
                let len = dec.u32()? as usize;
                let name = String::from_utf8(dec.bytes(len)?.to_vec()).map_err(|_| {
                    StorageError::Corruption("file name in WAL record is not UTF-8".into())
                })?;
                WalRecord::FileCreated { unit, file, name }
            }
            KIND_FULL_CHECKPOINT_START => WalRecord::FullCheckpointStart {
                previous: dec.opt_lsn()?,
            },
            KIND_FULL_CHECKPOINT_END => WalRecord::FullCheckpointEnd,
            KIND_FUZZY_CHECKPOINT_START => WalRecord::FuzzyCheckpointStart {
                previous: dec.opt_lsn()?,
            },
            KIND_FUZZY_CHECKPOINT_END => WalRecord::FuzzyCheckpointEnd,
            KIND_DIRTY_PAGES => {
                let count = dec.u32()? as usize;
                let mut pages = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    pages.push(DirtyPage {
                        file: FileId(dec.u32()?),
                        page: PageIndex(dec.u64()?),
                        lsn: Lsn(dec.u64()?),
                    });
                }
                WalRecord::DirtyPages { pages }
            }
            other => {
                return Err(StorageError::Corruption(format!(
                    "unknown WAL record kind {other}"
                )))
            }
        };
        if !dec.is_finished() {
            return Err(StorageError::Corruption(
                "trailing bytes after WAL record".into(),
            ));
        }
        Ok(record)
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(StorageError::Corruption(
                "truncated WAL record payload".into(),
            )),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.bytes(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(raw);
        Ok(u32::from_be_bytes(arr))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        Ok(u64::from_be_bytes(arr))
    }

    fn opt_lsn(&mut self) -> Result<Option<Lsn>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(Lsn(self.u64()?))),
            other => Err(StorageError::Corruption(format!(
                "invalid option flag {other} in WAL record"
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn encode_opt_lsn(out: &mut Vec<u8>, lsn: Option<Lsn>) {
    match lsn {
        Some(lsn) => {
            out.push(1);
            out.extend_from_slice(&lsn.0.to_be_bytes());
        }
        None => out.push(0),
    }
}
