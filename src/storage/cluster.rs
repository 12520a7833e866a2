//! Paginated record clusters.
//!
//! A cluster stores versioned records in one cache file. Each page holds a
//! small directory header followed by densely appended entries; an entry
//! carries the record's state, kind, version, logical position, reserved
//! capacity and current length. Positions are logical and stable: an
//! update that no longer fits its slot relocates the bytes but keeps the
//! position, and a deleted position is never reissued.
//!
//! The in-memory position map is an index, not the truth. After an undo
//! pass rewrites pages underneath the cluster, [`PaginatedCluster::reload`]
//! rebuilds it from the pages.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, trace};

use crate::storage::atomic::{AtomicOperationsManager, OperationContext};
use crate::storage::cache::{PageCache, PAGE_PAYLOAD};
use crate::storage::config::{ClusterConfig, CompressionMethod};
use crate::storage::conflict::ConflictResolution;
use crate::storage::page::DurablePage;
use crate::types::{FileId, PageIndex, PhysicalPosition, Result, StorageError};

/// Offset of the entry-count field in the page payload.
const COUNT_OFFSET: usize = 8;
/// Offset of the free-space pointer in the page payload.
const FREE_OFFSET: usize = 10;
/// Offset where entries start.
const ENTRIES_START: usize = 12;
/// Bytes of entry header before the record content.
const ENTRY_HEADER: usize = 22;

/// Largest record content (after compression) a cluster accepts.
pub const MAX_RECORD_CONTENT: usize = PAGE_PAYLOAD - ENTRIES_START - ENTRY_HEADER;

const STATE_FREE: u8 = 0;
const STATE_LIVE: u8 = 1;
const STATE_REMOVED: u8 = 2;
const STATE_MOVED: u8 = 3;
const STATE_HIDDEN: u8 = 4;

#[derive(Clone, Copy)]
struct SlotRef {
    page: u64,
    offset: usize,
}

#[derive(Default)]
struct ClusterState {
    positions: BTreeMap<u64, SlotRef>,
    next_position: u64,
    append_page: u64,
    entries: u64,
    tombstones: u64,
}

/// A record read out of a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    /// Record content, decompressed.
    pub content: Vec<u8>,
    /// Stored version counter.
    pub version: i32,
    /// Caller-supplied record kind byte.
    pub record_kind: u8,
}

/// Guard returned by [`PaginatedCluster::lock_unit`]; the next unit may
/// touch the cluster once it drops.
pub type ClusterUnitGuard = ArcMutexGuard<RawMutex, ()>;

/// One cluster of versioned records backed by a single cache file.
pub struct PaginatedCluster {
    id: u32,
    name: String,
    file: FileId,
    file_name: String,
    compression: CompressionMethod,
    conflict: ConflictResolution,
    cache: Arc<PageCache>,
    atomic: Option<Arc<AtomicOperationsManager>>,
    state: Mutex<ClusterState>,
    unit_lock: Arc<Mutex<()>>,
}

impl PaginatedCluster {
    /// Opens (creating the backing file when absent) the cluster described
    /// by `config` and rebuilds the position map from its pages.
    pub fn open(
        cache: Arc<PageCache>,
        atomic: Option<Arc<AtomicOperationsManager>>,
        config: &ClusterConfig,
        compression: CompressionMethod,
        default_conflict: ConflictResolution,
    ) -> Result<Self> {
        let file = cache.open_file(&config.file_name)?;
        let cluster = Self {
            id: config.id,
            name: config.name.clone(),
            file,
            file_name: config.file_name.clone(),
            compression,
            conflict: config.conflict.unwrap_or(default_conflict),
            cache,
            atomic,
            state: Mutex::new(ClusterState::default()),
            unit_lock: Arc::new(Mutex::new(())),
        };
        cluster.reload()?;
        Ok(cluster)
    }

    /// Serializes atomic units against this cluster. A rolled-back unit
    /// is undone from raw before-images, which only holds up if no other
    /// unit wrote the same pages in between; every unit that mutates the
    /// cluster holds the guard from before its first page write until
    /// after its end record.
    pub fn lock_unit(&self) -> ClusterUnitGuard {
        self.unit_lock.lock_arc()
    }

    /// Cluster identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing cache file.
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Name of the backing cache file.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Effective conflict-resolution strategy.
    pub fn conflict(&self) -> ConflictResolution {
        self.conflict
    }

    /// Number of live records.
    pub fn entries(&self) -> u64 {
        self.state.lock().entries
    }

    /// Number of removed or hidden positions still occupying space.
    pub fn tombstones(&self) -> u64 {
        self.state.lock().tombstones
    }

    /// Appends a record and returns its physical position, versioned 1.
    pub fn create_record(
        &self,
        ctx: &OperationContext,
        content: &[u8],
        record_kind: u8,
    ) -> Result<PhysicalPosition> {
        let stored = self.compress(content)?;
        let needed = ENTRY_HEADER + stored.len();
        if stored.len() > MAX_RECORD_CONTENT {
            return Err(StorageError::Configuration(format!(
                "record of {} bytes exceeds the {MAX_RECORD_CONTENT}-byte page limit",
                stored.len()
            )));
        }

        let mut state = self.state.lock();
        let position = state.next_position;
        state.next_position += 1;

        let (page_index, offset) = self.append_slot(&mut state, needed)?;
        let mut page = self.load_page(page_index)?;
        write_entry_header(
            &mut page,
            offset,
            STATE_LIVE,
            record_kind,
            1,
            position,
            stored.len() as u32,
            stored.len() as u32,
        );
        page.write(offset + ENTRY_HEADER, &stored);
        page.write_u16(COUNT_OFFSET, page.read_u16(COUNT_OFFSET) + 1);
        page.write_u16(FREE_OFFSET, (offset + needed) as u16);
        self.log_page(ctx, &mut page)?;

        state.positions.insert(position, SlotRef {
            page: page_index,
            offset,
        });
        state.entries += 1;
        trace!(
            target: "cluster.create",
            cluster = self.id,
            position,
            bytes = stored.len()
        );
        Ok(PhysicalPosition {
            position,
            version: 1,
            record_kind,
        })
    }

    /// Reads a record. Removed, hidden and unknown positions read as absent.
    pub fn read_record(&self, position: u64) -> Result<Option<RawRecord>> {
        let slot = {
            let state = self.state.lock();
            match state.positions.get(&position) {
                Some(slot) => *slot,
                None => return Ok(None),
            }
        };
        let page = self.load_page(slot.page)?;
        let header = read_entry_header(&page, slot.offset);
        if header.state != STATE_LIVE || header.position != position {
            return Err(StorageError::Corruption(format!(
                "cluster {} position map points at a stale slot for position {position}",
                self.id
            )));
        }
        let stored = page.read(slot.offset + ENTRY_HEADER, header.len as usize);
        Ok(Some(RawRecord {
            content: self.decompress(&stored)?,
            version: header.version,
            record_kind: header.kind,
        }))
    }

    /// Physical position of a live record, if tracked.
    pub fn physical_position(&self, position: u64) -> Result<Option<PhysicalPosition>> {
        let slot = {
            let state = self.state.lock();
            match state.positions.get(&position) {
                Some(slot) => *slot,
                None => return Ok(None),
            }
        };
        let page = self.load_page(slot.page)?;
        let header = read_entry_header(&page, slot.offset);
        Ok(Some(PhysicalPosition {
            position,
            version: header.version,
            record_kind: header.kind,
        }))
    }

    /// Overwrites a record with `content` at `version`. Returns false when
    /// the position is not tracked. The caller decides the version; the
    /// cluster stores it verbatim.
    pub fn update_record(
        &self,
        ctx: &OperationContext,
        position: u64,
        content: &[u8],
        version: i32,
        record_kind: u8,
    ) -> Result<bool> {
        let stored = self.compress(content)?;
        if stored.len() > MAX_RECORD_CONTENT {
            return Err(StorageError::Configuration(format!(
                "record of {} bytes exceeds the {MAX_RECORD_CONTENT}-byte page limit",
                stored.len()
            )));
        }

        let mut state = self.state.lock();
        let slot = match state.positions.get(&position) {
            Some(slot) => *slot,
            None => return Ok(false),
        };
        let mut page = self.load_page(slot.page)?;
        let header = read_entry_header(&page, slot.offset);

        if stored.len() <= header.capacity as usize {
            // In-place rewrite inside the reserved capacity.
            page.write_i32(slot.offset + 2, version);
            page.write(slot.offset + 1, &[record_kind]);
            page.write_u32(slot.offset + 18, stored.len() as u32);
            page.write(slot.offset + ENTRY_HEADER, &stored);
            self.log_page(ctx, &mut page)?;
            return Ok(true);
        }

        // Relocate: retire the old slot, append a fresh one under the same
        // logical position.
        page.write(slot.offset, &[STATE_MOVED]);
        self.log_page(ctx, &mut page)?;
        drop(page);

        let needed = ENTRY_HEADER + stored.len();
        let (page_index, offset) = self.append_slot(&mut state, needed)?;
        let mut page = self.load_page(page_index)?;
        write_entry_header(
            &mut page,
            offset,
            STATE_LIVE,
            record_kind,
            version,
            position,
            stored.len() as u32,
            stored.len() as u32,
        );
        page.write(offset + ENTRY_HEADER, &stored);
        page.write_u16(COUNT_OFFSET, page.read_u16(COUNT_OFFSET) + 1);
        page.write_u16(FREE_OFFSET, (offset + needed) as u16);
        self.log_page(ctx, &mut page)?;

        state.positions.insert(position, SlotRef {
            page: page_index,
            offset,
        });
        debug!(
            target: "cluster.relocate",
            cluster = self.id,
            position,
            to_page = page_index
        );
        Ok(true)
    }

    /// Removes a record. Returns false when the position is not tracked.
    pub fn delete_record(&self, ctx: &OperationContext, position: u64) -> Result<bool> {
        self.retire(ctx, position, STATE_REMOVED)
    }

    /// Hides a record: the position stays allocated but reads as absent.
    pub fn hide_record(&self, ctx: &OperationContext, position: u64) -> Result<bool> {
        self.retire(ctx, position, STATE_HIDDEN)
    }

    /// Lowest tracked position, if any.
    pub fn first_position(&self) -> Option<u64> {
        self.state.lock().positions.keys().next().copied()
    }

    /// Lowest tracked position strictly greater than `position`.
    pub fn higher_position(&self, position: u64) -> Option<u64> {
        use std::ops::Bound;
        self.state
            .lock()
            .positions
            .range((Bound::Excluded(position), Bound::Unbounded))
            .next()
            .map(|(pos, _)| *pos)
    }

    /// Rebuilds the in-memory position map from the pages. Called after
    /// log-driven undo or redo rewrote page bytes directly.
    pub fn reload(&self) -> Result<()> {
        let mut fresh = ClusterState::default();
        let page_count = self.cache.file_page_count(self.file)?;
        for page_index in 0..page_count {
            let page = self.load_page(page_index)?;
            let free = free_offset(&page);
            let mut offset = ENTRIES_START;
            while offset + ENTRY_HEADER <= free {
                let header = read_entry_header(&page, offset);
                if header.state == STATE_FREE {
                    break;
                }
                match header.state {
                    STATE_LIVE => {
                        fresh.positions.insert(header.position, SlotRef {
                            page: page_index,
                            offset,
                        });
                        fresh.entries += 1;
                    }
                    STATE_REMOVED | STATE_HIDDEN => fresh.tombstones += 1,
                    STATE_MOVED => {}
                    other => {
                        return Err(StorageError::Corruption(format!(
                            "cluster {} page {page_index} has entry state {other}",
                            self.id
                        )))
                    }
                }
                fresh.next_position = fresh.next_position.max(header.position + 1);
                offset += ENTRY_HEADER + header.capacity as usize;
            }
        }
        fresh.append_page = page_count.saturating_sub(1);
        *self.state.lock() = fresh;
        Ok(())
    }

    /// Drops every record and resets the cluster to empty.
    pub fn truncate(&self) -> Result<()> {
        self.cache.truncate_file(self.file)?;
        *self.state.lock() = ClusterState::default();
        Ok(())
    }

    /// Removes the backing file. The cluster must not be used afterwards.
    pub fn delete(&self) -> Result<()> {
        self.cache.delete_file(self.file)
    }

    fn retire(&self, ctx: &OperationContext, position: u64, state_byte: u8) -> Result<bool> {
        let mut state = self.state.lock();
        let slot = match state.positions.remove(&position) {
            Some(slot) => slot,
            None => return Ok(false),
        };
        let mut page = self.load_page(slot.page)?;
        page.write(slot.offset, &[state_byte]);
        page.write_u16(COUNT_OFFSET, page.read_u16(COUNT_OFFSET) - 1);
        self.log_page(ctx, &mut page)?;
        state.entries -= 1;
        state.tombstones += 1;
        trace!(
            target: "cluster.retire",
            cluster = self.id,
            position,
            hidden = state_byte == STATE_HIDDEN
        );
        Ok(true)
    }

    /// Picks the page and offset for a new entry of `needed` bytes,
    /// advancing to a fresh page when the append page is full.
    fn append_slot(&self, state: &mut ClusterState, needed: usize) -> Result<(u64, usize)> {
        let page = self.load_page(state.append_page)?;
        let free = free_offset(&page);
        if free + needed <= PAGE_PAYLOAD {
            return Ok((state.append_page, free));
        }
        state.append_page += 1;
        Ok((state.append_page, ENTRIES_START))
    }

    fn load_page(&self, page: u64) -> Result<DurablePage> {
        Ok(DurablePage::new(self.cache.load(self.file, PageIndex(page))?))
    }

    fn log_page(&self, ctx: &OperationContext, page: &mut DurablePage) -> Result<()> {
        match &self.atomic {
            Some(atomic) => {
                atomic.log_page_update(ctx, page)?;
            }
            None => {
                // Running without a WAL: drop the change set, keep the page.
                page.take_changes();
                page.pinned().mark_dirty();
            }
        }
        Ok(())
    }

    fn compress(&self, content: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            CompressionMethod::None => Ok(content.to_vec()),
            CompressionMethod::Snappy => snap::raw::Encoder::new()
                .compress_vec(content)
                .map_err(|err| StorageError::Corruption(format!("compression failed: {err}"))),
        }
    }

    fn decompress(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            CompressionMethod::None => Ok(stored.to_vec()),
            CompressionMethod::Snappy => snap::raw::Decoder::new()
                .decompress_vec(stored)
                .map_err(|err| StorageError::Corruption(format!("decompression failed: {err}"))),
        }
    }
}

struct EntryHeader {
    state: u8,
    kind: u8,
    version: i32,
    position: u64,
    capacity: u32,
    len: u32,
}

fn read_entry_header(page: &DurablePage, offset: usize) -> EntryHeader {
    EntryHeader {
        state: page.read(offset, 1)[0],
        kind: page.read(offset + 1, 1)[0],
        version: page.read_i32(offset + 2),
        position: page.read_u64(offset + 6),
        capacity: page.read_u32(offset + 14),
        len: page.read_u32(offset + 18),
    }
}

#[allow(clippy::too_many_arguments)]
fn write_entry_header(
    page: &mut DurablePage,
    offset: usize,
    state: u8,
    kind: u8,
    version: i32,
    position: u64,
    capacity: u32,
    len: u32,
) {
    let mut header = [0u8; ENTRY_HEADER];
    header[0] = state;
    header[1] = kind;
    header[2..6].copy_from_slice(&(version as u32).to_be_bytes());
    header[6..14].copy_from_slice(&position.to_be_bytes());
    header[14..18].copy_from_slice(&capacity.to_be_bytes());
    header[18..22].copy_from_slice(&len.to_be_bytes());
    page.write(offset, &header);
}

fn free_offset(page: &DurablePage) -> usize {
    let raw = page.read_u16(FREE_OFFSET) as usize;
    if raw == 0 {
        ENTRIES_START
    } else {
        raw
    }
}
