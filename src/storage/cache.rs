//! Write-back page cache over the storage's data files.
//!
//! Every page is 4 KiB on disk: 4092 payload bytes followed by a CRC32
//! bound to the file id, the page index and the storage salt, so a page
//! that lands in the wrong slot fails verification. Pages full of zeroes
//! are "never written" and skip verification.
//!
//! The cache itself is an LRU over pinned pages. A page stays resident
//! while any [`PinnedPage`] handle is alive; only unpinned pages are
//! eviction candidates, and dirty pages are written back before they are
//! dropped.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::page_crc32;
use crate::types::{FileId, Lsn, PageIndex, Result, StorageError};

/// On-disk page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Payload bytes available to callers; the rest is the page checksum.
pub const PAGE_PAYLOAD: usize = PAGE_SIZE - 4;

pub(crate) const REGISTRY_FILE: &str = "files.map";

/// One page that failed checksum verification during a surface check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageVerificationError {
    /// Name of the file holding the broken page.
    pub file_name: String,
    /// Index of the broken page.
    pub page: PageIndex,
}

#[derive(Serialize, Deserialize)]
struct Registry {
    salt: u64,
    next_id: u32,
    names: HashMap<String, u32>,
}

struct FileHandle {
    name: String,
    io: StdFileIo,
}

struct FilesState {
    by_id: HashMap<u32, FileHandle>,
    by_name: HashMap<String, u32>,
    next_id: u32,
}

struct CachedPage {
    file: FileId,
    page: PageIndex,
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
    /// Start LSN of the unit that made the first logged change since the
    /// last write-back. Drives the dirty-page table of fuzzy checkpoints.
    first_change: Mutex<Option<u64>>,
}

/// Handle pinning one page in the cache.
#[derive(Clone)]
pub struct PinnedPage {
    inner: Arc<CachedPage>,
}

impl PinnedPage {
    /// File the page belongs to.
    pub fn file(&self) -> FileId {
        self.inner.file
    }

    /// Index of the page inside its file.
    pub fn page(&self) -> PageIndex {
        self.inner.page
    }

    /// Locks the payload for reading or writing. The guard is the page's
    /// exclusive latch; hold it for the duration of one access.
    pub fn payload(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.data.lock()
    }

    /// Marks the page as needing write-back.
    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// True when the page has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Records the LSN replay must resume from to cover a logged change;
    /// the oldest one since the last write-back is kept.
    pub fn note_change_lsn(&self, lsn: Lsn) {
        let mut first = self.inner.first_change.lock();
        *first = Some(first.map_or(lsn.0, |oldest| oldest.min(lsn.0)));
    }
}

/// Shared page cache for every data file of one storage.
pub struct PageCache {
    dir: PathBuf,
    salt: u64,
    capacity: usize,
    files: RwLock<FilesState>,
    pages: Mutex<LruCache<(u32, u64), Arc<CachedPage>>>,
}

impl PageCache {
    /// Opens the cache over `dir`, creating the file registry when absent.
    pub fn open(dir: impl AsRef<Path>, capacity: NonZeroUsize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let registry_path = dir.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            let raw = fs::read(&registry_path)?;
            serde_json::from_slice::<Registry>(&raw)
                .map_err(|err| StorageError::Corruption(format!("invalid file registry: {err}")))?
        } else {
            Registry {
                salt: rand::thread_rng().gen(),
                next_id: 0,
                names: HashMap::new(),
            }
        };

        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (name, id) in &registry.names {
            let path = dir.join(name);
            if !path.exists() {
                warn!(
                    target: "cache.open",
                    file = %name,
                    "registered file is missing, dropping it from the registry"
                );
                continue;
            }
            let io = StdFileIo::open(path)?;
            by_id.insert(*id, FileHandle {
                name: name.clone(),
                io,
            });
            by_name.insert(name.clone(), *id);
        }

        let cache = Self {
            dir,
            salt: registry.salt,
            capacity: capacity.get(),
            files: RwLock::new(FilesState {
                by_id,
                by_name,
                next_id: registry.next_id,
            }),
            pages: Mutex::new(LruCache::unbounded()),
        };
        cache.persist_registry()?;
        info!(
            target: "cache.open",
            files = cache.files.read().by_id.len(),
            capacity = cache.capacity,
            "page cache opened"
        );
        Ok(cache)
    }

    /// Opens (creating when absent) the file named `name`, returning its id.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        {
            let files = self.files.read();
            if let Some(id) = files.by_name.get(name) {
                return Ok(FileId(*id));
            }
        }
        let mut files = self.files.write();
        if let Some(id) = files.by_name.get(name) {
            return Ok(FileId(*id));
        }
        let id = files.next_id;
        files.next_id += 1;
        self.register(&mut files, id, name)?;
        drop(files);
        self.persist_registry()?;
        Ok(FileId(id))
    }

    /// Opens `name` under a caller-chosen id. Used when replaying file
    /// creations from the log, where ids must match the original run.
    pub fn open_file_by_id(&self, id: FileId, name: &str) -> Result<()> {
        let mut files = self.files.write();
        match files.by_name.get(name) {
            Some(existing) if *existing == id.0 => return Ok(()),
            Some(existing) => {
                return Err(StorageError::State(format!(
                    "file '{name}' is already registered under id {existing}"
                )))
            }
            None => {}
        }
        if files.by_id.contains_key(&id.0) {
            return Err(StorageError::State(format!(
                "file id {} is already in use",
                id.0
            )));
        }
        files.next_id = files.next_id.max(id.0 + 1);
        self.register(&mut files, id.0, name)?;
        drop(files);
        self.persist_registry()
    }

    /// True when a file is registered under `id`.
    pub fn is_open(&self, id: FileId) -> bool {
        self.files.read().by_id.contains_key(&id.0)
    }

    /// Id of the file named `name`, if registered.
    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.files.read().by_name.get(name).copied().map(FileId)
    }

    /// Number of pages currently stored in the file.
    pub fn file_page_count(&self, id: FileId) -> Result<u64> {
        let files = self.files.read();
        let handle = file_handle(&files, id)?;
        Ok(handle.io.len()? / PAGE_SIZE as u64)
    }

    /// Pins the page at (`file`, `page`). Pages at or past the end of the
    /// file come back zero-filled and clean; the file grows when such a
    /// page is first flushed.
    pub fn load(&self, file: FileId, page: PageIndex) -> Result<PinnedPage> {
        let mut pages = self.pages.lock();
        if let Some(cached) = pages.get(&(file.0, page.0)) {
            return Ok(PinnedPage {
                inner: Arc::clone(cached),
            });
        }
        drop(pages);

        let payload = self.read_page(file, page)?;
        let entry = Arc::new(CachedPage {
            file,
            page,
            data: Mutex::new(payload),
            dirty: AtomicBool::new(false),
            first_change: Mutex::new(None),
        });

        let mut pages = self.pages.lock();
        // Another thread may have loaded the page while we read it.
        if let Some(cached) = pages.get(&(file.0, page.0)) {
            return Ok(PinnedPage {
                inner: Arc::clone(cached),
            });
        }
        pages.put((file.0, page.0), Arc::clone(&entry));
        self.evict_excess(&mut pages)?;
        Ok(PinnedPage { inner: entry })
    }

    /// Writes back every dirty page and syncs every file.
    pub fn flush_buffer(&self) -> Result<()> {
        let entries: Vec<Arc<CachedPage>> = {
            let pages = self.pages.lock();
            pages.iter().map(|(_, page)| Arc::clone(page)).collect()
        };
        let mut flushed = 0usize;
        for entry in entries {
            if entry.dirty.load(Ordering::Acquire) {
                self.write_back(&entry)?;
                flushed += 1;
            }
        }
        let files = self.files.read();
        for handle in files.by_id.values() {
            handle.io.sync_all()?;
        }
        debug!(target: "cache.flush", pages = flushed, "cache flushed");
        Ok(())
    }

    /// Writes back and syncs the dirty pages of one file.
    pub fn flush_file(&self, file: FileId) -> Result<()> {
        let entries: Vec<Arc<CachedPage>> = {
            let pages = self.pages.lock();
            pages
                .iter()
                .filter(|((f, _), _)| *f == file.0)
                .map(|(_, page)| Arc::clone(page))
                .collect()
        };
        for entry in entries {
            if entry.dirty.load(Ordering::Acquire) {
                self.write_back(&entry)?;
            }
        }
        let files = self.files.read();
        file_handle(&files, file)?.io.sync_all()
    }

    /// Drops the file's cached pages and truncates it to zero length.
    pub fn truncate_file(&self, file: FileId) -> Result<()> {
        self.forget_pages(file);
        let files = self.files.read();
        file_handle(&files, file)?.io.truncate(0)
    }

    /// Removes the file from the cache, the registry and the filesystem.
    pub fn delete_file(&self, file: FileId) -> Result<()> {
        self.forget_pages(file);
        let name = {
            let mut files = self.files.write();
            let handle = files.by_id.remove(&file.0).ok_or_else(|| {
                StorageError::State(format!("file {} is not open", file.0))
            })?;
            files.by_name.remove(&handle.name);
            handle.name
        };
        fs::remove_file(self.dir.join(&name))?;
        self.persist_registry()
    }

    /// Every dirty page with the LSN of its first unflushed logged change.
    /// Pages dirtied without a logged change report `None`.
    pub fn dirty_pages(&self) -> Vec<(FileId, PageIndex, Option<Lsn>)> {
        let pages = self.pages.lock();
        pages
            .iter()
            .filter(|(_, page)| page.dirty.load(Ordering::Acquire))
            .map(|(_, page)| {
                let first = page.first_change.lock().map(Lsn);
                (page.file, page.page, first)
            })
            .collect()
    }

    /// Verifies the checksum of every stored page, returning the broken
    /// ones. All-zero pages are unwritten and skipped.
    pub fn check_stored_pages(&self) -> Result<Vec<PageVerificationError>> {
        self.flush_buffer()?;
        let files = self.files.read();
        let mut broken = Vec::new();
        for (id, handle) in &files.by_id {
            let page_count = handle.io.len()? / PAGE_SIZE as u64;
            let mut buf = vec![0u8; PAGE_SIZE];
            for page in 0..page_count {
                handle.io.read_at(page * PAGE_SIZE as u64, &mut buf)?;
                if buf.iter().all(|byte| *byte == 0) {
                    continue;
                }
                let stored = u32::from_be_bytes([
                    buf[PAGE_PAYLOAD],
                    buf[PAGE_PAYLOAD + 1],
                    buf[PAGE_PAYLOAD + 2],
                    buf[PAGE_PAYLOAD + 3],
                ]);
                let expected = page_crc32(*id, page, self.salt, &buf[..PAGE_PAYLOAD]);
                if stored != expected {
                    broken.push(PageVerificationError {
                        file_name: handle.name.clone(),
                        page: PageIndex(page),
                    });
                }
            }
        }
        Ok(broken)
    }

    /// Flushes everything and empties the cache.
    pub fn close(&self) -> Result<()> {
        self.flush_buffer()?;
        self.pages.lock().clear();
        Ok(())
    }

    /// Removes every registered file and the registry itself.
    pub fn delete(self) -> Result<()> {
        self.pages.lock().clear();
        let files = self.files.read();
        for handle in files.by_id.values() {
            fs::remove_file(self.dir.join(&handle.name))?;
        }
        let registry = self.dir.join(REGISTRY_FILE);
        if registry.exists() {
            fs::remove_file(registry)?;
        }
        Ok(())
    }

    fn register(&self, files: &mut FilesState, id: u32, name: &str) -> Result<()> {
        let io = StdFileIo::open(self.dir.join(name))?;
        files.by_id.insert(id, FileHandle {
            name: name.to_owned(),
            io,
        });
        files.by_name.insert(name.to_owned(), id);
        Ok(())
    }

    fn read_page(&self, file: FileId, page: PageIndex) -> Result<Vec<u8>> {
        let files = self.files.read();
        let handle = file_handle(&files, file)?;
        let offset = page.0 * PAGE_SIZE as u64;
        if offset + PAGE_SIZE as u64 > handle.io.len()? {
            return Ok(vec![0u8; PAGE_PAYLOAD]);
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        handle.io.read_at(offset, &mut buf)?;
        if buf.iter().all(|byte| *byte == 0) {
            buf.truncate(PAGE_PAYLOAD);
            return Ok(buf);
        }
        let stored = u32::from_be_bytes([
            buf[PAGE_PAYLOAD],
            buf[PAGE_PAYLOAD + 1],
            buf[PAGE_PAYLOAD + 2],
            buf[PAGE_PAYLOAD + 3],
        ]);
        let expected = page_crc32(file.0, page.0, self.salt, &buf[..PAGE_PAYLOAD]);
        if stored != expected {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in file '{}' page {}",
                handle.name, page.0
            )));
        }
        buf.truncate(PAGE_PAYLOAD);
        Ok(buf)
    }

    fn write_back(&self, entry: &CachedPage) -> Result<()> {
        let files = self.files.read();
        let handle = file_handle(&files, entry.file)?;
        let payload = entry.data.lock();
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..PAGE_PAYLOAD].copy_from_slice(&payload);
        let crc = page_crc32(entry.file.0, entry.page.0, self.salt, &payload);
        buf[PAGE_PAYLOAD..].copy_from_slice(&crc.to_be_bytes());
        handle.io.write_at(entry.page.0 * PAGE_SIZE as u64, &buf)?;
        *entry.first_change.lock() = None;
        entry.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn forget_pages(&self, file: FileId) {
        let mut pages = self.pages.lock();
        let keys: Vec<(u32, u64)> = pages
            .iter()
            .map(|(key, _)| *key)
            .filter(|(f, _)| *f == file.0)
            .collect();
        for key in keys {
            pages.pop(&key);
        }
    }

    fn evict_excess(&self, pages: &mut LruCache<(u32, u64), Arc<CachedPage>>) -> Result<()> {
        let mut attempts = pages.len();
        while pages.len() > self.capacity && attempts > 0 {
            attempts -= 1;
            let Some((key, entry)) = pages.pop_lru() else {
                break;
            };
            if Arc::strong_count(&entry) > 1 {
                // Pinned pages are not evictable; cycle them to the front.
                pages.put(key, entry);
                continue;
            }
            if entry.dirty.load(Ordering::Acquire) {
                self.write_back(&entry)?;
            }
        }
        Ok(())
    }

    fn persist_registry(&self) -> Result<()> {
        let files = self.files.read();
        let registry = Registry {
            salt: self.salt,
            next_id: files.next_id,
            names: files
                .by_name
                .iter()
                .map(|(name, id)| (name.clone(), *id))
                .collect(),
        };
        let raw = serde_json::to_vec_pretty(&registry)
            .map_err(|err| StorageError::Configuration(err.to_string()))?;
        let tmp = self.dir.join(format!("{REGISTRY_FILE}.tmp"));
        fs::write(&tmp, &raw)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, self.dir.join(REGISTRY_FILE))?;
        Ok(())
    }
}

fn file_handle(files: &FilesState, id: FileId) -> Result<&FileHandle> {
    files
        .by_id
        .get(&id.0)
        .ok_or_else(|| StorageError::State(format!("file {} is not open", id.0)))
}
