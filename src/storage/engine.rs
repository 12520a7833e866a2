//! The paginated storage engine.
//!
//! [`PaginatedStorage`] ties the components together: the configuration
//! record, the write-ahead log, the page cache and the clusters. Every
//! mutation runs inside an atomic operation unit and is logged before its
//! pages may reach disk; a storage reopened after a crash replays the log
//! from the last usable checkpoint and rolls back units that never ended.
//!
//! Lock order is fixed: component guard, then the modification gate, then
//! the cluster unit lock (in ascending cluster order), then the record
//! lock, then cluster internals. Checkpoints take the gate exclusively,
//! so they see no half-applied operations.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::primitives::wal::record::{DirtyPage, WalRecord};
use crate::primitives::wal::WriteAheadLog;
use crate::storage::atomic::{AtomicOperationsManager, CompletedOperation, OperationContext};
use crate::storage::cache::{PageCache, PageVerificationError};
use crate::storage::cluster::{ClusterUnitGuard, PaginatedCluster, RawRecord};
use crate::storage::config::{GlobalOptions, StorageConfiguration};
use crate::storage::conflict::ConflictResolution;
use crate::storage::locks::{ModificationLock, ProhibitionGuard, RecordLockManager};
use crate::storage::transaction::{
    is_provisional, ClientTransaction, CommittedRecord, RecordOperationKind, StorageSession,
};
use crate::types::{
    FileId, Lsn, RecordId, Result, StorageError, StorageStatus, UnitId, VERSION_NO_BUMP,
    VERSION_SKIP_CHECK, VERSION_UNTRACKED,
};

/// Default number of pages held by the cache.
pub const DEFAULT_CACHE_PAGES: usize = 4096;

/// Page updates are replayed in groups of this size during recovery.
const RESTORE_BATCH_SIZE: usize = 1024;

/// Clusters every storage starts with; the last one is the default target
/// for record operations that do not name a cluster.
const BOOKKEEPING_CLUSTERS: [&str; 4] = ["internal", "index", "manindex", "default"];

/// Result of a single record mutation.
///
/// `Failed` reports an internal failure that was rolled back; the storage
/// stays consistent and the caller may retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationOutcome<T> {
    /// The operation ran to completion.
    Completed(T),
    /// The operation failed and its unit was rolled back.
    Failed,
}

impl<T> OperationOutcome<T> {
    /// The completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            OperationOutcome::Completed(value) => Some(value),
            OperationOutcome::Failed => None,
        }
    }
}

struct Components {
    config: StorageConfiguration,
    wal: Option<Arc<WriteAheadLog>>,
    cache: Arc<PageCache>,
    atomic: Option<Arc<AtomicOperationsManager>>,
    clusters: RwLock<Vec<Option<Arc<PaginatedCluster>>>>,
}

/// Durable, crash-recoverable record storage over paginated files.
pub struct PaginatedStorage {
    dir: PathBuf,
    status: RwLock<StorageStatus>,
    inner: RwLock<Option<Components>>,
    modification: ModificationLock,
    record_locks: RecordLockManager,
}

impl PaginatedStorage {
    /// Creates a new storage in `dir` and opens it.
    pub fn create(dir: impl AsRef<Path>, options: GlobalOptions) -> Result<Self> {
        Self::open_internal(dir.as_ref(), default_cache_pages(), Some(options))
    }

    /// Opens an existing storage, running crash recovery when its previous
    /// run did not shut down cleanly.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_internal(dir.as_ref(), default_cache_pages(), None)
    }

    /// Like [`PaginatedStorage::open`] with an explicit cache size.
    pub fn open_with_cache(dir: impl AsRef<Path>, cache_pages: NonZeroUsize) -> Result<Self> {
        Self::open_internal(dir.as_ref(), cache_pages, None)
    }

    fn open_internal(
        dir: &Path,
        cache_pages: NonZeroUsize,
        create: Option<GlobalOptions>,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let storage = Self {
            dir: dir.to_path_buf(),
            status: RwLock::new(StorageStatus::Opening),
            inner: RwLock::new(None),
            modification: ModificationLock::new(),
            record_locks: RecordLockManager::new(),
        };
        match storage.initialize(cache_pages, create) {
            Ok(()) => {
                *storage.status.write() = StorageStatus::Open;
                Ok(storage)
            }
            Err(err) => {
                *storage.status.write() = StorageStatus::Closed;
                *storage.inner.write() = None;
                Err(err)
            }
        }
    }

    fn initialize(&self, cache_pages: NonZeroUsize, create: Option<GlobalOptions>) -> Result<()> {
        let creating = create.is_some();
        let config = match create {
            Some(options) => StorageConfiguration::create(&self.dir, options)?,
            None => StorageConfiguration::load(&self.dir)?,
        };
        let options = config.options();
        let cache = Arc::new(PageCache::open(&self.dir, cache_pages)?);

        let (wal, atomic, restored) = if options.wal_enabled {
            let wal = Arc::new(WriteAheadLog::open(&self.dir)?);
            let (next_unit, restored) = if !creating && config.is_dirty() {
                warn!(
                    target: "storage.open",
                    path = %self.dir.display(),
                    "storage was not shut down cleanly, restoring from the write-ahead log"
                );
                (restore_from_wal(&wal, &cache)?, true)
            } else {
                (1, false)
            };
            let atomic = Arc::new(AtomicOperationsManager::new(Arc::clone(&wal), next_unit));
            (Some(wal), Some(atomic), restored)
        } else {
            (None, None, false)
        };

        let mut clusters: Vec<Option<Arc<PaginatedCluster>>> = Vec::new();
        for cfg in config.clusters() {
            if !self.dir.join(&cfg.file_name).exists() {
                warn!(
                    target: "storage.open",
                    cluster = %cfg.name,
                    file = %cfg.file_name,
                    "cluster file is missing, cluster excluded"
                );
                continue;
            }
            let cluster = PaginatedCluster::open(
                Arc::clone(&cache),
                atomic.clone(),
                &cfg,
                options.compression,
                options.conflict,
            )?;
            let slot = cfg.id as usize;
            if clusters.len() <= slot {
                clusters.resize(slot + 1, None);
            }
            clusters[slot] = Some(Arc::new(cluster));
        }

        *self.inner.write() = Some(Components {
            config,
            wal,
            cache,
            atomic,
            clusters: RwLock::new(clusters),
        });

        let comps = self.components()?;
        if creating {
            for name in BOOKKEEPING_CLUSTERS {
                let id = self.add_cluster_inner(&comps, name, None)?;
                if name == "default" {
                    comps.config.set_default_cluster(id)?;
                }
            }
        }
        if restored {
            // A fresh checkpoint makes the repaired state durable and
            // trims the log the recovery just replayed.
            self.checkpoint_internal(&comps, false)?;
            info!(target: "storage.open", "restore complete");
        } else if creating && options.checkpoint_on_create && options.wal_enabled {
            self.checkpoint_internal(&comps, false)?;
        }
        info!(
            target: "storage.open",
            path = %self.dir.display(),
            clusters = comps.clusters.read().iter().flatten().count(),
            "storage open"
        );
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> StorageStatus {
        *self.status.read()
    }

    /// Global options the storage was created with.
    pub fn options(&self) -> Result<GlobalOptions> {
        Ok(self.components()?.config.options())
    }

    /// Checkpoints, flushes and closes the storage. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut status = self.status.write();
            match *status {
                StorageStatus::Open => *status = StorageStatus::Closing,
                StorageStatus::Closed => return Ok(()),
                other => {
                    return Err(StorageError::State(format!(
                        "cannot close a storage that is {other}"
                    )))
                }
            }
        }
        let result = self.close_components();
        *self.status.write() = StorageStatus::Closed;
        result
    }

    /// Closes the storage and removes every file it owns.
    pub fn delete(self) -> Result<()> {
        let cluster_files: Vec<String> = self
            .components()
            .map(|c| c.config.clusters().into_iter().map(|cfg| cfg.file_name).collect())
            .unwrap_or_default();
        self.close()?;
        for name in cluster_files {
            remove_if_present(&self.dir.join(name))?;
        }
        for name in [
            crate::storage::config::CONFIG_FILE,
            crate::storage::cache::REGISTRY_FILE,
            crate::primitives::wal::WAL_FILE,
            crate::primitives::wal::MASTER_FILE,
        ] {
            remove_if_present(&self.dir.join(name))?;
        }
        info!(target: "storage.delete", path = %self.dir.display(), "storage deleted");
        Ok(())
    }

    // ---- cluster management ----

    /// Registers a new cluster and returns its identifier.
    pub fn add_cluster(&self, name: &str, conflict: Option<ConflictResolution>) -> Result<u32> {
        self.guard_open()?;
        let comps = self.components()?;
        self.add_cluster_inner(&comps, name, conflict)
    }

    fn add_cluster_inner(
        &self,
        comps: &Components,
        name: &str,
        conflict: Option<ConflictResolution>,
    ) -> Result<u32> {
        let _gate = self.modification.start();
        comps.config.mark_dirty()?;
        let cfg = comps.config.add_cluster(name, conflict)?;
        let options = comps.config.options();

        let mut ctx = OperationContext::new();
        let opened = (|| -> Result<Arc<PaginatedCluster>> {
            if let Some(atomic) = &comps.atomic {
                atomic.start(&mut ctx)?;
                let file = comps.cache.open_file(&cfg.file_name)?;
                atomic.log_file_created(&ctx, file, &cfg.file_name)?;
            }
            let cluster = PaginatedCluster::open(
                Arc::clone(&comps.cache),
                comps.atomic.clone(),
                &cfg,
                options.compression,
                options.conflict,
            )?;
            Ok(Arc::new(cluster))
        })();

        match opened {
            Ok(cluster) => {
                self.finish_unit(comps, &mut ctx)?;
                let mut clusters = comps.clusters.write();
                let slot = cfg.id as usize;
                if clusters.len() <= slot {
                    clusters.resize(slot + 1, None);
                }
                clusters[slot] = Some(cluster);
                info!(target: "storage.cluster", cluster = name, id = cfg.id, "cluster created");
                Ok(cfg.id)
            }
            Err(err) => {
                error!(
                    target: "storage.cluster",
                    cluster = name,
                    error = %err,
                    "cluster creation failed, rolling back"
                );
                self.abort_unit(comps, &mut ctx)?;
                comps.config.drop_cluster(cfg.id)?;
                Err(err)
            }
        }
    }

    /// Drops a cluster, its records and its backing file.
    pub fn drop_cluster(&self, id: u32) -> Result<()> {
        self.guard_open()?;
        let comps = self.components()?;
        {
            let _prohibit = self.modification.prohibit();
            let cluster = self.cluster(&comps, id)?;
            comps.config.drop_cluster(id)?;
            comps.clusters.write()[id as usize] = None;
            cluster.delete()?;
        }
        // File removal is not logged; a checkpoint pins the new state.
        self.checkpoint_internal(&comps, false)?;
        info!(target: "storage.cluster", id, "cluster dropped");
        Ok(())
    }

    /// Removes every record from a cluster, resetting it to its freshly
    /// created state. The cluster stays registered and keeps its id.
    pub fn truncate_cluster(&self, id: u32) -> Result<()> {
        self.guard_open()?;
        let comps = self.components()?;
        {
            let _prohibit = self.modification.prohibit();
            let cluster = self.cluster(&comps, id)?;
            comps.config.mark_dirty()?;
            cluster.truncate()?;
        }
        // Truncation is not logged; a checkpoint pins the new state.
        self.checkpoint_internal(&comps, false)?;
        info!(target: "storage.cluster", id, "cluster truncated");
        Ok(())
    }

    /// Identifier of the cluster named `name`, if any.
    pub fn cluster_id_by_name(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.components()?.config.cluster_by_name(name).map(|c| c.id))
    }

    /// Names of every registered cluster.
    pub fn cluster_names(&self) -> Result<Vec<String>> {
        Ok(self
            .components()?
            .config
            .clusters()
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    /// Marks `id` as the default cluster.
    pub fn set_default_cluster(&self, id: u32) -> Result<()> {
        self.components()?.config.set_default_cluster(id)
    }

    /// Identifier of the default cluster, if set.
    pub fn default_cluster(&self) -> Result<Option<u32>> {
        Ok(self.components()?.config.default_cluster())
    }

    /// Number of live records in a cluster.
    pub fn count_records(&self, cluster_id: u32) -> Result<u64> {
        let comps = self.components()?;
        Ok(self.cluster(&comps, cluster_id)?.entries())
    }

    // ---- record operations ----

    /// Creates a record in `cluster_id` (or the default cluster) and
    /// returns its identity and initial version.
    pub fn create_record(
        &self,
        cluster_id: Option<u32>,
        content: &[u8],
        record_kind: u8,
    ) -> Result<OperationOutcome<(RecordId, i32)>> {
        self.guard_open()?;
        let comps = self.components()?;
        let cluster_id = match cluster_id {
            Some(id) => id,
            None => comps.config.default_cluster().ok_or_else(|| {
                StorageError::Configuration("no default cluster is configured".into())
            })?,
        };
        let cluster = self.cluster(&comps, cluster_id)?;

        let _gate = self.modification.start();
        let _serial = cluster.lock_unit();
        comps.config.mark_dirty()?;
        let mut ctx = OperationContext::new();
        if let Some(atomic) = &comps.atomic {
            atomic.start(&mut ctx)?;
        }
        match cluster.create_record(&ctx, content, record_kind) {
            Ok(pos) => {
                self.finish_unit(&comps, &mut ctx)?;
                Ok(OperationOutcome::Completed((
                    RecordId::new(cluster_id, pos.position),
                    pos.version,
                )))
            }
            Err(err) => {
                self.abort_unit(&comps, &mut ctx)?;
                self.classify_failure("storage.create", err)
            }
        }
    }

    /// Reads a record. Unknown, deleted and hidden records read as `None`.
    pub fn read_record(&self, rid: RecordId) -> Result<Option<RawRecord>> {
        self.guard_open()?;
        let comps = self.components()?;
        let cluster = self.cluster(&comps, rid.cluster_id)?;
        let _lock = self.record_locks.lock_shared(rid);
        cluster.read_record(rid.position)
    }

    /// Overwrites a record after the optimistic version check and returns
    /// the stored version.
    ///
    /// An update of a position the cluster does not track completes as a
    /// no-op with [`VERSION_UNTRACKED`]. A version mismatch is handed to
    /// the cluster's conflict strategy; if it refuses, the error surfaces
    /// as [`StorageError::ConcurrentModification`].
    pub fn update_record(
        &self,
        rid: RecordId,
        content: &[u8],
        version: i32,
        record_kind: u8,
    ) -> Result<OperationOutcome<i32>> {
        self.guard_open()?;
        let comps = self.components()?;
        let cluster = self.cluster(&comps, rid.cluster_id)?;

        let _gate = self.modification.start();
        let _serial = cluster.lock_unit();
        comps.config.mark_dirty()?;
        let _lock = self.record_locks.lock_exclusive(rid);

        let Some(ppos) = cluster.physical_position(rid.position)? else {
            warn!(
                target: "storage.update",
                rid = %rid,
                "update of an untracked position is a no-op"
            );
            return Ok(OperationOutcome::Completed(VERSION_UNTRACKED));
        };
        let (to_store, new_version) =
            resolve_version(&cluster, rid, ppos.version, version, content)?;

        let mut ctx = OperationContext::new();
        if let Some(atomic) = &comps.atomic {
            atomic.start(&mut ctx)?;
        }
        match cluster.update_record(&ctx, rid.position, to_store, new_version, record_kind) {
            Ok(true) => {
                self.finish_unit(&comps, &mut ctx)?;
                Ok(OperationOutcome::Completed(new_version))
            }
            Ok(false) => {
                self.abort_unit(&comps, &mut ctx)?;
                Ok(OperationOutcome::Completed(VERSION_UNTRACKED))
            }
            Err(err) => {
                self.abort_unit(&comps, &mut ctx)?;
                self.classify_failure("storage.update", err)
            }
        }
    }

    /// Deletes a record after the optimistic version check. Deleting an
    /// absent record completes as `false`.
    pub fn delete_record(&self, rid: RecordId, version: i32) -> Result<OperationOutcome<bool>> {
        self.guard_open()?;
        let comps = self.components()?;
        let cluster = self.cluster(&comps, rid.cluster_id)?;

        let _gate = self.modification.start();
        let _serial = cluster.lock_unit();
        comps.config.mark_dirty()?;
        let _lock = self.record_locks.lock_exclusive(rid);

        let Some(ppos) = cluster.physical_position(rid.position)? else {
            return Ok(OperationOutcome::Completed(false));
        };
        if version >= 0 && version != ppos.version {
            return Err(StorageError::ConcurrentModification {
                rid,
                stored: ppos.version,
                requested: version,
            });
        }

        let mut ctx = OperationContext::new();
        if let Some(atomic) = &comps.atomic {
            atomic.start(&mut ctx)?;
        }
        match cluster.delete_record(&ctx, rid.position) {
            Ok(found) => {
                self.finish_unit(&comps, &mut ctx)?;
                Ok(OperationOutcome::Completed(found))
            }
            Err(err) => {
                self.abort_unit(&comps, &mut ctx)?;
                self.classify_failure("storage.delete", err)
            }
        }
    }

    /// Hides a record: its position stays allocated but reads as absent.
    /// Hiding an absent record completes as `false`.
    pub fn hide_record(&self, rid: RecordId) -> Result<OperationOutcome<bool>> {
        self.guard_open()?;
        let comps = self.components()?;
        let cluster = self.cluster(&comps, rid.cluster_id)?;

        let _gate = self.modification.start();
        let _serial = cluster.lock_unit();
        comps.config.mark_dirty()?;
        let _lock = self.record_locks.lock_exclusive(rid);

        if cluster.physical_position(rid.position)?.is_none() {
            return Ok(OperationOutcome::Completed(false));
        }
        let mut ctx = OperationContext::new();
        if let Some(atomic) = &comps.atomic {
            atomic.start(&mut ctx)?;
        }
        match cluster.hide_record(&ctx, rid.position) {
            Ok(found) => {
                self.finish_unit(&comps, &mut ctx)?;
                Ok(OperationOutcome::Completed(found))
            }
            Err(err) => {
                self.abort_unit(&comps, &mut ctx)?;
                self.classify_failure("storage.hide", err)
            }
        }
    }

    /// Lowest live record identity in a cluster.
    pub fn first_record_id(&self, cluster_id: u32) -> Result<Option<RecordId>> {
        let comps = self.components()?;
        let cluster = self.cluster(&comps, cluster_id)?;
        Ok(cluster
            .first_position()
            .map(|position| RecordId::new(cluster_id, position)))
    }

    /// Lowest live record identity after `rid` in its cluster.
    pub fn next_record_id(&self, rid: RecordId) -> Result<Option<RecordId>> {
        let comps = self.components()?;
        let cluster = self.cluster(&comps, rid.cluster_id)?;
        Ok(cluster
            .higher_position(rid.position)
            .map(|position| RecordId::new(rid.cluster_id, position)))
    }

    // ---- transactions ----

    /// Commits a transaction as one atomic unit: either every buffered
    /// operation applies, or none does.
    ///
    /// The transaction is bound to `session` for the duration of the
    /// commit; a stale transaction still bound from an earlier failed
    /// commit is dropped first. Provisional identities from
    /// in-transaction creates are resolved to real ones; the returned
    /// list maps each operation to its final identity and stored
    /// version. On error the unit is rolled back at page level before
    /// the error is returned, and the transaction stays bound so the
    /// caller can [`PaginatedStorage::rollback`] it.
    pub fn commit(
        &self,
        session: &mut StorageSession,
        tx: &ClientTransaction,
    ) -> Result<Vec<CommittedRecord>> {
        self.commit_with(session, tx, |_| Ok(()))
    }

    /// Like [`PaginatedStorage::commit`], invoking `callback` with the
    /// per-operation results after they applied but before the unit is
    /// finalized; a callback error rolls the whole transaction back.
    ///
    /// The callback runs inside the commit's unit and under its cluster
    /// locks; starting another mutation on one of those clusters from the
    /// calling thread deadlocks.
    pub fn commit_with<F>(
        &self,
        session: &mut StorageSession,
        tx: &ClientTransaction,
        callback: F,
    ) -> Result<Vec<CommittedRecord>>
    where
        F: FnOnce(&[CommittedRecord]) -> Result<()>,
    {
        self.guard_open()?;
        if let Some(active) = session.active_transaction() {
            if active != tx.id() {
                warn!(
                    target: "storage.commit",
                    stale = active,
                    tx = tx.id(),
                    "dropping a stale transaction still bound to this context"
                );
            }
        }
        session.bind(tx.id());

        let comps = self.components()?;
        let atomic = comps
            .atomic
            .as_ref()
            .ok_or(StorageError::WalUnavailable)?
            .clone();
        if tx.is_empty() {
            session.unbind();
            return Ok(Vec::new());
        }

        let _gate = self.modification.start();

        // One unit per cluster at a time: a rollback undoes raw
        // before-images, which only holds up if no other unit wrote the
        // same pages in between. Ascending order keeps concurrent commits
        // out of deadlock.
        let mut touched: Vec<u32> = tx
            .operations()
            .iter()
            .map(|op| op.rid.cluster_id)
            .collect();
        touched.sort_unstable();
        touched.dedup();
        let _serials: Vec<ClusterUnitGuard> = touched
            .into_iter()
            .map(|id| Ok(self.cluster(&comps, id)?.lock_unit()))
            .collect::<Result<_>>()?;

        comps.config.mark_dirty()?;

        // Lock target records in a stable order so concurrent commits
        // cannot deadlock.
        let mut to_lock: Vec<RecordId> = tx
            .operations()
            .iter()
            .map(|op| op.rid)
            .filter(|rid| !is_provisional(*rid))
            .collect();
        to_lock.sort_by_key(|rid| (rid.cluster_id, rid.position));
        to_lock.dedup();
        let _locks: Vec<_> = to_lock
            .into_iter()
            .map(|rid| self.record_locks.lock_exclusive(rid))
            .collect();

        let mut ctx = OperationContext::new();
        atomic.start(&mut ctx)?;
        let mut aliases: HashMap<RecordId, RecordId> = HashMap::new();
        let mut results = Vec::with_capacity(tx.operations().len());

        let applied = (|| -> Result<()> {
            for op in tx.operations() {
                let target = aliases.get(&op.rid).copied().unwrap_or(op.rid);
                let cluster = self.cluster(&comps, target.cluster_id)?;
                match &op.kind {
                    RecordOperationKind::Create {
                        content,
                        record_kind,
                    } => {
                        let pos = cluster.create_record(&ctx, content, *record_kind)?;
                        let actual = RecordId::new(target.cluster_id, pos.position);
                        aliases.insert(op.rid, actual);
                        results.push(CommittedRecord {
                            requested: op.rid,
                            actual,
                            version: pos.version,
                        });
                    }
                    RecordOperationKind::Update {
                        content,
                        version,
                        record_kind,
                    } => {
                        let Some(ppos) = cluster.physical_position(target.position)? else {
                            results.push(CommittedRecord {
                                requested: op.rid,
                                actual: target,
                                version: VERSION_UNTRACKED,
                            });
                            continue;
                        };
                        let (to_store, new_version) =
                            resolve_version(&cluster, target, ppos.version, *version, content)?;
                        cluster.update_record(
                            &ctx,
                            target.position,
                            to_store,
                            new_version,
                            *record_kind,
                        )?;
                        results.push(CommittedRecord {
                            requested: op.rid,
                            actual: target,
                            version: new_version,
                        });
                    }
                    RecordOperationKind::Delete { version } => {
                        let Some(ppos) = cluster.physical_position(target.position)? else {
                            results.push(CommittedRecord {
                                requested: op.rid,
                                actual: target,
                                version: VERSION_UNTRACKED,
                            });
                            continue;
                        };
                        if *version >= 0 && *version != ppos.version {
                            return Err(StorageError::ConcurrentModification {
                                rid: target,
                                stored: ppos.version,
                                requested: *version,
                            });
                        }
                        cluster.delete_record(&ctx, target.position)?;
                        results.push(CommittedRecord {
                            requested: op.rid,
                            actual: target,
                            version: -1,
                        });
                    }
                }
            }
            Ok(())
        })();
        let applied = applied.and_then(|()| callback(&results));

        match applied {
            Ok(()) => {
                let completed = atomic.end(&mut ctx, false)?;
                if let Some(wal) = &comps.wal {
                    wal.flush()?;
                }
                debug!(
                    target: "storage.commit",
                    tx = tx.id(),
                    unit = completed.unit.0,
                    records = results.len(),
                    "transaction committed"
                );
                session.unbind();
                Ok(results)
            }
            Err(err) => {
                warn!(
                    target: "storage.commit",
                    tx = tx.id(),
                    error = %err,
                    "transaction failed, rolling back"
                );
                self.abort_unit(&comps, &mut ctx)?;
                Err(err)
            }
        }
    }

    /// Discards a transaction's buffered operations, reverting it to its
    /// freshly created state and unbinding it from `session`.
    ///
    /// A no-op when no transaction is bound to the session; rolling back
    /// a transaction other than the bound one is a state error. Page
    /// changes of a failed commit were already undone when the commit
    /// returned, so only client state is reverted here.
    pub fn rollback(
        &self,
        session: &mut StorageSession,
        tx: &mut ClientTransaction,
    ) -> Result<()> {
        let Some(active) = session.active_transaction() else {
            debug!(
                target: "storage.rollback",
                tx = tx.id(),
                "no transaction bound to this context, nothing to roll back"
            );
            return Ok(());
        };
        if active != tx.id() {
            return Err(StorageError::State(format!(
                "transaction {} is not the one bound to this context (expected {active})",
                tx.id()
            )));
        }
        tx.rollback();
        session.unbind();
        debug!(target: "storage.rollback", tx = tx.id(), "transaction discarded");
        Ok(())
    }

    // ---- checkpoints and integrity ----

    /// Takes a full checkpoint: flushes every dirty page, trims the log
    /// and clears the dirty flag.
    pub fn make_full_checkpoint(&self) -> Result<()> {
        self.guard_open()?;
        let comps = self.components()?;
        self.checkpoint_internal(&comps, false)
    }

    /// Takes a fuzzy checkpoint: logs the dirty-page table without
    /// flushing, trimming the log up to the oldest unflushed change.
    pub fn make_fuzzy_checkpoint(&self) -> Result<()> {
        self.guard_open()?;
        let comps = self.components()?;
        self.checkpoint_internal(&comps, true)
    }

    /// Quiesces the storage for an external backup: blocks new
    /// modifications, waits for in-flight ones to finish, and flushes the
    /// log, pages and configuration so the files on disk form a consistent
    /// snapshot. The storage is released when the guard drops.
    pub fn freeze(&self) -> Result<FreezeGuard<'_>> {
        self.guard_open()?;
        let comps = self.components()?;
        let prohibit = self.modification.prohibit();
        if let Some(wal) = &comps.wal {
            wal.flush()?;
        }
        comps.cache.flush_buffer()?;
        comps.config.synch()?;
        info!(target: "storage.freeze", path = %self.dir.display(), "storage frozen");
        Ok(FreezeGuard {
            _prohibit: prohibit,
        })
    }

    /// Verifies the checksum of every stored page.
    pub fn check_integrity(&self) -> Result<Vec<PageVerificationError>> {
        let comps = self.components()?;
        comps.cache.check_stored_pages()
    }

    // ---- internals ----

    fn guard_open(&self) -> Result<()> {
        let status = *self.status.read();
        if status != StorageStatus::Open {
            return Err(StorageError::State(format!(
                "storage is {status}, expected open"
            )));
        }
        Ok(())
    }

    fn components(&self) -> Result<MappedRwLockReadGuard<'_, Components>> {
        RwLockReadGuard::try_map(self.inner.read(), Option::as_ref)
            .map_err(|_| StorageError::State("storage is closed".into()))
    }

    fn cluster(&self, comps: &Components, id: u32) -> Result<Arc<PaginatedCluster>> {
        comps
            .clusters
            .read()
            .get(id as usize)
            .and_then(Clone::clone)
            .ok_or_else(|| StorageError::Configuration(format!("unknown cluster {id}")))
    }

    fn finish_unit(&self, comps: &Components, ctx: &mut OperationContext) -> Result<()> {
        if let Some(atomic) = &comps.atomic {
            if ctx.active().is_some() {
                atomic.end(ctx, false)?;
            }
        }
        if let Some(wal) = &comps.wal {
            wal.flush()?;
        }
        Ok(())
    }

    /// Ends the active unit as rolled back and undoes its page changes
    /// from the log, then rebuilds the position maps of touched clusters.
    fn abort_unit(&self, comps: &Components, ctx: &mut OperationContext) -> Result<()> {
        let (Some(atomic), Some(wal)) = (&comps.atomic, &comps.wal) else {
            return Ok(());
        };
        if ctx.active().is_none() {
            return Ok(());
        }
        let completed = atomic.end(ctx, true)?;
        let lsns = collect_unit_lsns(wal, &completed)?;
        let affected = undo_unit(wal, &comps.cache, completed.unit, &lsns)?;
        let clusters = comps.clusters.read();
        for cluster in clusters.iter().flatten() {
            if affected.contains(&cluster.file()) {
                cluster.reload()?;
            }
        }
        wal.flush()?;
        Ok(())
    }

    fn classify_failure<T>(&self, op: &str, err: StorageError) -> Result<OperationOutcome<T>> {
        match err {
            err @ (StorageError::Configuration(_)
            | StorageError::ConcurrentModification { .. }
            | StorageError::State(_)) => Err(err),
            err => {
                error!(target: "storage.failure", operation = op, error = %err, "operation rolled back");
                Ok(OperationOutcome::Failed)
            }
        }
    }

    fn checkpoint_internal(&self, comps: &Components, fuzzy: bool) -> Result<()> {
        let Some(wal) = &comps.wal else {
            comps.cache.flush_buffer()?;
            comps.config.synch()?;
            comps.config.clear_dirty()?;
            return Ok(());
        };
        let _prohibit = self.modification.prohibit();
        wal.flush()?;
        comps.config.synch()?;
        let start = wal.log_checkpoint_start(fuzzy)?;
        if fuzzy {
            let pages: Vec<DirtyPage> = comps
                .cache
                .dirty_pages()
                .into_iter()
                .filter_map(|(file, page, lsn)| lsn.map(|lsn| DirtyPage { file, page, lsn }))
                .collect();
            let oldest = pages.iter().map(|p| p.lsn).min();
            wal.log(&WalRecord::DirtyPages { pages })?;
            wal.log_checkpoint_end(true)?;
            wal.flush()?;
            wal.cut_till(oldest.map_or(start, |lsn| lsn.min(start)))?;
            info!(target: "storage.checkpoint", kind = "fuzzy", start = %start, "checkpoint complete");
        } else {
            comps.cache.flush_buffer()?;
            wal.log_checkpoint_end(false)?;
            wal.flush()?;
            wal.cut_till(start)?;
            comps.config.clear_dirty()?;
            info!(target: "storage.checkpoint", kind = "full", start = %start, "checkpoint complete");
        }
        Ok(())
    }

    fn close_components(&self) -> Result<()> {
        let Some(comps) = self.inner.write().take() else {
            return Ok(());
        };
        self.checkpoint_internal(&comps, false)?;
        comps.cache.close()?;
        if let Some(wal) = &comps.wal {
            wal.close()?;
        }
        info!(target: "storage.close", path = %self.dir.display(), "storage closed");
        Ok(())
    }
}

/// Quiesce token returned by [`PaginatedStorage::freeze`]; modifications
/// resume when it drops.
pub struct FreezeGuard<'a> {
    _prohibit: ProhibitionGuard<'a>,
}

impl Drop for PaginatedStorage {
    fn drop(&mut self) {
        if *self.status.read() == StorageStatus::Open {
            if let Err(err) = self.close() {
                error!(target: "storage.close", error = %err, "close during drop failed");
            }
        }
    }
}

fn default_cache_pages() -> NonZeroUsize {
    // DEFAULT_CACHE_PAGES is a non-zero constant.
    NonZeroUsize::new(DEFAULT_CACHE_PAGES).unwrap_or(NonZeroUsize::MIN)
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Applies the optimistic version check and picks the version to store.
fn resolve_version<'a>(
    cluster: &PaginatedCluster,
    rid: RecordId,
    stored: i32,
    requested: i32,
    content: &'a [u8],
) -> Result<(&'a [u8], i32)> {
    if requested == VERSION_NO_BUMP {
        return Ok((content, stored));
    }
    if requested == VERSION_SKIP_CHECK || requested == stored {
        return Ok((content, stored + 1));
    }
    let resolved = cluster.conflict().resolve(rid, stored, requested, content)?;
    Ok((resolved, stored + 1))
}

fn collect_unit_lsns(wal: &WriteAheadLog, completed: &CompletedOperation) -> Result<Vec<Lsn>> {
    let mut lsns = Vec::new();
    let mut cursor = Some(completed.start_lsn);
    while let Some(lsn) = cursor {
        if lsn >= completed.end_lsn {
            break;
        }
        let record = wal.read(lsn)?;
        if record.unit() == Some(completed.unit) {
            lsns.push(lsn);
        }
        cursor = wal.next(lsn)?;
    }
    Ok(lsns)
}

/// Reverts a unit's records in reverse order. Returns the files whose
/// pages were touched so the caller can rebuild cluster state.
fn undo_unit(
    wal: &WriteAheadLog,
    cache: &PageCache,
    unit: UnitId,
    lsns: &[Lsn],
) -> Result<Vec<FileId>> {
    let mut affected = Vec::new();
    for (index, lsn) in lsns.iter().enumerate().rev() {
        match wal.read(*lsn)? {
            WalRecord::UnitStart { .. } => {
                if index != 0 {
                    return Err(StorageError::RecoveryInconsistency(format!(
                        "unit {unit} has a start record in the middle of its operations"
                    )));
                }
            }
            WalRecord::UnitEnd { .. } => {
                return Err(StorageError::RecoveryInconsistency(format!(
                    "unit {unit} has an end record inside its operation list"
                )))
            }
            WalRecord::PageUpdate {
                file,
                page,
                prior_lsn,
                changes,
                ..
            } => {
                if !cache.is_open(file) {
                    warn!(
                        target: "storage.undo",
                        file = file.0,
                        "page update for an unknown file skipped during undo"
                    );
                    continue;
                }
                let pinned = cache.load(file, page)?;
                {
                    let mut payload = pinned.payload();
                    changes.revert(&mut payload);
                    let prior = prior_lsn.map_or(0, |lsn| lsn.0);
                    payload[..8].copy_from_slice(&prior.to_be_bytes());
                }
                pinned.mark_dirty();
                if !affected.contains(&file) {
                    affected.push(file);
                }
            }
            WalRecord::FileCreated { file, .. } => {
                if cache.is_open(file) {
                    cache.delete_file(file)?;
                }
            }
            other => {
                return Err(StorageError::RecoveryInconsistency(format!(
                    "unexpected record {other:?} inside unit {unit}"
                )))
            }
        }
    }
    Ok(affected)
}

// ---- crash recovery ----

/// Restores page state from the log. Returns the first unit identifier
/// safe for new operations.
fn restore_from_wal(wal: &WriteAheadLog, cache: &PageCache) -> Result<u64> {
    if wal.end().is_none() {
        warn!(target: "storage.restore", "log is empty, nothing to restore");
        return Ok(1);
    }

    let mut checkpoint = wal.last_checkpoint();
    let start = loop {
        let Some(cp) = checkpoint else {
            debug!(target: "storage.restore", "no usable checkpoint, replaying the whole log");
            break wal.begin();
        };
        match wal.read(cp) {
            Ok(WalRecord::FullCheckpointStart { previous }) => {
                if checkpoint_complete(wal, cp, false)? {
                    break restore_start_after_end(wal, cp, false)?;
                }
                warn!(
                    target: "storage.restore",
                    checkpoint = %cp,
                    "full checkpoint is incomplete, falling back to the previous one"
                );
                checkpoint = previous;
            }
            Ok(WalRecord::FuzzyCheckpointStart { previous }) => {
                if checkpoint_complete(wal, cp, true)? {
                    break fuzzy_restore_start(wal, cp)?;
                }
                warn!(
                    target: "storage.restore",
                    checkpoint = %cp,
                    "fuzzy checkpoint is incomplete, falling back to the previous one"
                );
                checkpoint = previous;
            }
            Ok(other) => {
                return Err(StorageError::RecoveryInconsistency(format!(
                    "expected a checkpoint start at {cp}, found {other:?}"
                )))
            }
            Err(StorageError::NotFound(_) | StorageError::WalBroken(_)) => {
                warn!(
                    target: "storage.restore",
                    checkpoint = %cp,
                    "checkpoint record is unreadable, replaying the whole log"
                );
                break wal.begin();
            }
            Err(err) => return Err(err),
        }
    };

    let next_unit = replay(wal, cache, start)?;
    cache.flush_buffer()?;
    Ok(next_unit)
}

/// True when the checkpoint started at `cp` has a matching end record in
/// the readable log.
fn checkpoint_complete(wal: &WriteAheadLog, cp: Lsn, fuzzy: bool) -> Result<bool> {
    let mut cursor = match wal.next(cp) {
        Ok(next) => next,
        Err(StorageError::WalBroken(_)) => return Ok(false),
        Err(err) => return Err(err),
    };
    while let Some(lsn) = cursor {
        match wal.read(lsn) {
            Ok(WalRecord::FullCheckpointEnd) if !fuzzy => return Ok(true),
            Ok(WalRecord::FuzzyCheckpointEnd) if fuzzy => return Ok(true),
            Ok(_) => {}
            Err(StorageError::WalBroken(_)) => return Ok(false),
            Err(err) => return Err(err),
        }
        cursor = match wal.next(lsn) {
            Ok(next) => next,
            Err(StorageError::WalBroken(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
    }
    Ok(false)
}

/// Replay position after a complete checkpoint's end record.
fn restore_start_after_end(wal: &WriteAheadLog, cp: Lsn, fuzzy: bool) -> Result<Option<Lsn>> {
    let mut cursor = wal.next(cp)?;
    while let Some(lsn) = cursor {
        match wal.read(lsn)? {
            WalRecord::FullCheckpointEnd if !fuzzy => return wal.next(lsn),
            WalRecord::FuzzyCheckpointEnd if fuzzy => return wal.next(lsn),
            _ => {}
        }
        cursor = wal.next(lsn)?;
    }
    Ok(None)
}

/// Replay position for a complete fuzzy checkpoint: the oldest change of
/// the dirty-page table it logged, or past its end when nothing was dirty.
fn fuzzy_restore_start(wal: &WriteAheadLog, cp: Lsn) -> Result<Option<Lsn>> {
    let mut cursor = wal.next(cp)?;
    while let Some(lsn) = cursor {
        match wal.read(lsn)? {
            WalRecord::DirtyPages { pages } => {
                if let Some(oldest) = pages.iter().map(|p| p.lsn).min() {
                    return Ok(Some(oldest));
                }
            }
            WalRecord::FuzzyCheckpointEnd => return wal.next(lsn),
            _ => {}
        }
        cursor = wal.next(lsn)?;
    }
    Ok(None)
}

/// Forward replay from `start`: redo logged page changes, reopen replayed
/// files, and roll back units the crash left open.
fn replay(wal: &WriteAheadLog, cache: &PageCache, start: Option<Lsn>) -> Result<u64> {
    let mut open_units: HashMap<u64, Vec<Lsn>> = HashMap::new();
    let mut max_unit = 0u64;
    let mut batch: Vec<(Lsn, WalRecord)> = Vec::new();
    let mut replayed = 0usize;

    let mut cursor = start;
    while let Some(lsn) = cursor {
        let record = match wal.read(lsn) {
            Ok(record) => record,
            Err(StorageError::WalBroken(at)) => {
                warn!(
                    target: "storage.restore",
                    at = %at,
                    "log is broken past this point, stopping forward replay"
                );
                break;
            }
            Err(StorageError::NotFound(_)) => break,
            Err(err) => return Err(err),
        };
        replayed += 1;
        match &record {
            WalRecord::UnitStart { unit } => {
                max_unit = max_unit.max(unit.0);
                if open_units.insert(unit.0, vec![lsn]).is_some() {
                    return Err(StorageError::RecoveryInconsistency(format!(
                        "unit {unit} was started twice"
                    )));
                }
            }
            WalRecord::UnitEnd { unit, rollback } => match open_units.remove(&unit.0) {
                Some(lsns) => {
                    if *rollback {
                        // The previous run rolled this unit back without
                        // logging compensation records; redo then undo.
                        apply_batch(cache, &mut batch)?;
                        undo_unit(wal, cache, *unit, &lsns)?;
                    }
                }
                None => warn!(
                    target: "storage.restore",
                    unit = unit.0,
                    "end record for an unknown unit skipped"
                ),
            },
            WalRecord::PageUpdate { unit, .. } | WalRecord::FileCreated { unit, .. } => {
                match open_units.get_mut(&unit.0) {
                    Some(lsns) => {
                        lsns.push(lsn);
                        batch.push((lsn, record.clone()));
                    }
                    None => warn!(
                        target: "storage.restore",
                        unit = unit.0,
                        "operation record outside an open unit skipped"
                    ),
                }
            }
            _ => {}
        }
        if batch.len() >= RESTORE_BATCH_SIZE {
            apply_batch(cache, &mut batch)?;
        }
        cursor = match wal.next(lsn) {
            Ok(next) => next,
            Err(StorageError::WalBroken(at)) => {
                warn!(
                    target: "storage.restore",
                    at = %at,
                    "log is broken past this point, stopping forward replay"
                );
                break;
            }
            Err(err) => return Err(err),
        };
    }
    apply_batch(cache, &mut batch)?;

    // Units that never ended are rolled back, lowest first so the pass is
    // deterministic.
    let mut unfinished: Vec<(u64, Vec<Lsn>)> = open_units.into_iter().collect();
    unfinished.sort_by_key(|(unit, _)| *unit);
    for (unit, lsns) in unfinished {
        warn!(
            target: "storage.restore",
            unit,
            records = lsns.len(),
            "rolling back a unit the crash left open"
        );
        wal.log(&WalRecord::UnitEnd {
            unit: UnitId(unit),
            rollback: true,
        })?;
        undo_unit(wal, cache, UnitId(unit), &lsns)?;
    }
    wal.flush()?;
    info!(target: "storage.restore", records = replayed, "forward replay finished");
    Ok(max_unit + 1)
}

/// Applies buffered redo records. Pages already stamped with an LSN at or
/// past the record's are up to date and skipped.
fn apply_batch(cache: &PageCache, batch: &mut Vec<(Lsn, WalRecord)>) -> Result<()> {
    for (lsn, record) in batch.drain(..) {
        match record {
            WalRecord::FileCreated { file, name, .. } => {
                cache.open_file_by_id(file, &name)?;
            }
            WalRecord::PageUpdate {
                file,
                page,
                changes,
                ..
            } => {
                if !cache.is_open(file) {
                    warn!(
                        target: "storage.restore",
                        file = file.0,
                        "page update for an unknown file skipped"
                    );
                    continue;
                }
                let pinned = cache.load(file, page)?;
                {
                    let mut payload = pinned.payload();
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&payload[..8]);
                    if u64::from_be_bytes(raw) >= lsn.0 {
                        continue;
                    }
                    changes.apply(&mut payload);
                    payload[..8].copy_from_slice(&lsn.0.to_be_bytes());
                }
                pinned.mark_dirty();
                pinned.note_change_lsn(lsn);
            }
            _ => {}
        }
    }
    Ok(())
}
