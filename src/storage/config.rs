//! Persistent storage configuration: global options, the cluster registry
//! and the dirty flag consulted by crash recovery.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::conflict::ConflictResolution;
use crate::types::{Result, StorageError};

pub(crate) const CONFIG_FILE: &str = "storage.json";
const CONFIG_TMP_FILE: &str = "storage.json.tmp";

/// Compression applied to record content before it reaches a cluster page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    /// Store record bytes as-is.
    #[default]
    None,
    /// Snappy-compress record bytes.
    Snappy,
}

/// Options fixed at storage creation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalOptions {
    /// When false the storage runs without a WAL; transactions are refused
    /// and crash recovery is unavailable.
    pub wal_enabled: bool,
    /// Compression method for record content.
    pub compression: CompressionMethod,
    /// Take a full checkpoint as soon as a storage is created.
    pub checkpoint_on_create: bool,
    /// Default conflict-resolution strategy for clusters without an override.
    pub conflict: ConflictResolution,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            wal_enabled: true,
            compression: CompressionMethod::None,
            checkpoint_on_create: true,
            conflict: ConflictResolution::default(),
        }
    }
}

/// Registered cluster and the names tying it to its cache file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier, equal to the cluster's slot in the registry.
    pub id: u32,
    /// User-visible cluster name, unique case-insensitively.
    pub name: String,
    /// Name of the cache file backing the cluster.
    pub file_name: String,
    /// Conflict strategy override; falls back to the global one when absent.
    pub conflict: Option<ConflictResolution>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ConfigData {
    options: GlobalOptions,
    /// Slot-indexed registry; dropped clusters leave holes that are reused.
    clusters: Vec<Option<ClusterConfig>>,
    default_cluster: Option<u32>,
    /// Set before the first write after a clean state; cleared only by a
    /// successful checkpoint or clean close.
    dirty: bool,
}

/// On-disk configuration record of one storage.
#[derive(Debug)]
pub struct StorageConfiguration {
    path: PathBuf,
    tmp_path: PathBuf,
    data: RwLock<ConfigData>,
}

impl StorageConfiguration {
    /// Creates a fresh configuration in `dir` and persists it.
    pub fn create(dir: &Path, options: GlobalOptions) -> Result<Self> {
        let config = Self {
            path: dir.join(CONFIG_FILE),
            tmp_path: dir.join(CONFIG_TMP_FILE),
            data: RwLock::new(ConfigData {
                options,
                ..ConfigData::default()
            }),
        };
        if config.path.exists() {
            return Err(StorageError::State(format!(
                "storage already exists at {}",
                dir.display()
            )));
        }
        config.persist()?;
        Ok(config)
    }

    /// Loads the configuration stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let raw = fs::read(&path)?;
        let data: ConfigData = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::Corruption(format!("invalid configuration: {err}")))?;
        Ok(Self {
            path,
            tmp_path: dir.join(CONFIG_TMP_FILE),
            data: RwLock::new(data),
        })
    }

    /// True when a configuration record exists in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(CONFIG_FILE).exists()
    }

    /// Global options fixed at creation time.
    pub fn options(&self) -> GlobalOptions {
        self.data.read().options.clone()
    }

    /// Registers a cluster, reusing the lowest free slot, and persists.
    /// Returns the new cluster's configuration.
    pub fn add_cluster(
        &self,
        name: &str,
        conflict: Option<ConflictResolution>,
    ) -> Result<ClusterConfig> {
        if name.is_empty() {
            return Err(StorageError::Configuration(
                "cluster name must not be empty".into(),
            ));
        }
        let mut data = self.data.write();
        if data
            .clusters
            .iter()
            .flatten()
            .any(|c| c.name.eq_ignore_ascii_case(name))
        {
            return Err(StorageError::Configuration(format!(
                "cluster '{name}' already exists"
            )));
        }
        let slot = data
            .clusters
            .iter()
            .position(Option::is_none)
            .unwrap_or(data.clusters.len());
        let config = ClusterConfig {
            id: slot as u32,
            name: name.to_owned(),
            file_name: format!("{}_{slot}.lcl", sanitize(name)),
            conflict,
        };
        if slot == data.clusters.len() {
            data.clusters.push(Some(config.clone()));
        } else {
            data.clusters[slot] = Some(config.clone());
        }
        drop(data);
        self.persist()?;
        Ok(config)
    }

    /// Unregisters a cluster and persists. Clearing the default cluster is
    /// the caller's concern; dropping the default is refused here.
    pub fn drop_cluster(&self, id: u32) -> Result<ClusterConfig> {
        let mut data = self.data.write();
        if data.default_cluster == Some(id) {
            return Err(StorageError::Configuration(format!(
                "cluster {id} is the default cluster and cannot be dropped"
            )));
        }
        let slot = data
            .clusters
            .get_mut(id as usize)
            .ok_or_else(|| StorageError::Configuration(format!("unknown cluster {id}")))?;
        let removed = slot
            .take()
            .ok_or_else(|| StorageError::Configuration(format!("unknown cluster {id}")))?;
        drop(data);
        self.persist()?;
        Ok(removed)
    }

    /// Configuration of cluster `id`, if registered.
    pub fn cluster(&self, id: u32) -> Option<ClusterConfig> {
        self.data
            .read()
            .clusters
            .get(id as usize)
            .and_then(Clone::clone)
    }

    /// Configuration of the cluster named `name`, if registered.
    pub fn cluster_by_name(&self, name: &str) -> Option<ClusterConfig> {
        self.data
            .read()
            .clusters
            .iter()
            .flatten()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Every registered cluster, in slot order.
    pub fn clusters(&self) -> Vec<ClusterConfig> {
        self.data.read().clusters.iter().flatten().cloned().collect()
    }

    /// Marks `id` as the default cluster for record operations that do not
    /// name one.
    pub fn set_default_cluster(&self, id: u32) -> Result<()> {
        {
            let mut data = self.data.write();
            if data.clusters.get(id as usize).and_then(Option::as_ref).is_none() {
                return Err(StorageError::Configuration(format!("unknown cluster {id}")));
            }
            data.default_cluster = Some(id);
        }
        self.persist()
    }

    /// Identifier of the default cluster, if one is set.
    pub fn default_cluster(&self) -> Option<u32> {
        self.data.read().default_cluster
    }

    /// True when the storage shut down without a clean checkpoint.
    pub fn is_dirty(&self) -> bool {
        self.data.read().dirty
    }

    /// Sets the dirty flag, persisting only on the clean-to-dirty edge.
    pub fn mark_dirty(&self) -> Result<()> {
        {
            let mut data = self.data.write();
            if data.dirty {
                return Ok(());
            }
            data.dirty = true;
        }
        debug!(target: "storage.config", "dirty flag raised");
        self.persist()
    }

    /// Clears the dirty flag after a successful checkpoint or clean close.
    pub fn clear_dirty(&self) -> Result<()> {
        {
            let mut data = self.data.write();
            if !data.dirty {
                return Ok(());
            }
            data.dirty = false;
        }
        debug!(target: "storage.config", "dirty flag cleared");
        self.persist()
    }

    /// Forces the current state to disk.
    pub fn synch(&self) -> Result<()> {
        self.persist()
    }

    /// Removes the configuration record from disk.
    pub fn delete(self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let data = self.data.read().clone();
        let raw = serde_json::to_vec_pretty(&data)
            .map_err(|err| StorageError::Configuration(err.to_string()))?;
        // Write-then-rename keeps a valid record on disk at every instant.
        fs::write(&self.tmp_path, &raw)?;
        let file = fs::File::open(&self.tmp_path)?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
