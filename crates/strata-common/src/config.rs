//! Configuration structures for StrataDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the indexed storage core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data files.
    pub data_dir: PathBuf,
    /// Number of frames per buffer pool instance.
    pub pool_size: usize,
    /// Number of buffer pool instances (shards).
    pub num_instances: usize,
    /// Maximum entries per B+ tree leaf page (0 = derive from page size).
    pub leaf_max_size: usize,
    /// Maximum children per B+ tree internal page (0 = derive from page size).
    pub internal_max_size: usize,
    /// Enable fsync for page writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pool_size: 64,
            num_instances: 1,
            leaf_max_size: 0,
            internal_max_size: 0,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total number of frames across all instances.
    pub fn total_frames(&self) -> usize {
        self.pool_size * self.num_instances
    }
}
