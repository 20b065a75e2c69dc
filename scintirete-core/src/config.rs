//! Runtime configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `SCINTIRETE_`-prefixed environment variables (e.g.
//! `SCINTIRETE_AOF_SYNC_STRATEGY=always`).

use crate::{Error, HnswParams, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durability policy for the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// fsync after every record. Safest, slowest.
    Always,
    /// A background tick fsyncs once per second. The default.
    EverySec,
    /// Let the OS flush when it wants to.
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub rdb_filename: String,
    pub aof_filename: String,
    pub aof_sync_strategy: SyncStrategy,
    /// Period of the background rewrite check.
    pub rdb_interval_seconds: u64,
    /// AOF size that triggers a rewrite between ticks.
    pub aof_rewrite_threshold_bytes: u64,
    /// How many timestamped RDB backups to keep after rewrites.
    pub backup_retention_count: usize,
    pub default_hnsw_m: u32,
    pub default_hnsw_ef_construction: u32,
    pub default_hnsw_ef_search: u32,
    pub default_max_layers: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let hnsw = HnswParams::default();
        Self {
            data_dir: PathBuf::from("./data"),
            rdb_filename: "scintirete.rdb".to_string(),
            aof_filename: "scintirete.aof".to_string(),
            aof_sync_strategy: SyncStrategy::EverySec,
            rdb_interval_seconds: 300,
            aof_rewrite_threshold_bytes: 64 * 1024 * 1024,
            backup_retention_count: 3,
            default_hnsw_m: hnsw.m,
            default_hnsw_ef_construction: hnsw.ef_construction,
            default_hnsw_ef_search: hnsw.ef_search,
            default_max_layers: hnsw.max_layers,
        }
    }
}

impl Settings {
    /// Loads settings from an optional TOML file and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("SCINTIRETE"))
            .build()
            .map_err(|e| Error::InvalidArgument(format!("config: {e}")))?;
        cfg.try_deserialize()
            .map_err(|e| Error::InvalidArgument(format!("config: {e}")))
    }

    pub fn rdb_path(&self) -> PathBuf {
        self.data_dir.join(&self.rdb_filename)
    }

    pub fn aof_path(&self) -> PathBuf {
        self.data_dir.join(&self.aof_filename)
    }

    /// HNSW parameters applied when a create-collection request leaves
    /// them unspecified.
    pub fn default_hnsw(&self) -> HnswParams {
        HnswParams {
            m: self.default_hnsw_m,
            ef_construction: self.default_hnsw_ef_construction,
            ef_search: self.default_hnsw_ef_search,
            max_layers: self.default_max_layers,
            ..HnswParams::default()
        }
    }
}
