//! Persistence data model: append-log commands and snapshot shapes.
//!
//! The AOF records only resulting data mutations. Higher-level
//! operations (embed-then-insert) are decomposed before logging so
//! replay never depends on an external service.

use crate::{CollectionConfig, Metadata, VectorId};
use serde::{Deserialize, Serialize};

/// A vector as it appears on disk: resolved id, raw elements, metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedVector {
    pub id: VectorId,
    pub elements: Vec<f32>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// One mutating command in the append-only log.
///
/// Insert commands carry post-resolution ids (the collection assigns
/// ids before the record is built), so replay is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AofCommand {
    CreateDatabase {
        db: String,
    },
    DropDatabase {
        db: String,
    },
    CreateCollection {
        db: String,
        name: String,
        config: CollectionConfig,
    },
    DropCollection {
        db: String,
        name: String,
    },
    InsertVectors {
        db: String,
        collection: String,
        vectors: Vec<PersistedVector>,
    },
    DeleteVectors {
        db: String,
        collection: String,
        ids: Vec<VectorId>,
    },
}

impl AofCommand {
    /// Short tag used in recovery logging.
    pub fn name(&self) -> &'static str {
        match self {
            AofCommand::CreateDatabase { .. } => "create_database",
            AofCommand::DropDatabase { .. } => "drop_database",
            AofCommand::CreateCollection { .. } => "create_collection",
            AofCommand::DropCollection { .. } => "drop_collection",
            AofCommand::InsertVectors { .. } => "insert_vectors",
            AofCommand::DeleteVectors { .. } => "delete_vectors",
        }
    }
}

/// Envelope written to the log: monotonic sequence + command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AofRecord {
    pub seq: u64,
    pub command: AofCommand,
}

/// Consistent view of one collection for the snapshot writer.
/// Tombstoned vectors are dropped at snapshot time; `next_id` is
/// carried so ids never regress after a rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub name: String,
    pub dimension: Option<u32>,
    pub config: CollectionConfig,
    pub next_id: VectorId,
    pub vectors: Vec<PersistedVector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub name: String,
    pub collections: Vec<CollectionSnapshot>,
}

/// Full-engine state captured for the RDB writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub databases: Vec<DatabaseSnapshot>,
    /// Operation counter at capture time; recovery resumes past it.
    pub last_seq: u64,
}

impl EngineSnapshot {
    pub fn vector_count(&self) -> u64 {
        self.databases
            .iter()
            .flat_map(|d| d.collections.iter())
            .map(|c| c.vectors.len() as u64)
            .sum()
    }
}
