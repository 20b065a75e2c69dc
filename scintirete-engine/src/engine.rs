//! The engine: process-wide root owning the database namespace and the
//! monotonic operation counter used for durability sequencing.
//!
//! There are no static globals; the gateway and the persistence
//! manager both receive their `Arc<Engine>` at construction.

use crate::collection::{Collection, CollectionState};
use crate::database::Database;
use crate::manager::{Ack, CommandLog};
use crate::validate_name;
use scintirete_core::{
    AofCommand, DatabaseSnapshot, EngineSnapshot, Error, InsertItem, OpGuard, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug)]
pub struct Engine {
    databases: Arc<RwLock<HashMap<String, Arc<Database>>>>,
    op_seq: Arc<AtomicU64>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            databases: Arc::new(RwLock::new(HashMap::new())),
            op_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn create_database(&self, name: &str, log: Option<&CommandLog>) -> Result<Ack> {
        validate_name("database", name)?;
        let mut map = self.databases.write().await;
        if map.contains_key(name) {
            return Err(Error::AlreadyExists(format!("database '{name}'")));
        }
        let ack = match log {
            Some(log) => log.submit(AofCommand::CreateDatabase {
                db: name.to_string(),
            })?,
            None => Ack::none(),
        };
        map.insert(name.to_string(), Arc::new(Database::new(name.to_string())));
        Ok(ack)
    }

    /// Drops a database and with it every collection it holds.
    pub async fn drop_database(&self, name: &str, log: Option<&CommandLog>) -> Result<Ack> {
        let mut map = self.databases.write().await;
        if !map.contains_key(name) {
            return Err(Error::NotFound(format!("database '{name}'")));
        }
        let ack = match log {
            Some(log) => log.submit(AofCommand::DropDatabase {
                db: name.to_string(),
            })?,
            None => Ack::none(),
        };
        map.remove(name);
        Ok(ack)
    }

    pub async fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("database '{name}'")))
    }

    pub async fn list_databases(&self) -> Vec<String> {
        let map = self.databases.read().await;
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every collection across every database. Used by background
    /// maintenance.
    pub async fn collections(&self) -> Vec<Arc<Collection>> {
        let dbs: Vec<Arc<Database>> = self.databases.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for db in dbs {
            out.extend(db.list_collections().await);
        }
        out
    }

    pub(crate) fn op_seq_arc(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.op_seq)
    }

    pub fn current_seq(&self) -> u64 {
        self.op_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_seq_to(&self, seq: u64) {
        self.op_seq.fetch_max(seq, Ordering::SeqCst);
    }

    /// Applies one replayed log command through the same entry points
    /// live operations use. Never logs (the record already exists).
    pub async fn apply(&self, command: AofCommand) -> Result<()> {
        let guard = OpGuard::unbounded();
        match command {
            AofCommand::CreateDatabase { db } => {
                self.create_database(&db, None).await?;
            }
            AofCommand::DropDatabase { db } => {
                self.drop_database(&db, None).await?;
            }
            AofCommand::CreateCollection { db, name, config } => {
                self.database(&db)
                    .await?
                    .create_collection(&name, config, None)
                    .await?;
            }
            AofCommand::DropCollection { db, name } => {
                self.database(&db).await?.drop_collection(&name, None).await?;
            }
            AofCommand::InsertVectors {
                db,
                collection,
                vectors,
            } => {
                let items: Vec<InsertItem> = vectors
                    .into_iter()
                    .map(|v| InsertItem {
                        id: Some(v.id),
                        elements: v.elements,
                        metadata: v.metadata,
                    })
                    .collect();
                self.database(&db)
                    .await?
                    .collection(&collection)
                    .await?
                    .insert(items, &guard, None)
                    .await?;
            }
            AofCommand::DeleteVectors {
                db,
                collection,
                ids,
            } => {
                self.database(&db)
                    .await?
                    .collection(&collection)
                    .await?
                    .delete(&ids, &guard, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Rebuilds the engine from a loaded snapshot. Only valid on a
    /// fresh engine, before any live traffic.
    pub async fn restore(&self, snapshot: EngineSnapshot) -> Result<()> {
        for db_snap in snapshot.databases {
            self.create_database(&db_snap.name, None).await?;
            let db = self.database(&db_snap.name).await?;
            for coll_snap in db_snap.collections {
                let collection = Collection::from_snapshot(db_snap.name.clone(), coll_snap)?;
                db.adopt(collection).await?;
            }
        }
        self.bump_seq_to(snapshot.last_seq);
        Ok(())
    }

    /// Takes every collection's write lock (plus read locks on the
    /// name maps, which blocks create/drop) and returns the frozen
    /// view. Writers wait until the returned value is dropped; readers
    /// of individual collections wait only on their own collection.
    pub async fn freeze(&self) -> FrozenEngine {
        let db_guard = Arc::clone(&self.databases).read_owned().await;
        let mut dbs: Vec<Arc<Database>> = db_guard.values().cloned().collect();
        dbs.sort_by(|a, b| a.name().cmp(b.name()));

        let mut parts = Vec::with_capacity(dbs.len());
        for db in dbs {
            let coll_guard = db.collections_arc().read_owned().await;
            let mut collections: Vec<Arc<Collection>> = coll_guard.values().cloned().collect();
            collections.sort_by(|a, b| a.name().cmp(b.name()));

            let mut frozen = Vec::with_capacity(collections.len());
            for collection in collections {
                let state = collection.state_arc().write_owned().await;
                frozen.push((collection, state));
            }
            parts.push(FrozenDatabase {
                name: db.name().to_string(),
                _coll_guard: coll_guard,
                collections: frozen,
            });
        }
        FrozenEngine {
            _db_guard: db_guard,
            parts,
        }
    }
}

struct FrozenDatabase {
    name: String,
    _coll_guard: OwnedRwLockReadGuard<HashMap<String, Arc<Collection>>>,
    collections: Vec<(Arc<Collection>, OwnedRwLockWriteGuard<CollectionState>)>,
}

/// A stop-the-world view of the engine. Holding it keeps every writer
/// out; drop it as soon as the snapshot is cloned.
pub struct FrozenEngine {
    _db_guard: OwnedRwLockReadGuard<HashMap<String, Arc<Database>>>,
    parts: Vec<FrozenDatabase>,
}

impl FrozenEngine {
    pub fn snapshot(&self, last_seq: u64) -> EngineSnapshot {
        EngineSnapshot {
            last_seq,
            databases: self
                .parts
                .iter()
                .map(|db| DatabaseSnapshot {
                    name: db.name.clone(),
                    collections: db
                        .collections
                        .iter()
                        .map(|(coll, state)| state.snapshot(coll.name(), coll.config()))
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scintirete_core::{CollectionConfig, HnswParams, MetricKind};

    fn config() -> CollectionConfig {
        CollectionConfig {
            metric: MetricKind::Cosine,
            hnsw: HnswParams::default(),
        }
    }

    #[tokio::test]
    async fn test_database_lifecycle() {
        let engine = Engine::new();
        engine.create_database("a", None).await.unwrap();
        engine.create_database("b", None).await.unwrap();

        assert!(matches!(
            engine.create_database("a", None).await,
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(engine.list_databases().await, vec!["a", "b"]);

        engine.drop_database("a", None).await.unwrap();
        assert!(matches!(
            engine.database("a").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            engine.drop_database("a", None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let engine = Engine::new();
        engine.create_database("d", None).await.unwrap();
        let db = engine.database("d").await.unwrap();
        db.create_collection("c", config(), None).await.unwrap();
        let coll = db.collection("c").await.unwrap();

        let guard = OpGuard::unbounded();
        let items: Vec<InsertItem> = (0..8)
            .map(|i| InsertItem {
                id: None,
                elements: vec![(i as f32).sin(), (i as f32).cos()],
                metadata: None,
            })
            .collect();
        coll.insert(items, &guard, None).await.unwrap();
        coll.delete(&[3], &guard, None).await.unwrap();

        let frozen = engine.freeze().await;
        let snapshot = frozen.snapshot(17);
        drop(frozen);
        // Tombstoned vectors are dropped at snapshot time.
        assert_eq!(snapshot.vector_count(), 7);

        let restored = Engine::new();
        restored.restore(snapshot).await.unwrap();
        assert_eq!(restored.current_seq(), 17);

        let coll2 = restored
            .database("d")
            .await
            .unwrap()
            .collection("c")
            .await
            .unwrap();
        assert_eq!(coll2.count().await, 7);
        assert!(coll2.get(3).await.is_none());
        assert!(coll2.get(4).await.is_some());

        // Next id continues past everything ever assigned.
        let out = coll2
            .insert(
                vec![InsertItem {
                    id: None,
                    elements: vec![0.1, 0.2],
                    metadata: None,
                }],
                &guard,
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.ids, vec![9]);
    }

    #[tokio::test]
    async fn test_apply_replays_commands() {
        let engine = Engine::new();
        engine
            .apply(AofCommand::CreateDatabase { db: "d".into() })
            .await
            .unwrap();
        engine
            .apply(AofCommand::CreateCollection {
                db: "d".into(),
                name: "c".into(),
                config: config(),
            })
            .await
            .unwrap();
        engine
            .apply(AofCommand::InsertVectors {
                db: "d".into(),
                collection: "c".into(),
                vectors: vec![scintirete_core::PersistedVector {
                    id: 5,
                    elements: vec![1.0, 0.0],
                    metadata: None,
                }],
            })
            .await
            .unwrap();
        engine
            .apply(AofCommand::DeleteVectors {
                db: "d".into(),
                collection: "c".into(),
                ids: vec![5],
            })
            .await
            .unwrap();

        let coll = engine
            .database("d")
            .await
            .unwrap()
            .collection("c")
            .await
            .unwrap();
        assert_eq!(coll.count().await, 0);
        assert_eq!(coll.info().await.deleted_count, 1);
    }
}
