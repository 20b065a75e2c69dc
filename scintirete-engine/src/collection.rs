//! The collection: vectors, metadata, id allocation and the HNSW graph
//! behind a single reader/writer lock.
//!
//! The lock discipline follows the write-ahead ordering contract: a
//! mutating operation validates, submits its log record, and applies
//! its in-memory effect all while holding the write lock, so log order
//! equals apply order. Only the durability ack is awaited after the
//! lock is released. Once the record is submitted the in-memory effect
//! always completes: cancellation is honored during validation, never
//! during apply.

use crate::manager::{Ack, CommandLog};
use rayon::prelude::*;
use scintirete_core::{
    AofCommand, CollectionConfig, CollectionInfo, CollectionSnapshot, Error, InsertItem, Metadata,
    OpGuard, PersistedVector, Result, SearchHit, VectorId,
};
use scintirete_index::{HnswGraph, VectorSource, distance};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fixed per-record bookkeeping charged to the memory estimate.
const RECORD_OVERHEAD: u64 = 64;

#[derive(Debug)]
struct VectorRecord {
    elements: Box<[f32]>,
    metadata: Option<Metadata>,
    tombstoned: bool,
}

impl VectorRecord {
    fn footprint(&self) -> u64 {
        let meta = self
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_vec(m).ok())
            .map_or(0, |b| b.len() as u64);
        RECORD_OVERHEAD + (self.elements.len() * 4) as u64 + meta
    }
}

/// Owning store of vector records. The graph reads elements through
/// [`VectorSource`]; tombstoned records stay visible there because
/// their nodes keep serving connectivity.
#[derive(Default, Debug)]
pub(crate) struct VectorStore {
    records: HashMap<VectorId, VectorRecord>,
}

impl VectorSource for VectorStore {
    fn vector(&self, id: VectorId) -> Option<&[f32]> {
        self.records.get(&id).map(|r| &*r.elements)
    }
}

#[derive(Debug)]
pub(crate) struct CollectionState {
    dim: Option<u32>,
    store: VectorStore,
    graph: HnswGraph,
    next_id: VectorId,
    live_count: u64,
    deleted_count: u64,
    memory_bytes: u64,
}

impl CollectionState {
    fn new(config: CollectionConfig) -> Self {
        Self {
            dim: None,
            store: VectorStore::default(),
            graph: HnswGraph::new(config.hnsw, config.metric),
            next_id: 1,
            live_count: 0,
            deleted_count: 0,
            memory_bytes: 0,
        }
    }

    /// Consistent view for the snapshot writer: live vectors only,
    /// ascending by id.
    pub(crate) fn snapshot(&self, name: &str, config: CollectionConfig) -> CollectionSnapshot {
        let mut vectors: Vec<PersistedVector> = self
            .store
            .records
            .iter()
            .filter(|(_, r)| !r.tombstoned)
            .map(|(&id, r)| PersistedVector {
                id,
                elements: r.elements.to_vec(),
                metadata: r.metadata.clone(),
            })
            .collect();
        vectors.sort_unstable_by_key(|v| v.id);
        CollectionSnapshot {
            name: name.to_string(),
            dimension: self.dim,
            config,
            next_id: self.next_id,
            vectors,
        }
    }
}

/// Result of an insert: assigned ids in input order, plus the
/// durability ack to await once locks are released.
#[derive(Debug)]
pub struct InsertOutcome {
    pub ids: Vec<VectorId>,
    pub ack: Ack,
}

#[derive(Debug)]
pub struct Collection {
    db_name: String,
    name: String,
    config: CollectionConfig,
    state: Arc<RwLock<CollectionState>>,
}

impl Collection {
    pub(crate) fn new(db_name: String, name: String, config: CollectionConfig) -> Result<Self> {
        config.hnsw.validate()?;
        Ok(Self {
            db_name,
            name,
            state: Arc::new(RwLock::new(CollectionState::new(config))),
            config,
        })
    }

    /// Reconstructs a collection from a snapshot: vectors are stored,
    /// then the graph is rebuilt by inserting ids in ascending order.
    pub(crate) fn from_snapshot(db_name: String, snap: CollectionSnapshot) -> Result<Self> {
        let coll = Self::new(db_name, snap.name.clone(), snap.config)?;
        let mut st = coll
            .state
            .try_write()
            .map_err(|_| Error::Internal("fresh collection lock contended".into()))?;

        let mut ids = Vec::with_capacity(snap.vectors.len());
        let mut max_id = 0;
        for v in snap.vectors {
            max_id = max_id.max(v.id);
            ids.push(v.id);
            let record = VectorRecord {
                elements: v.elements.into_boxed_slice(),
                metadata: v.metadata,
                tombstoned: false,
            };
            st.memory_bytes += record.footprint();
            st.store.records.insert(v.id, record);
        }
        ids.sort_unstable();
        st.graph = HnswGraph::build(
            snap.config.hnsw,
            snap.config.metric,
            &ids,
            &st.store,
            &OpGuard::unbounded(),
        )?;
        st.dim = snap.dimension;
        st.live_count = ids.len() as u64;
        st.next_id = snap.next_id.max(max_id + 1);
        drop(st);
        Ok(coll)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CollectionConfig {
        self.config
    }

    pub(crate) fn state_arc(&self) -> Arc<RwLock<CollectionState>> {
        Arc::clone(&self.state)
    }

    /// Batch insert, all-or-nothing. Caller-supplied non-zero ids are
    /// honored (collision is an error); `None` or 0 allocates the next
    /// id. The first vector locks the collection dimension.
    pub async fn insert(
        &self,
        items: Vec<InsertItem>,
        guard: &OpGuard,
        log: Option<&CommandLog>,
    ) -> Result<InsertOutcome> {
        if items.is_empty() {
            return Ok(InsertOutcome {
                ids: Vec::new(),
                ack: Ack::none(),
            });
        }
        guard.check()?;
        let mut st = self.state.write().await;

        // Validate and resolve ids before touching anything.
        let mut dim = st.dim;
        let mut next_id = st.next_id;
        let mut resolved = Vec::with_capacity(items.len());
        let mut batch_ids = HashSet::with_capacity(items.len());
        for item in &items {
            guard.check()?;
            if item.elements.is_empty() {
                return Err(Error::InvalidArgument("vector elements are empty".into()));
            }
            match dim {
                None => dim = Some(item.elements.len() as u32),
                Some(d) if d as usize != item.elements.len() => {
                    return Err(Error::DimensionMismatch {
                        expected: d as usize,
                        actual: item.elements.len(),
                    });
                }
                Some(_) => {}
            }
            let id = match item.id {
                None | Some(0) => {
                    let id = next_id;
                    next_id += 1;
                    // next_id stays above every id ever stored, so an
                    // allocated id cannot collide.
                    debug_assert!(!st.store.records.contains_key(&id));
                    id
                }
                Some(id) => {
                    if st.store.records.contains_key(&id) {
                        return Err(Error::AlreadyExists(format!("vector {id}")));
                    }
                    if id >= next_id {
                        next_id = id + 1;
                    }
                    id
                }
            };
            if !batch_ids.insert(id) {
                return Err(Error::AlreadyExists(format!(
                    "vector {id} appears twice in one batch"
                )));
            }
            resolved.push(id);
        }

        // Write-ahead: submit while the lock is held so log order
        // equals apply order. Backpressure surfaces here.
        let ack = match log {
            Some(log) => {
                let vectors = items
                    .iter()
                    .zip(&resolved)
                    .map(|(item, &id)| PersistedVector {
                        id,
                        elements: item.elements.clone(),
                        metadata: item.metadata.clone(),
                    })
                    .collect();
                log.submit(AofCommand::InsertVectors {
                    db: self.db_name.clone(),
                    collection: self.name.clone(),
                    vectors,
                })?
            }
            None => Ack::none(),
        };

        // Apply. The record is queued: no cancellation from here on.
        let apply_guard = OpGuard::unbounded();
        let CollectionState {
            store,
            graph,
            dim: st_dim,
            next_id: st_next_id,
            live_count,
            memory_bytes,
            ..
        } = &mut *st;

        let mut applied: Vec<VectorId> = Vec::with_capacity(items.len());
        let mut added_bytes = 0u64;
        for (item, &id) in items.into_iter().zip(&resolved) {
            let record = VectorRecord {
                elements: item.elements.into_boxed_slice(),
                metadata: item.metadata,
                tombstoned: false,
            };
            added_bytes += record.footprint();
            store.records.insert(id, record);
            if let Err(e) = graph.insert(id, &*store, &apply_guard) {
                store.records.remove(&id);
                for &prev in &applied {
                    graph.remove(prev);
                    store.records.remove(&prev);
                }
                tracing::error!(
                    collection = %self.name,
                    "index insert failed mid-batch, batch rolled back: {e}"
                );
                return Err(e);
            }
            applied.push(id);
        }

        *st_dim = dim;
        *st_next_id = next_id;
        *live_count += applied.len() as u64;
        *memory_bytes += added_bytes;
        drop(st);

        Ok(InsertOutcome {
            ids: resolved,
            ack,
        })
    }

    /// Tombstones the given ids. Unknown or already-deleted ids are
    /// skipped; returns how many vectors were actually deleted.
    pub async fn delete(
        &self,
        ids: &[VectorId],
        guard: &OpGuard,
        log: Option<&CommandLog>,
    ) -> Result<(u64, Ack)> {
        guard.check()?;
        let mut st = self.state.write().await;

        let mut seen = HashSet::with_capacity(ids.len());
        let hit: Vec<VectorId> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .filter(|id| st.store.records.get(id).is_some_and(|r| !r.tombstoned))
            .collect();
        if hit.is_empty() {
            return Ok((0, Ack::none()));
        }

        let ack = match log {
            Some(log) => log.submit(AofCommand::DeleteVectors {
                db: self.db_name.clone(),
                collection: self.name.clone(),
                ids: hit.clone(),
            })?,
            None => Ack::none(),
        };

        for &id in &hit {
            if let Some(record) = st.store.records.get_mut(&id) {
                record.tombstoned = true;
            }
            st.graph.mark_deleted(id)?;
        }
        st.deleted_count += hit.len() as u64;
        st.live_count -= hit.len() as u64;
        drop(st);

        Ok((hit.len() as u64, ack))
    }

    /// Top-k search. Small collections fall back to an exact parallel
    /// scan, which is both faster and more accurate at that size.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_override: Option<u32>,
        include_vector: bool,
        guard: &OpGuard,
    ) -> Result<Vec<SearchHit>> {
        guard.check()?;
        let st = self.state.read().await;

        let Some(dim) = st.dim else {
            return Ok(Vec::new());
        };
        if query.len() != dim as usize {
            return Err(Error::DimensionMismatch {
                expected: dim as usize,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let scored: Vec<(VectorId, f32)> = if st.live_count < 2 * k as u64 {
            let mut all = Self::exact_scan(&st, self.config.metric, query)?;
            all.truncate(k);
            all
        } else {
            let ef = ef_override.unwrap_or(self.config.hnsw.ef_search) as usize;
            st.graph.search(query, k, ef, &st.store, guard)?
        };

        Ok(scored
            .into_iter()
            .map(|(id, dist)| {
                let record = st.store.records.get(&id);
                SearchHit {
                    id,
                    distance: dist,
                    metadata: record.and_then(|r| r.metadata.clone()),
                    elements: record
                        .filter(|_| include_vector)
                        .map(|r| r.elements.to_vec()),
                }
            })
            .collect())
    }

    fn exact_scan(
        st: &CollectionState,
        metric: scintirete_core::MetricKind,
        query: &[f32],
    ) -> Result<Vec<(VectorId, f32)>> {
        let mut scored: Vec<(VectorId, f32)> = st
            .store
            .records
            .par_iter()
            .filter(|(_, r)| !r.tombstoned)
            .map(|(&id, r)| distance(metric, query, &r.elements).map(|d| (id, d)))
            .collect::<Result<_>>()?;
        scored.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(scored)
    }

    /// Fetches a live vector by id.
    pub async fn get(&self, id: VectorId) -> Option<PersistedVector> {
        let st = self.state.read().await;
        st.store
            .records
            .get(&id)
            .filter(|r| !r.tombstoned)
            .map(|r| PersistedVector {
                id,
                elements: r.elements.to_vec(),
                metadata: r.metadata.clone(),
            })
    }

    pub async fn count(&self) -> u64 {
        self.state.read().await.live_count
    }

    pub async fn info(&self) -> CollectionInfo {
        let st = self.state.read().await;
        CollectionInfo {
            name: self.name.clone(),
            dimension: st.dim,
            live_count: st.live_count,
            deleted_count: st.deleted_count,
            memory_bytes: st.memory_bytes,
            metric: self.config.metric,
            hnsw: self.config.hnsw,
        }
    }

    /// True once tombstones reach 20% of live vectors.
    pub async fn rebuild_recommended(&self) -> bool {
        self.state.read().await.graph.rebuild_recommended()
    }

    /// Rebuilds the graph from live vectors and drops tombstoned
    /// records. The fresh graph is swapped in atomically; searches see
    /// either the old or the new graph, never a partial one.
    pub async fn rebuild(&self, guard: &OpGuard) -> Result<()> {
        guard.check()?;
        let mut st = self.state.write().await;

        let mut ids: Vec<VectorId> = st
            .store
            .records
            .iter()
            .filter(|(_, r)| !r.tombstoned)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();

        let graph = HnswGraph::build(
            self.config.hnsw,
            self.config.metric,
            &ids,
            &st.store,
            guard,
        )?;
        st.graph = graph;
        st.store.records.retain(|_, r| !r.tombstoned);
        st.deleted_count = 0;
        st.memory_bytes = st.store.records.values().map(VectorRecord::footprint).sum();
        let pruned = st.live_count;
        drop(st);
        tracing::info!(collection = %self.name, live = pruned, "graph rebuilt, tombstones pruned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scintirete_core::MetricKind;

    fn config() -> CollectionConfig {
        CollectionConfig {
            metric: MetricKind::L2,
            hnsw: scintirete_core::HnswParams {
                m: 8,
                ef_construction: 100,
                seed: 11,
                ..Default::default()
            },
        }
    }

    fn coll() -> Collection {
        Collection::new("db".into(), "c".into(), config()).unwrap()
    }

    fn item(id: Option<VectorId>, elements: Vec<f32>) -> InsertItem {
        InsertItem {
            id,
            elements,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_auto_id_assignment() {
        let c = coll();
        let guard = OpGuard::unbounded();

        let out = c
            .insert(vec![item(None, vec![1.0, 0.0])], &guard, None)
            .await
            .unwrap();
        assert_eq!(out.ids, vec![1]);

        let out = c
            .insert(vec![item(Some(0), vec![0.0, 1.0])], &guard, None)
            .await
            .unwrap();
        assert_eq!(out.ids, vec![2]);

        let out = c
            .insert(vec![item(Some(100), vec![1.0, 1.0])], &guard, None)
            .await
            .unwrap();
        assert_eq!(out.ids, vec![100]);

        let out = c
            .insert(vec![item(None, vec![0.5, 0.5])], &guard, None)
            .await
            .unwrap();
        assert_eq!(out.ids, vec![101]);
    }

    #[tokio::test]
    async fn test_dimension_locked_by_first_insert() {
        let c = coll();
        let guard = OpGuard::unbounded();

        c.insert(vec![item(None, vec![1.0, 2.0, 3.0, 4.0])], &guard, None)
            .await
            .unwrap();
        assert_eq!(c.info().await.dimension, Some(4));

        let err = c
            .insert(
                vec![item(None, vec![1.0, 2.0, 3.0, 4.0, 5.0])],
                &guard,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_elements_rejected() {
        let c = coll();
        let err = c
            .insert(vec![item(None, vec![])], &OpGuard::unbounded(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let c = coll();
        let guard = OpGuard::unbounded();
        c.insert(vec![item(Some(5), vec![1.0, 0.0])], &guard, None)
            .await
            .unwrap();

        // Second item collides; the first must not survive.
        let err = c
            .insert(
                vec![item(None, vec![0.0, 1.0]), item(Some(5), vec![0.5, 0.5])],
                &guard,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(c.count().await, 1);
        assert!(c.get(6).await.is_none());

        // Ids consumed by the failed batch are not reused... the batch
        // failed before allocation was committed, so the next auto id
        // continues from the last successful state.
        let out = c
            .insert(vec![item(None, vec![0.0, 1.0])], &guard, None)
            .await
            .unwrap();
        assert_eq!(out.ids, vec![6]);
    }

    #[tokio::test]
    async fn test_duplicate_id_within_batch_rejected() {
        let c = coll();
        let err = c
            .insert(
                vec![item(Some(7), vec![1.0, 0.0]), item(Some(7), vec![0.0, 1.0])],
                &OpGuard::unbounded(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(c.count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_counts_and_excludes() {
        let c = coll();
        let guard = OpGuard::unbounded();
        c.insert(
            vec![
                item(None, vec![1.0, 0.0, 0.0]),
                item(None, vec![0.0, 1.0, 0.0]),
                item(None, vec![0.0, 0.0, 1.0]),
            ],
            &guard,
            None,
        )
        .await
        .unwrap();

        let (deleted, _) = c.delete(&[1, 999], &guard, None).await.unwrap();
        assert_eq!(deleted, 1);
        // Repeat delete of a tombstoned id is a no-op.
        let (deleted, _) = c.delete(&[1], &guard, None).await.unwrap();
        assert_eq!(deleted, 0);

        let hits = c
            .search(&[0.9, 0.1, 0.0], 3, None, false, &guard)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.id != 1));

        let info = c.info().await;
        assert_eq!(info.live_count, 2);
        assert_eq!(info.deleted_count, 1);
    }

    #[tokio::test]
    async fn test_search_empty_collection() {
        let c = coll();
        let hits = c
            .search(&[1.0, 2.0], 5, None, false, &OpGuard::unbounded())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_k_larger_than_live() {
        let c = coll();
        let guard = OpGuard::unbounded();
        c.insert(
            vec![item(None, vec![1.0, 0.0]), item(None, vec![0.0, 1.0])],
            &guard,
            None,
        )
        .await
        .unwrap();

        let hits = c.search(&[1.0, 0.0], 10, None, false, &guard).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_include_vector_controls_elements() {
        let c = coll();
        let guard = OpGuard::unbounded();
        let mut metadata = Metadata::new();
        metadata.insert("label".into(), serde_json::json!("origin"));
        c.insert(
            vec![InsertItem {
                id: None,
                elements: vec![1.0, 0.0],
                metadata: Some(metadata),
            }],
            &guard,
            None,
        )
        .await
        .unwrap();

        let hits = c.search(&[1.0, 0.0], 1, None, false, &guard).await.unwrap();
        assert!(hits[0].elements.is_none());
        assert_eq!(
            hits[0].metadata.as_ref().unwrap()["label"],
            serde_json::json!("origin")
        );

        let hits = c.search(&[1.0, 0.0], 1, None, true, &guard).await.unwrap();
        assert_eq!(hits[0].elements.as_deref(), Some(&[1.0, 0.0][..]));
    }

    #[tokio::test]
    async fn test_self_match_distance_near_zero() {
        let c = coll();
        let guard = OpGuard::unbounded();
        let v = vec![0.3, -0.7, 0.2];
        c.insert(vec![item(None, v.clone())], &guard, None)
            .await
            .unwrap();
        let hits = c.search(&v, 1, None, false, &guard).await.unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rebuild_prunes_tombstones() {
        let c = coll();
        let guard = OpGuard::unbounded();
        let items: Vec<InsertItem> = (0..20)
            .map(|i| item(None, vec![(i as f32 * 0.37).sin(), (i as f32 * 0.61).cos()]))
            .collect();
        c.insert(items, &guard, None).await.unwrap();
        c.delete(&[1, 2, 3, 4, 5], &guard, None).await.unwrap();

        assert!(c.rebuild_recommended().await);
        let before = c.info().await;
        assert_eq!(before.deleted_count, 5);

        c.rebuild(&guard).await.unwrap();
        let after = c.info().await;
        assert_eq!(after.deleted_count, 0);
        assert_eq!(after.live_count, 15);
        assert!(after.memory_bytes < before.memory_bytes);

        // Deleted ids stay gone, the rest stay searchable.
        let hits = c
            .search(&[0.0, 1.0], 20, None, false, &guard)
            .await
            .unwrap();
        assert_eq!(hits.len(), 15);
        assert!(hits.iter().all(|h| h.id > 5));
    }

    #[tokio::test]
    async fn test_delete_then_reinsert_same_distances() {
        let c = coll();
        let guard = OpGuard::unbounded();
        let v = vec![0.6, 0.8];
        c.insert(
            vec![item(None, v.clone()), item(None, vec![0.0, 1.0])],
            &guard,
            None,
        )
        .await
        .unwrap();

        let before = c.search(&v, 1, None, false, &guard).await.unwrap();
        c.delete(&[1], &guard, None).await.unwrap();
        c.insert(vec![item(None, v.clone())], &guard, None)
            .await
            .unwrap();
        let after = c.search(&v, 1, None, false, &guard).await.unwrap();

        assert_ne!(before[0].id, after[0].id);
        assert_eq!(before[0].distance, after[0].distance);
    }

    #[tokio::test]
    async fn test_cancelled_before_lock() {
        let c = coll();
        let guard = OpGuard::unbounded();
        guard.cancel();
        assert!(matches!(
            c.insert(vec![item(None, vec![1.0])], &guard, None).await,
            Err(Error::Cancelled(_))
        ));
        assert!(matches!(
            c.search(&[1.0], 1, None, false, &guard).await,
            Err(Error::Cancelled(_))
        ));
    }
}
