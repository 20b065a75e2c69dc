//! HNSW (Hierarchical Navigable Small World) graph.
//!
//! A layered proximity graph: layer 0 holds every node, higher layers
//! hold exponentially fewer. Search enters at the sparse top layer,
//! greedily descends to layer 1 carrying a single survivor, then runs a
//! beam search on layer 0.
//!
//! The graph does not own vector data. Every operation receives a
//! [`VectorSource`] view into the collection's store, so elements exist
//! exactly once in memory. Deletes are tombstones: the node keeps
//! serving connectivity but is filtered from results until a rebuild
//! prunes it.

use crate::distance;
use crate::rng::Xorshift64;
use scintirete_core::{Error, HnswParams, MetricKind, OpGuard, Result, VectorId};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Read-only view into the vector storage that owns the elements.
pub trait VectorSource {
    fn vector(&self, id: VectorId) -> Option<&[f32]>;
}

impl VectorSource for HashMap<VectorId, Vec<f32>> {
    fn vector(&self, id: VectorId) -> Option<&[f32]> {
        self.get(&id).map(Vec::as_slice)
    }
}

/// A scored node. Orders by distance, then id, so heap pops and sorts
/// are deterministic even under distance ties.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    id: VectorId,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug)]
struct Node {
    /// Top layer this node occupies. Fixed at insertion.
    layer: u32,
    /// Per-layer neighbor ids, index 0..=layer. Sets, not bags.
    neighbors: Vec<Vec<VectorId>>,
    tombstoned: AtomicBool,
}

impl Node {
    fn new(layer: u32) -> Self {
        Self {
            layer,
            neighbors: vec![Vec::new(); layer as usize + 1],
            tombstoned: AtomicBool::new(false),
        }
    }

    fn neighbors_at(&self, layer: u32) -> &[VectorId] {
        self.neighbors
            .get(layer as usize)
            .map_or(&[], Vec::as_slice)
    }

    fn push_neighbor(&mut self, layer: u32, n: VectorId) {
        if let Some(list) = self.neighbors.get_mut(layer as usize)
            && !list.contains(&n)
        {
            list.push(n);
        }
    }
}

#[derive(Debug)]
pub struct HnswGraph {
    params: HnswParams,
    metric: MetricKind,
    nodes: HashMap<VectorId, Node>,
    entry_point: Option<VectorId>,
    top_layer: u32,
    rng: Xorshift64,
    deleted: AtomicU64,
}

impl HnswGraph {
    pub fn new(params: HnswParams, metric: MetricKind) -> Self {
        Self {
            rng: Xorshift64::new(params.seed),
            params,
            metric,
            nodes: HashMap::new(),
            entry_point: None,
            top_layer: 0,
            deleted: AtomicU64::new(0),
        }
    }

    /// Builds a graph by inserting `ids` in the given order. With a
    /// fixed seed the result is identical across runs.
    pub fn build<S: VectorSource>(
        params: HnswParams,
        metric: MetricKind,
        ids: &[VectorId],
        source: &S,
        guard: &OpGuard,
    ) -> Result<Self> {
        let mut graph = Self::new(params, metric);
        for &id in ids {
            guard.check()?;
            graph.insert(id, source, guard)?;
        }
        tracing::debug!(nodes = graph.nodes.len(), "hnsw graph built");
        Ok(graph)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn live_count(&self) -> u64 {
        self.nodes.len() as u64 - self.deleted_count()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_tombstoned(&self, id: VectorId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|n| n.tombstoned.load(Ordering::Relaxed))
    }

    pub fn entry_point(&self) -> Option<VectorId> {
        self.entry_point
    }

    pub fn top_layer(&self) -> u32 {
        self.top_layer
    }

    /// Neighbor list of `id` on `layer`, for invariant checks.
    pub fn neighbors(&self, id: VectorId, layer: u32) -> Option<&[VectorId]> {
        self.nodes.get(&id).map(|n| n.neighbors_at(layer))
    }

    /// Top layer assigned to `id`, if present.
    pub fn node_layer(&self, id: VectorId) -> Option<u32> {
        self.nodes.get(&id).map(|n| n.layer)
    }

    /// True once tombstones reach 20% of live nodes; the collection may
    /// then schedule an offline rebuild.
    pub fn rebuild_recommended(&self) -> bool {
        let deleted = self.deleted_count();
        let live = self.live_count();
        deleted > 0 && (live == 0 || deleted * 5 >= live)
    }

    /// Inserts an already-stored vector into the graph.
    pub fn insert<S: VectorSource>(
        &mut self,
        id: VectorId,
        source: &S,
        guard: &OpGuard,
    ) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("vector {id} already indexed")));
        }
        let q = Self::vec_of(source, id)?;
        let node_layer = self.random_layer();

        let Some(ep0) = self.entry_point else {
            self.nodes.insert(id, Node::new(node_layer));
            self.entry_point = Some(id);
            self.top_layer = node_layer;
            return Ok(());
        };

        // Greedy descent above the node's top layer: one survivor.
        let mut ep = Candidate {
            dist: self.dist(q, Self::vec_of(source, ep0)?)?,
            id: ep0,
        };
        let mut layer = self.top_layer;
        while layer > node_layer {
            guard.check()?;
            ep = self.greedy_search(q, ep, layer, source)?;
            layer -= 1;
        }

        self.nodes.insert(id, Node::new(node_layer));
        if let Err(e) = self.connect(id, q, node_layer, ep, source, guard) {
            // Cancellation or an internal failure mid-linking: take the
            // half-connected node out again.
            self.remove(id);
            return Err(e);
        }

        if node_layer > self.top_layer {
            self.top_layer = node_layer;
            self.entry_point = Some(id);
        }
        Ok(())
    }

    /// Beam search + heuristic linking from `min(top_layer, ℓ(v))`
    /// down to 0. The full candidate set of one layer seeds the next.
    fn connect<S: VectorSource>(
        &mut self,
        id: VectorId,
        q: &[f32],
        node_layer: u32,
        ep: Candidate,
        source: &S,
        guard: &OpGuard,
    ) -> Result<()> {
        let start = self.top_layer.min(node_layer);
        let mut eps = vec![ep];
        for l in (0..=start).rev() {
            guard.check()?;
            let candidates =
                self.search_layer(q, &eps, self.params.ef_construction as usize, l, source)?;
            let selected = self.select_neighbors(&candidates, self.params.m as usize, source)?;

            let node = self.node_mut(id)?;
            for c in &selected {
                node.push_neighbor(l, c.id);
            }
            for c in &selected {
                self.link_back(c.id, id, l, source)?;
            }
            eps = candidates;
        }
        Ok(())
    }

    /// Top-k search. Tombstoned nodes are traversed for connectivity
    /// but never returned.
    pub fn search<S: VectorSource>(
        &self,
        q: &[f32],
        k: usize,
        ef: usize,
        source: &S,
        guard: &OpGuard,
    ) -> Result<Vec<(VectorId, f32)>> {
        let Some(ep0) = self.entry_point else {
            return Ok(Vec::new());
        };
        let mut best = Candidate {
            dist: self.dist(q, Self::vec_of(source, ep0)?)?,
            id: ep0,
        };
        for layer in (1..=self.top_layer).rev() {
            guard.check()?;
            best = self.greedy_search(q, best, layer, source)?;
        }
        guard.check()?;
        let found = self.search_layer(q, &[best], ef.max(k), 0, source)?;
        Ok(found
            .into_iter()
            .filter(|c| !self.is_tombstoned(c.id))
            .take(k)
            .map(|c| (c.id, c.dist))
            .collect())
    }

    /// Physically removes a node and strips every edge referencing it.
    /// Linear in graph size: pruning leaves asymmetric edges, so the
    /// whole node table must be swept. This is the rollback path for a
    /// failed insert batch; regular deletes tombstone instead.
    pub fn remove(&mut self, id: VectorId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        if node.tombstoned.load(Ordering::Relaxed) {
            self.deleted.fetch_sub(1, Ordering::Relaxed);
        }
        for other in self.nodes.values_mut() {
            for list in &mut other.neighbors {
                list.retain(|&n| n != id);
            }
        }
        if self.entry_point == Some(id) {
            match self.nodes.iter().map(|(&nid, n)| (n.layer, nid)).max() {
                Some((layer, nid)) => {
                    self.entry_point = Some(nid);
                    self.top_layer = layer;
                }
                None => {
                    self.entry_point = None;
                    self.top_layer = 0;
                }
            }
        }
        true
    }

    /// O(1) soft delete. Takes `&self`: the tombstone is an atomic
    /// flag, so latency-sensitive callers can mark under a read guard.
    pub fn mark_deleted(&self, id: VectorId) -> Result<bool> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("vector {id} not indexed")))?;
        let was = node.tombstoned.swap(true, Ordering::Relaxed);
        if !was {
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(!was)
    }

    fn vec_of<'s, S: VectorSource>(source: &'s S, id: VectorId) -> Result<&'s [f32]> {
        source
            .vector(id)
            .ok_or_else(|| Error::Internal(format!("graph references missing vector {id}")))
    }

    fn dist(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        distance::distance(self.metric, a, b)
    }

    fn node(&self, id: VectorId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::Internal(format!("graph node {id} missing")))
    }

    fn node_mut(&mut self, id: VectorId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("graph node {id} missing")))
    }

    /// Draws `⌊−ln(U)/ln(M)⌋`, capped at `max_layers`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn random_layer(&mut self) -> u32 {
        let u = self.rng.next_f64().max(f64::MIN_POSITIVE);
        let level_mult = 1.0 / f64::from(self.params.m).ln();
        ((-u.ln() * level_mult).floor() as u32).min(self.params.max_layers)
    }

    /// Repeatedly moves to the strictly-closer neighbor on `layer`
    /// until no neighbor improves.
    fn greedy_search<S: VectorSource>(
        &self,
        q: &[f32],
        mut best: Candidate,
        layer: u32,
        source: &S,
    ) -> Result<Candidate> {
        loop {
            let mut improved = false;
            for &n in self.node(best.id)?.neighbors_at(layer) {
                let d = self.dist(q, Self::vec_of(source, n)?)?;
                if d < best.dist {
                    best = Candidate { dist: d, id: n };
                    improved = true;
                }
            }
            if !improved {
                return Ok(best);
            }
        }
    }

    /// Two-heap beam search on one layer: a min-heap of nodes left to
    /// explore, a bounded max-heap of the best `ef` seen. Returns the
    /// result set ascending by distance.
    fn search_layer<S: VectorSource>(
        &self,
        q: &[f32],
        eps: &[Candidate],
        ef: usize,
        layer: u32,
        source: &S,
    ) -> Result<Vec<Candidate>> {
        let mut visited: HashSet<VectorId> = eps.iter().map(|c| c.id).collect();
        let mut candidates: BinaryHeap<Reverse<Candidate>> =
            eps.iter().map(|&c| Reverse(c)).collect();
        let mut best: BinaryHeap<Candidate> = eps.iter().copied().collect();
        while best.len() > ef {
            best.pop();
        }

        while let Some(Reverse(c)) = candidates.pop() {
            if best.len() >= ef
                && let Some(worst) = best.peek()
                && c.dist > worst.dist
            {
                break;
            }
            for &n in self.node(c.id)?.neighbors_at(layer) {
                if visited.insert(n) {
                    let d = self.dist(q, Self::vec_of(source, n)?)?;
                    let worst = best.peek().map_or(f32::MAX, |w| w.dist);
                    if best.len() < ef || d < worst {
                        let cand = Candidate { dist: d, id: n };
                        candidates.push(Reverse(cand));
                        best.push(cand);
                        if best.len() > ef {
                            best.pop();
                        }
                    }
                }
            }
        }
        Ok(best.into_sorted_vec())
    }

    /// Heuristic neighbor selection: walk candidates in ascending
    /// distance and keep `c` only if it is closer to the query point
    /// than to every neighbor already kept. Favors spread over raw
    /// proximity, which keeps the graph navigable in clustered data.
    fn select_neighbors<S: VectorSource>(
        &self,
        candidates: &[Candidate],
        m: usize,
        source: &S,
    ) -> Result<Vec<Candidate>> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        'outer: for &c in candidates {
            if selected.len() == m {
                break;
            }
            let c_vec = Self::vec_of(source, c.id)?;
            for r in &selected {
                let d_cr = self.dist(c_vec, Self::vec_of(source, r.id)?)?;
                if d_cr <= c.dist {
                    continue 'outer;
                }
            }
            selected.push(c);
        }
        Ok(selected)
    }

    /// Adds the backlink `r -> v` on `layer`; if `r`'s list now exceeds
    /// the layer cap, re-runs heuristic selection over the combined set
    /// relative to `r`.
    fn link_back<S: VectorSource>(
        &mut self,
        r: VectorId,
        v: VectorId,
        layer: u32,
        source: &S,
    ) -> Result<()> {
        let cap = self.params.layer_cap(layer);
        {
            let node = self.node_mut(r)?;
            if (layer as usize) >= node.neighbors.len() {
                return Ok(());
            }
            node.push_neighbor(layer, v);
            if node.neighbors_at(layer).len() <= cap {
                return Ok(());
            }
        }

        let current: Vec<VectorId> = self.node(r)?.neighbors_at(layer).to_vec();
        let r_vec = Self::vec_of(source, r)?;
        let mut combined = Vec::with_capacity(current.len());
        for n in current {
            combined.push(Candidate {
                dist: self.dist(r_vec, Self::vec_of(source, n)?)?,
                id: n,
            });
        }
        combined.sort_unstable();

        let kept = self.select_neighbors(&combined, cap, source)?;
        let node = self.node_mut(r)?;
        node.neighbors[layer as usize] = kept.into_iter().map(|c| c.id).collect();
        Ok(())
    }
}
