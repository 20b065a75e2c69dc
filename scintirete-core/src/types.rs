//! Data model vocabulary: ids, metrics, HNSW parameters, request and
//! response shapes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a vector within its collection. Assigned
/// monotonically by the collection; never reused.
pub type VectorId = u64;

/// Key/value metadata attached to a vector. Values are arbitrary JSON.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Distance metric for a collection.
///
/// All three kernels are oriented smaller-is-closer so the engine uses a
/// single heap discipline everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Squared Euclidean distance. The square root is never applied;
    /// ordering in squared space is identical.
    L2,
    /// `1 - cos(a, b)`. Vectors need not be pre-normalized.
    Cosine,
    /// Negated dot product.
    InnerProduct,
}

/// Construction-time parameters of an HNSW graph. Immutable once the
/// collection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Target neighbor count per node per layer. Layer 0 caps at `2*m`.
    pub m: u32,
    /// Candidate-set size bounding work during insertion.
    pub ef_construction: u32,
    /// Default candidate-set size during search; overridable per query.
    pub ef_search: u32,
    /// Hard cap on the layer a node may be assigned to.
    pub max_layers: u32,
    /// Seed for the layer-assignment RNG. Fixed seed + fixed insert
    /// order produce identical graphs.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            max_layers: 16,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

impl HnswParams {
    /// Maximum neighbor-list length on `layer`.
    pub fn layer_cap(&self, layer: u32) -> usize {
        if layer == 0 {
            self.m as usize * 2
        } else {
            self.m as usize
        }
    }

    /// Rejects degenerate parameters that would produce an unusable
    /// graph.
    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(Error::InvalidArgument(format!(
                "hnsw m must be >= 2, got {}",
                self.m
            )));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(Error::InvalidArgument(
                "hnsw ef_construction and ef_search must be > 0".into(),
            ));
        }
        if self.max_layers == 0 {
            return Err(Error::InvalidArgument("hnsw max_layers must be > 0".into()));
        }
        Ok(())
    }
}

/// Immutable collection attributes fixed at creation time. The
/// dimension is not part of the config: it is inferred from the first
/// inserted vector and locked from then on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub metric: MetricKind,
    pub hnsw: HnswParams,
}

/// One item of an insert batch. `id` of `None` (or 0, which is
/// reserved) asks the collection to assign the next id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertItem {
    #[serde(default)]
    pub id: Option<VectorId>,
    pub elements: Vec<f32>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// One search result, ascending by distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: VectorId,
    pub distance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Present only when the caller asked for `include_vector`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<f32>>,
}

/// Read-only snapshot of a collection's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    /// `None` until the first vector locks the dimension.
    pub dimension: Option<u32>,
    pub live_count: u64,
    pub deleted_count: u64,
    pub memory_bytes: u64,
    pub metric: MetricKind,
    pub hnsw: HnswParams,
}

/// Outcome of a synchronous `SAVE`.
#[derive(Debug, Clone)]
pub struct SaveReport {
    /// Size of the written snapshot file.
    pub bytes: u64,
    pub duration: Duration,
}
