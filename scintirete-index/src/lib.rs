//! Vector index for Scintirete: distance kernels and the HNSW graph.
//!
//! The graph is an in-memory structure only. It is never serialized;
//! recovery rebuilds it from the persisted vectors, so the on-disk
//! formats stay independent of graph layout.

mod distance;
mod hnsw;
mod rng;

pub use distance::{cosine, distance, inner_product, l2_squared};
pub use hnsw::{HnswGraph, VectorSource};
pub use rng::Xorshift64;
