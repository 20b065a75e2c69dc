//! Embedding collaborator contract.
//!
//! The actual text-to-vector client is an outbound HTTP caller owned by
//! the gateway layer. The engine consumes this trait for the
//! convenience operations that embed before inserting or searching; the
//! append-log only ever sees the resulting vector mutation.

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embeds a batch of texts with the named model. One output vector
    /// per input text, in input order.
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>>;
}
