//! The Scintirete engine: concurrent collections of vectors, the
//! database namespace above them, and the persistence orchestration
//! that keeps everything durable.
//!
//! Layering, leaves first: a [`Collection`] owns its vectors, metadata
//! and HNSW graph behind one reader/writer lock; a [`Database`] is a
//! named map of collections; the [`Engine`] is the process-wide root.
//! The [`PersistenceManager`] recovers state at startup and runs the
//! snapshot/rewrite cycle; the [`VectorService`] is the authenticated
//! operation surface a gateway talks to.

mod collection;
mod database;
mod engine;
mod manager;
mod service;

pub use collection::{Collection, InsertOutcome};
pub use database::Database;
pub use engine::Engine;
pub use manager::{Ack, CommandLog, PersistenceManager};
pub use service::VectorService;

use scintirete_core::{Error, Result};

/// Name rules shared by databases and collections: non-empty, at most
/// 255 bytes, no path separators.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!("{kind} name is empty")));
    }
    if name.len() > 255 {
        return Err(Error::InvalidArgument(format!(
            "{kind} name exceeds 255 bytes"
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidArgument(format!(
            "{kind} name '{name}' contains a path separator"
        )));
    }
    Ok(())
}
