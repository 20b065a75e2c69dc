//! Core types and contracts shared across the Scintirete workspace.
//!
//! This crate defines the pieces every other crate agrees on:
//!
//! - The error taxonomy ([`Error`]): exactly one variant classifies
//!   every failure the engine can surface.
//! - The data model vocabulary: vector ids, metrics, HNSW parameters,
//!   collection configuration, search hits.
//! - The persistence data model: append-log commands ([`AofCommand`])
//!   and snapshot shapes ([`EngineSnapshot`]).
//! - Collaborator contracts for subsystems that live outside the core:
//!   [`Authenticator`] and [`EmbeddingClient`].
//! - Runtime configuration ([`Settings`]) and the per-operation
//!   deadline/cancellation guard ([`OpGuard`]).

mod auth;
mod command;
mod config;
mod embedding;
mod error;
mod guard;
mod types;

pub use auth::{AllowAll, Authenticator, StaticTokenAuthenticator};
pub use command::{AofCommand, AofRecord, PersistedVector};
pub use command::{CollectionSnapshot, DatabaseSnapshot, EngineSnapshot};
pub use config::{Settings, SyncStrategy};
pub use embedding::EmbeddingClient;
pub use error::{Error, Result};
pub use guard::OpGuard;
pub use types::{
    CollectionConfig, CollectionInfo, HnswParams, InsertItem, Metadata, MetricKind, SaveReport,
    SearchHit, VectorId,
};
