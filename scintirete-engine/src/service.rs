//! The internal service surface a gateway talks to.
//!
//! Every operation authenticates the caller's opaque credential before
//! touching the engine, carries the caller's [`OpGuard`], and awaits
//! its durability ack only after all locks are released. The
//! embed-then-insert convenience decomposes into one outbound `embed`
//! call plus a plain vector insert, so the append log never depends on
//! the embedding service.

use crate::engine::Engine;
use crate::manager::PersistenceManager;
use scintirete_core::{
    Authenticator, CollectionConfig, CollectionInfo, EmbeddingClient, Error, HnswParams,
    InsertItem, Metadata, MetricKind, OpGuard, Result, SaveReport, SearchHit, Settings, VectorId,
};
use std::sync::Arc;

pub struct VectorService {
    engine: Arc<Engine>,
    manager: Arc<PersistenceManager>,
    auth: Arc<dyn Authenticator>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    settings: Settings,
}

impl VectorService {
    pub fn new(
        engine: Arc<Engine>,
        manager: Arc<PersistenceManager>,
        auth: Arc<dyn Authenticator>,
        settings: Settings,
    ) -> Self {
        Self {
            engine,
            manager,
            auth,
            embedder: None,
            settings,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingClient>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn create_database(
        &self,
        token: Option<&str>,
        name: &str,
        guard: &OpGuard,
    ) -> Result<()> {
        self.auth.authenticate(token).await?;
        guard.check()?;
        let ack = self
            .engine
            .create_database(name, Some(self.manager.command_log()))
            .await?;
        ack.wait().await;
        Ok(())
    }

    pub async fn drop_database(
        &self,
        token: Option<&str>,
        name: &str,
        guard: &OpGuard,
    ) -> Result<()> {
        self.auth.authenticate(token).await?;
        guard.check()?;
        let ack = self
            .engine
            .drop_database(name, Some(self.manager.command_log()))
            .await?;
        ack.wait().await;
        Ok(())
    }

    pub async fn list_databases(&self, token: Option<&str>) -> Result<Vec<String>> {
        self.auth.authenticate(token).await?;
        Ok(self.engine.list_databases().await)
    }

    /// Creates a collection. Unspecified HNSW parameters fall back to
    /// the configured defaults.
    pub async fn create_collection(
        &self,
        token: Option<&str>,
        db: &str,
        name: &str,
        metric: MetricKind,
        hnsw: Option<HnswParams>,
        guard: &OpGuard,
    ) -> Result<()> {
        self.auth.authenticate(token).await?;
        guard.check()?;
        let config = CollectionConfig {
            metric,
            hnsw: hnsw.unwrap_or_else(|| self.settings.default_hnsw()),
        };
        let ack = self
            .engine
            .database(db)
            .await?
            .create_collection(name, config, Some(self.manager.command_log()))
            .await?;
        ack.wait().await;
        Ok(())
    }

    pub async fn drop_collection(
        &self,
        token: Option<&str>,
        db: &str,
        name: &str,
        guard: &OpGuard,
    ) -> Result<()> {
        self.auth.authenticate(token).await?;
        guard.check()?;
        let ack = self
            .engine
            .database(db)
            .await?
            .drop_collection(name, Some(self.manager.command_log()))
            .await?;
        ack.wait().await;
        Ok(())
    }

    pub async fn get_collection_info(
        &self,
        token: Option<&str>,
        db: &str,
        name: &str,
    ) -> Result<CollectionInfo> {
        self.auth.authenticate(token).await?;
        let collection = self.engine.database(db).await?.collection(name).await?;
        Ok(collection.info().await)
    }

    pub async fn list_collections(
        &self,
        token: Option<&str>,
        db: &str,
    ) -> Result<Vec<CollectionInfo>> {
        self.auth.authenticate(token).await?;
        let database = self.engine.database(db).await?;
        let mut infos = Vec::new();
        for collection in database.list_collections().await {
            infos.push(collection.info().await);
        }
        Ok(infos)
    }

    /// Batch insert; returns assigned ids in input order.
    pub async fn insert_vectors(
        &self,
        token: Option<&str>,
        db: &str,
        collection: &str,
        items: Vec<InsertItem>,
        guard: &OpGuard,
    ) -> Result<Vec<VectorId>> {
        self.auth.authenticate(token).await?;
        let collection = self.engine.database(db).await?.collection(collection).await?;
        let outcome = collection
            .insert(items, guard, Some(self.manager.command_log()))
            .await?;
        outcome.ack.wait().await;
        Ok(outcome.ids)
    }

    /// Returns how many of the ids were actually deleted.
    pub async fn delete_vectors(
        &self,
        token: Option<&str>,
        db: &str,
        collection: &str,
        ids: &[VectorId],
        guard: &OpGuard,
    ) -> Result<u64> {
        self.auth.authenticate(token).await?;
        let collection = self.engine.database(db).await?.collection(collection).await?;
        let (deleted, ack) = collection
            .delete(ids, guard, Some(self.manager.command_log()))
            .await?;
        ack.wait().await;
        Ok(deleted)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn search(
        &self,
        token: Option<&str>,
        db: &str,
        collection: &str,
        query: &[f32],
        top_k: usize,
        ef_search: Option<u32>,
        include_vector: bool,
        guard: &OpGuard,
    ) -> Result<Vec<SearchHit>> {
        self.auth.authenticate(token).await?;
        let collection = self.engine.database(db).await?.collection(collection).await?;
        collection
            .search(query, top_k, ef_search, include_vector, guard)
            .await
    }

    /// Embeds `texts` and inserts the resulting vectors. The log
    /// records only the insert.
    pub async fn embed_and_insert(
        &self,
        token: Option<&str>,
        db: &str,
        collection: &str,
        texts: Vec<(String, Option<Metadata>)>,
        model: &str,
        guard: &OpGuard,
    ) -> Result<Vec<VectorId>> {
        self.auth.authenticate(token).await?;
        guard.check()?;
        let embedder = self.embedder()?;
        let inputs: Vec<String> = texts.iter().map(|(text, _)| text.clone()).collect();
        let vectors = embedder.embed(&inputs, model).await?;
        if vectors.len() != texts.len() {
            return Err(Error::Internal(format!(
                "embedding client returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        let items: Vec<InsertItem> = vectors
            .into_iter()
            .zip(texts)
            .map(|(elements, (_, metadata))| InsertItem {
                id: None,
                elements,
                metadata,
            })
            .collect();
        self.insert_vectors(token, db, collection, items, guard)
            .await
    }

    /// Embeds one query text and searches with the resulting vector.
    #[allow(clippy::too_many_arguments)]
    pub async fn embed_and_search(
        &self,
        token: Option<&str>,
        db: &str,
        collection: &str,
        text: &str,
        model: &str,
        top_k: usize,
        guard: &OpGuard,
    ) -> Result<Vec<SearchHit>> {
        self.auth.authenticate(token).await?;
        guard.check()?;
        let embedder = self.embedder()?;
        let mut vectors = embedder.embed(&[text.to_string()], model).await?;
        let query = vectors
            .pop()
            .filter(|_| vectors.is_empty())
            .ok_or_else(|| Error::Internal("embedding client returned no vector".into()))?;
        self.search(token, db, collection, &query, top_k, None, false, guard)
            .await
    }

    /// Blocking snapshot rewrite.
    pub async fn save(&self, token: Option<&str>) -> Result<SaveReport> {
        self.auth.authenticate(token).await?;
        self.manager.save().await
    }

    /// Background snapshot rewrite; returns the job id.
    pub async fn bg_save(&self, token: Option<&str>) -> Result<u64> {
        self.auth.authenticate(token).await?;
        Ok(self.manager.bgsave().await)
    }

    fn embedder(&self) -> Result<&Arc<dyn EmbeddingClient>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| Error::Internal("no embedding client configured".into()))
    }
}
