//! End-to-end smoke run: create, insert, search, save, recover.
//!
//! ```bash
//! cargo run --example smoke -p scintirete-engine
//! ```

use scintirete_core::{AllowAll, InsertItem, MetricKind, OpGuard, Settings, SyncStrategy};
use scintirete_engine::{PersistenceManager, VectorService};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let settings = Settings {
        data_dir: dir.path().to_path_buf(),
        aof_sync_strategy: SyncStrategy::Always,
        ..Default::default()
    };
    let guard = OpGuard::unbounded();

    {
        let (engine, manager) = PersistenceManager::open(settings.clone()).await?;
        let svc = VectorService::new(engine, manager, Arc::new(AllowAll), settings.clone());

        svc.create_database(None, "demo", &guard).await?;
        svc.create_collection(None, "demo", "points", MetricKind::L2, None, &guard)
            .await?;

        let ids = svc
            .insert_vectors(
                None,
                "demo",
                "points",
                (0..256)
                    .map(|i| InsertItem {
                        id: None,
                        elements: vec![(i as f32 * 0.13).sin(), (i as f32 * 0.31).cos(), i as f32 / 256.0],
                        metadata: None,
                    })
                    .collect(),
                &guard,
            )
            .await?;
        tracing::info!(count = ids.len(), "inserted");

        let hits = svc
            .search(None, "demo", "points", &[0.0, 1.0, 0.0], 5, None, false, &guard)
            .await?;
        for hit in &hits {
            tracing::info!(id = hit.id, distance = hit.distance, "hit");
        }

        let report = svc.save(None).await?;
        tracing::info!(bytes = report.bytes, "snapshot saved");
    }

    // Recover from the files alone.
    let (engine, manager) = PersistenceManager::open(settings.clone()).await?;
    let svc = VectorService::new(engine, manager, Arc::new(AllowAll), settings);
    let info = svc.get_collection_info(None, "demo", "points").await?;
    tracing::info!(live = info.live_count, dim = ?info.dimension, "recovered");
    anyhow::ensure!(info.live_count == 256);
    Ok(())
}
