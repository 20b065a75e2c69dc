//! Persistence orchestration: write-ahead logging of live mutations,
//! startup recovery, and the snapshot/rewrite cycle.
//!
//! Recovery order: load the RDB if present (any integrity failure is
//! fatal), replay the AOF through the engine's normal entry points
//! (records at or below the snapshot's sequence are skipped, so a
//! crash between the RDB rename and the AOF rotation replays cleanly),
//! then open the log for appending.
//!
//! A rewrite freezes the engine just long enough to clone its state
//! and mark the log offset it covers, then streams the snapshot to a
//! temp file, atomically renames it over the RDB, and splices the
//! uncovered log suffix into a fresh AOF.

use crate::engine::Engine;
use scintirete_core::{AofCommand, AofRecord, Error, OpGuard, Result, SaveReport, Settings};
use scintirete_persistence::{AofReader, AofWriter, read_snapshot, write_snapshot};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, oneshot};

/// Bound on records waiting for the writer task. Past this, writes
/// fail with `ResourceExhausted` instead of queueing unboundedly.
const AOF_QUEUE_DEPTH: usize = 4096;

/// Pending durability confirmation. Awaiting it never fails the user
/// operation: an append error re-establishes durability at the next
/// snapshot and is only logged here.
#[derive(Debug)]
pub struct Ack(Option<oneshot::Receiver<Result<()>>>);

impl Ack {
    pub fn none() -> Self {
        Self(None)
    }

    pub(crate) fn pending(rx: Option<oneshot::Receiver<Result<()>>>) -> Self {
        Self(rx)
    }

    /// Resolves once the record is fsync-visible (under `always`);
    /// immediately otherwise.
    pub async fn wait(self) {
        if let Some(rx) = self.0 {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("aof append failed, state remains in memory: {e}"),
                Err(_) => tracing::error!("aof writer stopped before confirming append"),
            }
        }
    }
}

/// Sequenced command sink shared by every mutating entry point.
/// Submission is synchronous so callers can submit under their locks.
#[derive(Clone, Debug)]
pub struct CommandLog {
    writer: AofWriter,
    seq: Arc<AtomicU64>,
}

impl CommandLog {
    pub(crate) fn new(writer: AofWriter, seq: Arc<AtomicU64>) -> Self {
        Self { writer, seq }
    }

    pub fn submit(&self, command: AofCommand) -> Result<Ack> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = AofRecord { seq, command };
        Ok(Ack::pending(self.writer.submit(&record)?))
    }
}

#[derive(Debug)]
pub struct PersistenceManager {
    settings: Settings,
    engine: Arc<Engine>,
    aof: AofWriter,
    log: CommandLog,
    /// One rewrite at a time; SAVE, BGSAVE and the background trigger
    /// all serialize here.
    rewrite_gate: Mutex<()>,
    bgsave_jobs: AtomicU64,
}

impl PersistenceManager {
    /// Recovers engine state from the data directory and opens the log
    /// for appending. Returns the recovered engine and the manager.
    pub async fn open(settings: Settings) -> Result<(Arc<Engine>, Arc<Self>)> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let engine = Arc::new(Engine::new());

        let rdb_path = settings.rdb_path();
        if rdb_path.exists() {
            let snapshot = read_snapshot(&rdb_path)?;
            tracing::info!(
                vectors = snapshot.vector_count(),
                last_seq = snapshot.last_seq,
                "rdb snapshot loaded"
            );
            engine.restore(snapshot).await?;
        }

        let aof_path = settings.aof_path();
        if aof_path.exists() {
            Self::replay(&engine, &aof_path).await?;
        }

        let aof = AofWriter::open(&aof_path, settings.aof_sync_strategy, AOF_QUEUE_DEPTH)?;
        let log = CommandLog::new(aof.clone(), engine.op_seq_arc());
        let manager = Arc::new(Self {
            settings,
            engine: Arc::clone(&engine),
            aof,
            log,
            rewrite_gate: Mutex::new(()),
            bgsave_jobs: AtomicU64::new(0),
        });
        Self::spawn_background(&manager);
        Ok((engine, manager))
    }

    async fn replay(engine: &Engine, path: &PathBuf) -> Result<()> {
        let mut reader = AofReader::open(path)?;
        let snapshot_seq = engine.current_seq();
        let mut applied = 0u64;
        let mut skipped = 0u64;
        while let Some(record) = reader.next_record()? {
            if record.seq <= snapshot_seq {
                // Already contained in the snapshot.
                skipped += 1;
                continue;
            }
            engine.apply(record.command).await.map_err(|e| {
                Error::Internal(format!("aof replay failed at seq {}: {e}", record.seq))
            })?;
            engine.bump_seq_to(record.seq);
            applied += 1;
        }
        if reader.truncated() {
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(reader.valid_len())?;
            file.sync_all()?;
            tracing::warn!(
                valid_len = reader.valid_len(),
                "aof tail damaged; truncated to last complete record"
            );
        }
        tracing::info!(applied, skipped, "aof replay complete");
        Ok(())
    }

    /// The command sink live mutations log through.
    pub fn command_log(&self) -> &CommandLog {
        &self.log
    }

    /// Synchronous save: runs a full rewrite and blocks until the
    /// snapshot is durable.
    pub async fn save(&self) -> Result<SaveReport> {
        self.rewrite().await
    }

    /// Background save: returns a job id immediately; completion and
    /// failure are reported through the log.
    pub async fn bgsave(self: &Arc<Self>) -> u64 {
        let job_id = self.bgsave_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.rewrite().await {
                Ok(report) => tracing::info!(
                    job_id,
                    bytes = report.bytes,
                    ms = report.duration.as_millis() as u64,
                    "bgsave complete"
                ),
                Err(e) => tracing::error!(job_id, "bgsave failed: {e}"),
            }
        });
        job_id
    }

    async fn rewrite(&self) -> Result<SaveReport> {
        let _gate = self.rewrite_gate.lock().await;
        let started = Instant::now();

        // Freeze writers, drain the queue, and mark how much of the
        // log the snapshot covers.
        let frozen = self.engine.freeze().await;
        let covered = self.aof.flush().await?;
        let snapshot = frozen.snapshot(self.engine.current_seq());
        drop(frozen);

        let rdb_path = self.settings.rdb_path();
        let tmp_path = {
            let mut name = rdb_path.as_os_str().to_owned();
            name.push(".tmp");
            PathBuf::from(name)
        };

        let write_path = tmp_path.clone();
        let written = tokio::task::spawn_blocking(move || write_snapshot(&write_path, &snapshot))
            .await
            .map_err(|e| Error::Internal(format!("snapshot task panicked: {e}")))?;
        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                // Leave the existing RDB and AOF untouched; the next
                // trigger retries.
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        self.rotate_backups(&rdb_path)?;
        std::fs::rename(&tmp_path, &rdb_path)?;
        let kept = self.aof.rotate(covered).await?;

        let report = SaveReport {
            bytes,
            duration: started.elapsed(),
        };
        tracing::info!(
            bytes,
            aof_kept = kept,
            ms = report.duration.as_millis() as u64,
            "rewrite complete"
        );
        Ok(report)
    }

    /// Moves the current RDB aside as a timestamped backup and prunes
    /// old backups past the retention count.
    fn rotate_backups(&self, rdb_path: &PathBuf) -> Result<()> {
        let retention = self.settings.backup_retention_count;
        if retention == 0 || !rdb_path.exists() {
            return Ok(());
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let backup_name = format!(
            "{}.{}-{}.bak",
            self.settings.rdb_filename,
            ts,
            self.engine.current_seq()
        );
        std::fs::rename(rdb_path, self.settings.data_dir.join(&backup_name))?;

        let prefix = format!("{}.", self.settings.rdb_filename);
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.settings.data_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
            })
            .collect();
        backups.sort();
        while backups.len() > retention {
            let victim = backups.remove(0);
            if let Err(e) = std::fs::remove_file(&victim) {
                tracing::warn!("failed to prune backup {}: {e}", victim.display());
            }
        }
        Ok(())
    }

    /// Periodic rewrite trigger: fires on the configured interval and
    /// early when the AOF passes the size threshold. Holds only a weak
    /// reference so dropping the last handle stops the task.
    fn spawn_background(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);
        let interval_secs = manager.settings.rdb_interval_seconds.max(1);
        let period = Duration::from_secs(interval_secs.min(5));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_rewrite = Instant::now();
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let due = last_rewrite.elapsed().as_secs() >= interval_secs;
                let oversized =
                    manager.aof.len() >= manager.settings.aof_rewrite_threshold_bytes;
                if manager.aof.len() > 0 && (due || oversized) {
                    match manager.rewrite().await {
                        Ok(_) => last_rewrite = Instant::now(),
                        Err(e) => tracing::error!("background rewrite failed: {e}"),
                    }
                } else if due {
                    last_rewrite = Instant::now();
                }
                manager.maintenance_pass().await;
            }
        });
    }

    /// Rebuilds any collection whose tombstones crossed the 20%
    /// threshold, pruning them from graph and store.
    async fn maintenance_pass(&self) {
        for collection in self.engine.collections().await {
            if collection.rebuild_recommended().await {
                let name = collection.name().to_string();
                match collection.rebuild(&OpGuard::unbounded()).await {
                    Ok(()) => tracing::info!(collection = %name, "scheduled rebuild complete"),
                    Err(e) => tracing::error!(collection = %name, "scheduled rebuild failed: {e}"),
                }
            }
        }
    }
}
