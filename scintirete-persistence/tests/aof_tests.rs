//! Append-log round trips and damaged-tail recovery.

use scintirete_core::{
    AofCommand, AofRecord, CollectionConfig, HnswParams, MetricKind, PersistedVector, SyncStrategy,
};
use scintirete_persistence::{AofReader, AofWriter, encode_record};
use std::io::Write;
use std::path::Path;

fn sample_records() -> Vec<AofRecord> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("title".into(), serde_json::json!("first"));
    metadata.insert("rank".into(), serde_json::json!(3));

    vec![
        AofRecord {
            seq: 1,
            command: AofCommand::CreateDatabase { db: "d".into() },
        },
        AofRecord {
            seq: 2,
            command: AofCommand::CreateCollection {
                db: "d".into(),
                name: "c".into(),
                config: CollectionConfig {
                    metric: MetricKind::L2,
                    hnsw: HnswParams::default(),
                },
            },
        },
        AofRecord {
            seq: 3,
            command: AofCommand::InsertVectors {
                db: "d".into(),
                collection: "c".into(),
                vectors: vec![
                    PersistedVector {
                        id: 1,
                        elements: vec![1.0, 0.0, 0.0],
                        metadata: Some(metadata),
                    },
                    PersistedVector {
                        id: 2,
                        elements: vec![0.0, 1.0, 0.0],
                        metadata: None,
                    },
                ],
            },
        },
        AofRecord {
            seq: 4,
            command: AofCommand::DeleteVectors {
                db: "d".into(),
                collection: "c".into(),
                ids: vec![2],
            },
        },
    ]
}

fn read_all(path: &Path) -> (Vec<AofRecord>, bool, u64) {
    let mut reader = AofReader::open(path).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        records.push(record);
    }
    (records, reader.truncated(), reader.valid_len())
}

#[tokio::test]
async fn test_append_then_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let writer = AofWriter::open(&path, SyncStrategy::Always, 64).unwrap();

    let records = sample_records();
    for record in &records {
        writer.append(record).await.unwrap();
    }
    writer.flush().await.unwrap();

    let (read, truncated, _) = read_all(&path);
    assert!(!truncated);
    assert_eq!(read, records);
}

#[tokio::test]
async fn test_everysec_flush_barrier() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let writer = AofWriter::open(&path, SyncStrategy::EverySec, 64).unwrap();

    let records = sample_records();
    for record in &records {
        writer.append(record).await.unwrap();
    }
    // The barrier resolves only after everything queued is on disk.
    let len = writer.flush().await.unwrap();
    assert!(len > 0);
    assert_eq!(writer.len(), len);

    let (read, truncated, valid_len) = read_all(&path);
    assert!(!truncated);
    assert_eq!(read.len(), records.len());
    assert_eq!(valid_len, len);
}

#[tokio::test]
async fn test_truncated_tail_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let writer = AofWriter::open(&path, SyncStrategy::Always, 64).unwrap();

    let records = sample_records();
    for record in &records {
        writer.append(record).await.unwrap();
    }
    let intact_len = writer.flush().await.unwrap();

    // Simulate a crash mid-append: a frame with its body cut short.
    let partial = encode_record(&records[0]).unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&partial[..partial.len() - 7]).unwrap();
    drop(file);

    let (read, truncated, valid_len) = read_all(&path);
    assert!(truncated);
    assert_eq!(read, records);
    assert_eq!(valid_len, intact_len);
}

#[tokio::test]
async fn test_corrupt_tail_checksum_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let writer = AofWriter::open(&path, SyncStrategy::Always, 64).unwrap();

    let records = sample_records();
    for record in &records[..2] {
        writer.append(record).await.unwrap();
    }
    writer.flush().await.unwrap();

    // Append a frame whose body is flipped after the CRC was computed.
    let mut frame = encode_record(&records[2]).unwrap();
    frame[6] ^= 0xFF;
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&frame).unwrap();
    drop(file);

    let (read, truncated, _) = read_all(&path);
    assert!(truncated);
    assert_eq!(read, records[..2]);
}

#[tokio::test]
async fn test_empty_log_reads_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    std::fs::File::create(&path).unwrap();

    let (read, truncated, valid_len) = read_all(&path);
    assert!(read.is_empty());
    assert!(!truncated);
    assert_eq!(valid_len, 0);
}

#[tokio::test]
async fn test_rotate_keeps_only_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let writer = AofWriter::open(&path, SyncStrategy::Always, 64).unwrap();

    let records = sample_records();
    writer.append(&records[0]).await.unwrap();
    writer.append(&records[1]).await.unwrap();
    let cut = writer.flush().await.unwrap();

    writer.append(&records[2]).await.unwrap();
    writer.append(&records[3]).await.unwrap();
    let expected: usize = records[2..]
        .iter()
        .map(|r| encode_record(r).unwrap().len())
        .sum();
    let new_len = writer.rotate(cut).await.unwrap();
    assert_eq!(new_len, expected as u64);

    let (read, truncated, _) = read_all(&path);
    assert!(!truncated);
    assert_eq!(read, records[2..]);

    // The writer stays usable on the fresh file.
    writer.append(&records[0]).await.unwrap();
    writer.flush().await.unwrap();
    let (read, _, _) = read_all(&path);
    assert_eq!(read.len(), 3);
}

#[tokio::test]
async fn test_rotate_from_zero_is_full_truncate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let writer = AofWriter::open(&path, SyncStrategy::Always, 64).unwrap();

    for record in &sample_records() {
        writer.append(record).await.unwrap();
    }
    let len = writer.flush().await.unwrap();
    let new_len = writer.rotate(len).await.unwrap();
    assert_eq!(new_len, 0);

    let (read, _, _) = read_all(&path);
    assert!(read.is_empty());
}
