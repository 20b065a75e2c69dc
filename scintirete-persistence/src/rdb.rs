//! Binary engine snapshot (RDB).
//!
//! Layout: 4 magic bytes + 1 version byte, then the body (operation
//! counter, database count, and per database its name and collections,
//! each collection a bincode header followed by one framed record per
//! live vector), and a trailing CRC-32 over the body. Records are
//! framed individually so a snapshot of any size streams through a
//! small buffer.
//!
//! Loading validates magic, version and CRC. Any failure here is
//! `CorruptedData`: the caller must refuse to start rather than come up
//! with partial state.

use scintirete_core::{
    CollectionConfig, CollectionSnapshot, DatabaseSnapshot, EngineSnapshot, Error, PersistedVector,
    Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const RDB_MAGIC: &[u8; 4] = b"SCRT";
pub const RDB_VERSION: u8 = 1;

/// A frame length beyond this means the file is damaged.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct CollectionHeader {
    name: String,
    dimension: Option<u32>,
    config: CollectionConfig,
    next_id: u64,
    vector_count: u64,
}

/// Hashes every byte that passes through on its way to `inner`.
struct CrcWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finish(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct CrcReader<R: Read> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finish(self) -> (R, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn write_frame<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    let bytes =
        bincode::serialize(value).map_err(|e| Error::Internal(format!("rdb encode: {e}")))?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|&l| l <= MAX_FRAME_BYTES)
        .ok_or_else(|| Error::Internal("rdb frame exceeds size limit".into()))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&bytes)?;
    Ok(())
}

fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .map_err(|e| Error::CorruptedData(format!("rdb frame length: {e}")))?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::CorruptedData("rdb frame length implausible".into()));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)
        .map_err(|e| Error::CorruptedData(format!("rdb frame body: {e}")))?;
    bincode::deserialize(&body).map_err(|e| Error::CorruptedData(format!("rdb frame decode: {e}")))
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| Error::CorruptedData(format!("rdb: {e}")))?;
    Ok(u32::from_le_bytes(buf))
}

/// Writes a snapshot to `path` and fsyncs it. Returns the file size.
///
/// The caller is responsible for writing to a temp path and renaming:
/// this function alone does not make the swap atomic.
pub fn write_snapshot(path: &Path, snapshot: &EngineSnapshot) -> Result<u64> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    out.write_all(RDB_MAGIC)?;
    out.write_all(&[RDB_VERSION])?;

    let mut body = CrcWriter::new(out);
    body.write_all(&snapshot.last_seq.to_le_bytes())?;
    write_u32(&mut body, snapshot.databases.len() as u32)?;
    for db in &snapshot.databases {
        write_frame(&mut body, &db.name)?;
        write_u32(&mut body, db.collections.len() as u32)?;
        for coll in &db.collections {
            write_frame(
                &mut body,
                &CollectionHeader {
                    name: coll.name.clone(),
                    dimension: coll.dimension,
                    config: coll.config,
                    next_id: coll.next_id,
                    vector_count: coll.vectors.len() as u64,
                },
            )?;
            for vector in &coll.vectors {
                write_frame(&mut body, vector)?;
            }
        }
    }

    let (mut out, crc) = body.finish();
    out.write_all(&crc.to_le_bytes())?;
    out.flush()?;
    let file = out
        .into_inner()
        .map_err(|e| Error::Internal(format!("rdb flush: {e}")))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Loads and validates a snapshot.
pub fn read_snapshot(path: &Path) -> Result<EngineSnapshot> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| Error::CorruptedData(format!("rdb magic: {e}")))?;
    if &magic != RDB_MAGIC {
        return Err(Error::CorruptedData("rdb magic bytes do not match".into()));
    }
    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .map_err(|e| Error::CorruptedData(format!("rdb version: {e}")))?;
    if version[0] != RDB_VERSION {
        return Err(Error::CorruptedData(format!(
            "unsupported rdb version {}",
            version[0]
        )));
    }

    let mut body = CrcReader::new(reader);
    let mut seq_buf = [0u8; 8];
    body.read_exact(&mut seq_buf)
        .map_err(|e| Error::CorruptedData(format!("rdb: {e}")))?;
    let last_seq = u64::from_le_bytes(seq_buf);

    let db_count = read_u32(&mut body)?;
    let mut databases = Vec::with_capacity(db_count as usize);
    for _ in 0..db_count {
        let name: String = read_frame(&mut body)?;
        let coll_count = read_u32(&mut body)?;
        let mut collections = Vec::with_capacity(coll_count as usize);
        for _ in 0..coll_count {
            let header: CollectionHeader = read_frame(&mut body)?;
            let mut vectors = Vec::with_capacity(header.vector_count.min(1 << 20) as usize);
            for _ in 0..header.vector_count {
                let vector: PersistedVector = read_frame(&mut body)?;
                vectors.push(vector);
            }
            collections.push(CollectionSnapshot {
                name: header.name,
                dimension: header.dimension,
                config: header.config,
                next_id: header.next_id,
                vectors,
            });
        }
        databases.push(DatabaseSnapshot { name, collections });
    }

    let (mut reader, computed) = body.finish();
    let mut crc_buf = [0u8; 4];
    reader
        .read_exact(&mut crc_buf)
        .map_err(|e| Error::CorruptedData(format!("rdb checksum: {e}")))?;
    if computed != u32::from_le_bytes(crc_buf) {
        return Err(Error::CorruptedData("rdb checksum mismatch".into()));
    }
    if reader.read(&mut [0u8; 1])? != 0 {
        return Err(Error::CorruptedData("rdb has trailing garbage".into()));
    }

    Ok(EngineSnapshot {
        databases,
        last_seq,
    })
}
