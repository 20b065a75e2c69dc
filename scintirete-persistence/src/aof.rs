//! Append-only command log.
//!
//! Record framing: 4-byte little-endian body length, bincode-encoded
//! [`AofRecord`] body, 4-byte CRC-32 of the body. Appends flow through
//! a bounded queue to one dedicated writer task, which amortizes fsync
//! and keeps request tails flat. A full queue surfaces
//! `ResourceExhausted` instead of growing without bound.

use scintirete_core::{AofRecord, Error, Result, SyncStrategy};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

/// A length field beyond this is treated as a damaged tail, not a real
/// record.
const MAX_RECORD_BYTES: u32 = 256 * 1024 * 1024;

/// Frames one record for appending.
pub fn encode_record(record: &AofRecord) -> Result<Vec<u8>> {
    let body =
        bincode::serialize(record).map_err(|e| Error::Internal(format!("aof encode: {e}")))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&l| l <= MAX_RECORD_BYTES)
        .ok_or_else(|| Error::Internal("aof record exceeds size limit".into()))?;
    let mut frame = Vec::with_capacity(LEN_BYTES + body.len() + CRC_BYTES);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Reads until `buf` is full or EOF; returns bytes actually read.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Sequential log reader used during recovery.
///
/// A trailing partial record (length or body cut short, or a CRC
/// mismatch at end of file) marks the log as truncated: iteration
/// stops, [`AofReader::truncated`] reports it, and
/// [`AofReader::valid_len`] is the offset of the last complete record.
pub struct AofReader {
    reader: BufReader<File>,
    valid_len: u64,
    truncated: bool,
    done: bool,
}

impl AofReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            valid_len: 0,
            truncated: false,
            done: false,
        })
    }

    /// Next complete record, or `None` at end of log.
    pub fn next_record(&mut self) -> Result<Option<AofRecord>> {
        if self.done {
            return Ok(None);
        }

        let mut len_buf = [0u8; LEN_BYTES];
        let n = read_up_to(&mut self.reader, &mut len_buf)?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        if n < LEN_BYTES {
            return Ok(self.mark_truncated("partial length prefix"));
        }

        let len = u32::from_le_bytes(len_buf);
        if len > MAX_RECORD_BYTES {
            return Ok(self.mark_truncated("implausible record length"));
        }

        let mut body = vec![0u8; len as usize];
        if read_up_to(&mut self.reader, &mut body)? < body.len() {
            return Ok(self.mark_truncated("partial record body"));
        }

        let mut crc_buf = [0u8; CRC_BYTES];
        if read_up_to(&mut self.reader, &mut crc_buf)? < CRC_BYTES {
            return Ok(self.mark_truncated("partial record checksum"));
        }
        if crc32fast::hash(&body) != u32::from_le_bytes(crc_buf) {
            return Ok(self.mark_truncated("checksum mismatch"));
        }

        let record: AofRecord = bincode::deserialize(&body)
            .map_err(|e| Error::CorruptedData(format!("aof record decode: {e}")))?;
        self.valid_len += (LEN_BYTES + body.len() + CRC_BYTES) as u64;
        Ok(Some(record))
    }

    fn mark_truncated(&mut self, reason: &str) -> Option<AofRecord> {
        tracing::warn!(
            valid_len = self.valid_len,
            reason,
            "discarding damaged aof tail"
        );
        self.truncated = true;
        self.done = true;
        None
    }

    /// Offset one past the last complete record.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

enum Command {
    Append {
        frame: Vec<u8>,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    /// Durability barrier: fsync everything queued before it, answer
    /// with the current file length.
    Flush {
        ack: oneshot::Sender<Result<u64>>,
    },
    /// Splice the suffix starting at `keep_from` into a fresh log and
    /// swap it in. Used by rewrite: the prefix is covered by the new
    /// snapshot, the suffix is not.
    Rotate {
        keep_from: u64,
        ack: oneshot::Sender<Result<u64>>,
    },
}

/// Handle to the single-threaded appender. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AofWriter {
    tx: mpsc::Sender<Command>,
    strategy: SyncStrategy,
    len: Arc<AtomicU64>,
}

impl AofWriter {
    /// Opens (or creates) the log in append mode and spawns the writer
    /// task. Must run inside a tokio runtime.
    pub fn open(path: &Path, strategy: SyncStrategy, queue_depth: usize) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = Arc::new(AtomicU64::new(file.metadata()?.len()));
        let (tx, rx) = mpsc::channel(queue_depth.max(1));

        let task = WriterTask {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len: Arc::clone(&len),
            strategy,
            dirty: false,
        };
        tokio::spawn(task.run(rx));

        Ok(Self { tx, strategy, len })
    }

    /// Enqueues one record without awaiting. Synchronous on purpose:
    /// callers submit while holding their collection lock, so queue
    /// order equals in-memory apply order. A full queue is
    /// backpressure: `ResourceExhausted`, the caller may retry.
    ///
    /// Under `always` the returned receiver resolves once the record
    /// is fsync-visible; under the other policies there is nothing to
    /// wait for and `None` is returned.
    pub fn submit(&self, record: &AofRecord) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        let frame = encode_record(record)?;
        if self.strategy == SyncStrategy::Always {
            let (tx, rx) = oneshot::channel();
            self.send(Command::Append {
                frame,
                ack: Some(tx),
            })?;
            Ok(Some(rx))
        } else {
            self.send(Command::Append { frame, ack: None })?;
            Ok(None)
        }
    }

    /// [`AofWriter::submit`] plus the wait for durability.
    pub async fn append(&self, record: &AofRecord) -> Result<()> {
        match self.submit(record)? {
            Some(rx) => rx
                .await
                .map_err(|_| Error::Internal("aof writer stopped".into()))?,
            None => Ok(()),
        }
    }

    /// Flushes and fsyncs everything queued so far; returns the file
    /// length at the barrier.
    pub async fn flush(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { ack: tx })?;
        rx.await
            .map_err(|_| Error::Internal("aof writer stopped".into()))?
    }

    /// Replaces the log with its own suffix from `keep_from`; returns
    /// the new length.
    pub async fn rotate(&self, keep_from: u64) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Rotate { keep_from, ack: tx })?;
        rx.await
            .map_err(|_| Error::Internal("aof writer stopped".into()))?
    }

    /// Current log size. Tracked by the writer task; used for the
    /// rewrite size trigger.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::ResourceExhausted("aof queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => Error::Internal("aof writer stopped".into()),
        })
    }
}

struct WriterTask {
    path: PathBuf,
    writer: BufWriter<File>,
    len: Arc<AtomicU64>,
    strategy: SyncStrategy,
    dirty: bool,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Append { frame, ack }) => {
                        let res = self.write_frame(&frame);
                        match ack {
                            Some(ack) => {
                                let _ = ack.send(res);
                            }
                            None => {
                                if let Err(e) = res {
                                    tracing::error!("aof append failed: {e}");
                                }
                            }
                        }
                    }
                    Some(Command::Flush { ack }) => {
                        let res = self.sync().map(|()| self.len.load(Ordering::Acquire));
                        let _ = ack.send(res);
                    }
                    Some(Command::Rotate { keep_from, ack }) => {
                        let _ = ack.send(self.rotate(keep_from));
                    }
                    None => {
                        if let Err(e) = self.sync() {
                            tracing::error!("aof final sync failed: {e}");
                        }
                        break;
                    }
                },
                _ = tick.tick(), if self.strategy == SyncStrategy::EverySec => {
                    if let Err(e) = self.sync() {
                        tracing::error!("aof periodic fsync failed: {e}");
                    }
                }
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame)?;
        self.len.fetch_add(frame.len() as u64, Ordering::Release);
        match self.strategy {
            SyncStrategy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            SyncStrategy::EverySec | SyncStrategy::No => self.dirty = true,
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.dirty {
            self.writer.get_ref().sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn rotate(&mut self, keep_from: u64) -> Result<u64> {
        self.sync()?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        {
            let mut src = File::open(&self.path)?;
            let src_len = src.metadata()?.len();
            src.seek(SeekFrom::Start(keep_from.min(src_len)))?;
            let mut dst = File::create(&tmp)?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let new_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.dirty = false;
        self.len.store(new_len, Ordering::Release);
        tracing::info!(kept_bytes = new_len, "aof rotated");
        Ok(new_len)
    }
}
