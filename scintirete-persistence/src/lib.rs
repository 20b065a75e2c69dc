//! Durability layer: the append-only command log (AOF) and the binary
//! engine snapshot (RDB).
//!
//! Both files carry CRC-32 integrity checks, but they fail differently:
//! an AOF with a damaged tail loses at most that one trailing record
//! (a crash mid-append is expected), while an RDB that fails its
//! checksum is fatal; recovery refuses to start on it.

mod aof;
mod rdb;

pub use aof::{AofReader, AofWriter, encode_record};
pub use rdb::{RDB_MAGIC, RDB_VERSION, read_snapshot, write_snapshot};
