//! Binary write-ahead log.
//!
//! Every job mutation appends one fixed-layout, big-endian record. The
//! log is sharded across N append-only files; all records for a job land
//! in file `id % N`, so replay order only matters within a file. The
//! first record for a job is *full* (it carries the tube name and body);
//! every later record is a *delta* that overwrites the scalar fields
//! only. A record with the invalid state is a tombstone.
//!
//! On startup the whole directory is replayed, the surviving jobs are
//! folded out of the record stream, and the shard files are rewritten
//! from scratch with one full record per survivor. A truncated or
//! unreadable file tail is treated as end-of-file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// Default number of shard files.
pub const DEFAULT_SHARDS: usize = 8;

/// Bytes in a record before the variable-length tube name.
const RECORD_HEAD: usize = 62;

/// Job state as stored on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalState {
    Ready,
    Delayed,
    Reserved,
    Buried,
    /// Tombstone: the job no longer exists.
    Invalid,
}

impl WalState {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Ready),
            1 => Some(Self::Delayed),
            2 => Some(Self::Reserved),
            3 => Some(Self::Buried),
            4 => Some(Self::Invalid),
            _ => None,
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            Self::Ready => 0,
            Self::Delayed => 1,
            Self::Reserved => 2,
            Self::Buried => 3,
            Self::Invalid => 4,
        }
    }
}

/// One log record: the durable image of a job after some mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    pub id: u64,
    pub delay: u32,
    pub ttr: u32,
    pub pri: u32,
    pub created_ms: u64,
    pub deadline_ms: u64,
    pub state: WalState,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
    /// Set on full records only.
    pub tube: Option<String>,
    /// Set on full records only. Only lengths are consulted, so non-UTF-8
    /// bodies round-trip.
    pub body: Option<Vec<u8>>,
}

impl WalRecord {
    /// A full record carries the tube name and body.
    pub fn is_full(&self) -> bool {
        self.tube.is_some()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let tube = self.tube.as_deref().unwrap_or("");
        let body = self.body.as_deref().unwrap_or(b"");

        buf.reserve(RECORD_HEAD + tube.len() + 4 + body.len());
        buf.put_u64(self.id);
        buf.put_u32(self.delay);
        buf.put_u32(self.ttr);
        buf.put_u32(self.pri);
        buf.put_u64(self.created_ms);
        buf.put_u64(self.deadline_ms);
        buf.put_u16(self.state.as_u16());
        buf.put_u32(self.reserves);
        buf.put_u32(self.timeouts);
        buf.put_u32(self.releases);
        buf.put_u32(self.buries);
        buf.put_u32(self.kicks);
        buf.put_u32(tube.len() as u32);
        buf.put_slice(tube.as_bytes());
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
    }

    /// Decodes one record from the front of `src`, advancing it. Returns
    /// None without consuming anything when `src` holds only a partial or
    /// corrupt record (an unreadable tail is end-of-file).
    pub fn decode(src: &mut Bytes) -> Option<Self> {
        let mut buf = src.clone();

        if buf.remaining() < RECORD_HEAD {
            return None;
        }

        let id = buf.get_u64();
        let delay = buf.get_u32();
        let ttr = buf.get_u32();
        let pri = buf.get_u32();
        let created_ms = buf.get_u64();
        let deadline_ms = buf.get_u64();
        let state = WalState::from_u16(buf.get_u16())?;
        let reserves = buf.get_u32();
        let timeouts = buf.get_u32();
        let releases = buf.get_u32();
        let buries = buf.get_u32();
        let kicks = buf.get_u32();

        let tube_len = buf.get_u32() as usize;
        if buf.remaining() < tube_len {
            return None;
        }
        let tube_bytes = buf.copy_to_bytes(tube_len);

        if buf.remaining() < 4 {
            return None;
        }
        let body_len = buf.get_u32() as usize;
        if buf.remaining() < body_len {
            return None;
        }
        let body_bytes = buf.copy_to_bytes(body_len);

        let (tube, body) = if tube_len > 0 {
            let tube = String::from_utf8(tube_bytes.to_vec()).ok()?;
            (Some(tube), Some(body_bytes.to_vec()))
        } else {
            (None, None)
        };

        let consumed = src.remaining() - buf.remaining();
        src.advance(consumed);

        Some(Self {
            id,
            delay,
            ttr,
            pri,
            created_ms,
            deadline_ms,
            state,
            reserves,
            timeouts,
            releases,
            buries,
            kicks,
            tube,
            body,
        })
    }

    /// Folds a later record for the same id into this one. Every scalar
    /// field is overwritten; tube and body only change on a full record.
    fn merge(&mut self, newer: &WalRecord) {
        let (tube, body) = (self.tube.take(), self.body.take());
        *self = newer.clone();
        if !newer.is_full() {
            self.tube = tube;
            self.body = body;
        }
    }
}

/// The write side of the log: one append-only file per shard.
pub struct Wal {
    files: Vec<File>,
    dir: PathBuf,
    scratch: BytesMut,
}

impl Wal {
    /// Opens the log in `dir`: replays whatever records previous runs
    /// left, rewrites fresh shard files containing one full record per
    /// surviving job, and returns the writer plus those survivors.
    pub fn open(
        dir: &Path,
        shards: usize,
    ) -> io::Result<(Self, Vec<WalRecord>)> {
        fs::create_dir_all(dir)?;

        let recovered = replay_dir(dir)?;

        // Old shard files are dropped wholesale: the rewrite below makes
        // the fresh files self-sufficient, and a stale file from a run
        // with a larger shard count would otherwise be replayed twice.
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if is_shard_file(&path) {
                fs::remove_file(&path)?;
            }
        }

        let mut files = Vec::with_capacity(shards);
        for i in 0..shards {
            files.push(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(shard_path(dir, i))?,
            );
        }

        let mut wal = Self {
            files,
            dir: dir.to_path_buf(),
            scratch: BytesMut::new(),
        };

        for rec in &recovered {
            wal.append(rec)?;
        }

        debug!(
            dir = %wal.dir.display(),
            shards,
            recovered = recovered.len(),
            "write-ahead log open"
        );

        Ok((wal, recovered))
    }

    /// Appends one record to the shard owning its job id.
    pub fn append(&mut self, rec: &WalRecord) -> io::Result<()> {
        let shard = (rec.id % self.files.len() as u64) as usize;

        self.scratch.clear();
        rec.encode(&mut self.scratch);
        self.files[shard].write_all(&self.scratch)
    }
}

fn shard_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("wal-{index}.bin"))
}

fn is_shard_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("wal-") && n.ends_with(".bin"))
        .unwrap_or(false)
}

/// Replays every shard file in `dir` into the set of surviving jobs,
/// each represented as a full record. No reservation survives a restart:
/// recovered reserved jobs come back ready.
fn replay_dir(dir: &Path) -> io::Result<Vec<WalRecord>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_shard_file(p))
        .collect();
    paths.sort();

    let mut jobs: BTreeMap<u64, WalRecord> = BTreeMap::new();

    for path in paths {
        let mut data = Bytes::from(fs::read(&path)?);

        while let Some(rec) = WalRecord::decode(&mut data) {
            if rec.state == WalState::Invalid {
                jobs.remove(&rec.id);
            } else if rec.is_full() {
                jobs.insert(rec.id, rec);
            } else if let Some(existing) = jobs.get_mut(&rec.id) {
                existing.merge(&rec);
            } else {
                // A delta with no preceding full record: the put that
                // introduced this id is gone, so the job is unrecoverable.
                warn!(id = rec.id, file = %path.display(),
                      "dropping delta for unknown job");
            }
        }

        if data.has_remaining() {
            warn!(file = %path.display(), trailing = data.remaining(),
                  "ignoring unreadable log tail");
        }
    }

    let mut recovered: Vec<WalRecord> = jobs.into_values().collect();
    for rec in &mut recovered {
        if rec.state == WalState::Reserved {
            rec.state = WalState::Ready;
            rec.deadline_ms = 0;
        }
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(id: u64, state: WalState) -> WalRecord {
        WalRecord {
            id,
            delay: 0,
            ttr: 60,
            pri: 1024,
            created_ms: 1_000,
            deadline_ms: 0,
            state,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
            tube: Some("default".into()),
            body: Some(format!("job-{id}").into_bytes()),
        }
    }

    fn delta(id: u64, state: WalState) -> WalRecord {
        WalRecord {
            tube: None,
            body: None,
            ..full(id, state)
        }
    }

    #[test]
    fn record_roundtrip() {
        let rec = WalRecord {
            id: 42,
            delay: 3,
            ttr: 120,
            pri: 7,
            created_ms: 1_234_567,
            deadline_ms: 1_240_567,
            state: WalState::Delayed,
            reserves: 1,
            timeouts: 2,
            releases: 3,
            buries: 4,
            kicks: 5,
            tube: Some("emails".into()),
            body: Some(vec![0x00, 0xff, 0x7f]), // non-UTF-8 body
        };

        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(WalRecord::decode(&mut bytes), Some(rec));
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn decode_leaves_partial_records_alone() {
        let mut buf = BytesMut::new();
        full(1, WalState::Ready).encode(&mut buf);
        let complete = buf.freeze();

        for cut in [0, 1, RECORD_HEAD - 1, RECORD_HEAD, complete.len() - 1] {
            let mut truncated = complete.slice(0..cut);
            assert_eq!(WalRecord::decode(&mut truncated), None);
            assert_eq!(truncated.len(), cut, "partial decode must not consume");
        }
    }

    #[test]
    fn decode_consumes_back_to_back_records() {
        let mut buf = BytesMut::new();
        full(1, WalState::Ready).encode(&mut buf);
        delta(1, WalState::Buried).encode(&mut buf);
        let mut bytes = buf.freeze();

        let first = WalRecord::decode(&mut bytes).unwrap();
        assert!(first.is_full());
        let second = WalRecord::decode(&mut bytes).unwrap();
        assert!(!second.is_full());
        assert_eq!(second.state, WalState::Buried);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn replay_merges_deltas_and_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, recovered) = Wal::open(dir.path(), 4).unwrap();
        assert!(recovered.is_empty());

        wal.append(&full(1, WalState::Ready)).unwrap();
        wal.append(&full(2, WalState::Ready)).unwrap();
        wal.append(&full(3, WalState::Delayed)).unwrap();

        // Job 1 gets reserved then buried with a new priority; job 2 is
        // deleted; job 3 stays delayed.
        let mut rec = delta(1, WalState::Reserved);
        rec.reserves = 1;
        wal.append(&rec).unwrap();
        let mut rec = delta(1, WalState::Buried);
        rec.reserves = 1;
        rec.buries = 1;
        rec.pri = 5;
        wal.append(&rec).unwrap();
        wal.append(&delta(2, WalState::Invalid)).unwrap();
        drop(wal);

        let (_, recovered) = Wal::open(dir.path(), 4).unwrap();
        assert_eq!(recovered.len(), 2);

        let job1 = &recovered[0];
        assert_eq!(job1.id, 1);
        assert_eq!(job1.state, WalState::Buried);
        assert_eq!(job1.pri, 5);
        assert_eq!(job1.buries, 1);
        // Tube and body survive from the original full record.
        assert_eq!(job1.tube.as_deref(), Some("default"));
        assert_eq!(job1.body.as_deref(), Some(&b"job-1"[..]));

        assert_eq!(recovered[1].id, 3);
        assert_eq!(recovered[1].state, WalState::Delayed);
    }

    #[test]
    fn replay_reduces_reserved_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, _) = Wal::open(dir.path(), 2).unwrap();

        wal.append(&full(1, WalState::Ready)).unwrap();
        let mut rec = delta(1, WalState::Reserved);
        rec.deadline_ms = 99_000;
        rec.reserves = 1;
        wal.append(&rec).unwrap();
        drop(wal);

        let (_, recovered) = Wal::open(dir.path(), 2).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, WalState::Ready);
        assert_eq!(recovered[0].deadline_ms, 0);
        assert_eq!(recovered[0].reserves, 1);
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, _) = Wal::open(dir.path(), 8).unwrap();
        for id in 1..=20 {
            wal.append(&full(id, WalState::Ready)).unwrap();
        }
        wal.append(&delta(7, WalState::Invalid)).unwrap();
        drop(wal);

        let (_, first) = Wal::open(dir.path(), 8).unwrap();
        let (_, second) = Wal::open(dir.path(), 8).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 19);
        assert!(first.iter().all(|r| r.id != 7));
        assert!(first.iter().all(|r| r.is_full()));
    }

    #[test]
    fn records_shard_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, _) = Wal::open(dir.path(), 4).unwrap();
        for id in 1..=8 {
            wal.append(&full(id, WalState::Ready)).unwrap();
        }
        drop(wal);

        for i in 0..4 {
            let data = fs::read(shard_path(dir.path(), i)).unwrap();
            let mut bytes = Bytes::from(data);
            let mut ids = Vec::new();
            while let Some(rec) = WalRecord::decode(&mut bytes) {
                ids.push(rec.id);
            }
            // Two of the eight ids land in each of the four shards.
            assert_eq!(ids.len(), 2);
            assert!(ids.iter().all(|id| (id % 4) as usize == i));
        }
    }

    #[test]
    fn truncated_tail_is_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, _) = Wal::open(dir.path(), 1).unwrap();
        wal.append(&full(1, WalState::Ready)).unwrap();
        wal.append(&full(2, WalState::Ready)).unwrap();
        drop(wal);

        // Chop the last few bytes off the single shard file.
        let path = shard_path(dir.path(), 0);
        let mut data = fs::read(&path).unwrap();
        let keep = data.len() - 5;
        data.truncate(keep);
        fs::write(&path, data).unwrap();

        let (_, recovered) = Wal::open(dir.path(), 1).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, 1);
    }

    #[test]
    fn shard_count_change_recovers_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wal, _) = Wal::open(dir.path(), 8).unwrap();
        for id in 1..=10 {
            wal.append(&full(id, WalState::Ready)).unwrap();
        }
        drop(wal);

        let (_, recovered) = Wal::open(dir.path(), 2).unwrap();
        assert_eq!(recovered.len(), 10);

        // And the directory now holds exactly the two new shards.
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["wal-0.bin", "wal-1.bin"]);
    }
}
