use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use tracing::debug;

use super::{net::Error, NodeId};

const DIGEST_LEN: usize = 32;
const ZSTD_LEVEL: i32 = 3;

/// What a node keeps once its part of a snapshot round completes.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SnapshotRecord {
    pub node: NodeId,
    pub seq: u32,
    /// Microseconds since the unix epoch when the record was produced.
    pub taken_at_micros: i64,
    /// The node's clock as recorded when the round's marker reached it.
    pub clock: Vec<u32>,
    /// Whether the node's application reported pending work this round.
    pub spark: bool,
    /// Coordinator only: every node's recorded clock, indexed by node id.
    pub matrix: Option<SnapshotMatrix>,
    /// Coordinator only: the outcome of the diagonal dominance check.
    pub consistent: Option<bool>,
}

/// N rows of N clock entries. Row `i` is node `i`'s recorded clock.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SnapshotMatrix {
    pub rows: Vec<Vec<u32>>,
}

impl SnapshotMatrix {
    pub fn node_count(&self) -> usize {
        self.rows.len()
    }

    /// A snapshot is consistent when no node has seen more of node `j`'s
    /// events than node `j` had itself recorded. Returns every cell that
    /// breaks this as `(i, j)`.
    pub fn violations(&self) -> Vec<(usize, usize)> {
        let mut violations = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            for (j, observed) in row.iter().enumerate() {
                let diagonal = self.rows.get(j).and_then(|r| r.get(j)).copied().unwrap_or(0);
                if *observed > diagonal {
                    violations.push((i, j));
                }
            }
        }
        violations
    }
}

impl fmt::Display for SnapshotMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>8}|", "")?;
        for j in 0..self.node_count() {
            write!(f, " [{:4}]", j)?;
        }
        writeln!(f)?;
        for (i, row) in self.rows.iter().enumerate() {
            write!(f, " [{:4}]|", i)?;
            for value in row {
                write!(f, "  {:4} ", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Somewhere to keep snapshot records. Failures are reported to the caller,
/// which logs them; a failed save never stops the protocol.
pub trait SnapshotStore: Send {
    fn save(&mut self, record: &SnapshotRecord) -> Result<(), Error>;
}

/// Keeps records in memory. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<SnapshotRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SnapshotRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&mut self, record: &SnapshotRecord) -> Result<(), Error> {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}

/// Writes each record to its own file under a directory:
/// blake3(archive) | zstd(archive)
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, node: NodeId, seq: u32) -> PathBuf {
        self.dir.join(format!("node-{}-snap-{:08}.vgl", node, seq))
    }

    /// Reads a record back, checking it against its digest.
    pub fn load(path: impl AsRef<Path>) -> Result<SnapshotRecord, Error> {
        let buf = fs::read(path)?;
        if buf.len() < DIGEST_LEN {
            Err(Error::CouldNotDecodeSnapshot)?
        }
        let (digest, compressed) = buf.split_at(DIGEST_LEN);
        let archive = zstd::decode_all(compressed)?;
        if blake3::hash(&archive).as_bytes() != digest {
            Err(Error::SnapshotDigestMismatch)?
        }
        let mut aligned = AlignedVec::with_capacity(archive.len());
        aligned.extend_from_slice(&archive);
        from_bytes::<SnapshotRecord>(&aligned).map_err(|_| Error::CouldNotDecodeSnapshot)
    }
}

impl SnapshotStore for DirStore {
    fn save(&mut self, record: &SnapshotRecord) -> Result<(), Error> {
        let archive =
            to_bytes::<_, 1024>(record).map_err(|_| Error::CouldNotEncodeSnapshot)?;
        let digest = blake3::hash(&archive);
        let compressed = zstd::encode_all(archive.as_slice(), ZSTD_LEVEL)?;

        let mut buf = Vec::with_capacity(DIGEST_LEN + compressed.len());
        buf.extend_from_slice(digest.as_bytes());
        buf.extend_from_slice(&compressed);

        let path = self.path_for(record.node, record.seq);
        fs::write(&path, buf)?;
        debug!("saved snapshot {} to {} ({})", record.seq, path.display(), digest.to_hex());
        Ok(())
    }
}
