use anyhow::{Context, Result};
use protobuf::Message as PbMessage;
use raft::GetEntriesContext;
use raft::prelude::*;
use raft::{Error as RaftError, Result as RaftResult, Storage};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};
use std::path::Path;
use std::sync::Arc;

use crate::metadata::fsm::MetadataFsm;
use crate::metadata::utils::{be_to_u64, u64be_bytes};

const CF_RAFT_LOG: &str = "raft_log";
const CF_RAFT_STATE: &str = "raft_state";

// raft_state keys
pub const KEY_HARD_STATE: &[u8] = b"hard_state";
pub const KEY_CONF_STATE: &[u8] = b"conf_state";
pub const KEY_FIRST_INDEX: &[u8] = b"first_index";
pub const KEY_LAST_INDEX: &[u8] = b"last_index";
/// Index and term of the last entry removed by compaction or covered by a snapshot.
pub const KEY_TRUNCATED: &[u8] = b"truncated";

/// Write-ahead log of one replication group.
#[derive(Clone)]
pub struct RaftLogStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RaftLogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("create wal dir {}", path.display()))?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_RAFT_LOG, Options::default()),
            ColumnFamilyDescriptor::new(CF_RAFT_STATE, Options::default()),
        ];
        let db: DBWithThreadMode<MultiThreaded> =
            DBWithThreadMode::open_cf_descriptors(&opts, path, cfs)
                .with_context(|| format!("open wal {}", path.display()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow::anyhow!("missing column family {name}"))
    }

    fn write(&self, wb: WriteBatch) -> Result<()> {
        let mut wo = WriteOptions::default();
        wo.set_sync(true);
        self.db.write_opt(wb, &wo)?;
        Ok(())
    }

    // ---- Persistence helpers used during Ready handling ----

    pub fn set_hard_state(&self, hs: &HardState) -> Result<()> {
        let buf = PbMessage::write_to_bytes(hs)?;
        let mut wb = WriteBatch::default();
        wb.put_cf(&self.cf(CF_RAFT_STATE)?, KEY_HARD_STATE, buf);
        self.write(wb)
    }

    /// Persist the commit index reported by a light ready.
    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hs = self.load_hard_state()?.unwrap_or_default();
        if hs.commit >= commit {
            return Ok(());
        }
        hs.commit = commit;
        self.set_hard_state(&hs)
    }

    pub fn set_conf_state(&self, cs: &ConfState) -> Result<()> {
        let buf = PbMessage::write_to_bytes(cs)?;
        let mut wb = WriteBatch::default();
        wb.put_cf(&self.cf(CF_RAFT_STATE)?, KEY_CONF_STATE, buf);
        self.write(wb)
    }

    /// Append `ents`, dropping any previously stored entries they conflict with.
    pub fn append(&self, ents: &[Entry]) -> Result<()> {
        let (Some(head), Some(tail)) = (ents.first(), ents.last()) else {
            return Ok(());
        };
        let first = self.first_index_inner()?;
        if head.index < first {
            anyhow::bail!("append at {} overlaps compacted log (first {})", head.index, first);
        }
        let old_last = self.last_index_inner()?;
        let cf_log = self.cf(CF_RAFT_LOG)?;
        let mut wb = WriteBatch::default();
        for e in ents {
            wb.put_cf(&cf_log, u64be_bytes(e.index), PbMessage::write_to_bytes(e)?);
        }
        if old_last > tail.index {
            wb.delete_range_cf(&cf_log, u64be_bytes(tail.index + 1), u64be_bytes(old_last + 1));
        }
        wb.put_cf(&self.cf(CF_RAFT_STATE)?, KEY_LAST_INDEX, u64be_bytes(tail.index));
        self.write(wb)
    }

    /// Drop entries below `to`; the entry at `to - 1` becomes the truncation point.
    pub fn compact_to(&self, to: u64) -> Result<()> {
        let first = self.first_index_inner()?;
        if to <= first {
            return Ok(());
        }
        let last = self.last_index_inner()?;
        if to > last + 1 {
            anyhow::bail!("compact to {} beyond last index {}", to, last);
        }
        let truncated_term = self.term_inner(to - 1)?;
        let mut wb = WriteBatch::default();
        wb.delete_range_cf(&self.cf(CF_RAFT_LOG)?, u64be_bytes(first), u64be_bytes(to));
        let cf_state = self.cf(CF_RAFT_STATE)?;
        wb.put_cf(&cf_state, KEY_FIRST_INDEX, u64be_bytes(to));
        wb.put_cf(&cf_state, KEY_TRUNCATED, truncated(to - 1, truncated_term));
        self.write(wb)?;
        tracing::debug!("raft log compacted to {}", to);
        Ok(())
    }

    /// Reset the log so that it starts right after an installed snapshot.
    pub fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) -> Result<()> {
        let index = meta.get_index();
        let term = meta.get_term();
        let mut hs = self.load_hard_state()?.unwrap_or_default();
        hs.commit = hs.commit.max(index);
        hs.term = hs.term.max(term);

        let first = self.first_index_inner()?;
        let last = self.last_index_inner()?;
        let cf_state = self.cf(CF_RAFT_STATE)?;
        let mut wb = WriteBatch::default();
        if last >= first {
            wb.delete_range_cf(&self.cf(CF_RAFT_LOG)?, u64be_bytes(first), u64be_bytes(last + 1));
        }
        wb.put_cf(&cf_state, KEY_FIRST_INDEX, u64be_bytes(index + 1));
        wb.put_cf(&cf_state, KEY_LAST_INDEX, u64be_bytes(index));
        wb.put_cf(&cf_state, KEY_TRUNCATED, truncated(index, term));
        wb.put_cf(&cf_state, KEY_HARD_STATE, PbMessage::write_to_bytes(&hs)?);
        wb.put_cf(
            &cf_state,
            KEY_CONF_STATE,
            PbMessage::write_to_bytes(meta.get_conf_state())?,
        );
        self.write(wb)
    }

    pub fn first_index_inner(&self) -> Result<u64> {
        Ok(self.get_u64(KEY_FIRST_INDEX)?.unwrap_or(1))
    }

    pub fn last_index_inner(&self) -> Result<u64> {
        match self.get_u64(KEY_LAST_INDEX)? {
            Some(last) => Ok(last),
            None => Ok(self.first_index_inner()? - 1),
        }
    }

    fn truncated_state(&self) -> Result<(u64, u64)> {
        let raw = self.db.get_cf(&self.cf(CF_RAFT_STATE)?, KEY_TRUNCATED)?;
        match raw {
            None => Ok((0, 0)),
            Some(v) if v.len() == 16 => {
                let index = be_to_u64(&v[..8]).unwrap_or_default();
                let term = be_to_u64(&v[8..]).unwrap_or_default();
                Ok((index, term))
            }
            Some(v) => anyhow::bail!("corrupt truncated state ({} bytes)", v.len()),
        }
    }

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        match self.db.get_cf(&self.cf(CF_RAFT_STATE)?, key)? {
            None => Ok(None),
            Some(v) => be_to_u64(&v)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("corrupt raft state key {:?}", key)),
        }
    }

    pub fn load_hard_state(&self) -> Result<Option<HardState>> {
        Ok(self
            .db
            .get_cf(&self.cf(CF_RAFT_STATE)?, KEY_HARD_STATE)?
            .map(|v| HardState::parse_from_bytes(v.as_ref()))
            .transpose()?)
    }

    pub fn load_conf_state(&self) -> Result<Option<ConfState>> {
        Ok(self
            .db
            .get_cf(&self.cf(CF_RAFT_STATE)?, KEY_CONF_STATE)?
            .map(|v| ConfState::parse_from_bytes(v.as_ref()))
            .transpose()?)
    }

    fn term_inner(&self, idx: u64) -> Result<u64> {
        let (truncated_index, truncated_term) = self.truncated_state()?;
        if idx == truncated_index {
            return Ok(truncated_term);
        }
        let v = self
            .db
            .get_cf(&self.cf(CF_RAFT_LOG)?, u64be_bytes(idx))?
            .ok_or_else(|| anyhow::anyhow!("log entry {idx} missing"))?;
        Ok(Entry::parse_from_bytes(v.as_ref())?.term)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush_cf(&self.cf(CF_RAFT_LOG)?)?;
        self.db.flush_cf(&self.cf(CF_RAFT_STATE)?)?;
        Ok(())
    }
}

fn truncated(index: u64, term: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&u64be_bytes(index));
    buf[8..].copy_from_slice(&u64be_bytes(term));
    buf
}

/// Raft-facing storage of a partition: the log plus the state machine that
/// snapshots are cut from.
#[derive(Clone)]
pub struct PartitionStorage {
    log: RaftLogStore,
    sm: Arc<MetadataFsm>,
}

impl PartitionStorage {
    pub fn new(log: RaftLogStore, sm: Arc<MetadataFsm>) -> Self {
        Self { log, sm }
    }

    pub fn log(&self) -> &RaftLogStore {
        &self.log
    }
}

// ---- Storage trait implementation (used by Raft for reads) ----
impl Storage for PartitionStorage {
    fn initial_state(&self) -> RaftResult<RaftState> {
        let hs = self
            .log
            .load_hard_state()
            .map_err(to_raft_err)?
            .unwrap_or_default();
        let cs = self
            .log
            .load_conf_state()
            .map_err(to_raft_err)?
            .unwrap_or_default();
        Ok(RaftState {
            hard_state: hs,
            conf_state: cs,
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> RaftResult<Vec<Entry>> {
        let first = self.log.first_index_inner().map_err(to_raft_err)?;
        if low < first {
            return Err(RaftError::Store(raft::StorageError::Compacted));
        }
        let last = self.log.last_index_inner().map_err(to_raft_err)?;
        if high > last + 1 {
            return Err(RaftError::Store(raft::StorageError::Unavailable));
        }
        let cf_log = self.log.cf(CF_RAFT_LOG).map_err(to_raft_err)?;
        let mut ents = Vec::new();
        let mut size: u64 = 0;
        let low_key = u64be_bytes(low);
        let it = self
            .log
            .db
            .iterator_cf(&cf_log, IteratorMode::From(&low_key, Direction::Forward));
        let max_size = max_size.into();
        for kv in it {
            let (_, v) = kv.map_err(to_raft_err)?;
            let e = Entry::parse_from_bytes(v.as_ref()).map_err(to_raft_err)?;
            if e.index >= high {
                break;
            }
            size += v.len() as u64;
            // always hand back at least one entry
            if !ents.is_empty() && max_size.is_some_and(|m| size > m) {
                break;
            }
            ents.push(e);
        }
        Ok(ents)
    }

    fn term(&self, idx: u64) -> RaftResult<u64> {
        if idx == 0 {
            return Ok(0);
        }
        let (truncated_index, truncated_term) =
            self.log.truncated_state().map_err(to_raft_err)?;
        if idx == truncated_index {
            return Ok(truncated_term);
        }
        let first = self.log.first_index_inner().map_err(to_raft_err)?;
        let last = self.log.last_index_inner().map_err(to_raft_err)?;
        if idx < first {
            return Err(RaftError::Store(raft::StorageError::Compacted));
        }
        if idx > last {
            return Err(RaftError::Store(raft::StorageError::Unavailable));
        }
        self.log.term_inner(idx).map_err(to_raft_err)
    }

    fn first_index(&self) -> RaftResult<u64> {
        self.log.first_index_inner().map_err(to_raft_err)
    }

    fn last_index(&self) -> RaftResult<u64> {
        self.log.last_index_inner().map_err(to_raft_err)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> RaftResult<Snapshot> {
        let reader = self.sm.snapshot().map_err(to_raft_err)?;
        let applied = reader.applied_index();
        if applied < request_index {
            return Err(RaftError::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        let term = self.log.term_inner(applied).map_err(to_raft_err)?;
        let conf_state = self
            .log
            .load_conf_state()
            .map_err(to_raft_err)?
            .unwrap_or_default();
        let data = reader.encode().map_err(to_raft_err)?;

        let mut snap = Snapshot::default();
        snap.data = data.into();
        let meta = snap.mut_metadata();
        meta.index = applied;
        meta.term = term;
        meta.set_conf_state(conf_state);
        tracing::info!("built snapshot at index {} term {}", applied, term);
        Ok(snap)
    }
}

// ---- Utilities ----
fn to_raft_err<E>(e: E) -> RaftError
where
    E: Into<anyhow::Error>,
{
    RaftError::Store(raft::StorageError::Other(Box::new(AnyhowStdError(
        e.into(),
    ))))
}

struct AnyhowStdError(anyhow::Error);

impl std::fmt::Debug for AnyhowStdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for AnyhowStdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for AnyhowStdError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::rocks::RocksDbStore;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = format!("e{index}").into_bytes().into();
        e
    }

    fn storage(dir: &Path) -> PartitionStorage {
        let log = RaftLogStore::open(dir.join("wal")).unwrap();
        let store = RocksDbStore::open(dir.join("store"), 8 << 20, 4 << 20).unwrap();
        let sm = MetadataFsm::new(store, 100);
        sm.restore().unwrap();
        PartitionStorage::new(log, Arc::new(sm))
    }

    #[test]
    fn test_empty_log_bounds() {
        let dir = tempdir().unwrap();
        let st = storage(dir.path());
        assert_eq!(st.first_index().unwrap(), 1);
        assert_eq!(st.last_index().unwrap(), 0);
        assert_eq!(st.term(0).unwrap(), 0);
        let state = st.initial_state().unwrap();
        assert_eq!(state.hard_state, HardState::default());
        assert!(state.conf_state.voters.is_empty());
    }

    #[test]
    fn test_append_truncates_conflicting_tail() {
        let dir = tempdir().unwrap();
        let st = storage(dir.path());
        st.log().append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        st.log().append(&[entry(2, 2)]).unwrap();

        assert_eq!(st.last_index().unwrap(), 2);
        assert_eq!(st.term(2).unwrap(), 2);
        let ents = st
            .entries(1, 3, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(ents.len(), 2);
        assert!(matches!(
            st.entries(1, 4, None, GetEntriesContext::empty(false)),
            Err(RaftError::Store(raft::StorageError::Unavailable))
        ));
    }

    #[test]
    fn test_entries_respects_max_size_but_returns_one() {
        let dir = tempdir().unwrap();
        let st = storage(dir.path());
        st.log().append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        let ents = st
            .entries(1, 4, Some(1), GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].index, 1);
    }

    #[test]
    fn test_compaction_keeps_truncated_term() {
        let dir = tempdir().unwrap();
        let st = storage(dir.path());
        st.log()
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)])
            .unwrap();
        st.log().compact_to(4).unwrap();

        assert_eq!(st.first_index().unwrap(), 4);
        assert_eq!(st.last_index().unwrap(), 4);
        assert_eq!(st.term(3).unwrap(), 2);
        assert!(matches!(
            st.term(2),
            Err(RaftError::Store(raft::StorageError::Compacted))
        ));
        assert!(matches!(
            st.entries(2, 5, None, GetEntriesContext::empty(false)),
            Err(RaftError::Store(raft::StorageError::Compacted))
        ));
    }

    #[test]
    fn test_snapshot_meta_resets_log() {
        let dir = tempdir().unwrap();
        let st = storage(dir.path());
        st.log().append(&[entry(1, 1), entry(2, 1)]).unwrap();

        let mut meta = SnapshotMetadata::default();
        meta.index = 10;
        meta.term = 3;
        let mut cs = ConfState::default();
        cs.voters = vec![1, 2, 3];
        meta.set_conf_state(cs);
        st.log().apply_snapshot_meta(&meta).unwrap();

        assert_eq!(st.first_index().unwrap(), 11);
        assert_eq!(st.last_index().unwrap(), 10);
        assert_eq!(st.term(10).unwrap(), 3);
        let state = st.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 10);
        assert_eq!(state.conf_state.voters, vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_built_from_state_machine() {
        let dir = tempdir().unwrap();
        let st = storage(dir.path());
        st.log().append(&[entry(1, 1), entry(2, 4)]).unwrap();
        st.sm.apply(1, &[]).unwrap();
        st.sm.apply(2, &[]).unwrap();

        let snap = st.snapshot(2, 0).unwrap();
        assert_eq!(snap.get_metadata().index, 2);
        assert_eq!(snap.get_metadata().term, 4);
        assert!(!snap.get_data().is_empty());
        assert!(matches!(
            st.snapshot(3, 0),
            Err(RaftError::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }
}
