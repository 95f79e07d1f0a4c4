//! Metadata state machine.
//!
//! Interprets committed entries in log order and persists their effects
//! together with the applied index, so that a restarted replica resumes at
//! exactly the first entry it has not incorporated.
//!
//! Every committed entry advances the applied index, including entries whose
//! command fails to decode or is rejected by the handler: the entry is
//! committed cluster-wide, and refusing it here would make this replica
//! diverge from the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use prost::Message;
use rocksdb::WriteBatch;

use crate::common::{Error, Result};
use crate::master::MetaCmd;
use crate::metadata::handler::{
    CommandHandler, CommandOutput, LeaderChange, LeaderChangeHandler, Mutation, PeerChange,
    PeerChangeHandler, SnapshotAppliedHandler, StoreReader,
};
use crate::metadata::rocks::RocksDbStore;
use crate::metadata::snapshot::{SnapshotDecoder, SnapshotReader};
use crate::metadata::utils::{APPLIED_KEY, be_to_u64, u64be_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Restoring,
    Ready,
    Applying,
    SnapshotLoading,
    Closed,
}

/// Outcome of one committed entry.
#[derive(Debug)]
pub struct Applied {
    pub index: u64,
    /// Handler reply, or the `Apply` error that was recorded for this entry.
    pub result: Result<Vec<u8>>,
}

#[derive(Default)]
struct Handlers {
    leader_change: OnceLock<Arc<dyn LeaderChangeHandler>>,
    peer_change: OnceLock<Arc<dyn PeerChangeHandler>>,
    snapshot_applied: OnceLock<Arc<dyn SnapshotAppliedHandler>>,
    command: OnceLock<Arc<dyn CommandHandler>>,
}

pub struct MetadataFsm {
    store: RocksDbStore,
    retain_logs: u64,
    applied: AtomicU64,
    /// Held for the whole of every apply and snapshot install.
    state: Mutex<FsmState>,
    handlers: Handlers,
}

impl MetadataFsm {
    pub fn new(store: RocksDbStore, retain_logs: u64) -> Self {
        Self {
            store,
            retain_logs: retain_logs.max(1),
            applied: AtomicU64::new(0),
            state: Mutex::new(FsmState::Restoring),
            handlers: Handlers::default(),
        }
    }

    pub fn register_leader_change_handler(
        &self,
        handler: Arc<dyn LeaderChangeHandler>,
    ) -> Result<()> {
        self.handlers
            .leader_change
            .set(handler)
            .map_err(|_| Error::AlreadyRegistered("leader-change"))
    }

    pub fn register_peer_change_handler(&self, handler: Arc<dyn PeerChangeHandler>) -> Result<()> {
        self.handlers
            .peer_change
            .set(handler)
            .map_err(|_| Error::AlreadyRegistered("peer-change"))
    }

    pub fn register_apply_snapshot_handler(
        &self,
        handler: Arc<dyn SnapshotAppliedHandler>,
    ) -> Result<()> {
        self.handlers
            .snapshot_applied
            .set(handler)
            .map_err(|_| Error::AlreadyRegistered("apply-snapshot"))
    }

    pub fn register_user_command_handler(&self, handler: Arc<dyn CommandHandler>) -> Result<()> {
        self.handlers
            .command
            .set(handler)
            .map_err(|_| Error::AlreadyRegistered("user-command"))
    }

    pub fn state(&self) -> FsmState {
        *self.state.lock()
    }

    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn retain_logs(&self) -> u64 {
        self.retain_logs
    }

    /// Load the persisted applied index; no consensus traffic required.
    pub fn restore(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if *state == FsmState::Closed {
            return Err(Error::Closed);
        }
        let applied = match self.store.get(APPLIED_KEY)? {
            None => 0,
            Some(raw) => be_to_u64(&raw).ok_or_else(|| {
                Error::StoreIo(format!("corrupt applied index ({} bytes)", raw.len()))
            })?,
        };
        self.applied.store(applied, Ordering::Release);
        *state = FsmState::Ready;
        tracing::info!(
            "restored metadata state machine from {} at applied index {}",
            self.store.dir().display(),
            applied
        );
        Ok(applied)
    }

    /// Apply the committed entry at `index`.
    ///
    /// The outer error is reserved for conditions the replica cannot continue
    /// from (store IO, closed, not restored); command failures are reported in
    /// [`Applied::result`] and the index still advances.
    pub fn apply(&self, index: u64, data: &[u8]) -> Result<Applied> {
        let mut state = self.state.lock();
        self.check_ready(*state)?;

        let applied = self.applied.load(Ordering::Acquire);
        if index <= applied {
            tracing::debug!("skip entry {} already covered by applied {}", index, applied);
            return Ok(Applied {
                index,
                result: Ok(Vec::new()),
            });
        }

        *state = FsmState::Applying;
        let outcome = if data.is_empty() {
            Ok(CommandOutput::default())
        } else {
            self.execute(data)
        };

        let mut wb = WriteBatch::default();
        let result = match outcome {
            Ok(out) => {
                for m in out.mutations {
                    match m {
                        Mutation::Put { key, value } => wb.put(key, value),
                        Mutation::Delete { key } => wb.delete(key),
                    }
                }
                Ok(out.response)
            }
            Err(e) => {
                tracing::warn!("entry {} rejected, advancing applied index anyway: {}", index, e);
                Err(Error::Apply(format!("entry {index}: {e}")))
            }
        };
        wb.put(APPLIED_KEY, u64be_bytes(index));

        let written = self.store.write(wb);
        *state = FsmState::Ready;
        written?;
        self.applied.store(index, Ordering::Release);
        Ok(Applied { index, result })
    }

    fn execute(&self, data: &[u8]) -> Result<CommandOutput> {
        let cmd = MetaCmd::decode(data)?;
        let handler = self
            .handlers
            .command
            .get()
            .ok_or_else(|| Error::Internal("no user-command handler registered".into()))?;
        handler.handle(&cmd, &self.store)
    }

    /// Record a membership entry and forward it to the peer-change handler.
    pub fn apply_member_change(&self, index: u64, change: &PeerChange) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.check_ready(*state)?;
            if index <= self.applied.load(Ordering::Acquire) {
                return Ok(());
            }
            *state = FsmState::Applying;
            let mut wb = WriteBatch::default();
            wb.put(APPLIED_KEY, u64be_bytes(index));
            let written = self.store.write(wb);
            *state = FsmState::Ready;
            written?;
            self.applied.store(index, Ordering::Release);
        }
        tracing::info!("applied membership change at {}: {:?}", index, change);
        self.handle_peer_change(change);
        Ok(())
    }

    /// Produce a snapshot stream at the current applied index.
    pub fn snapshot(&self) -> Result<SnapshotReader<'_>> {
        let state = self.state.lock();
        self.check_ready(*state)?;
        let applied = self.applied.load(Ordering::Acquire);
        Ok(SnapshotReader::new(applied, self.store.iter()))
    }

    /// Replace the whole store with an encoded snapshot.
    pub fn apply_snapshot(&self, data: &[u8]) -> Result<u64> {
        let applied = {
            let mut state = self.state.lock();
            self.check_ready(*state)?;
            *state = FsmState::SnapshotLoading;
            let installed = self.install_snapshot(data);
            *state = FsmState::Ready;
            installed?
        };
        self.applied.store(applied, Ordering::Release);
        tracing::info!("installed snapshot at applied index {}", applied);
        if let Some(handler) = self.handlers.snapshot_applied.get() {
            handler.on_snapshot_applied(applied);
        }
        Ok(applied)
    }

    fn install_snapshot(&self, data: &[u8]) -> Result<u64> {
        let decoder = SnapshotDecoder::new(data)?;
        let applied = decoder.applied_index();
        let expected = decoder.record_count();
        let mut wb = WriteBatch::default();
        for kv in self.store.iter() {
            let (key, _) = kv?;
            wb.delete(key);
        }
        let mut records = 0u64;
        for record in decoder {
            let record = record?;
            records += 1;
            if record.key == APPLIED_KEY {
                continue;
            }
            wb.put(record.key, record.value);
        }
        if records != expected {
            return Err(Error::SnapshotApply(format!(
                "snapshot holds {records} records, header says {expected}"
            )));
        }
        wb.put(APPLIED_KEY, u64be_bytes(applied));
        self.store.write(wb)?;
        tracing::debug!("snapshot carried {} records", records);
        Ok(applied)
    }

    pub fn handle_leader_change(&self, change: LeaderChange) {
        if let Some(handler) = self.handlers.leader_change.get() {
            handler.on_leader_change(change);
        }
    }

    pub fn handle_peer_change(&self, change: &PeerChange) {
        if let Some(handler) = self.handlers.peer_change.get() {
            handler.on_peer_change(change);
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == FsmState::Closed {
            return Ok(());
        }
        *state = FsmState::Closed;
        self.store.flush()
    }

    fn check_ready(&self, state: FsmState) -> Result<()> {
        match state {
            FsmState::Closed => Err(Error::Closed),
            FsmState::Restoring => Err(Error::Internal("state machine not restored".into())),
            _ => Ok(()),
        }
    }
}

impl StoreReader for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        RocksDbStore::get(self, key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        RocksDbStore::scan_prefix(self, prefix)
    }
}

/// Reads see committed state; they may run concurrently with apply.
impl StoreReader for MetadataFsm {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.store.scan_prefix(prefix)
    }
}
