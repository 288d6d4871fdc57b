//! In-memory collaborator implementations.
//!
//! Recording doubles for every contract in [`crate::collab`], used by the
//! unit and integration suites and by crash-replay simulation: a shared
//! [`MemWal`] survives tearing one subsystem down and recovering another on
//! top of it, which is exactly what a crash-restart looks like to this
//! crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use keystone_error::{KeystoneError, Result};
use keystone_types::{
    DistribTimestamp, DistribXid, ForkNumber, Gid, Lsn, RelFileNode, TimestampTz, TwoPhaseRmId,
    Xid,
};
use parking_lot::Mutex;

use crate::collab::{
    Clock, Clog, Collaborators, DistributedLog, DistributedXact, ProcArray, RmgrTable, StatsSink,
    Storage, StorageHandle, Subtrans, SyncRep, WalLog, WalSenders, XactSource,
};
use crate::gxact_table::{DummyProc, SlotId};
use crate::record::XactWalKind;

// ---------------------------------------------------------------------------
// MemWal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemWalRecord {
    kind: XactWalKind,
    begin: Lsn,
    payload: Vec<u8>,
}

struct MemWalInner {
    records: Vec<MemWalRecord>,
    next_offset: u32,
    last_begin: Lsn,
    flushed_to: Lsn,
}

/// Append-only single-log WAL. Records are addressed by their begin LSN.
pub struct MemWal {
    inner: Mutex<MemWalInner>,
}

impl Default for MemWal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemWal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemWalInner {
                records: Vec::new(),
                // Offset 0 doubles as "no record"; start past it.
                next_offset: 64,
                last_begin: Lsn::ZERO,
                flushed_to: Lsn::ZERO,
            }),
        }
    }

    /// Kinds of every record inserted so far, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<XactWalKind> {
        self.inner.lock().records.iter().map(|r| r.kind).collect()
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn flushed_to(&self) -> Lsn {
        self.inner.lock().flushed_to
    }

    /// Flip one byte of the record at `at`, simulating on-disk damage.
    pub fn corrupt_record(&self, at: Lsn) {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.begin == at)
            .expect("record to corrupt exists");
        record.payload[0] ^= 0xFF;
    }

    /// Drop the record at `at` entirely, simulating an unreadable location.
    pub fn lose_record(&self, at: Lsn) {
        self.inner.lock().records.retain(|r| r.begin != at);
    }
}

impl WalLog for MemWal {
    fn insert(&self, kind: XactWalKind, payload: &[u8]) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let begin = Lsn::new(0, inner.next_offset);
        let end = Lsn::new(0, inner.next_offset + payload.len() as u32);
        inner.records.push(MemWalRecord {
            kind,
            begin,
            payload: payload.to_vec(),
        });
        inner.next_offset = end.offset;
        inner.last_begin = begin;
        Ok(end)
    }

    fn last_insert_begin_lsn(&self) -> Lsn {
        self.inner.lock().last_begin
    }

    fn flush(&self, upto: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if upto > inner.flushed_to {
            inner.flushed_to = upto;
        }
        Ok(())
    }

    fn read_record(&self, at: Lsn) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .records
            .iter()
            .find(|r| r.begin == at)
            .map(|r| r.payload.clone())
            .ok_or_else(|| {
                KeystoneError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no WAL record begins at {at}"),
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// MemProcArray
// ---------------------------------------------------------------------------

/// Process array keyed by descriptor slot id.
#[derive(Default)]
pub struct MemProcArray {
    procs: Mutex<HashMap<SlotId, DummyProc>>,
    removed: Mutex<Vec<(SlotId, Xid)>>,
}

impl MemProcArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains_xid(&self, xid: Xid) -> bool {
        self.procs.lock().values().any(|p| p.xid == xid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.procs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(slot, latest_xid)` pairs from every removal, in order.
    #[must_use]
    pub fn removals(&self) -> Vec<(SlotId, Xid)> {
        self.removed.lock().clone()
    }
}

impl ProcArray for MemProcArray {
    fn add(&self, slot: SlotId, proc: &DummyProc) {
        self.procs.lock().insert(slot, proc.clone());
    }

    fn remove(&self, slot: SlotId, latest_xid: Xid) {
        self.procs.lock().remove(&slot);
        self.removed.lock().push((slot, latest_xid));
    }
}

// ---------------------------------------------------------------------------
// MemClog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XactStatus {
    Committed,
    Aborted,
}

/// Commit log over a plain map; unlisted xids are in-progress.
#[derive(Default)]
pub struct MemClog {
    status: Mutex<HashMap<u32, XactStatus>>,
}

impl MemClog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_tree(&self, xid: Xid, children: &[Xid], status: XactStatus) {
        let mut map = self.status.lock();
        map.insert(xid.raw(), status);
        for child in children {
            map.insert(child.raw(), status);
        }
    }
}

impl Clog for MemClog {
    fn commit_tree(&self, xid: Xid, children: &[Xid]) {
        self.mark_tree(xid, children, XactStatus::Committed);
    }

    fn abort_tree(&self, xid: Xid, children: &[Xid]) {
        self.mark_tree(xid, children, XactStatus::Aborted);
    }

    fn did_commit(&self, xid: Xid) -> bool {
        matches!(
            self.status.lock().get(&xid.raw()),
            Some(XactStatus::Committed)
        )
    }

    fn did_abort(&self, xid: Xid) -> bool {
        matches!(self.status.lock().get(&xid.raw()), Some(XactStatus::Aborted))
    }
}

// ---------------------------------------------------------------------------
// MemStorage
// ---------------------------------------------------------------------------

/// Storage layer that records every unlink.
#[derive(Default)]
pub struct MemStorage {
    open_rels: Mutex<Vec<RelFileNode>>,
    unlinked: Mutex<Vec<(RelFileNode, ForkNumber)>>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(rel, fork)` pairs from every unlink, in order.
    #[must_use]
    pub fn unlinked(&self) -> Vec<(RelFileNode, ForkNumber)> {
        self.unlinked.lock().clone()
    }

    /// Relations with at least one fork unlinked.
    #[must_use]
    pub fn unlinked_rels(&self) -> Vec<RelFileNode> {
        let mut rels: Vec<RelFileNode> =
            self.unlinked.lock().iter().map(|(rel, _)| *rel).collect();
        rels.dedup();
        rels
    }
}

impl Storage for MemStorage {
    fn open(&self, rel: RelFileNode) -> StorageHandle {
        let mut open_rels = self.open_rels.lock();
        open_rels.push(rel);
        StorageHandle(open_rels.len() as u64 - 1)
    }

    fn unlink(&self, handle: StorageHandle, fork: ForkNumber) -> Result<()> {
        let rel = self.open_rels.lock()[handle.0 as usize];
        self.unlinked.lock().push((rel, fork));
        Ok(())
    }

    fn close(&self, _handle: StorageHandle) {}
}

// ---------------------------------------------------------------------------
// MemSubtrans / MemDistributedLog
// ---------------------------------------------------------------------------

/// Subtransaction parent map.
#[derive(Default)]
pub struct MemSubtrans {
    parents: Mutex<HashMap<u32, Xid>>,
}

impl MemSubtrans {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn parent_of(&self, child: Xid) -> Option<Xid> {
        self.parents.lock().get(&child.raw()).copied()
    }
}

impl Subtrans for MemSubtrans {
    fn set_parent(&self, child: Xid, parent: Xid) {
        self.parents.lock().insert(child.raw(), parent);
    }
}

/// One distributed-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTree {
    pub xid: Xid,
    pub children: Vec<Xid>,
    pub timestamp: DistribTimestamp,
    pub distrib_xid: DistribXid,
    pub is_redo: bool,
}

/// Distributed commit log that records every marked tree.
#[derive(Default)]
pub struct MemDistributedLog {
    trees: Mutex<Vec<CommittedTree>>,
}

impl MemDistributedLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trees(&self) -> Vec<CommittedTree> {
        self.trees.lock().clone()
    }
}

impl DistributedLog for MemDistributedLog {
    fn set_committed_tree(
        &self,
        xid: Xid,
        children: &[Xid],
        timestamp: DistribTimestamp,
        distrib_xid: DistribXid,
        is_redo: bool,
    ) {
        self.trees.lock().push(CommittedTree {
            xid,
            children: children.to_vec(),
            timestamp,
            distrib_xid,
            is_redo,
        });
    }
}

// ---------------------------------------------------------------------------
// DtxGidCracker
// ---------------------------------------------------------------------------

/// Cracks GIDs of the form `<timestamp>-<distrib_xid>[-...]`. A GID that
/// does not match is treated as local-only and yields zeros.
#[derive(Default)]
pub struct DtxGidCracker;

impl DtxGidCracker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DistributedXact for DtxGidCracker {
    fn crack_gid(&self, gid: &Gid) -> Result<(DistribTimestamp, DistribXid)> {
        let mut parts = gid.as_str().splitn(3, '-');
        let timestamp = parts.next().and_then(|p| p.parse::<u32>().ok());
        let distrib_xid = parts.next().and_then(|p| p.parse::<u32>().ok());
        match (timestamp, distrib_xid) {
            (Some(ts), Some(dx)) => Ok((DistribTimestamp(ts), DistribXid(dx))),
            _ => Ok((DistribTimestamp(0), DistribXid(0))),
        }
    }
}

// ---------------------------------------------------------------------------
// Small recording singletons
// ---------------------------------------------------------------------------

/// Sync-rep waiter that records every LSN it was asked to wait for.
#[derive(Default)]
pub struct RecordingSyncRep {
    waited: Mutex<Vec<Lsn>>,
}

impl RecordingSyncRep {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn waited(&self) -> Vec<Lsn> {
        self.waited.lock().clone()
    }
}

impl SyncRep for RecordingSyncRep {
    fn wait_for_lsn(&self, lsn: Lsn) {
        self.waited.lock().push(lsn);
    }
}

/// WAL-sender wakeup counter.
#[derive(Default)]
pub struct CountingWalSenders {
    wakeups: AtomicU64,
}

impl CountingWalSenders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

impl WalSenders for CountingWalSenders {
    fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }
}

/// Commit/abort counters.
#[derive(Default)]
pub struct CountingStats {
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl CountingStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }
}

impl StatsSink for CountingStats {
    fn xact_finished(&self, committed: bool) {
        if committed {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Settable clock for deterministic second-phase timestamps.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(micros: i64) -> Self {
        Self {
            now: AtomicI64::new(micros),
        }
    }

    pub fn set(&self, micros: i64) {
        self.now.store(micros, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimestampTz {
        TimestampTz::from_micros(self.now.load(Ordering::Relaxed))
    }
}

/// One resource-manager callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmgrEvent {
    pub rmid: TwoPhaseRmId,
    pub xid: Xid,
    pub info: u16,
    pub data: Vec<u8>,
}

/// Rmgr table that records every callback by phase.
#[derive(Default)]
pub struct RecordingRmgr {
    recovered: Mutex<Vec<RmgrEvent>>,
    post_commit: Mutex<Vec<RmgrEvent>>,
    post_abort: Mutex<Vec<RmgrEvent>>,
}

impl RecordingRmgr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn recovered(&self) -> Vec<RmgrEvent> {
        self.recovered.lock().clone()
    }

    #[must_use]
    pub fn post_committed(&self) -> Vec<RmgrEvent> {
        self.post_commit.lock().clone()
    }

    #[must_use]
    pub fn post_aborted(&self) -> Vec<RmgrEvent> {
        self.post_abort.lock().clone()
    }
}

impl RmgrTable for RecordingRmgr {
    fn recover(&self, rmid: TwoPhaseRmId, xid: Xid, info: u16, data: &[u8]) {
        self.recovered.lock().push(RmgrEvent {
            rmid,
            xid,
            info,
            data: data.to_vec(),
        });
    }

    fn post_commit(&self, rmid: TwoPhaseRmId, xid: Xid, info: u16, data: &[u8]) {
        self.post_commit.lock().push(RmgrEvent {
            rmid,
            xid,
            info,
            data: data.to_vec(),
        });
    }

    fn post_abort(&self, rmid: TwoPhaseRmId, xid: Xid, info: u16, data: &[u8]) {
        self.post_abort.lock().push(RmgrEvent {
            rmid,
            xid,
            info,
            data: data.to_vec(),
        });
    }
}

// ---------------------------------------------------------------------------
// TestXactSource / TestEnv
// ---------------------------------------------------------------------------

/// Canned transaction state for the preparing backend.
#[derive(Default, Clone)]
pub struct TestXactSource {
    pub children: Vec<Xid>,
    pub commit_rels: Vec<RelFileNode>,
    pub abort_rels: Vec<RelFileNode>,
}

impl XactSource for TestXactSource {
    fn committed_children(&self) -> Vec<Xid> {
        self.children.clone()
    }

    fn pending_deletes(&self, at_commit: bool) -> Vec<RelFileNode> {
        if at_commit {
            self.commit_rels.clone()
        } else {
            self.abort_rels.clone()
        }
    }
}

/// One shared set of collaborators. Hand `collaborators()` to as many
/// subsystem instances as the scenario needs; sharing the same [`MemWal`]
/// across two instances is how crash-restart is simulated.
pub struct TestEnv {
    pub wal: Arc<MemWal>,
    pub procarray: Arc<MemProcArray>,
    pub clog: Arc<MemClog>,
    pub storage: Arc<MemStorage>,
    pub subtrans: Arc<MemSubtrans>,
    pub distributed_log: Arc<MemDistributedLog>,
    pub cracker: Arc<DtxGidCracker>,
    pub syncrep: Arc<RecordingSyncRep>,
    pub wal_senders: Arc<CountingWalSenders>,
    pub stats: Arc<CountingStats>,
    pub clock: Arc<ManualClock>,
    pub rmgr: Arc<RecordingRmgr>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            wal: Arc::new(MemWal::new()),
            procarray: Arc::new(MemProcArray::new()),
            clog: Arc::new(MemClog::new()),
            storage: Arc::new(MemStorage::new()),
            subtrans: Arc::new(MemSubtrans::new()),
            distributed_log: Arc::new(MemDistributedLog::new()),
            cracker: Arc::new(DtxGidCracker::new()),
            syncrep: Arc::new(RecordingSyncRep::new()),
            wal_senders: Arc::new(CountingWalSenders::new()),
            stats: Arc::new(CountingStats::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000_000_000)),
            rmgr: Arc::new(RecordingRmgr::new()),
        }
    }

    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            wal: self.wal.clone(),
            procarray: self.procarray.clone(),
            clog: self.clog.clone(),
            storage: self.storage.clone(),
            subtrans: self.subtrans.clone(),
            distributed_log: self.distributed_log.clone(),
            distributed_xact: self.cracker.clone(),
            syncrep: self.syncrep.clone(),
            wal_senders: self.wal_senders.clone(),
            stats: self.stats.clone(),
            clock: self.clock.clone(),
            rmgr: self.rmgr.clone(),
        }
    }
}
