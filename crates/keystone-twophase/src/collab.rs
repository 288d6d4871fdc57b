//! Collaborator contracts.
//!
//! The coordination core owns GID reservation, the shared table, payload
//! layout, ordering, and recovery; everything else it reaches through the
//! traits here. Implementations live elsewhere in the database; [`crate::testkit`]
//! provides in-memory doubles for all of them.
//!
//! All traits are object-safe and bundled into one [`Collaborators`] value
//! handed to the subsystem at construction.

use std::sync::Arc;

use keystone_error::Result;
use keystone_types::{
    DistribTimestamp, DistribXid, ForkNumber, Gid, Lsn, RelFileNode, TimestampTz, Xid,
};

use crate::gxact_table::{DummyProc, SlotId};
use crate::record::XactWalKind;

/// The WAL writer/reader.
pub trait WalLog: Send + Sync {
    /// Atomically insert one record; returns the end-of-record location.
    fn insert(&self, kind: XactWalKind, payload: &[u8]) -> Result<Lsn>;

    /// Begin location of the most recent insert by this backend.
    fn last_insert_begin_lsn(&self) -> Lsn;

    /// Make everything up to `upto` durable.
    fn flush(&self, upto: Lsn) -> Result<()>;

    /// Read back the record that begins at `at`. A failure here means the
    /// record is unreadable; callers treat that as data corruption.
    fn read_record(&self, at: Lsn) -> Result<Vec<u8>>;
}

/// The shared process array. Keyed by the descriptor's stable slot id; the
/// core hands over a copy of the dummy proc at insertion time.
pub trait ProcArray: Send + Sync {
    fn add(&self, slot: SlotId, proc: &DummyProc);

    /// Remove the dummy proc. `latest_xid` is the newest xid among the
    /// transaction and its children, used to advance the latest-completed
    /// cursor.
    fn remove(&self, slot: SlotId, latest_xid: Xid);
}

/// The commit log.
pub trait Clog: Send + Sync {
    fn commit_tree(&self, xid: Xid, children: &[Xid]);
    fn abort_tree(&self, xid: Xid, children: &[Xid]);
    fn did_commit(&self, xid: Xid) -> bool;
    fn did_abort(&self, xid: Xid) -> bool;
}

/// Opaque handle to an open storage relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageHandle(pub u64);

/// The storage-file layer, used to drop relation files when a prepared
/// transaction resolves.
pub trait Storage: Send + Sync {
    fn open(&self, rel: RelFileNode) -> StorageHandle;
    fn unlink(&self, handle: StorageHandle, fork: ForkNumber) -> Result<()>;
    fn close(&self, handle: StorageHandle);
}

/// The subtransaction parent map, rebuilt during recovery.
pub trait Subtrans: Send + Sync {
    fn set_parent(&self, child: Xid, parent: Xid);
}

/// The distributed commit log.
pub trait DistributedLog: Send + Sync {
    fn set_committed_tree(
        &self,
        xid: Xid,
        children: &[Xid],
        timestamp: DistribTimestamp,
        distrib_xid: DistribXid,
        is_redo: bool,
    );
}

/// Distributed-transaction identity carried inside a GID.
pub trait DistributedXact: Send + Sync {
    /// Crack a GID open into the coordinator start timestamp and the
    /// distributed xid. Implementations may treat a GID with no distributed
    /// identity as local-only and return zeros.
    fn crack_gid(&self, gid: &Gid) -> Result<(DistribTimestamp, DistribXid)>;
}

/// Synchronous-replication waiter.
pub trait SyncRep: Send + Sync {
    fn wait_for_lsn(&self, lsn: Lsn);
}

/// WAL sender wakeup, called after each flush when senders are configured.
pub trait WalSenders: Send + Sync {
    fn wakeup(&self);
}

/// Statistics collector.
pub trait StatsSink: Send + Sync {
    fn xact_finished(&self, committed: bool);
}

/// Wall clock, injected so second-phase record timestamps are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimestampTz;
}

/// The three parallel resource-manager callback tables, keyed by rmid.
/// A resource manager with nothing to do for a phase simply ignores the
/// call.
pub trait RmgrTable: Send + Sync {
    /// Re-acquire state (locks, notifications, ...) during recovery.
    fn recover(&self, rmid: keystone_types::TwoPhaseRmId, xid: Xid, info: u16, data: &[u8]);

    /// Release state after COMMIT PREPARED.
    fn post_commit(&self, rmid: keystone_types::TwoPhaseRmId, xid: Xid, info: u16, data: &[u8]);

    /// Release state after ROLLBACK PREPARED.
    fn post_abort(&self, rmid: keystone_types::TwoPhaseRmId, xid: Xid, info: u16, data: &[u8]);
}

/// The preparing backend's own transaction state: committed children and
/// files scheduled for deletion. Queried once when assembly starts.
pub trait XactSource {
    fn committed_children(&self) -> Vec<Xid>;
    fn pending_deletes(&self, at_commit: bool) -> Vec<RelFileNode>;
}

/// Everything the subsystem needs from the rest of the database.
#[derive(Clone)]
pub struct Collaborators {
    pub wal: Arc<dyn WalLog>,
    pub procarray: Arc<dyn ProcArray>,
    pub clog: Arc<dyn Clog>,
    pub storage: Arc<dyn Storage>,
    pub subtrans: Arc<dyn Subtrans>,
    pub distributed_log: Arc<dyn DistributedLog>,
    pub distributed_xact: Arc<dyn DistributedXact>,
    pub syncrep: Arc<dyn SyncRep>,
    pub wal_senders: Arc<dyn WalSenders>,
    pub stats: Arc<dyn StatsSink>,
    pub clock: Arc<dyn Clock>,
    pub rmgr: Arc<dyn RmgrTable>,
}
