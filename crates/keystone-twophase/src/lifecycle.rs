//! Prepare/finish state machine.
//!
//! From the calling backend's view one descriptor moves through:
//!
//! ```text
//! [none] --mark_as_preparing--> RESERVED/locked --abort--> [none]
//! RESERVED/locked --end_prepare--> PREPARED/locked
//! PREPARED/locked --post_prepare--> PREPARED/unlocked
//! PREPARED/unlocked --finish_prepared--> [none]
//! ```
//!
//! Ordering is the whole point. On prepare: the post-checkpoint index must
//! learn the record's location before the WAL flush, so a checkpoint racing
//! past the insert still finds the record; the dummy proc must enter the
//! process array before the caller stops advertising the XID itself, so no
//! observer sees the XID as neither-running-nor-prepared. On finish: WAL
//! record, then clog, then process-array removal, then file unlinks, then
//! resource-manager callbacks; a crash between any two of these replays to
//! the same outcome.
//!
//! Between entering a critical section and leaving it, every failure is a
//! process panic: the durable state is already ahead of shared memory and
//! there is nothing sane to roll back to.

use std::sync::Arc;

use keystone_error::{KeystoneError, Result};
use keystone_types::{ForkNumber, Gid, Lsn, Oid, RelFileNode, TimestampTz, Xid};
use tracing::{debug, error, info, warn};

use crate::checkpoint::PostCheckpointMap;
use crate::collab::{Collaborators, XactSource};
use crate::config::TwoPhaseConfig;
use crate::gxact_table::{GXactTable, LocalDistribXact, PreparedXactRow, SlotId};
use crate::record::{
    AbortPreparedRecord, CommitPreparedRecord, PrepareHeader, PreparePayload, XactWalKind,
};
use crate::session::BackendSession;

/// Unwrap a collaborator result inside a critical section; failure is
/// unrecoverable because durable state already moved.
fn critical<T>(what: &'static str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!(%err, what, "failure inside two-phase critical section");
            panic!("two-phase critical section failed: {what}: {err}");
        }
    }
}

/// The two-phase-commit subsystem: configuration, the shared descriptor
/// table, the post-checkpoint index, and the collaborator bundle.
pub struct TwoPhaseSubsystem {
    config: TwoPhaseConfig,
    table: GXactTable,
    post_checkpoint: PostCheckpointMap,
    collab: Collaborators,
}

impl TwoPhaseSubsystem {
    #[must_use]
    pub fn new(config: TwoPhaseConfig, collab: Collaborators) -> Arc<Self> {
        let table = GXactTable::new(config.max_prepared, config.max_real_backends);
        Arc::new(Self {
            config,
            table,
            post_checkpoint: PostCheckpointMap::new(),
            collab,
        })
    }

    /// Open a backend's handle on the subsystem.
    #[must_use]
    pub fn begin_session(
        self: &Arc<Self>,
        backend_id: keystone_types::BackendId,
        role: Oid,
        database: Oid,
        superuser: bool,
    ) -> BackendSession {
        BackendSession::new(Arc::clone(self), backend_id, role, database, superuser)
    }

    #[must_use]
    pub fn config(&self) -> &TwoPhaseConfig {
        &self.config
    }

    #[must_use]
    pub fn table(&self) -> &GXactTable {
        &self.table
    }

    #[must_use]
    pub fn post_checkpoint(&self) -> &PostCheckpointMap {
        &self.post_checkpoint
    }

    #[must_use]
    pub(crate) fn collab(&self) -> &Collaborators {
        &self.collab
    }

    // -----------------------------------------------------------------------
    // Prepare
    // -----------------------------------------------------------------------

    /// Reserve `gid` for `xid`. Also the reload path during recovery, which
    /// passes the known `prepare_begin_lsn`; avoid assuming backend context
    /// beyond the session itself.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_as_preparing(
        &self,
        session: &mut BackendSession,
        xid: Xid,
        distrib: LocalDistribXact,
        gid: &str,
        prepared_at: TimestampTz,
        owner: Oid,
        database: Oid,
        prepare_begin_lsn: Option<Lsn>,
    ) -> Result<SlotId> {
        session.arm_cleanup();

        let gid = Gid::new(gid).map_err(|err| KeystoneError::IdentifierTooLong {
            gid: gid.to_owned(),
            len: err.len,
            max: err.max,
        })?;
        if !self.config.enabled() {
            return Err(KeystoneError::PreparedDisabled);
        }

        let slot = self.table.reserve(
            session.backend_id(),
            xid,
            distrib,
            &gid,
            prepared_at,
            owner,
            database,
            prepare_begin_lsn.unwrap_or(Lsn::ZERO),
        )?;

        // Remember the locked entry; if we abort after this point the
        // cleanup hook must release it.
        session.locked = Some(slot);
        Ok(slot)
    }

    /// Begin payload assembly: header plus the subxact and pending-delete
    /// arrays pulled from the backend's transaction state. The child list
    /// is stashed in the dummy proc at the same time.
    pub fn start_prepare(
        &self,
        session: &mut BackendSession,
        source: &dyn XactSource,
    ) -> Result<()> {
        let slot = session.locked.ok_or_else(|| KeystoneError::Internal {
            detail: "start_prepare with no reserved descriptor".to_owned(),
        })?;
        let snap = self.table.snapshot_of(slot);

        let children = source.committed_children();
        let commit_rels = source.pending_deletes(true);
        let abort_rels = source.pending_deletes(false);

        let header = PrepareHeader {
            total_len: 0,
            xid: snap.xid,
            database: snap.database,
            prepared_at: snap.prepared_at,
            owner: snap.owner,
            nsubxacts: 0,
            ncommit_rels: 0,
            nabort_rels: 0,
            gid: snap.gid,
        };
        session
            .builder
            .start(&header, &children, &commit_rels, &abort_rels);
        self.table.load_subxacts(slot, &children);
        Ok(())
    }

    /// Make the transaction durably prepared: seal the payload, write and
    /// flush it, publish the entry, hand the lock back to the session.
    pub fn end_prepare(&self, session: &mut BackendSession) -> Result<()> {
        let slot = session.locked.ok_or_else(|| KeystoneError::Internal {
            detail: "end_prepare with no reserved descriptor".to_owned(),
        })?;

        // Oversize payloads must fail here, while the error is still
        // recoverable, not at finish time.
        let payload = session.builder.finish()?;

        // --- critical section -------------------------------------------
        // in_commit keeps a checkpoint that starts after our WAL insert
        // from completing without covering this record.
        session.set_in_commit(true);

        let end_lsn = critical(
            "insert prepare record",
            self.collab.wal.insert(XactWalKind::Prepare, &payload),
        );
        let begin_lsn = self.collab.wal.last_insert_begin_lsn();
        self.table.set_prepare_lsns(slot, begin_lsn, end_lsn);

        let snap = self.table.snapshot_of(slot);
        self.post_checkpoint.insert(snap.xid, begin_lsn);

        critical("flush prepare record", self.collab.wal.flush(end_lsn));
        if self.config.wal_senders > 0 {
            self.collab.wal_senders.wakeup();
        }

        // If we crash now, we have prepared: replay fixes things up.
        if self.config.debug_abort_after_prepare {
            panic!("panic after prepare flush as directed by debug_abort_after_prepare");
        }

        // Publish the entry before the caller stops advertising the XID
        // under its own proc: the XID may briefly appear twice in the
        // process array, never zero times.
        let proc = self.table.mark_valid(slot);
        self.collab.procarray.add(slot, &proc);

        // The entry survives the critical section still locked by us so the
        // cleanup hook knows to unlock rather than recycle it.
        session.locked = Some(slot);

        session.set_in_commit(false);
        // --- end critical section ----------------------------------------

        self.collab.syncrep.wait_for_lsn(end_lsn);
        debug!(xid = %snap.xid, gid = %snap.gid, %begin_lsn, %end_lsn, "prepared global transaction");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finish
    // -----------------------------------------------------------------------

    /// Execute COMMIT PREPARED (`is_commit`) or ROLLBACK PREPARED.
    ///
    /// Returns `false` only when `raise_if_missing` is off and no such GID
    /// exists; every other outcome is `true` or an error/panic.
    pub fn finish_prepared(
        &self,
        session: &mut BackendSession,
        gid: &str,
        is_commit: bool,
        raise_if_missing: bool,
    ) -> Result<bool> {
        session.arm_cleanup();

        // An over-long identifier cannot name any entry.
        let Ok(gid) = Gid::new(gid) else {
            if raise_if_missing {
                return Err(KeystoneError::UnknownIdentifier {
                    gid: gid.to_owned(),
                });
            }
            return Ok(false);
        };

        let Some(snap) = self.table.lock_for_finish(
            &gid,
            session.backend_id(),
            session.role(),
            session.is_superuser(),
            session.database(),
            self.config.coordinator_execute_mode,
        )?
        else {
            if raise_if_missing {
                return Err(KeystoneError::UnknownIdentifier {
                    gid: gid.as_str().to_owned(),
                });
            }
            return Ok(false);
        };
        session.locked = Some(snap.slot);
        let xid = snap.xid;
        debug!(%xid, gid = %gid, is_commit, "finishing prepared transaction");

        // Read the prepare payload back from the WAL. An unreadable record
        // means this primary cannot resolve the transaction at all.
        let bytes = self
            .collab
            .wal
            .read_record(snap.prepare_begin_lsn)
            .map_err(|err| {
                warn!(%xid, lsn = %snap.prepare_begin_lsn, %err,
                      "prepare record unreadable; failover to a healthy mirror requested");
                KeystoneError::CorruptStateRecord {
                    detail: format!(
                        "prepare record for transaction {xid} at {} is unreadable: {err}",
                        snap.prepare_begin_lsn
                    ),
                }
            })?;
        let payload = PreparePayload::parse(bytes).map_err(|err| {
            warn!(%xid, %err, "prepare record malformed; failover to a healthy mirror requested");
            err
        })?;
        if payload.header.xid != xid {
            return Err(KeystoneError::CorruptStateRecord {
                detail: format!(
                    "prepare record xid mismatch: table has {xid}, record has {}",
                    payload.header.xid
                ),
            });
        }
        let latest_xid = xid.latest(&payload.subxacts);

        // --- critical section -------------------------------------------
        session.set_in_commit(true);

        let finish_lsn = if is_commit {
            self.record_commit_prepared(xid, &gid, &payload.subxacts, &payload.commit_rels)
        } else {
            self.record_abort_prepared(xid, &payload.subxacts, &payload.abort_rels)
        };

        // The XID stops reading as in-progress from here.
        self.collab.procarray.remove(snap.slot, latest_xid);

        // Still locked by us, so no lock is needed: mark invalid so nobody
        // retries this entry and a failure below leaves it recyclable.
        self.table.clear_valid(snap.slot);

        // Drop files before releasing locks, matching the single-phase
        // commit path.
        let delrels = if is_commit {
            &payload.commit_rels
        } else {
            &payload.abort_rels
        };
        for rel in delrels {
            let handle = self.collab.storage.open(*rel);
            for fork in ForkNumber::ALL {
                critical(
                    "unlink relation fork",
                    self.collab.storage.unlink(handle, fork),
                );
            }
            self.collab.storage.close(handle);
        }

        for record in payload.rmgr_records() {
            let record = critical("walk rmgr sub-records", record);
            if is_commit {
                self.collab
                    .rmgr
                    .post_commit(record.rmid, xid, record.info, record.data);
            } else {
                self.collab
                    .rmgr
                    .post_abort(record.rmid, xid, record.info, record.data);
            }
        }

        self.collab.stats.xact_finished(is_commit);
        self.post_checkpoint.remove(xid);
        critical(
            "recycle finished descriptor",
            self.table.release_and_recycle(snap.slot),
        );
        session.locked = None;

        session.set_in_commit(false);
        // --- end critical section ----------------------------------------

        self.collab.syncrep.wait_for_lsn(finish_lsn);
        info!(%xid, gid = %gid, is_commit, "finished prepared transaction");
        Ok(true)
    }

    /// Emit and flush the commit-prepared record, then mark the distributed
    /// and local commit trees. Runs inside the finish critical section;
    /// failures panic.
    fn record_commit_prepared(
        &self,
        xid: Xid,
        gid: &Gid,
        children: &[Xid],
        rels: &[RelFileNode],
    ) -> Lsn {
        let (timestamp, distrib_xid) = critical(
            "crack distributed identity out of gid",
            self.collab.distributed_xact.crack_gid(gid),
        );
        let record = CommitPreparedRecord {
            xid,
            distrib_timestamp: timestamp,
            distrib_xid,
            commit_time: self.collab.clock.now(),
            rels: rels.to_vec(),
            subxacts: children.to_vec(),
        };
        let lsn = critical(
            "insert commit-prepared record",
            self.collab
                .wal
                .insert(XactWalKind::CommitPrepared, &record.encode()),
        );
        critical("flush commit-prepared record", self.collab.wal.flush(lsn));
        if self.config.wal_senders > 0 {
            self.collab.wal_senders.wakeup();
        }

        // Distributed tree first, then the local clog tree.
        self.collab
            .distributed_log
            .set_committed_tree(xid, children, timestamp, distrib_xid, false);
        self.collab.clog.commit_tree(xid, children);
        lsn
    }

    /// Emit and flush the abort-prepared record and mark the tree aborted.
    /// Runs inside the finish critical section; failures panic.
    fn record_abort_prepared(&self, xid: Xid, children: &[Xid], rels: &[RelFileNode]) -> Lsn {
        // Catch an abort arriving after a commit already went durable.
        if self.collab.clog.did_commit(xid) {
            error!(%xid, "attempted to abort an already-committed prepared transaction");
            panic!("cannot abort transaction {xid}, it was already committed");
        }

        let record = AbortPreparedRecord {
            xid,
            abort_time: self.collab.clock.now(),
            rels: rels.to_vec(),
            subxacts: children.to_vec(),
        };
        let lsn = critical(
            "insert abort-prepared record",
            self.collab
                .wal
                .insert(XactWalKind::AbortPrepared, &record.encode()),
        );
        critical("flush abort-prepared record", self.collab.wal.flush(lsn));
        if self.config.wal_senders > 0 {
            self.collab.wal_senders.wakeup();
        }
        self.collab.clog.abort_tree(xid, children);
        lsn
    }

    // -----------------------------------------------------------------------
    // Reporting and resync intents
    // -----------------------------------------------------------------------

    /// One row per fully-prepared transaction.
    #[must_use]
    pub fn prepared_xacts(&self) -> Vec<PreparedXactRow> {
        self.table.prepared_rows()
    }

    /// Delay storage resync for the prepared transaction named by `gid`.
    pub fn incr_resync_intent(&self, gid: &str) -> Result<()> {
        let gid = Gid::new(gid).map_err(|err| KeystoneError::IdentifierTooLong {
            gid: gid.to_owned(),
            len: err.len,
            max: err.max,
        })?;
        self.table.incr_resync_intent(&gid)
    }

    /// Release one delayed-resync intent.
    pub fn decr_resync_intent(&self, gid: &str) -> Result<()> {
        let gid = Gid::new(gid).map_err(|err| KeystoneError::IdentifierTooLong {
            gid: gid.to_owned(),
            len: err.len,
            max: err.max,
        })?;
        self.table.decr_resync_intent(&gid)
    }
}
