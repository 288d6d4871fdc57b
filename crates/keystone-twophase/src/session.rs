//! Per-backend two-phase state.
//!
//! Each backend holds at most one locked global-transaction descriptor at a
//! time, tracked here together with the prepare-record builder and the
//! `in_commit` flag the checkpointer observes. The abort cleanup runs both
//! explicitly (error paths) and on drop (abnormal session termination):
//!
//! - nothing locked: no-op;
//! - locked entry not yet valid: the reservation never completed (or a
//!   finish failed after clearing `valid`), so the entry is recycled and
//!   its GID becomes reusable;
//! - locked entry valid: only the lock is released; the transaction remains
//!   for a later COMMIT PREPARED / ROLLBACK PREPARED retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use keystone_error::Result;
use keystone_types::{BackendId, Oid, TwoPhaseRmId, Xid};
use tracing::debug;

use crate::gxact_table::{DummyProc, SlotId};
use crate::lifecycle::TwoPhaseSubsystem;
use crate::record::PrepareRecordBuilder;

/// One-slot cache for repeated `dummy_proc_for` lookups, keyed by table
/// generation so any structural mutation invalidates it.
#[derive(Debug, Clone, Copy)]
struct ProcCache {
    xid: Xid,
    slot: SlotId,
    generation: u64,
}

/// A backend's handle on the two-phase subsystem.
pub struct BackendSession {
    subsystem: Arc<TwoPhaseSubsystem>,
    backend_id: BackendId,
    role: Oid,
    database: Oid,
    superuser: bool,
    in_commit: Arc<AtomicBool>,
    pub(crate) locked: Option<SlotId>,
    pub(crate) builder: PrepareRecordBuilder,
    cleanup_armed: bool,
    proc_cache: Option<ProcCache>,
}

impl BackendSession {
    pub(crate) fn new(
        subsystem: Arc<TwoPhaseSubsystem>,
        backend_id: BackendId,
        role: Oid,
        database: Oid,
        superuser: bool,
    ) -> Self {
        Self {
            subsystem,
            backend_id,
            role,
            database,
            superuser,
            in_commit: Arc::new(AtomicBool::new(false)),
            locked: None,
            builder: PrepareRecordBuilder::new(),
            cleanup_armed: false,
            proc_cache: None,
        }
    }

    #[must_use]
    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    #[must_use]
    pub fn role(&self) -> Oid {
        self.role
    }

    #[must_use]
    pub fn database(&self) -> Oid {
        self.database
    }

    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    /// The descriptor this backend currently holds locked, if any.
    #[must_use]
    pub fn locked_slot(&self) -> Option<SlotId> {
        self.locked
    }

    /// Shared flag the checkpointer reads to decide whether a two-phase
    /// record may still be between WAL insert and table visibility.
    #[must_use]
    pub fn in_commit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_commit)
    }

    #[must_use]
    pub fn in_commit(&self) -> bool {
        self.in_commit.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_commit(&self, on: bool) {
        self.in_commit.store(on, Ordering::Release);
    }

    /// First-use arming of the abort cleanup, mirrored by `Drop`.
    pub(crate) fn arm_cleanup(&mut self) {
        if !self.cleanup_armed {
            debug!(backend = %self.backend_id, "arming two-phase abort cleanup");
            self.cleanup_armed = true;
        }
    }

    /// Append one resource-manager sub-record to the payload under
    /// assembly. `data` may be empty.
    pub fn register_record(&mut self, rmid: TwoPhaseRmId, info: u16, data: &[u8]) {
        self.builder.register(rmid, info, data);
    }

    /// Unlock the entry after lock/state transfer to the prepared
    /// transaction is complete. The entry stays in the table, finishable by
    /// anyone authorized.
    pub fn post_prepare(&mut self) {
        let slot = self
            .locked
            .take()
            .expect("post_prepare with no locked descriptor");
        self.subsystem.table().unlock(slot);
    }

    /// Abort/exit cleanup. Safe to call at any point; idempotent.
    pub fn at_abort(&mut self) {
        let Some(slot) = self.locked.take() else {
            return;
        };
        // Mid-prepare state in the builder is garbage now either way.
        self.builder = PrepareRecordBuilder::new();

        let table = self.subsystem.table();
        if !table.snapshot_of(slot).valid {
            // Reservation never completed, or a finish already cleared
            // `valid`: the descriptor must become reusable.
            if let Err(err) = table.release_and_recycle(slot) {
                debug!(%slot, %err, "abort cleanup found descriptor already recycled");
            }
        } else {
            table.unlock(slot);
        }
        debug!(backend = %self.backend_id, %slot, "two-phase abort cleanup ran");
    }

    /// Dummy proc for a prepared `xid`, with a one-slot cache: recovery and
    /// finish paths ask for the same xid repeatedly.
    pub fn dummy_proc_for(&mut self, xid: Xid) -> Result<DummyProc> {
        let table = self.subsystem.table();
        let generation = table.generation();
        if let Some(cache) = self.proc_cache {
            if cache.xid == xid && cache.generation == generation {
                return Ok(table.proc_at(cache.slot));
            }
        }
        let (slot, proc) = table.dummy_proc_for(xid)?;
        self.proc_cache = Some(ProcCache {
            xid,
            slot,
            generation,
        });
        Ok(proc)
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        self.at_abort();
    }
}
