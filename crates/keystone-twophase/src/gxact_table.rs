//! Shared table of in-flight global transactions.
//!
//! A fixed-capacity slab of descriptors allocated once at subsystem start.
//! Two lists partition the slab at all times: the freelist and the dense
//! active array (`[0, num_active)`; removal swaps in the last element).
//! A single reader-writer lock guards structural mutation; after a
//! reservation the `locking_backend` field gives the owning backend
//! exclusive use of the descriptor's payload fields.
//!
//! Lifecycle of one descriptor:
//!
//! 1. `reserve` checks the requested GID against every active entry (valid
//!    or not), pops the freelist, and hands the entry to the caller with
//!    `valid = false` and `locking_backend` set.
//! 2. After the prepare record is durable, `mark_valid` flips `valid` and
//!    the caller inserts the dummy proc into the process array, so the XID
//!    keeps reading as in-progress.
//! 3. COMMIT PREPARED / ROLLBACK PREPARED relocks the entry through
//!    `lock_for_finish`, which rejects busy entries, foreign owners, and
//!    cross-database callers.
//! 4. `release_and_recycle` swap-removes the entry from the active array
//!    and pushes it back on the freelist.
//!
//! A reservation that fails between steps 1 and 2 must be recycled so the
//! GID becomes reusable; that is the session cleanup path.

use keystone_error::{KeystoneError, Result};
use keystone_types::limits::MAX_CACHED_SUBXIDS;
use keystone_types::{
    BackendId, DistribTimestamp, DistribXid, Gid, Lsn, Oid, TimestampTz, Xid,
};
use parking_lot::RwLock;
use tracing::debug;

// ---------------------------------------------------------------------------
// SlotId
// ---------------------------------------------------------------------------

/// Stable index of one descriptor in the slab. Slot ids never move; the
/// active array and freelist hold slot ids, not descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SlotId(u32);

impl SlotId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Dummy proc
// ---------------------------------------------------------------------------

/// Distributed-transaction state carried on a dummy proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistribXactState {
    Active,
    Prepared,
}

/// Distributed identity of a local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDistribXact {
    pub state: DistribXactState,
    pub timestamp: DistribTimestamp,
    pub xid: DistribXid,
}

impl LocalDistribXact {
    /// A purely local transaction with no distributed coordinator.
    #[must_use]
    pub const fn local_only() -> Self {
        Self {
            state: DistribXactState::Active,
            timestamp: DistribTimestamp(0),
            xid: DistribXid(0),
        }
    }
}

/// Bounded cache of committed child XIDs on a dummy proc.
///
/// Holds at most [`MAX_CACHED_SUBXIDS`] ids; beyond that the cache is marked
/// overflowed and truncated. The prepare payload always carries the full
/// list, so the cache is a fast path only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubXidCache {
    xids: Vec<Xid>,
    overflowed: bool,
}

impl SubXidCache {
    pub fn load(&mut self, children: &[Xid]) {
        self.overflowed = children.len() > MAX_CACHED_SUBXIDS;
        let keep = children.len().min(MAX_CACHED_SUBXIDS);
        self.xids.clear();
        self.xids.extend_from_slice(&children[..keep]);
    }

    #[must_use]
    pub fn xids(&self) -> &[Xid] {
        &self.xids
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.xids.len()
    }
}

/// Surrogate process entry for a prepared transaction. Inserted into the
/// process array under the descriptor's stable slot id so the XID keeps
/// reading as in-progress and locks have somewhere to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyProc {
    pub xid: Xid,
    /// Local transaction id; a prepared xact reuses its XID here.
    pub lxid: u32,
    pub database: Oid,
    pub role: Oid,
    pub distrib: LocalDistribXact,
    pub subxids: SubXidCache,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// One global-transaction descriptor. Slots on the freelist keep their
/// `dummy_backend_id` but carry stale payload fields.
#[derive(Debug, Clone)]
struct GXact {
    proc: DummyProc,
    dummy_backend_id: BackendId,
    prepared_at: TimestampTz,
    prepare_begin_lsn: Lsn,
    prepare_lsn: Lsn,
    owner: Oid,
    locking_backend: Option<BackendId>,
    valid: bool,
    gid: Gid,
    resync_intent_count: u32,
}

impl GXact {
    fn vacant(dummy_backend_id: BackendId) -> Self {
        Self {
            proc: DummyProc {
                xid: Xid::INVALID,
                lxid: 0,
                database: Oid::INVALID,
                role: Oid::INVALID,
                distrib: LocalDistribXact::local_only(),
                subxids: SubXidCache::default(),
            },
            dummy_backend_id,
            prepared_at: TimestampTz::default(),
            prepare_begin_lsn: Lsn::ZERO,
            prepare_lsn: Lsn::ZERO,
            owner: Oid::INVALID,
            locking_backend: None,
            valid: false,
            gid: Gid::new("").expect("empty gid is in bounds"),
            resync_intent_count: 0,
        }
    }
}

/// Copy of one descriptor's observable fields, taken under the shared lock.
#[derive(Debug, Clone)]
pub struct GXactSnapshot {
    pub slot: SlotId,
    pub dummy_backend_id: BackendId,
    pub xid: Xid,
    pub database: Oid,
    pub owner: Oid,
    pub prepared_at: TimestampTz,
    pub prepare_begin_lsn: Lsn,
    pub prepare_lsn: Lsn,
    pub locking_backend: Option<BackendId>,
    pub valid: bool,
    pub gid: Gid,
    pub resync_intent_count: u32,
    pub subxid_count: usize,
    pub subxids_overflowed: bool,
}

impl GXactSnapshot {
    fn of(slot: SlotId, gxact: &GXact) -> Self {
        Self {
            slot,
            dummy_backend_id: gxact.dummy_backend_id,
            xid: gxact.proc.xid,
            database: gxact.proc.database,
            owner: gxact.owner,
            prepared_at: gxact.prepared_at,
            prepare_begin_lsn: gxact.prepare_begin_lsn,
            prepare_lsn: gxact.prepare_lsn,
            locking_backend: gxact.locking_backend,
            valid: gxact.valid,
            gid: gxact.gid.clone(),
            resync_intent_count: gxact.resync_intent_count,
            subxid_count: gxact.proc.subxids.count(),
            subxids_overflowed: gxact.proc.subxids.overflowed(),
        }
    }
}

/// One row of the prepared-transactions view. Only `valid` entries produce
/// rows; reservations still in flight are filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedXactRow {
    pub transaction: Xid,
    pub gid: Gid,
    pub prepared: TimestampTz,
    pub ownerid: Oid,
    pub dbid: Oid,
}

// ---------------------------------------------------------------------------
// GXactTable
// ---------------------------------------------------------------------------

struct TableInner {
    slots: Vec<GXact>,
    free: Vec<SlotId>,
    active: Vec<SlotId>,
    /// Bumped on every structural mutation; feeds the per-backend one-slot
    /// `dummy_proc_for` cache.
    generation: u64,
}

/// The shared global-transaction table.
pub struct GXactTable {
    inner: RwLock<TableInner>,
    max_prepared: usize,
}

impl GXactTable {
    /// Allocate the slab. Dummy backend ids are assigned here, immediately
    /// after the real-backend range, and never change.
    #[must_use]
    pub fn new(max_prepared: usize, max_real_backends: u32) -> Self {
        let mut slots = Vec::with_capacity(max_prepared);
        let mut free = Vec::with_capacity(max_prepared);
        for i in 0..max_prepared {
            let id = BackendId::new(max_real_backends + 1 + i as u32)
                .expect("dummy backend ids start at max_real_backends + 1");
            slots.push(GXact::vacant(id));
            free.push(SlotId(i as u32));
        }
        Self {
            inner: RwLock::new(TableInner {
                slots,
                free,
                active: Vec::with_capacity(max_prepared),
                generation: 0,
            }),
            max_prepared,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_prepared
    }

    /// `(free, active)` slot counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.free.len(), inner.active.len())
    }

    /// Structural-mutation counter; any change invalidates cached lookups.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Reserve `gid` for `xid`: the first step of PREPARE and of recovery
    /// reload. The entry comes back locked by `backend` and not yet valid.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        &self,
        backend: BackendId,
        xid: Xid,
        distrib: LocalDistribXact,
        gid: &Gid,
        prepared_at: TimestampTz,
        owner: Oid,
        database: Oid,
        prepare_begin_lsn: Lsn,
    ) -> Result<SlotId> {
        let mut inner = self.inner.write();

        // GID uniqueness is checked against every active entry, including
        // reservations that have not reached valid yet.
        for &slot in &inner.active {
            if inner.slots[slot.index()].gid == *gid {
                return Err(KeystoneError::DuplicateIdentifier {
                    gid: gid.as_str().to_owned(),
                });
            }
        }

        let Some(slot) = inner.free.pop() else {
            return Err(KeystoneError::TableFull {
                max: self.max_prepared,
            });
        };

        let gxact = &mut inner.slots[slot.index()];
        gxact.proc = DummyProc {
            xid,
            lxid: xid.raw(),
            database,
            role: owner,
            distrib,
            subxids: SubXidCache::default(),
        };
        gxact.prepared_at = prepared_at;
        gxact.prepare_begin_lsn = prepare_begin_lsn;
        gxact.prepare_lsn = Lsn::ZERO;
        gxact.owner = owner;
        gxact.locking_backend = Some(backend);
        gxact.valid = false;
        gxact.gid = gid.clone();
        gxact.resync_intent_count = 0;

        inner.active.push(slot);
        inner.generation += 1;
        debug!(%slot, %xid, gid = %gid, "reserved global transaction");
        Ok(slot)
    }

    /// Stash the committed-children list in the dummy proc. Must run before
    /// `mark_valid`; the entry is still private to the reserving backend, so
    /// no extra synchronization is implied beyond the table lock.
    pub fn load_subxacts(&self, slot: SlotId, children: &[Xid]) {
        let mut inner = self.inner.write();
        inner.slots[slot.index()].proc.subxids.load(children);
    }

    /// Record where the prepare record landed in the WAL.
    pub fn set_prepare_lsns(&self, slot: SlotId, begin: Lsn, end: Lsn) {
        let mut inner = self.inner.write();
        let gxact = &mut inner.slots[slot.index()];
        gxact.prepare_begin_lsn = begin;
        gxact.prepare_lsn = end;
    }

    /// Flip the entry to valid and transition its distributed state to
    /// PREPARED. Returns a copy of the dummy proc for the caller to insert
    /// into the process array; the insert must happen before the caller
    /// stops advertising the XID under its own process entry.
    pub fn mark_valid(&self, slot: SlotId) -> DummyProc {
        let mut inner = self.inner.write();
        let gxact = &mut inner.slots[slot.index()];
        assert!(!gxact.valid, "descriptor marked valid twice");
        gxact.valid = true;
        gxact.proc.distrib.state = DistribXactState::Prepared;
        debug!(%slot, gid = %gxact.gid, "marked global transaction valid");
        gxact.proc.clone()
    }

    /// Clear `valid` on an entry the caller holds locked. Once cleared,
    /// nobody else will try to finish it and a failure from here on leaves
    /// it recyclable by the session cleanup path.
    pub fn clear_valid(&self, slot: SlotId) {
        let mut inner = self.inner.write();
        inner.slots[slot.index()].valid = false;
    }

    /// Locate the valid entry for `gid` and lock it for COMMIT PREPARED or
    /// ROLLBACK PREPARED. `Ok(None)` means no such GID; every other refusal
    /// is an error that leaves the table unchanged.
    pub fn lock_for_finish(
        &self,
        gid: &Gid,
        backend: BackendId,
        caller_role: Oid,
        caller_is_superuser: bool,
        caller_database: Oid,
        coordinator_execute_mode: bool,
    ) -> Result<Option<GXactSnapshot>> {
        let mut inner = self.inner.write();
        let Some(&slot) = inner.active.iter().find(|&&slot| {
            let gxact = &inner.slots[slot.index()];
            gxact.valid && gxact.gid == *gid
        }) else {
            return Ok(None);
        };

        let gxact = &mut inner.slots[slot.index()];
        if gxact.locking_backend.is_some() {
            return Err(KeystoneError::TransactionBusy {
                gid: gid.as_str().to_owned(),
            });
        }
        if caller_role != gxact.owner && !caller_is_superuser {
            return Err(KeystoneError::NotOwner);
        }
        if caller_database != gxact.proc.database && !coordinator_execute_mode {
            return Err(KeystoneError::ForeignDatabase);
        }

        gxact.locking_backend = Some(backend);
        debug!(%slot, gid = %gid, backend = %backend, "locked global transaction for finish");
        Ok(Some(GXactSnapshot::of(slot, gxact)))
    }

    /// Locate an entry by GID regardless of validity. Only the backend that
    /// reserved the entry may use this during its own prepare window.
    pub fn find(&self, gid: &Gid) -> Result<SlotId> {
        let inner = self.inner.read();
        inner
            .active
            .iter()
            .find(|&&slot| inner.slots[slot.index()].gid == *gid)
            .copied()
            .ok_or_else(|| KeystoneError::UnknownIdentifier {
                gid: gid.as_str().to_owned(),
            })
    }

    /// Clear `locking_backend` on an entry, leaving it for a later retry.
    pub fn unlock(&self, slot: SlotId) {
        let mut inner = self.inner.write();
        inner.slots[slot.index()].locking_backend = None;
    }

    /// Return a descriptor to the freelist. The caller must already have
    /// removed the dummy proc from the process array.
    pub fn release_and_recycle(&self, slot: SlotId) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(pos) = inner.active.iter().position(|&s| s == slot) else {
            return Err(KeystoneError::Internal {
                detail: format!("slot {slot} not in the active array"),
            });
        };
        inner.active.swap_remove(pos);
        let gxact = &mut inner.slots[slot.index()];
        gxact.valid = false;
        gxact.locking_backend = None;
        inner.free.push(slot);
        inner.generation += 1;
        debug!(%slot, "recycled global transaction descriptor");
        Ok(())
    }

    /// Copy of one descriptor's observable fields.
    #[must_use]
    pub fn snapshot_of(&self, slot: SlotId) -> GXactSnapshot {
        let inner = self.inner.read();
        GXactSnapshot::of(slot, &inner.slots[slot.index()])
    }

    /// Copies of every active descriptor, taken under the shared lock.
    /// Includes entries that are not fully prepared yet; callers that only
    /// want durable ones must filter on `valid`.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<GXactSnapshot> {
        let inner = self.inner.read();
        inner
            .active
            .iter()
            .map(|&slot| GXactSnapshot::of(slot, &inner.slots[slot.index()]))
            .collect()
    }

    /// View rows, one per valid entry.
    #[must_use]
    pub fn prepared_rows(&self) -> Vec<PreparedXactRow> {
        let inner = self.inner.read();
        inner
            .active
            .iter()
            .filter_map(|&slot| {
                let gxact = &inner.slots[slot.index()];
                gxact.valid.then(|| PreparedXactRow {
                    transaction: gxact.proc.xid,
                    gid: gxact.gid.clone(),
                    prepared: gxact.prepared_at,
                    ownerid: gxact.owner,
                    dbid: gxact.proc.database,
                })
            })
            .collect()
    }

    /// Find the dummy proc representing `xid`. An absent xid is an internal
    /// error: callers only ask about xids they know to be prepared.
    pub fn dummy_proc_for(&self, xid: Xid) -> Result<(SlotId, DummyProc)> {
        let inner = self.inner.read();
        for &slot in &inner.active {
            let gxact = &inner.slots[slot.index()];
            if gxact.proc.xid == xid {
                return Ok((slot, gxact.proc.clone()));
            }
        }
        Err(KeystoneError::Internal {
            detail: format!(
                "failed to find dummy proc for xid {xid} ({} entries)",
                inner.active.len()
            ),
        })
    }

    /// Direct proc read for a slot already located via `dummy_proc_for`.
    #[must_use]
    pub fn proc_at(&self, slot: SlotId) -> DummyProc {
        self.inner.read().slots[slot.index()].proc.clone()
    }

    /// Dummy backend id for the prepared transaction holding `xid`.
    pub fn dummy_backend_id_for(&self, xid: Xid) -> Result<BackendId> {
        let (slot, _) = self.dummy_proc_for(xid)?;
        Ok(self.inner.read().slots[slot.index()].dummy_backend_id)
    }

    /// Note a pending append-only resync that must wait for this prepared
    /// transaction to resolve.
    pub fn incr_resync_intent(&self, gid: &Gid) -> Result<()> {
        let slot = self.find(gid)?;
        let mut inner = self.inner.write();
        inner.slots[slot.index()].resync_intent_count += 1;
        Ok(())
    }

    /// Drop one pending resync intent. The counter must stay non-negative.
    pub fn decr_resync_intent(&self, gid: &Gid) -> Result<()> {
        let slot = self.find(gid)?;
        let mut inner = self.inner.write();
        let count = &mut inner.slots[slot.index()].resync_intent_count;
        assert!(*count >= 1, "resync intent count would go negative");
        *count -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(capacity: usize) -> GXactTable {
        GXactTable::new(capacity, 100)
    }

    fn backend(raw: u32) -> BackendId {
        BackendId::new(raw).expect("nonzero backend id")
    }

    fn reserve(
        table: &GXactTable,
        backend_id: u32,
        xid: u32,
        gid: &str,
    ) -> Result<SlotId> {
        table.reserve(
            backend(backend_id),
            Xid::new(xid),
            LocalDistribXact::local_only(),
            &Gid::new(gid).expect("valid gid"),
            TimestampTz::from_micros(1),
            Oid::new(10),
            Oid::new(16384),
            Lsn::ZERO,
        )
    }

    #[test]
    fn test_duplicate_gid_is_rejected() {
        let table = table(4);
        reserve(&table, 1, 100, "tx-A").expect("first reservation");
        let err = reserve(&table, 2, 101, "tx-A").expect_err("duplicate");
        assert_eq!(err.condition(), "duplicate_object");
        assert_eq!(table.counts(), (3, 1));
    }

    #[test]
    fn test_exhaustion_and_recycle() {
        let table = table(2);
        let a = reserve(&table, 1, 100, "tx-A").expect("slot");
        reserve(&table, 1, 101, "tx-B").expect("slot");
        let err = reserve(&table, 1, 102, "tx-C").expect_err("full");
        assert_eq!(err.condition(), "out_of_memory");

        table.release_and_recycle(a).expect("recycle");
        reserve(&table, 1, 102, "tx-C").expect("slot freed");
        assert_eq!(table.counts(), (0, 2));
    }

    #[test]
    fn test_dummy_backend_ids_follow_real_range() {
        let table = GXactTable::new(3, 100);
        let slot = reserve(&table, 1, 100, "tx-A").expect("slot");
        let id = table.snapshot_of(slot).dummy_backend_id.get();
        assert!(id > 100 && id <= 103, "id {id} outside dummy range");
        assert_eq!(
            table.dummy_backend_id_for(Xid::new(100)).expect("by xid").get(),
            id
        );
    }

    #[test]
    fn test_lock_for_finish_skips_invalid_entries() {
        let table = table(2);
        let gid = Gid::new("tx-A").expect("valid gid");
        reserve(&table, 1, 100, "tx-A").expect("slot");
        // Not yet valid: finish must not see it.
        let found = table
            .lock_for_finish(&gid, backend(2), Oid::new(10), false, Oid::new(16384), false)
            .expect("no error");
        assert!(found.is_none());
    }

    #[test]
    fn test_lock_for_finish_checks_owner_and_database() {
        let table = table(2);
        let gid = Gid::new("tx-A").expect("valid gid");
        let slot = reserve(&table, 1, 100, "tx-A").expect("slot");
        table.mark_valid(slot);
        table.unlock(slot);

        let err = table
            .lock_for_finish(&gid, backend(2), Oid::new(11), false, Oid::new(16384), false)
            .expect_err("wrong role");
        assert_eq!(err.condition(), "insufficient_privilege");

        let err = table
            .lock_for_finish(&gid, backend(2), Oid::new(10), false, Oid::new(1), false)
            .expect_err("wrong database");
        assert_eq!(err.condition(), "feature_not_supported");

        // Coordinator-executor mode waives the database check; superuser
        // waives the role check.
        let snap = table
            .lock_for_finish(&gid, backend(2), Oid::new(99), true, Oid::new(1), true)
            .expect("lockable")
            .expect("found");
        assert_eq!(snap.xid, Xid::new(100));
    }

    #[test]
    fn test_lock_for_finish_rejects_busy_entries() {
        let table = table(2);
        let gid = Gid::new("tx-A").expect("valid gid");
        let slot = reserve(&table, 1, 100, "tx-A").expect("slot");
        table.mark_valid(slot);
        table.unlock(slot);

        table
            .lock_for_finish(&gid, backend(2), Oid::new(10), false, Oid::new(16384), false)
            .expect("first locker")
            .expect("found");
        let err = table
            .lock_for_finish(&gid, backend(3), Oid::new(10), false, Oid::new(16384), false)
            .expect_err("busy");
        assert_eq!(err.condition(), "object_not_in_prerequisite_state");
    }

    #[test]
    fn test_find_sees_invalid_reservations() {
        let table = table(2);
        let gid = Gid::new("tx-A").expect("valid gid");
        let slot = reserve(&table, 1, 100, "tx-A").expect("slot");
        assert_eq!(table.find(&gid).expect("found"), slot);

        let missing = Gid::new("tx-Z").expect("valid gid");
        let err = table.find(&missing).expect_err("absent");
        assert_eq!(err.condition(), "undefined_object");
    }

    #[test]
    fn test_prepared_rows_filter_invalid() {
        let table = table(4);
        let a = reserve(&table, 1, 100, "tx-A").expect("slot");
        reserve(&table, 1, 101, "tx-B").expect("slot");
        table.mark_valid(a);

        let rows = table.prepared_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transaction, Xid::new(100));
        assert_eq!(rows[0].gid.as_str(), "tx-A");
    }

    #[test]
    fn test_dummy_proc_lookup_and_generation() {
        let table = table(2);
        let slot = reserve(&table, 1, 100, "tx-A").expect("slot");
        table.load_subxacts(slot, &[Xid::new(101)]);
        let gen_before = table.generation();

        let (found, proc) = table.dummy_proc_for(Xid::new(100)).expect("present");
        assert_eq!(found, slot);
        assert_eq!(proc.subxids.xids(), &[Xid::new(101)]);
        assert_eq!(table.generation(), gen_before);

        table.release_and_recycle(slot).expect("recycle");
        assert!(table.generation() > gen_before);
        assert!(table.dummy_proc_for(Xid::new(100)).is_err());
    }

    #[test]
    fn test_subxid_cache_overflow() {
        let children: Vec<Xid> =
            (0..MAX_CACHED_SUBXIDS as u32 + 5).map(|i| Xid::new(200 + i)).collect();
        let mut cache = SubXidCache::default();
        cache.load(&children);
        assert!(cache.overflowed());
        assert_eq!(cache.count(), MAX_CACHED_SUBXIDS);
    }

    #[test]
    fn test_resync_intents() {
        let table = table(2);
        let gid = Gid::new("tx-A").expect("valid gid");
        let slot = reserve(&table, 1, 100, "tx-A").expect("slot");
        table.incr_resync_intent(&gid).expect("incr");
        table.incr_resync_intent(&gid).expect("incr");
        assert_eq!(table.snapshot_of(slot).resync_intent_count, 2);
        table.decr_resync_intent(&gid).expect("decr");
        assert_eq!(table.snapshot_of(slot).resync_intent_count, 1);
    }

    proptest! {
        /// The freelist and the active array partition the slab after any
        /// sequence of reservations and releases, and the active array stays
        /// dense.
        #[test]
        fn prop_freelist_active_partition(ops in proptest::collection::vec(0_u8..4, 1..80)) {
            let capacity = 8;
            let table = table(capacity);
            let mut next_xid = 100_u32;

            for op in ops {
                if op < 3 {
                    let gid = format!("tx-{next_xid}");
                    let _ = reserve(&table, 1, next_xid, &gid);
                    next_xid += 1;
                } else {
                    let active = table.snapshot_all();
                    if let Some(snap) = active.first() {
                        table.release_and_recycle(snap.slot).expect("active slot recycles");
                    }
                }

                let inner = table.inner.read();
                prop_assert_eq!(inner.free.len() + inner.active.len(), capacity);
                let mut seen: Vec<u32> = inner
                    .free
                    .iter()
                    .chain(inner.active.iter())
                    .map(|s| s.0)
                    .collect();
                seen.sort_unstable();
                seen.dedup();
                prop_assert_eq!(seen.len(), capacity);
            }
        }
    }
}
