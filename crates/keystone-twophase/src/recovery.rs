//! Startup recovery driver.
//!
//! Runs once after WAL replay, before user connections are admitted. The
//! post-checkpoint index has already been populated from the checkpoint
//! payload and from replayed prepare records; the driver walks it twice:
//!
//! 1. **Prescan**: determine the oldest prepared XID still unresolved (to
//!    anchor subtransaction-map truncation) and push the next-xid cursor
//!    past every subxact id, since subxact assignment leaves no WAL of its
//!    own and those ids must never be reissued.
//! 2. **Recover**: rebuild a table entry per record, with subxact parents
//!    flattened onto the top-level xid, distributed identity cracked out of
//!    the GID, the dummy proc published, and resource-manager state
//!    replayed.
//!
//! Recovered entries keep `prepare_lsn` zero; they merely get re-covered by
//! every future checkpoint, which is harmless.

use keystone_error::Result;
use keystone_types::Xid;
use tracing::{debug, info};

use crate::gxact_table::{DistribXactState, LocalDistribXact};
use crate::lifecycle::TwoPhaseSubsystem;
use crate::record::PreparePayload;
use crate::session::BackendSession;

impl TwoPhaseSubsystem {
    /// Walk every known prepare record and fold the still-unresolved ones
    /// into the oldest-in-progress minimum, advancing `next_xid` past any
    /// subxact id found. Returns the oldest prepared XID, or the incoming
    /// `next_xid` when none is pending.
    pub fn prescan(&self, next_xid: &mut Xid) -> Result<Xid> {
        let mut oldest = *next_xid;

        for (_, lsn) in self.post_checkpoint().entries() {
            let bytes = self.collab().wal.read_record(lsn)?;
            let payload = PreparePayload::parse(bytes)?;
            let xid = payload.header.xid;

            if self.collab().clog.did_commit(xid) || self.collab().clog.did_abort(xid) {
                continue;
            }

            if xid.precedes(oldest) {
                oldest = xid;
            }

            // Subxact ids all follow the main xid; none of them may ever be
            // handed out again.
            for &subxid in &payload.subxacts {
                debug_assert!(subxid.follows(xid), "subxact id precedes its parent");
                if subxid.follows_or_equals(*next_xid) {
                    *next_xid = subxid.advance();
                }
            }
        }

        debug!(oldest = %oldest, next = %next_xid, "prescanned prepared transactions");
        Ok(oldest)
    }

    /// Rebuild the shared table from the post-checkpoint index. `session`
    /// is the startup process's handle; every rebuilt entry is unlocked
    /// before moving on so any authorized backend can finish it later.
    pub fn recover(&self, session: &mut BackendSession) -> Result<()> {
        for (_, lsn) in self.post_checkpoint().entries() {
            let bytes = self.collab().wal.read_record(lsn)?;
            let payload = PreparePayload::parse(bytes)?;
            let xid = payload.header.xid;
            info!(%xid, gid = %payload.header.gid, "recovering prepared transaction");

            // The original hierarchy is not preserved: every child links
            // directly to the top-level xid.
            for &subxid in &payload.subxacts {
                self.collab().subtrans.set_parent(subxid, xid);
            }

            let (timestamp, distrib_xid) = self
                .collab()
                .distributed_xact
                .crack_gid(&payload.header.gid)?;
            let distrib = LocalDistribXact {
                state: DistribXactState::Active,
                timestamp,
                xid: distrib_xid,
            };

            // prepare_lsn stays zero here; only the begin location is known
            // and that is all finishing needs.
            let slot = self.mark_as_preparing(
                session,
                xid,
                distrib,
                payload.header.gid.as_str(),
                payload.header.prepared_at,
                payload.header.owner,
                payload.header.database,
                Some(lsn),
            )?;
            self.table().load_subxacts(slot, &payload.subxacts);

            let proc = self.table().mark_valid(slot);
            self.collab().procarray.add(slot, &proc);

            // Re-acquire locks and other per-xact state.
            for record in payload.rmgr_records() {
                let record = record?;
                self.collab()
                    .rmgr
                    .recover(record.rmid, xid, record.info, record.data);
            }

            session.post_prepare();
        }
        Ok(())
    }
}
