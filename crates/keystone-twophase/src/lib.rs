//! Two-phase-commit coordination core.
//!
//! A global transaction is one a client reserves under a textual identifier
//! (GID) with PREPARE TRANSACTION, leaves durable across connection loss and
//! crash, and later finishes with COMMIT PREPARED or ROLLBACK PREPARED,
//! potentially from a different session. This crate owns the hard parts of
//! that lifecycle:
//!
//! - [`record`]: the on-WAL prepare payload: streaming assembly into an
//!   aligned byte chain, and alignment-aware parsing on the way back.
//! - [`gxact_table`]: the fixed-capacity shared table of in-flight global
//!   transactions, its freelist/active-array discipline, and the dummy-proc
//!   representation that keeps prepared XIDs visible as running.
//! - [`lifecycle`]: the prepare/finish state machine with its crash-safe
//!   ordering of WAL writes, visibility changes, file unlinks, and
//!   resource-manager callbacks.
//! - [`session`]: per-backend locked-entry tracking and abort cleanup.
//! - [`checkpoint`]: the post-checkpoint index from XID to prepare-record
//!   location, plus the checkpoint payload built from it.
//! - [`recovery`]: the startup driver that replays prepare records and
//!   resurrects the table before the system opens for writes.
//!
//! Everything the core needs from the rest of the database (WAL, clog,
//! process array, storage unlink, subtransaction map, sync-rep, resource
//! managers, distributed-xact identity) enters through the traits in
//! [`collab`]. [`testkit`] provides in-memory implementations of all of
//! them for tests and crash-replay simulation.

pub mod checkpoint;
pub mod collab;
pub mod config;
pub mod gxact_table;
pub mod lifecycle;
pub mod record;
pub mod recovery;
pub mod session;
pub mod testkit;

pub use checkpoint::{CheckpointPreparedData, PostCheckpointMap, PreparedPointer};
pub use collab::Collaborators;
pub use config::TwoPhaseConfig;
pub use gxact_table::{
    DistribXactState, DummyProc, GXactSnapshot, GXactTable, LocalDistribXact,
    PreparedXactRow, SlotId, SubXidCache,
};
pub use lifecycle::TwoPhaseSubsystem;
pub use record::{
    PrepareHeader, PreparePayload, PrepareRecordBuilder, RmgrRecord, XactWalKind,
    PREPARE_MAGIC,
};
pub use session::BackendSession;
