//! Post-checkpoint index and checkpoint payload.
//!
//! The index maps each currently-prepared XID to the WAL location where its
//! prepare record begins. It is fed from three sources: `end_prepare` during
//! normal operation, checkpoint-payload restore at startup, and the WAL
//! replay hook for prepare records. Finish and the forget replay hook remove
//! entries. The checkpointer snapshots the index (via the table, which is
//! the authority on which entries are valid) into a
//! [`CheckpointPreparedData`] payload attached to the checkpoint record, and
//! the smallest LSN in the index clamps WAL retention.
//!
//! There is no scheduled per-checkpoint fsync pass here: the checkpoint
//! payload carries everything recovery needs to find the records again.

use std::collections::HashMap;

use keystone_error::{KeystoneError, Result};
use keystone_types::{Lsn, Xid};
use parking_lot::Mutex;
use tracing::debug;

use crate::lifecycle::TwoPhaseSubsystem;

// ---------------------------------------------------------------------------
// PostCheckpointMap
// ---------------------------------------------------------------------------

/// XID → prepare-record begin location, lazily created on first insertion.
pub struct PostCheckpointMap {
    inner: Mutex<Option<HashMap<Xid, Lsn>>>,
}

impl Default for PostCheckpointMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PostCheckpointMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Insert a fresh mapping. A collision means two live prepare records
    /// claim the same XID, which cannot happen in a well-formed history.
    pub fn insert(&self, xid: Xid, lsn: Lsn) {
        let mut guard = self.inner.lock();
        let map = guard.get_or_insert_with(HashMap::new);
        let previous = map.insert(xid, lsn);
        assert!(
            previous.is_none(),
            "post-checkpoint map collision: xid {xid} already mapped to {}",
            previous.unwrap_or(Lsn::ZERO)
        );
        debug!(%xid, %lsn, "registered prepare record location");
    }

    /// Replay-path insert: revisiting the same record after a restart loop
    /// is legitimate, so an identical existing mapping is accepted.
    pub fn insert_idempotent(&self, xid: Xid, lsn: Lsn) {
        let mut guard = self.inner.lock();
        let map = guard.get_or_insert_with(HashMap::new);
        map.insert(xid, lsn);
    }

    #[must_use]
    pub fn lookup(&self, xid: Xid) -> Option<Lsn> {
        self.inner.lock().as_ref().and_then(|m| m.get(&xid).copied())
    }

    /// Drop a mapping; absent entries are fine (replay may forget records
    /// it never saw prepared).
    pub fn remove(&self, xid: Xid) {
        if let Some(map) = self.inner.lock().as_mut() {
            map.remove(&xid);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All mappings, ordered by xid so recovery walks a stable sequence.
    #[must_use]
    pub fn entries(&self) -> Vec<(Xid, Lsn)> {
        let mut entries: Vec<(Xid, Lsn)> = self
            .inner
            .lock()
            .as_ref()
            .map(|m| m.iter().map(|(&x, &l)| (x, l)).collect())
            .unwrap_or_default();
        entries.sort_by_key(|&(xid, _)| xid.raw());
        entries
    }

    /// Smallest prepare-record location still needed, for WAL retention.
    #[must_use]
    pub fn min_lsn(&self) -> Option<Lsn> {
        self.inner
            .lock()
            .as_ref()
            .and_then(|m| m.values().min().copied())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint payload
// ---------------------------------------------------------------------------

/// One `(xid, lsn)` pair in a checkpoint payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedPointer {
    pub xid: Xid,
    pub lsn: Lsn,
}

/// Wire width of one [`PreparedPointer`].
const POINTER_WIRE_LEN: usize = 12;

/// The prepared-transaction component of a checkpoint record:
/// `{count: u32, maps: [{xid, lsn.log_id, lsn.offset}; count]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointPreparedData {
    pub entries: Vec<PreparedPointer>,
}

impl CheckpointPreparedData {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * POINTER_WIRE_LEN);
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.xid.raw().to_le_bytes());
            out.extend_from_slice(&entry.lsn.log_id.to_le_bytes());
            out.extend_from_slice(&entry.lsn.offset.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(KeystoneError::CorruptStateRecord {
                detail: "checkpoint prepared-transaction payload too short".to_owned(),
            });
        }
        let count =
            u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice")) as usize;
        let need = 4 + count * POINTER_WIRE_LEN;
        if bytes.len() < need {
            return Err(KeystoneError::CorruptStateRecord {
                detail: format!(
                    "checkpoint prepared-transaction payload truncated: {} bytes, need {need}",
                    bytes.len()
                ),
            });
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = 4 + i * POINTER_WIRE_LEN;
            let word = |off: usize| {
                u32::from_le_bytes(bytes[at + off..at + off + 4].try_into().expect("4-byte slice"))
            };
            entries.push(PreparedPointer {
                xid: Xid::new(word(0)),
                lsn: Lsn::new(word(4), word(8)),
            });
        }
        Ok(Self { entries })
    }

    /// Oldest prepare-record location in the payload, `None` when empty.
    #[must_use]
    pub fn oldest(&self) -> Option<Lsn> {
        self.entries.iter().map(|e| e.lsn).min()
    }
}

// ---------------------------------------------------------------------------
// Subsystem entry points
// ---------------------------------------------------------------------------

impl TwoPhaseSubsystem {
    /// Gather the prepared-transaction pointers for the checkpoint record.
    /// Reservations that have not reached valid are skipped: their prepare
    /// records are not durable yet and a crash discards them.
    #[must_use]
    pub fn collect_checkpoint_data(&self) -> CheckpointPreparedData {
        let entries = self
            .table()
            .snapshot_all()
            .into_iter()
            .filter(|snap| snap.valid)
            .map(|snap| PreparedPointer {
                xid: snap.xid,
                lsn: snap.prepare_begin_lsn,
            })
            .collect();
        CheckpointPreparedData { entries }
    }

    /// Re-populate the post-checkpoint index from a checkpoint payload at
    /// startup, before WAL replay begins.
    pub fn restore_checkpoint_data(&self, data: &CheckpointPreparedData) {
        for entry in &data.entries {
            self.post_checkpoint().insert(entry.xid, entry.lsn);
        }
        debug!(count = data.entries.len(), "restored prepared-transaction pointers from checkpoint");
    }

    /// WAL replay hook: a prepare record was replayed at `begin_lsn`.
    pub fn note_replayed_prepare(&self, xid: Xid, begin_lsn: Lsn) {
        self.post_checkpoint().insert_idempotent(xid, begin_lsn);
    }

    /// WAL replay hook: a commit- or abort-prepared record was replayed and
    /// the prepare record is no longer needed.
    pub fn forget_prepared(&self, xid: Xid) {
        self.post_checkpoint().remove(xid);
    }

    /// Smallest prepare-record location still live, for WAL retention.
    #[must_use]
    pub fn oldest_prepared_lsn(&self) -> Option<Lsn> {
        self.post_checkpoint().min_lsn()
    }
}
