//! Startup-fixed configuration for the two-phase-commit core.

use serde::{Deserialize, Serialize};

/// Knobs fixed at subsystem construction. None of them may change while the
/// subsystem is live; capacity in particular sizes a shared slab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoPhaseConfig {
    /// Capacity of the prepared-transaction table. `0` disables the
    /// subsystem entirely: every reservation fails until restart.
    pub max_prepared: usize,

    /// Number of real backend slots. Dummy backend ids for prepared
    /// transactions are assigned immediately after this range, so an array
    /// of `max_real_backends + max_prepared + 1` has a slot for every
    /// backend and every prepared transaction.
    pub max_real_backends: u32,

    /// In coordinator-executor mode a prepared transaction may be finished
    /// from a session connected to a different database.
    pub coordinator_execute_mode: bool,

    /// Number of configured WAL sender slots; nonzero means senders are
    /// woken after each flush of a two-phase record.
    pub wal_senders: u32,

    /// Crash-recovery testing: panic immediately after the prepare record
    /// is flushed, before the entry is marked valid in shared memory.
    pub debug_abort_after_prepare: bool,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            max_prepared: 0,
            max_real_backends: 100,
            coordinator_execute_mode: false,
            wal_senders: 0,
            debug_abort_after_prepare: false,
        }
    }
}

impl TwoPhaseConfig {
    /// Whether the subsystem accepts reservations at all.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.max_prepared > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disabled() {
        let config = TwoPhaseConfig::default();
        assert!(!config.enabled());
    }

    #[test]
    fn test_deserializes_with_partial_fields() {
        let config: TwoPhaseConfig =
            serde_json::from_str(r#"{"max_prepared": 8}"#).expect("valid config json");
        assert_eq!(config.max_prepared, 8);
        assert_eq!(config.max_real_backends, 100);
        assert!(config.enabled());
    }
}
