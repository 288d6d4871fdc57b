//! Primary error type for the Keystone two-phase-commit core.
//!
//! Structured variants for the conditions the coordination core can raise,
//! with recovery hints folded into the user-facing message where the
//! condition has a documented operator response. Every variant maps to a
//! stable machine-readable condition name via [`KeystoneError::condition`].
//!
//! Failures *inside* the commit critical sections never surface through this
//! type; they escalate to a process panic because on-disk state is already
//! ahead of memory at that point.

use thiserror::Error;

/// Convenience alias used throughout the subsystem.
pub type Result<T> = std::result::Result<T, KeystoneError>;

/// Errors raised by the two-phase-commit coordination core.
#[derive(Error, Debug)]
pub enum KeystoneError {
    /// GID exceeds the fixed on-disk width.
    #[error("transaction identifier \"{gid}\" is too long ({len} > {max} max)")]
    IdentifierTooLong {
        gid: String,
        len: usize,
        max: usize,
    },

    /// The subsystem is disabled (`max_prepared == 0`).
    #[error("prepared transactions are disabled: set max_prepared to a nonzero value")]
    PreparedDisabled,

    /// Another in-flight global transaction already reserved this GID.
    #[error("transaction identifier \"{gid}\" is already in use")]
    DuplicateIdentifier { gid: String },

    /// The prepared-transaction slab is exhausted.
    #[error("maximum number of prepared transactions reached: increase max_prepared (currently {max})")]
    TableFull { max: usize },

    /// COMMIT PREPARED / ROLLBACK PREPARED named a GID nobody prepared.
    #[error("prepared transaction with identifier \"{gid}\" does not exist")]
    UnknownIdentifier { gid: String },

    /// Another backend is already committing or rolling back this entry.
    #[error("prepared transaction with identifier \"{gid}\" is busy")]
    TransactionBusy { gid: String },

    /// Caller is neither the preparing role nor a superuser.
    #[error("permission denied to finish prepared transaction: must be superuser or the user that prepared the transaction")]
    NotOwner,

    /// Cross-database finish outside coordinator-executor mode.
    #[error("prepared transaction belongs to another database: connect to the database where the transaction was prepared to finish it")]
    ForeignDatabase,

    /// A prepare record read back from the WAL is unreadable or malformed.
    /// The primary cannot finish this transaction; failover to a healthy
    /// mirror is the documented operator response.
    #[error("two-phase state record is corrupt ({detail}): failover to a healthy mirror may be required")]
    CorruptStateRecord { detail: String },

    /// The assembled prepare payload exceeds the WAL payload ceiling.
    #[error("two-phase state record maximum length exceeded ({len} > {max})")]
    StateRecordTooLarge { len: u64, max: u64 },

    /// An internal invariant did not hold. Not expected in normal operation.
    #[error("internal two-phase invariant violated: {detail}")]
    Internal { detail: String },

    /// Collaborator I/O failure outside a critical section.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeystoneError {
    /// Stable snake_case condition name for this error, suitable for
    /// matching by callers and for structured log fields.
    #[must_use]
    pub fn condition(&self) -> &'static str {
        match self {
            Self::IdentifierTooLong { .. } => "invalid_parameter_value",
            Self::PreparedDisabled | Self::TransactionBusy { .. } => {
                "object_not_in_prerequisite_state"
            }
            Self::DuplicateIdentifier { .. } => "duplicate_object",
            Self::TableFull { .. } => "out_of_memory",
            Self::UnknownIdentifier { .. } => "undefined_object",
            Self::NotOwner => "insufficient_privilege",
            Self::ForeignDatabase => "feature_not_supported",
            Self::CorruptStateRecord { .. } => "data_corrupted",
            Self::StateRecordTooLarge { .. } => "program_limit_exceeded",
            Self::Internal { .. } => "internal_error",
            Self::Io(_) => "io_error",
        }
    }

    /// True for conditions that leave no trace in the table: the caller may
    /// simply retry with corrected input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::CorruptStateRecord { .. } | Self::Internal { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_names_are_stable() {
        let err = KeystoneError::DuplicateIdentifier {
            gid: "tx-A".to_owned(),
        };
        assert_eq!(err.condition(), "duplicate_object");

        let err = KeystoneError::TableFull { max: 2 };
        assert_eq!(err.condition(), "out_of_memory");

        let err = KeystoneError::TransactionBusy {
            gid: "tx-A".to_owned(),
        };
        assert_eq!(err.condition(), "object_not_in_prerequisite_state");
    }

    #[test]
    fn test_messages_carry_hints() {
        let err = KeystoneError::TableFull { max: 8 };
        assert!(err.to_string().contains("increase max_prepared"));

        let err = KeystoneError::CorruptStateRecord {
            detail: "bad magic".to_owned(),
        };
        assert!(err.to_string().contains("failover"));
    }

    #[test]
    fn test_corruption_is_not_retryable() {
        let err = KeystoneError::CorruptStateRecord {
            detail: "truncated".to_owned(),
        };
        assert!(!err.is_retryable());
        assert!(KeystoneError::NotOwner.is_retryable());
    }
}
