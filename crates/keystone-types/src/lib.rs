//! Identifier and wire vocabulary for the Keystone two-phase-commit core.
//!
//! Plain data types shared by every crate in the workspace:
//!
//! - [`Xid`]: 32-bit transaction id with modulo-2^31 ordering.
//! - [`Oid`]: catalog object id (databases, roles, tablespaces, relations).
//! - [`BackendId`]: 1-based backend slot id; the INVALID sentinel is spelled
//!   `Option<BackendId>`.
//! - [`Lsn`]: WAL location as a `(log_id, byte_offset)` pair.
//! - [`RelFileNode`] / [`ForkNumber`]: physical relation addressing.
//! - [`Gid`]: client-chosen global transaction identifier, bounded length.
//! - [`TimestampTz`], [`DistribTimestamp`], [`DistribXid`], [`TwoPhaseRmId`].

use std::fmt;
use std::num::NonZeroU32;

pub mod limits {
    //! Fixed capacities and wire-format bounds.

    /// Fixed on-disk width of a GID field, including the NUL terminator.
    pub const GID_FIXED_LEN: usize = 200;

    /// Longest GID a client may choose, in bytes.
    pub const MAX_GID_LEN: usize = GID_FIXED_LEN - 1;

    /// Child-xid cache capacity on a dummy proc. Transactions with more
    /// subtransactions than this mark the cache overflowed; the prepare
    /// payload still carries the full list.
    pub const MAX_CACHED_SUBXIDS: usize = 64;

    /// Ceiling on a single prepare payload, matching the largest buffer the
    /// WAL reader is willing to allocate when reading the record back.
    pub const MAX_STATE_RECORD_LEN: u64 = 0x3FFF_FFFF;

    /// Alignment of every segment inside a prepare payload.
    pub const MAXALIGN: usize = 8;
}

// ---------------------------------------------------------------------------
// Xid
// ---------------------------------------------------------------------------

/// A 32-bit transaction identifier.
///
/// Ids 0..=2 are special (invalid, bootstrap, frozen); normal ids start at 3
/// and wrap around. Ordering between normal ids is modulo-2^31: an id
/// precedes another if the signed difference is negative. Special ids
/// compare unsigned against everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Xid(u32);

impl Xid {
    pub const INVALID: Self = Self(0);
    pub const BOOTSTRAP: Self = Self(1);
    pub const FROZEN: Self = Self(2);
    pub const FIRST_NORMAL: Self = Self(3);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// True for ids that take part in wraparound arithmetic.
    #[inline]
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Does `self` logically precede `other`?
    #[must_use]
    pub fn precedes(self, other: Self) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    #[must_use]
    pub fn follows(self, other: Self) -> bool {
        other.precedes(self)
    }

    #[must_use]
    pub fn follows_or_equals(self, other: Self) -> bool {
        self == other || self.follows(other)
    }

    /// The next assignable id, skipping the special range on wraparound.
    #[must_use]
    pub fn advance(self) -> Self {
        let next = self.0.wrapping_add(1);
        if next < Self::FIRST_NORMAL.0 {
            Self::FIRST_NORMAL
        } else {
            Self(next)
        }
    }

    /// The latest id among `self` and `children` under wraparound ordering.
    #[must_use]
    pub fn latest(self, children: &[Self]) -> Self {
        let mut latest = self;
        for &child in children {
            if child.follows(latest) {
                latest = child;
            }
        }
        latest
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Oid
// ---------------------------------------------------------------------------

/// Catalog object identifier (database, role, tablespace, relation).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Oid(u32);

impl Oid {
    pub const INVALID: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// BackendId
// ---------------------------------------------------------------------------

/// A 1-based backend slot id. Real backends occupy `1..=max_real_backends`;
/// dummy procs for prepared transactions occupy the range immediately after.
/// The INVALID sentinel is represented as `Option::<BackendId>::None`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct BackendId(NonZeroU32);

impl BackendId {
    /// Create a backend id from a raw 1-based slot number.
    ///
    /// Returns `None` for 0 (the INVALID sentinel has no value form).
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Lsn
// ---------------------------------------------------------------------------

/// A WAL location: logical log id plus byte offset within that log.
///
/// `Lsn::ZERO` doubles as "unknown / not yet written"; a freshly reserved
/// descriptor carries zero LSNs until its prepare record is inserted.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Lsn {
    pub log_id: u32,
    pub offset: u32,
}

impl Lsn {
    pub const ZERO: Self = Self {
        log_id: 0,
        offset: 0,
    };

    #[inline]
    #[must_use]
    pub const fn new(log_id: u32, offset: u32) -> Self {
        Self { log_id, offset }
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.log_id == 0 && self.offset == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.log_id, self.offset)
    }
}

// ---------------------------------------------------------------------------
// TimestampTz
// ---------------------------------------------------------------------------

/// Wall-clock timestamp in microseconds since the Unix epoch.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct TimestampTz(i64);

impl TimestampTz {
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[inline]
    #[must_use]
    pub const fn micros(self) -> i64 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Distributed transaction identity
// ---------------------------------------------------------------------------

/// Start timestamp of the distributed transaction manager that issued a
/// distributed xid. Together with [`DistribXid`] it identifies one
/// distributed transaction across restarts of the coordinator.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct DistribTimestamp(pub u32);

/// Coordinator-assigned distributed transaction id.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct DistribXid(pub u32);

// ---------------------------------------------------------------------------
// RelFileNode / ForkNumber
// ---------------------------------------------------------------------------

/// Physical address of a relation: tablespace, database, relation file.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RelFileNode {
    pub spc_node: Oid,
    pub db_node: Oid,
    pub rel_node: Oid,
}

impl RelFileNode {
    /// Wire width of one node triple.
    pub const WIRE_LEN: usize = 12;

    #[must_use]
    pub const fn new(spc: u32, db: u32, rel: u32) -> Self {
        Self {
            spc_node: Oid::new(spc),
            db_node: Oid::new(db),
            rel_node: Oid::new(rel),
        }
    }

    #[must_use]
    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0_u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.spc_node.raw().to_le_bytes());
        out[4..8].copy_from_slice(&self.db_node.raw().to_le_bytes());
        out[8..12].copy_from_slice(&self.rel_node.raw().to_le_bytes());
        out
    }

    /// Decode one node triple from `bytes`; `bytes` must be at least
    /// [`Self::WIRE_LEN`] long.
    #[must_use]
    pub fn from_wire(bytes: &[u8]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("12-byte slice"))
        };
        Self::new(word(0), word(4), word(8))
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// Relation fork. Unlinking a relation removes every fork.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(u8)]
pub enum ForkNumber {
    Main = 0,
    FreeSpaceMap = 1,
    VisibilityMap = 2,
}

impl ForkNumber {
    /// Every fork, in unlink order.
    pub const ALL: [Self; 3] = [Self::Main, Self::FreeSpaceMap, Self::VisibilityMap];
}

// ---------------------------------------------------------------------------
// Gid
// ---------------------------------------------------------------------------

/// A client-chosen global transaction identifier.
///
/// At most [`limits::MAX_GID_LEN`] bytes; compared byte-exact. On the wire a
/// GID occupies a fixed [`limits::GID_FIXED_LEN`]-byte NUL-padded field.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Gid(String);

impl Gid {
    /// Validate and wrap a client-supplied identifier.
    pub fn new(raw: &str) -> std::result::Result<Self, GidTooLong> {
        if raw.len() > limits::MAX_GID_LEN {
            return Err(GidTooLong {
                len: raw.len(),
                max: limits::MAX_GID_LEN,
            });
        }
        Ok(Self(raw.to_owned()))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Encode into the fixed NUL-padded wire field.
    #[must_use]
    pub fn to_wire(&self) -> [u8; limits::GID_FIXED_LEN] {
        let mut out = [0_u8; limits::GID_FIXED_LEN];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }

    /// Decode from the fixed NUL-padded wire field: bytes up to the first
    /// NUL, which must be valid UTF-8.
    pub fn from_wire(
        field: &[u8],
    ) -> std::result::Result<Self, GidNotUtf8> {
        let end = field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(field.len().min(limits::MAX_GID_LEN));
        let text = std::str::from_utf8(&field[..end]).map_err(|_| GidNotUtf8)?;
        Ok(Self(text.to_owned()))
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error: a client-supplied GID exceeds the fixed wire width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GidTooLong {
    pub len: usize,
    pub max: usize,
}

impl fmt::Display for GidTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction identifier is too long ({} > {} max)",
            self.len, self.max
        )
    }
}

impl std::error::Error for GidTooLong {}

/// Error: a wire GID field holds bytes that are not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GidNotUtf8;

impl fmt::Display for GidNotUtf8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transaction identifier field is not valid UTF-8")
    }
}

impl std::error::Error for GidNotUtf8 {}

// ---------------------------------------------------------------------------
// TwoPhaseRmId
// ---------------------------------------------------------------------------

/// Resource manager id for per-transaction sub-records inside a prepare
/// payload. Id 0 is the end-of-records sentinel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct TwoPhaseRmId(u8);

impl TwoPhaseRmId {
    /// End-of-records sentinel.
    pub const END: Self = Self(0);
    /// Lock manager.
    pub const LOCK: Self = Self(1);
    /// Cache invalidation.
    pub const INVAL: Self = Self(2);
    /// Asynchronous notifications.
    pub const NOTIFY: Self = Self(3);
    /// Statistics flush.
    pub const PGSTAT: Self = Self(4);
    /// Largest valid id.
    pub const MAX: Self = Self(4);

    #[inline]
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_end(self) -> bool {
        self.0 == Self::END.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 <= Self::MAX.0
    }
}

impl fmt::Display for TwoPhaseRmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_ordering_is_modulo() {
        let a = Xid::new(100);
        let b = Xid::new(101);
        assert!(a.precedes(b));
        assert!(b.follows(a));

        // Near the wraparound boundary the numerically larger id precedes.
        let old = Xid::new(u32::MAX - 1);
        let young = Xid::new(Xid::FIRST_NORMAL.raw() + 10);
        assert!(old.precedes(young));
        assert!(young.follows(old));
    }

    #[test]
    fn test_xid_special_ids_compare_plainly() {
        assert!(Xid::INVALID.precedes(Xid::new(u32::MAX)));
        assert!(Xid::FROZEN.precedes(Xid::FIRST_NORMAL));
    }

    #[test]
    fn test_xid_advance_skips_special_range() {
        assert_eq!(Xid::new(u32::MAX).advance(), Xid::FIRST_NORMAL);
        assert_eq!(Xid::new(7).advance(), Xid::new(8));
    }

    #[test]
    fn test_xid_latest_prefers_followers() {
        let top = Xid::new(200);
        let children = [Xid::new(201), Xid::new(205), Xid::new(203)];
        assert_eq!(top.latest(&children), Xid::new(205));
        assert_eq!(top.latest(&[]), top);
    }

    #[test]
    fn test_lsn_ordering_and_display() {
        let a = Lsn::new(0, 0x100);
        let b = Lsn::new(0, 0x200);
        let c = Lsn::new(1, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "0/100");
        assert!(Lsn::ZERO.is_zero());
    }

    #[test]
    fn test_gid_round_trips_through_wire_field() {
        let gid = Gid::new("dist-tx-4711").expect("valid gid");
        let field = gid.to_wire();
        assert_eq!(field.len(), limits::GID_FIXED_LEN);
        let back = Gid::from_wire(&field).expect("valid field");
        assert_eq!(back, gid);
    }

    #[test]
    fn test_gid_length_bound_is_exact() {
        let max = "g".repeat(limits::MAX_GID_LEN);
        assert!(Gid::new(&max).is_ok());
        let over = "g".repeat(limits::MAX_GID_LEN + 1);
        assert_eq!(
            Gid::new(&over),
            Err(GidTooLong {
                len: limits::MAX_GID_LEN + 1,
                max: limits::MAX_GID_LEN,
            })
        );
    }

    #[test]
    fn test_relfilenode_wire_round_trip() {
        let rel = RelFileNode::new(1, 2, 3);
        let wire = rel.to_wire();
        assert_eq!(RelFileNode::from_wire(&wire), rel);
    }

    #[test]
    fn test_backend_id_zero_is_invalid() {
        assert!(BackendId::new(0).is_none());
        assert_eq!(BackendId::new(7).map(BackendId::get), Some(7));
    }

    #[test]
    fn test_rm_id_sentinel() {
        assert!(TwoPhaseRmId::END.is_end());
        assert!(TwoPhaseRmId::LOCK.is_valid());
        assert!(!TwoPhaseRmId::new(99).is_valid());
    }
}
