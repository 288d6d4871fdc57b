//! On-WAL binary layout of two-phase state records.
//!
//! A prepare payload is the concatenation, each segment zero-padded to an
//! 8-byte boundary, of:
//!
//! ```text
//! [PrepareHeader: 240 bytes]
//! [subxact XIDs: nsubxacts * 4]
//! [commit rels:  ncommit_rels * 12]
//! [abort rels:   nabort_rels * 12]
//! [rmgr sub-record]*            each: {len:u32, rmid:u8, info:u16} + data
//! [END sentinel sub-record]     rmid == 0, len == 0
//! [CRC-32C: 4 bytes]
//! ```
//!
//! All integers are little-endian. `total_len` in the header counts the
//! whole payload including the trailing CRC. [`PrepareRecordBuilder`]
//! assembles the chain segment by segment; [`PreparePayload`] parses it back
//! with the same alignment rules, so the carved arrays are byte-identical to
//! what the builder was fed.
//!
//! The second-phase records ([`CommitPreparedRecord`],
//! [`AbortPreparedRecord`]) are plain concatenations with no inter-segment
//! padding; they are emitted once and replayed, never patched in place.

use keystone_error::{KeystoneError, Result};
use keystone_types::limits::{GID_FIXED_LEN, MAXALIGN, MAX_STATE_RECORD_LEN};
use keystone_types::{
    DistribTimestamp, DistribXid, Gid, Oid, RelFileNode, TimestampTz, TwoPhaseRmId, Xid,
};
use tracing::debug;

/// Format identifier leading every prepare payload.
pub const PREPARE_MAGIC: u32 = 0x57F9_4531;

/// Wire width of [`PrepareHeader`].
pub const PREPARE_HEADER_LEN: usize = 40 + GID_FIXED_LEN;

/// Wire width of one rmgr sub-record header.
const RMGR_HEADER_LEN: usize = 8;

/// Wire width of the trailing checksum.
const CRC_LEN: usize = 4;

/// WAL record kinds the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum XactWalKind {
    Prepare = 0x10,
    CommitPrepared = 0x30,
    AbortPrepared = 0x40,
}

#[inline]
#[must_use]
const fn maxalign(len: usize) -> usize {
    (len + MAXALIGN - 1) & !(MAXALIGN - 1)
}

fn corrupt(detail: impl Into<String>) -> KeystoneError {
    KeystoneError::CorruptStateRecord {
        detail: detail.into(),
    }
}

// ---------------------------------------------------------------------------
// PrepareHeader
// ---------------------------------------------------------------------------

/// Fixed header of a prepare payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareHeader {
    pub total_len: u32,
    pub xid: Xid,
    pub database: Oid,
    pub prepared_at: TimestampTz,
    pub owner: Oid,
    pub nsubxacts: u32,
    pub ncommit_rels: u32,
    pub nabort_rels: u32,
    pub gid: Gid,
}

impl PrepareHeader {
    fn to_wire(&self) -> [u8; PREPARE_HEADER_LEN] {
        let mut out = [0_u8; PREPARE_HEADER_LEN];
        out[0..4].copy_from_slice(&PREPARE_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.total_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.xid.raw().to_le_bytes());
        out[12..16].copy_from_slice(&self.database.raw().to_le_bytes());
        out[16..24].copy_from_slice(&self.prepared_at.micros().to_le_bytes());
        out[24..28].copy_from_slice(&self.owner.raw().to_le_bytes());
        out[28..32].copy_from_slice(&self.nsubxacts.to_le_bytes());
        out[32..36].copy_from_slice(&self.ncommit_rels.to_le_bytes());
        out[36..40].copy_from_slice(&self.nabort_rels.to_le_bytes());
        out[40..40 + GID_FIXED_LEN].copy_from_slice(&self.gid.to_wire());
        out
    }

    fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREPARE_HEADER_LEN {
            return Err(corrupt(format!(
                "short prepare header: {} bytes, need {PREPARE_HEADER_LEN}",
                bytes.len()
            )));
        }
        let word = |at: usize| {
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("4-byte slice"))
        };
        let magic = word(0);
        if magic != PREPARE_MAGIC {
            return Err(corrupt(format!(
                "bad prepare-record magic {magic:#010X}, expected {PREPARE_MAGIC:#010X}"
            )));
        }
        let gid = Gid::from_wire(&bytes[40..40 + GID_FIXED_LEN])
            .map_err(|_| corrupt("prepare-record GID field is not valid UTF-8"))?;
        Ok(Self {
            total_len: word(4),
            xid: Xid::new(word(8)),
            database: Oid::new(word(12)),
            prepared_at: TimestampTz::from_micros(i64::from_le_bytes(
                bytes[16..24].try_into().expect("8-byte slice"),
            )),
            owner: Oid::new(word(24)),
            nsubxacts: word(28),
            ncommit_rels: word(32),
            nabort_rels: word(36),
            gid,
        })
    }
}

// ---------------------------------------------------------------------------
// PrepareRecordBuilder
// ---------------------------------------------------------------------------

/// Streaming assembler for one prepare payload.
///
/// Held by the single backend currently preparing. Segments must be appended
/// in layout order: `start` writes the header and the subxact/rel arrays,
/// `register` appends rmgr sub-records, `finish` appends the END sentinel,
/// patches `total_len`, and seals the chain with its CRC. After `finish` (or
/// a failed `finish`) the builder is empty and must be `start`ed again.
#[derive(Debug, Default)]
pub struct PrepareRecordBuilder {
    buf: Option<Vec<u8>>,
}

impl PrepareRecordBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `start` and `finish`.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.buf.is_some()
    }

    /// Begin a payload: header plus the subxact and rel-file arrays.
    ///
    /// `total_len` is written as zero here and patched by [`Self::finish`].
    pub fn start(
        &mut self,
        header: &PrepareHeader,
        subxacts: &[Xid],
        commit_rels: &[RelFileNode],
        abort_rels: &[RelFileNode],
    ) {
        assert!(
            self.buf.is_none(),
            "prepare-record builder started twice without finish"
        );
        let mut header = header.clone();
        header.total_len = 0;
        header.nsubxacts = subxacts.len() as u32;
        header.ncommit_rels = commit_rels.len() as u32;
        header.nabort_rels = abort_rels.len() as u32;

        let mut buf = Vec::with_capacity(512);
        append_padded(&mut buf, &header.to_wire());
        if !subxacts.is_empty() {
            let mut seg = Vec::with_capacity(subxacts.len() * 4);
            for xid in subxacts {
                seg.extend_from_slice(&xid.raw().to_le_bytes());
            }
            append_padded(&mut buf, &seg);
        }
        for rels in [commit_rels, abort_rels] {
            if !rels.is_empty() {
                let mut seg = Vec::with_capacity(rels.len() * RelFileNode::WIRE_LEN);
                for rel in rels {
                    seg.extend_from_slice(&rel.to_wire());
                }
                append_padded(&mut buf, &seg);
            }
        }
        self.buf = Some(buf);
    }

    /// Append one rmgr sub-record. `data` may be empty.
    pub fn register(&mut self, rmid: TwoPhaseRmId, info: u16, data: &[u8]) {
        let buf = self
            .buf
            .as_mut()
            .expect("prepare-record builder used before start");
        let mut hdr = [0_u8; RMGR_HEADER_LEN];
        hdr[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        hdr[4] = rmid.raw();
        hdr[6..8].copy_from_slice(&info.to_le_bytes());
        append_padded(buf, &hdr);
        if !data.is_empty() {
            append_padded(buf, data);
        }
    }

    /// Seal the payload: END sentinel, `total_len` patch, trailing CRC.
    ///
    /// Fails with `program-limit-exceeded` when the payload would exceed the
    /// WAL ceiling; the builder is cleared either way.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        self.register(TwoPhaseRmId::END, 0, &[]);
        let mut buf = self.buf.take().expect("builder state present after register");

        let total_len = buf.len() as u64 + CRC_LEN as u64;
        if total_len > MAX_STATE_RECORD_LEN {
            return Err(KeystoneError::StateRecordTooLarge {
                len: total_len,
                max: MAX_STATE_RECORD_LEN,
            });
        }
        buf[4..8].copy_from_slice(&(total_len as u32).to_le_bytes());

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug!(total_len, crc, "sealed prepare payload");
        Ok(buf)
    }
}

/// Append `data` and zero-pad the buffer to the next 8-byte boundary.
fn append_padded(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(data);
    buf.resize(maxalign(buf.len()), 0);
}

// ---------------------------------------------------------------------------
// PreparePayload
// ---------------------------------------------------------------------------

/// One rmgr sub-record carved out of a prepare payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmgrRecord<'a> {
    pub rmid: TwoPhaseRmId,
    pub info: u16,
    pub data: &'a [u8],
}

/// A prepare payload read back from the WAL and validated.
#[derive(Debug, Clone)]
pub struct PreparePayload {
    raw: Vec<u8>,
    pub header: PrepareHeader,
    pub subxacts: Vec<Xid>,
    pub commit_rels: Vec<RelFileNode>,
    pub abort_rels: Vec<RelFileNode>,
    rm_offset: usize,
}

impl PreparePayload {
    /// Parse and validate a payload: magic, declared length, trailing CRC,
    /// and array bounds. Any mismatch is `data-corrupted`.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < PREPARE_HEADER_LEN + CRC_LEN {
            return Err(corrupt(format!(
                "prepare record too short: {} bytes",
                raw.len()
            )));
        }
        let header = PrepareHeader::from_wire(&raw)?;
        if header.total_len as usize != raw.len() {
            return Err(corrupt(format!(
                "prepare record length mismatch: header says {}, got {}",
                header.total_len,
                raw.len()
            )));
        }
        let body_len = raw.len() - CRC_LEN;
        let stored_crc = u32::from_le_bytes(
            raw[body_len..].try_into().expect("4-byte CRC trailer"),
        );
        let actual_crc = crc32c::crc32c(&raw[..body_len]);
        if stored_crc != actual_crc {
            return Err(corrupt(format!(
                "prepare record checksum mismatch: stored {stored_crc:#010X}, computed {actual_crc:#010X}"
            )));
        }

        let mut off = maxalign(PREPARE_HEADER_LEN);
        let subxacts = take_segment(&raw, &mut off, body_len, header.nsubxacts, 4, "subxact")?
            .chunks_exact(4)
            .map(|c| Xid::new(u32::from_le_bytes(c.try_into().expect("4-byte chunk"))))
            .collect();
        let commit_rels = take_segment(
            &raw,
            &mut off,
            body_len,
            header.ncommit_rels,
            RelFileNode::WIRE_LEN,
            "commit-rel",
        )?
        .chunks_exact(RelFileNode::WIRE_LEN)
        .map(RelFileNode::from_wire)
        .collect();
        let abort_rels = take_segment(
            &raw,
            &mut off,
            body_len,
            header.nabort_rels,
            RelFileNode::WIRE_LEN,
            "abort-rel",
        )?
        .chunks_exact(RelFileNode::WIRE_LEN)
        .map(RelFileNode::from_wire)
        .collect();
        let rm_offset = off;

        Ok(Self {
            raw,
            header,
            subxacts,
            commit_rels,
            abort_rels,
            rm_offset,
        })
    }

    /// Walk the rmgr sub-record stream, stopping at the END sentinel.
    #[must_use]
    pub fn rmgr_records(&self) -> RmgrRecords<'_> {
        RmgrRecords {
            raw: &self.raw[..self.raw.len() - CRC_LEN],
            off: self.rm_offset,
            done: false,
        }
    }
}

/// Carve one aligned array segment out of a payload, advancing the cursor
/// past the padding.
fn take_segment<'a>(
    raw: &'a [u8],
    off: &mut usize,
    body_len: usize,
    count: u32,
    width: usize,
    what: &str,
) -> Result<&'a [u8]> {
    let len = count as usize * width;
    let end = *off + len;
    if end > body_len {
        return Err(corrupt(format!(
            "prepare record {what} array overruns payload ({end} > {body_len})"
        )));
    }
    let seg = &raw[*off..end];
    *off = maxalign(end);
    Ok(seg)
}

/// Iterator over the rmgr sub-records of a [`PreparePayload`].
pub struct RmgrRecords<'a> {
    raw: &'a [u8],
    off: usize,
    done: bool,
}

impl<'a> Iterator for RmgrRecords<'a> {
    type Item = Result<RmgrRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.off + RMGR_HEADER_LEN > self.raw.len() {
            self.done = true;
            return Some(Err(corrupt(
                "rmgr record stream ran past end of payload without END sentinel",
            )));
        }
        let len = u32::from_le_bytes(
            self.raw[self.off..self.off + 4]
                .try_into()
                .expect("4-byte slice"),
        ) as usize;
        let rmid = TwoPhaseRmId::new(self.raw[self.off + 4]);
        let info = u16::from_le_bytes(
            self.raw[self.off + 6..self.off + 8]
                .try_into()
                .expect("2-byte slice"),
        );
        if !rmid.is_valid() {
            self.done = true;
            return Some(Err(corrupt(format!("unknown rmgr id {rmid} in payload"))));
        }
        if rmid.is_end() {
            self.done = true;
            return None;
        }
        let data_start = self.off + RMGR_HEADER_LEN;
        let data_end = data_start + len;
        if data_end > self.raw.len() {
            self.done = true;
            return Some(Err(corrupt(format!(
                "rmgr record data overruns payload ({data_end} > {})",
                self.raw.len()
            ))));
        }
        self.off = maxalign(data_end);
        Some(Ok(RmgrRecord {
            rmid,
            info,
            data: &self.raw[data_start..data_end],
        }))
    }
}

// ---------------------------------------------------------------------------
// Second-phase records
// ---------------------------------------------------------------------------

/// Wire width of the fixed part of a commit-prepared record.
pub const COMMIT_PREPARED_HEADER_LEN: usize = 32;

/// Wire width of the fixed part of an abort-prepared record.
pub const ABORT_PREPARED_HEADER_LEN: usize = 24;

/// COMMIT PREPARED record: fixed header, then the delete-on-commit rels,
/// then the committed child XIDs, no inter-segment padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPreparedRecord {
    pub xid: Xid,
    pub distrib_timestamp: DistribTimestamp,
    pub distrib_xid: DistribXid,
    pub commit_time: TimestampTz,
    pub rels: Vec<RelFileNode>,
    pub subxacts: Vec<Xid>,
}

impl CommitPreparedRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(COMMIT_PREPARED_HEADER_LEN + self.rels.len() * 12 + self.subxacts.len() * 4);
        out.extend_from_slice(&self.xid.raw().to_le_bytes());
        out.extend_from_slice(&self.distrib_timestamp.0.to_le_bytes());
        out.extend_from_slice(&self.distrib_xid.0.to_le_bytes());
        out.extend_from_slice(&[0_u8; 4]); // commit_time is 8-aligned
        out.extend_from_slice(&self.commit_time.micros().to_le_bytes());
        out.extend_from_slice(&(self.rels.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.subxacts.len() as u32).to_le_bytes());
        for rel in &self.rels {
            out.extend_from_slice(&rel.to_wire());
        }
        for xid in &self.subxacts {
            out.extend_from_slice(&xid.raw().to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COMMIT_PREPARED_HEADER_LEN {
            return Err(corrupt("short commit-prepared record"));
        }
        let word = |at: usize| {
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("4-byte slice"))
        };
        let nrels = word(24) as usize;
        let nsubxacts = word(28) as usize;
        let (rels, subxacts) =
            decode_tail(bytes, COMMIT_PREPARED_HEADER_LEN, nrels, nsubxacts)?;
        Ok(Self {
            xid: Xid::new(word(0)),
            distrib_timestamp: DistribTimestamp(word(4)),
            distrib_xid: DistribXid(word(8)),
            commit_time: TimestampTz::from_micros(i64::from_le_bytes(
                bytes[16..24].try_into().expect("8-byte slice"),
            )),
            rels,
            subxacts,
        })
    }
}

/// ROLLBACK PREPARED record: fixed header, then the delete-on-abort rels,
/// then the child XIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortPreparedRecord {
    pub xid: Xid,
    pub abort_time: TimestampTz,
    pub rels: Vec<RelFileNode>,
    pub subxacts: Vec<Xid>,
}

impl AbortPreparedRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(ABORT_PREPARED_HEADER_LEN + self.rels.len() * 12 + self.subxacts.len() * 4);
        out.extend_from_slice(&self.xid.raw().to_le_bytes());
        out.extend_from_slice(&[0_u8; 4]); // abort_time is 8-aligned
        out.extend_from_slice(&self.abort_time.micros().to_le_bytes());
        out.extend_from_slice(&(self.rels.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.subxacts.len() as u32).to_le_bytes());
        for rel in &self.rels {
            out.extend_from_slice(&rel.to_wire());
        }
        for xid in &self.subxacts {
            out.extend_from_slice(&xid.raw().to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ABORT_PREPARED_HEADER_LEN {
            return Err(corrupt("short abort-prepared record"));
        }
        let word = |at: usize| {
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("4-byte slice"))
        };
        let nrels = word(16) as usize;
        let nsubxacts = word(20) as usize;
        let (rels, subxacts) =
            decode_tail(bytes, ABORT_PREPARED_HEADER_LEN, nrels, nsubxacts)?;
        Ok(Self {
            xid: Xid::new(word(0)),
            abort_time: TimestampTz::from_micros(i64::from_le_bytes(
                bytes[8..16].try_into().expect("8-byte slice"),
            )),
            rels,
            subxacts,
        })
    }
}

fn decode_tail(
    bytes: &[u8],
    mut off: usize,
    nrels: usize,
    nsubxacts: usize,
) -> Result<(Vec<RelFileNode>, Vec<Xid>)> {
    let need = off + nrels * RelFileNode::WIRE_LEN + nsubxacts * 4;
    if bytes.len() < need {
        return Err(corrupt(format!(
            "second-phase record tail overruns payload ({need} > {})",
            bytes.len()
        )));
    }
    let rels = bytes[off..off + nrels * RelFileNode::WIRE_LEN]
        .chunks_exact(RelFileNode::WIRE_LEN)
        .map(RelFileNode::from_wire)
        .collect();
    off += nrels * RelFileNode::WIRE_LEN;
    let subxacts = bytes[off..off + nsubxacts * 4]
        .chunks_exact(4)
        .map(|c| Xid::new(u32::from_le_bytes(c.try_into().expect("4-byte chunk"))))
        .collect();
    Ok((rels, subxacts))
}
