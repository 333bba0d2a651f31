//! On-flash layout of the profile, pairing and activity-log regions.
//!
//! Every region starts with an 8-byte [`RegionHeader`] in its first sector.
//! The profile and pairing regions keep a single record right after the
//! header. The log region reserves sector 0 for the header alone and stores
//! fixed-size [`DailySummary`] records in the following sectors as a ring.
//!
//! Log addressing is expressed through [`LogCursor`] and [`AppendPlan`]
//! rather than offset arithmetic at the call sites:
//!
//! * a record whose index starts a sector needs that sector erased first;
//! * the append that lands on index 0 of a full log bumps the header's
//!   overflow counter (erase + rewrite of sector 0);
//! * every record is stamped with the overflow counter that was current when
//!   it was written, so records left over from the previous lap are told
//!   apart from fresh ones when the cursor is recovered at mount.

use super::ops::{DailySummary, PairingCode, PlayerProfile};

/// Erase granularity of the on-chip flash.
pub const SECTOR_SIZE: u32 = 2_048;
/// Size of the header at the start of every region.
pub const HEADER_LEN: usize = 8;
/// Size of one encoded log record.
pub const RECORD_LEN: usize = 16;
/// Sectors reserved for the log region, header sector included.
pub const LOG_SECTORS: u32 = 4;
/// Log records that fit in one sector.
pub const RECORDS_PER_SECTOR: u16 = (SECTOR_SIZE as usize / RECORD_LEN) as u16;
/// Total log records before the ring wraps.
pub const LOG_CAPACITY: u16 = RECORDS_PER_SECTOR * (LOG_SECTORS as u16 - 1);

const FORMAT_REVISION: u8 = 1;
const ERASED: u8 = 0xFF;

/// Region signatures.
pub const PROFILE_MAGIC: [u8; 4] = *b"TRKP";
pub const LOG_MAGIC: [u8; 4] = *b"TRKL";
pub const PAIRING_MAGIC: [u8; 4] = *b"TRKC";

/// Header stored at offset 0 of every region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionHeader {
    pub magic: [u8; 4],
    pub overflow: u16,
    pub revision: u8,
}

impl RegionHeader {
    #[must_use]
    pub const fn new(magic: [u8; 4], overflow: u16) -> Self {
        Self {
            magic,
            overflow,
            revision: FORMAT_REVISION,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.overflow.to_le_bytes());
        out[6] = self.revision;
        out
    }

    /// Parses a header, returning `None` for erased or foreign contents.
    #[must_use]
    pub fn decode(bytes: &[u8; HEADER_LEN], expected: [u8; 4]) -> Option<Self> {
        if bytes[..4] != expected || bytes[6] != FORMAT_REVISION {
            return None;
        }
        Some(Self {
            magic: expected,
            overflow: u16::from_le_bytes([bytes[4], bytes[5]]),
            revision: bytes[6],
        })
    }
}

/// Byte offset of the log record at `index`.
#[must_use]
pub const fn record_offset(index: u16) -> u32 {
    SECTOR_SIZE + index as u32 * RECORD_LEN as u32
}

/// Byte offset of the sector holding the log record at `index`.
#[must_use]
pub const fn sector_offset(index: u16) -> u32 {
    SECTOR_SIZE * (1 + (index / RECORDS_PER_SECTOR) as u32)
}

/// Encodes a summary stamped with the overflow generation.
#[must_use]
pub fn encode_record(summary: &DailySummary, generation: u16) -> [u8; RECORD_LEN] {
    let mut out = [0u8; RECORD_LEN];
    out[..4].copy_from_slice(&summary.timestamp.to_le_bytes());
    out[4..8].copy_from_slice(&summary.steps.to_le_bytes());
    out[8..10].copy_from_slice(&summary.runs.to_le_bytes());
    out[10..12].copy_from_slice(&summary.dashes.to_le_bytes());
    out[12..14].copy_from_slice(&generation.to_le_bytes());
    let sum = checksum(&out[..14]);
    out[14..16].copy_from_slice(&sum.to_le_bytes());
    out
}

/// Decodes a record, returning its generation alongside the summary.
///
/// Erased slots and records with a bad checksum yield `None`.
#[must_use]
pub fn decode_record(bytes: &[u8; RECORD_LEN]) -> Option<(DailySummary, u16)> {
    if bytes.iter().all(|&byte| byte == ERASED) {
        return None;
    }
    let stored = u16::from_le_bytes([bytes[14], bytes[15]]);
    if stored != checksum(&bytes[..14]) {
        return None;
    }
    let summary = DailySummary {
        timestamp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        steps: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        runs: u16::from_le_bytes([bytes[8], bytes[9]]),
        dashes: u16::from_le_bytes([bytes[10], bytes[11]]),
    };
    Some((summary, u16::from_le_bytes([bytes[12], bytes[13]])))
}

fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0xA5A5u16, |acc, &byte| acc.rotate_left(3) ^ u16::from(byte))
}

/// Profile region image: header followed by the profile.
pub const PROFILE_IMAGE_LEN: usize = HEADER_LEN + PlayerProfile::ENCODED_LEN;
/// Pairing region image: header followed by the code.
pub const PAIRING_IMAGE_LEN: usize = HEADER_LEN + PairingCode::LEN;

#[must_use]
pub fn profile_image(profile: &PlayerProfile) -> [u8; PROFILE_IMAGE_LEN] {
    let mut out = [0u8; PROFILE_IMAGE_LEN];
    out[..HEADER_LEN].copy_from_slice(&RegionHeader::new(PROFILE_MAGIC, 0).encode());
    out[HEADER_LEN..].copy_from_slice(&profile.to_bytes());
    out
}

#[must_use]
pub fn parse_profile_image(image: &[u8; PROFILE_IMAGE_LEN]) -> Option<PlayerProfile> {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&image[..HEADER_LEN]);
    RegionHeader::decode(&header, PROFILE_MAGIC)?;
    let mut body = [0u8; PlayerProfile::ENCODED_LEN];
    body.copy_from_slice(&image[HEADER_LEN..]);
    Some(PlayerProfile::from_bytes(&body))
}

#[must_use]
pub fn pairing_image(code: &PairingCode) -> [u8; PAIRING_IMAGE_LEN] {
    let mut out = [0u8; PAIRING_IMAGE_LEN];
    out[..HEADER_LEN].copy_from_slice(&RegionHeader::new(PAIRING_MAGIC, 0).encode());
    out[HEADER_LEN..].copy_from_slice(code.as_bytes());
    out
}

#[must_use]
pub fn parse_pairing_image(image: &[u8; PAIRING_IMAGE_LEN]) -> Option<PairingCode> {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&image[..HEADER_LEN]);
    RegionHeader::decode(&header, PAIRING_MAGIC)?;
    let mut code = [0u8; PairingCode::LEN];
    code.copy_from_slice(&image[HEADER_LEN..]);
    Some(PairingCode::new(code))
}

/// Write position of the log ring.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogCursor {
    /// Index the next record goes to.
    pub next: u16,
    /// Overflow counter persisted in the header.
    pub overflow: u16,
    /// Every slot holds a current-lap record; the next append wraps.
    pub full: bool,
    /// A valid header exists on flash.
    pub header_valid: bool,
}

/// Steps needed to append one record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AppendPlan {
    pub index: u16,
    /// The target sector must be erased first.
    pub erase_sector: bool,
    /// Sector 0 must be erased and rewritten with `generation` as overflow.
    pub rewrite_header: bool,
    /// Overflow generation stamped on the record.
    pub generation: u16,
}

impl LogCursor {
    /// Cursor of a log region that has never been written.
    #[must_use]
    pub const fn blank() -> Self {
        Self {
            next: 0,
            overflow: 0,
            full: false,
            header_valid: false,
        }
    }

    /// Rebuilds the cursor from the header and a per-index record lookup.
    ///
    /// `generation_at(index)` returns the generation of the record stored
    /// there, or `None` for an erased or corrupt slot. The first slot that is empty or
    /// carries a generation other than the header's is where the next record
    /// goes; when every slot is current the log is full.
    pub fn recover(
        header: Option<RegionHeader>,
        mut generation_at: impl FnMut(u16) -> Option<u16>,
    ) -> Self {
        let Some(header) = header else {
            return Self::blank();
        };

        let next =
            (0..LOG_CAPACITY).find(|&index| generation_at(index) != Some(header.overflow));
        Self {
            next: next.unwrap_or(0),
            overflow: header.overflow,
            full: next.is_none(),
            header_valid: true,
        }
    }

    /// Plans the next append without moving the cursor.
    #[must_use]
    pub const fn plan_append(&self) -> AppendPlan {
        let index = self.next;
        let wraps = self.full && index == 0;
        let generation = if wraps {
            self.overflow.wrapping_add(1)
        } else {
            self.overflow
        };
        AppendPlan {
            index,
            erase_sector: index % RECORDS_PER_SECTOR == 0,
            rewrite_header: wraps || !self.header_valid,
            generation,
        }
    }

    /// Moves the cursor past a successfully written record.
    pub fn commit(&mut self, plan: AppendPlan) {
        self.overflow = plan.generation;
        self.header_valid = true;
        self.next = plan.index + 1;
        self.full = false;
        if self.next >= LOG_CAPACITY {
            self.next = 0;
            self.full = true;
        }
    }

    /// Ring index of the record `back` entries before the newest one.
    ///
    /// Returns the index together with the generation a valid record there
    /// must carry, or `None` when `back` reaches past the ring.
    #[must_use]
    pub fn locate(&self, back: u16) -> Option<(u16, u16)> {
        if back >= LOG_CAPACITY {
            return None;
        }
        let index = (self.next + LOG_CAPACITY - 1 - back) % LOG_CAPACITY;
        let generation = if index < self.next || self.full {
            self.overflow
        } else {
            self.overflow.wrapping_sub(1)
        };
        Some((index, generation))
    }
}
