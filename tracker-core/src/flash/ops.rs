//! Storage operation catalog and the record templates that drive it.
//!
//! Each operation kind is one `const` [`OperationRecord`]. Installing an
//! operation copies its template over the controller's single record, and
//! force-reinit copies [`IDLE_TEMPLATE`] back. The step handlers of a record
//! are indexed by [`SubEvent`], so the controller never branches on the
//! operation kind to decide what a sub-event means.

use core::fmt;

use crate::drivers::Region;
use crate::machine::Fault;

use super::Timestamp;
use super::layout::AppendPlan;

/// Athlete attributes used by the activity classifier.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PlayerProfile {
    pub height_cm: u16,
    pub weight_kg: u16,
    pub age: u8,
    pub stride_cm: u8,
}

impl PlayerProfile {
    pub const ENCODED_LEN: usize = 6;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..2].copy_from_slice(&self.height_cm.to_le_bytes());
        out[2..4].copy_from_slice(&self.weight_kg.to_le_bytes());
        out[4] = self.age;
        out[5] = self.stride_cm;
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        Self {
            height_cm: u16::from_le_bytes([bytes[0], bytes[1]]),
            weight_kg: u16::from_le_bytes([bytes[2], bytes[3]]),
            age: bytes[4],
            stride_cm: bytes[5],
        }
    }

    /// Parses a command body; `None` when it is too short.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let body: &[u8; Self::ENCODED_LEN] = bytes.get(..Self::ENCODED_LEN)?.try_into().ok()?;
        Some(Self::from_bytes(body))
    }
}

/// One day (or one session) of activity totals.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DailySummary {
    pub timestamp: Timestamp,
    pub steps: u32,
    pub runs: u16,
    pub dashes: u16,
}

impl DailySummary {
    pub const ENCODED_LEN: usize = 12;

    /// Wire encoding used by the log read-back reply.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.timestamp.to_le_bytes());
        out[4..8].copy_from_slice(&self.steps.to_le_bytes());
        out[8..10].copy_from_slice(&self.runs.to_le_bytes());
        out[10..].copy_from_slice(&self.dashes.to_le_bytes());
        out
    }
}

/// Shared secret a central must present before privileged commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PairingCode([u8; PairingCode::LEN]);

impl PairingCode {
    pub const LEN: usize = 6;

    #[must_use]
    pub const fn new(digits: [u8; Self::LEN]) -> Self {
        Self(digits)
    }

    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let digits: [u8; Self::LEN] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(digits))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

/// What a storage operation request asks for, with its payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashRequest {
    UpdatePlayerProfile(PlayerProfile),
    WriteDailyLog(DailySummary),
    /// Close the day that ended at the given time.
    RotateLog(Timestamp),
    PairingWrite(PairingCode),
    PairingErase,
    PairingCheck(PairingCode),
}

impl FlashRequest {
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            FlashRequest::UpdatePlayerProfile(_) => OperationKind::UpdatePlayerProfile,
            FlashRequest::WriteDailyLog(_) => OperationKind::WriteDailyLog,
            FlashRequest::RotateLog(_) => OperationKind::RotateLog,
            FlashRequest::PairingWrite(_) => OperationKind::PairingWrite,
            FlashRequest::PairingErase => OperationKind::PairingErase,
            FlashRequest::PairingCheck(_) => OperationKind::PairingCheck,
        }
    }

    /// Payload carried across the steps of the operation.
    #[must_use]
    pub const fn carried(&self) -> Carried {
        match *self {
            FlashRequest::UpdatePlayerProfile(profile) => Carried::Profile(profile),
            FlashRequest::WriteDailyLog(summary) => Carried::Summary(summary),
            FlashRequest::RotateLog(timestamp) => Carried::Timestamp(timestamp),
            FlashRequest::PairingWrite(code) | FlashRequest::PairingCheck(code) => {
                Carried::Pairing(code)
            }
            FlashRequest::PairingErase => Carried::Nothing,
        }
    }
}

/// Kind of the operation occupying the record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperationKind {
    Idle,
    UpdatePlayerProfile,
    WriteDailyLog,
    RotateLog,
    PairingWrite,
    PairingErase,
    PairingCheck,
}

impl OperationKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            OperationKind::Idle => "idle",
            OperationKind::UpdatePlayerProfile => "update-profile",
            OperationKind::WriteDailyLog => "write-log",
            OperationKind::RotateLog => "rotate-log",
            OperationKind::PairingWrite => "pairing-write",
            OperationKind::PairingErase => "pairing-erase",
            OperationKind::PairingCheck => "pairing-check",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Payload kept in the record between steps.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Carried {
    Nothing,
    Profile(PlayerProfile),
    Summary(DailySummary),
    Timestamp(Timestamp),
    Pairing(PairingCode),
}

/// Bitset of sub-steps still pending for the active operation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StepFlags(u16);

impl StepFlags {
    pub const NONE: Self = Self(0);
    pub const ERASE_LOG_HEADER: Self = Self(1 << 0);
    pub const ERASE_LOG: Self = Self(1 << 1);
    pub const ERASE_PROFILE: Self = Self(1 << 2);
    pub const ERASE_PAIRING: Self = Self(1 << 3);
    pub const WRITE_LOG_HEADER: Self = Self(1 << 4);
    pub const WRITE_LOG: Self = Self(1 << 5);
    pub const WRITE_PROFILE: Self = Self(1 << 6);
    pub const WRITE_PAIRING: Self = Self(1 << 7);
    /// Slave latency 0 has been requested and not yet confirmed.
    pub const REQUEST_LATENCY_0: Self = Self(1 << 8);
    /// The relaxed latency must be restored when the operation ends.
    pub const REQUEST_LATENCY_1: Self = Self(1 << 9);

    /// Storage sub-steps in issue order: every erase precedes every write.
    pub const STORAGE_ORDER: [Self; 8] = [
        Self::ERASE_LOG_HEADER,
        Self::ERASE_LOG,
        Self::ERASE_PROFILE,
        Self::ERASE_PAIRING,
        Self::WRITE_LOG_HEADER,
        Self::WRITE_LOG,
        Self::WRITE_PROFILE,
        Self::WRITE_PAIRING,
    ];

    const ERASES: Self = Self(0x000F);

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Next storage sub-step to issue, if any remain.
    #[must_use]
    pub fn next_storage_step(self) -> Option<Self> {
        Self::STORAGE_ORDER
            .iter()
            .copied()
            .find(|&step| self.contains(step))
    }

    /// Returns `true` for erase sub-steps.
    #[must_use]
    pub const fn is_erase(self) -> bool {
        self.0 & Self::ERASES.0 != 0
    }

    /// Region a single storage sub-step touches.
    #[must_use]
    pub const fn region(self) -> Option<Region> {
        match self.0 {
            x if x == Self::ERASE_LOG_HEADER.0
                || x == Self::ERASE_LOG.0
                || x == Self::WRITE_LOG_HEADER.0
                || x == Self::WRITE_LOG.0 =>
            {
                Some(Region::Log)
            }
            x if x == Self::ERASE_PROFILE.0 || x == Self::WRITE_PROFILE.0 => Some(Region::Profile),
            x if x == Self::ERASE_PAIRING.0 || x == Self::WRITE_PAIRING.0 => Some(Region::Pairing),
            _ => None,
        }
    }
}

/// Named progression of an operation. Only ever moves forward.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Sequence {
    Idle,
    StatusChecked,
    AwaitingLatency,
    Started,
    Erasing,
    Writing,
    Finishing,
}

impl Sequence {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Sequence::Idle => "idle",
            Sequence::StatusChecked => "status-checked",
            Sequence::AwaitingLatency => "awaiting-latency",
            Sequence::Started => "started",
            Sequence::Erasing => "erasing",
            Sequence::Writing => "writing",
            Sequence::Finishing => "finishing",
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sub-events routed to the active record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubEvent {
    StatusCheck,
    OperationStarted,
    WriteComplete,
    EraseComplete,
}

impl SubEvent {
    pub const COUNT: usize = 4;

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Behaviour bound to one sub-event of a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepHandler {
    /// Compute step flags and decide whether low latency is needed.
    PlanProfile,
    PlanLogAppend,
    PlanRotation,
    PlanPairingWrite,
    PlanPairingErase,
    /// Read the stored pairing code and finish immediately.
    VerifyPairing,
    /// Issue the next pending storage sub-step or finish.
    IssueNext,
    /// Clear the completed sub-step and continue.
    CompleteStep,
    /// The sub-event has no meaning for this record.
    Unexpected,
}

/// Where the operation writes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Target {
    pub region: Option<Region>,
    /// Log append plan, resolved at status-check.
    pub append: Option<AppendPlan>,
}

impl Target {
    pub const NONE: Self = Self {
        region: None,
        append: None,
    };

    const fn region(region: Region) -> Self {
        Self {
            region: Some(region),
            append: None,
        }
    }
}

/// The single storage operation record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub sequence: Sequence,
    pub steps: StepFlags,
    pub target: Target,
    pub payload: Carried,
    pub handlers: [StepHandler; SubEvent::COUNT],
    /// Sub-step whose completion event is outstanding.
    pub in_flight: Option<StepFlags>,
}

impl OperationRecord {
    const fn template(kind: OperationKind, target: Target, plan: StepHandler) -> Self {
        Self {
            kind,
            sequence: Sequence::Idle,
            steps: StepFlags::NONE,
            target,
            payload: Carried::Nothing,
            handlers: [
                plan,
                StepHandler::IssueNext,
                StepHandler::CompleteStep,
                StepHandler::CompleteStep,
            ],
            in_flight: None,
        }
    }

    /// Handler bound to `event`.
    #[must_use]
    pub const fn handler(&self, event: SubEvent) -> StepHandler {
        self.handlers[event.index()]
    }

    /// Moves the sequence forward; requests to move backwards are ignored.
    pub fn advance(&mut self, to: Sequence) {
        if to > self.sequence {
            self.sequence = to;
        }
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.kind, OperationKind::Idle)
    }
}

pub const IDLE_TEMPLATE: OperationRecord = OperationRecord {
    kind: OperationKind::Idle,
    sequence: Sequence::Idle,
    steps: StepFlags::NONE,
    target: Target::NONE,
    payload: Carried::Nothing,
    handlers: [StepHandler::Unexpected; SubEvent::COUNT],
    in_flight: None,
};

pub const UPDATE_PROFILE_TEMPLATE: OperationRecord = OperationRecord::template(
    OperationKind::UpdatePlayerProfile,
    Target::region(Region::Profile),
    StepHandler::PlanProfile,
);

pub const WRITE_LOG_TEMPLATE: OperationRecord = OperationRecord::template(
    OperationKind::WriteDailyLog,
    Target::region(Region::Log),
    StepHandler::PlanLogAppend,
);

pub const ROTATE_LOG_TEMPLATE: OperationRecord = OperationRecord::template(
    OperationKind::RotateLog,
    Target::region(Region::Log),
    StepHandler::PlanRotation,
);

pub const PAIRING_WRITE_TEMPLATE: OperationRecord = OperationRecord::template(
    OperationKind::PairingWrite,
    Target::region(Region::Pairing),
    StepHandler::PlanPairingWrite,
);

pub const PAIRING_ERASE_TEMPLATE: OperationRecord = OperationRecord::template(
    OperationKind::PairingErase,
    Target::region(Region::Pairing),
    StepHandler::PlanPairingErase,
);

/// Pairing checks never touch erase or write, so only status-check is bound.
pub const PAIRING_CHECK_TEMPLATE: OperationRecord = OperationRecord {
    handlers: [
        StepHandler::VerifyPairing,
        StepHandler::Unexpected,
        StepHandler::Unexpected,
        StepHandler::Unexpected,
    ],
    ..OperationRecord::template(
        OperationKind::PairingCheck,
        Target::region(Region::Pairing),
        StepHandler::VerifyPairing,
    )
};

/// Template installed for `kind`.
///
/// # Errors
///
/// Asking for the idle kind is an inconsistency reported as
/// [`Fault::MissingOperation`].
pub const fn template_for(kind: OperationKind) -> Result<OperationRecord, Fault> {
    match kind {
        OperationKind::Idle => Err(Fault::MissingOperation),
        OperationKind::UpdatePlayerProfile => Ok(UPDATE_PROFILE_TEMPLATE),
        OperationKind::WriteDailyLog => Ok(WRITE_LOG_TEMPLATE),
        OperationKind::RotateLog => Ok(ROTATE_LOG_TEMPLATE),
        OperationKind::PairingWrite => Ok(PAIRING_WRITE_TEMPLATE),
        OperationKind::PairingErase => Ok(PAIRING_ERASE_TEMPLATE),
        OperationKind::PairingCheck => Ok(PAIRING_CHECK_TEMPLATE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erases_are_issued_before_writes() {
        let steps = StepFlags::WRITE_PROFILE.union(StepFlags::ERASE_PROFILE);
        assert_eq!(steps.next_storage_step(), Some(StepFlags::ERASE_PROFILE));

        let mut steps = steps;
        steps.remove(StepFlags::ERASE_PROFILE);
        assert_eq!(steps.next_storage_step(), Some(StepFlags::WRITE_PROFILE));
        assert!(!StepFlags::WRITE_PROFILE.is_erase());
    }

    #[test]
    fn latency_flags_are_not_storage_steps() {
        let steps = StepFlags::REQUEST_LATENCY_0.union(StepFlags::REQUEST_LATENCY_1);
        assert_eq!(steps.next_storage_step(), None);
        assert_eq!(StepFlags::REQUEST_LATENCY_0.region(), None);
    }

    #[test]
    fn sequence_never_moves_backwards() {
        let mut record = UPDATE_PROFILE_TEMPLATE;
        record.advance(Sequence::Writing);
        record.advance(Sequence::Started);
        assert_eq!(record.sequence, Sequence::Writing);
    }

    #[test]
    fn idle_template_binds_nothing() {
        assert_eq!(template_for(OperationKind::Idle), Err(Fault::MissingOperation));
        assert_eq!(IDLE_TEMPLATE.handler(SubEvent::WriteComplete), StepHandler::Unexpected);
        assert_eq!(
            PAIRING_CHECK_TEMPLATE.handler(SubEvent::StatusCheck),
            StepHandler::VerifyPairing
        );
        assert_eq!(
            PAIRING_CHECK_TEMPLATE.handler(SubEvent::EraseComplete),
            StepHandler::Unexpected
        );
    }

    #[test]
    fn profile_body_parses_from_command_payload() {
        let profile = PlayerProfile {
            height_cm: 182,
            weight_kg: 77,
            age: 24,
            stride_cm: 95,
        };
        let bytes = profile.to_bytes();
        assert_eq!(PlayerProfile::parse(&bytes), Some(profile));
        assert_eq!(PlayerProfile::parse(&bytes[..3]), None);
    }
}
