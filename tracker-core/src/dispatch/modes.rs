//! Operating modes and their command tables.
//!
//! A [`ModeRecord`] bundles the handler row for every [`Command`] with the
//! way incoming samples are consumed. Switching modes copies one of the
//! `const` records wholesale, mirroring how storage operations install their
//! templates.

use core::fmt;

use crate::drivers::Classification;
use crate::flash::{DailySummary, Timestamp};

use super::Command;

/// Kinds of timed measurement sessions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Measurement {
    Sprint,
    Interval,
    Endurance,
}

impl Measurement {
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Measurement::Sprint),
            1 => Some(Measurement::Interval),
            2 => Some(Measurement::Endurance),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Measurement::Sprint => 0,
            Measurement::Interval => 1,
            Measurement::Endurance => 2,
        }
    }
}

/// Active operating mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    DailyTracking,
    TimedMeasurement(Measurement),
    RawStream,
    Calibration,
}

impl Mode {
    /// Single-byte code reported in the status reply.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Mode::DailyTracking => 0x00,
            Mode::TimedMeasurement(kind) => 0x10 | kind.code(),
            Mode::RawStream => 0x20,
            Mode::Calibration => 0x30,
        }
    }

    /// Record installed when switching to this mode.
    #[must_use]
    pub const fn record(self) -> ModeRecord {
        match self {
            Mode::DailyTracking => DAILY_TRACKING,
            Mode::TimedMeasurement(kind) => ModeRecord {
                mode: Mode::TimedMeasurement(kind),
                ..TIMED_MEASUREMENT
            },
            Mode::RawStream => RAW_STREAM,
            Mode::Calibration => CALIBRATION,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::DailyTracking => f.write_str("daily"),
            Mode::TimedMeasurement(Measurement::Sprint) => f.write_str("sprint"),
            Mode::TimedMeasurement(Measurement::Interval) => f.write_str("interval"),
            Mode::TimedMeasurement(Measurement::Endurance) => f.write_str("endurance"),
            Mode::RawStream => f.write_str("raw-stream"),
            Mode::Calibration => f.write_str("calibration"),
        }
    }
}

/// Behaviour bound to one command in one mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandHandler {
    ReplyStatus,
    ReplyActivity,
    StoreProfile,
    ReplyProfile,
    ReadLog,
    StartMeasurement,
    StartRawStream,
    StartCalibration,
    StopMode,
    StorePairing,
    ClearPairing,
    VerifyPairing,
    EnterGuest,
    RequestSleep,
    /// Answer `UnsupportedInMode`.
    Unsupported,
}

/// How samples are consumed while the mode is active.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SampleHandler {
    /// Feed the classifier and accumulate daily totals.
    Classify,
    /// As `Classify`, also accumulating the session totals.
    ClassifySession,
    /// Forward every sample to the raw-data characteristic.
    Stream,
    /// Feed the orientation calibration.
    Calibrate,
}

/// Mode plus its handler row.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ModeRecord {
    pub mode: Mode,
    pub commands: [CommandHandler; Command::COUNT],
    pub samples: SampleHandler,
}

impl ModeRecord {
    #[must_use]
    pub const fn handler(&self, command: Command) -> CommandHandler {
        self.commands[command.index()]
    }
}

use CommandHandler as H;

// Rows follow the declaration order of `Command`.
pub const DAILY_TRACKING: ModeRecord = ModeRecord {
    mode: Mode::DailyTracking,
    commands: [
        H::ReplyStatus,
        H::ReplyActivity,
        H::StoreProfile,
        H::ReplyProfile,
        H::ReadLog,
        H::StartMeasurement,
        H::StartRawStream,
        H::StartCalibration,
        H::Unsupported,
        H::StorePairing,
        H::ClearPairing,
        H::VerifyPairing,
        H::EnterGuest,
        H::RequestSleep,
    ],
    samples: SampleHandler::Classify,
};

pub const TIMED_MEASUREMENT: ModeRecord = ModeRecord {
    mode: Mode::TimedMeasurement(Measurement::Sprint),
    commands: [
        H::ReplyStatus,
        H::ReplyActivity,
        H::Unsupported,
        H::ReplyProfile,
        H::ReadLog,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::StopMode,
        H::Unsupported,
        H::Unsupported,
        H::VerifyPairing,
        H::EnterGuest,
        H::RequestSleep,
    ],
    samples: SampleHandler::ClassifySession,
};

pub const RAW_STREAM: ModeRecord = ModeRecord {
    mode: Mode::RawStream,
    commands: [
        H::ReplyStatus,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::StopMode,
        H::Unsupported,
        H::Unsupported,
        H::VerifyPairing,
        H::EnterGuest,
        H::RequestSleep,
    ],
    samples: SampleHandler::Stream,
};

pub const CALIBRATION: ModeRecord = ModeRecord {
    mode: Mode::Calibration,
    commands: [
        H::ReplyStatus,
        H::Unsupported,
        H::Unsupported,
        H::ReplyProfile,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::Unsupported,
        H::StopMode,
        H::Unsupported,
        H::Unsupported,
        H::VerifyPairing,
        H::EnterGuest,
        H::RequestSleep,
    ],
    samples: SampleHandler::Calibrate,
};

/// Step/run/dash counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ActivityTotals {
    pub steps: u32,
    pub runs: u16,
    pub dashes: u16,
}

impl ActivityTotals {
    pub const ENCODED_LEN: usize = 8;

    pub fn add(&mut self, classification: &Classification) {
        self.steps = self.steps.saturating_add(u32::from(classification.steps));
        self.runs = self.runs.saturating_add(u16::from(classification.runs));
        self.dashes = self.dashes.saturating_add(u16::from(classification.dashes));
    }

    /// Removes what `archived` already holds; counts gathered since stay.
    pub fn deduct(&mut self, archived: &DailySummary) {
        self.steps = self.steps.saturating_sub(archived.steps);
        self.runs = self.runs.saturating_sub(archived.runs);
        self.dashes = self.dashes.saturating_sub(archived.dashes);
    }

    /// Summary of these totals closed at `timestamp`.
    #[must_use]
    pub const fn summary(&self, timestamp: Timestamp) -> DailySummary {
        DailySummary {
            timestamp,
            steps: self.steps,
            runs: self.runs,
            dashes: self.dashes,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.steps.to_le_bytes());
        out[4..6].copy_from_slice(&self.runs.to_le_bytes());
        out[6..].copy_from_slice(&self.dashes.to_le_bytes());
        out
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
