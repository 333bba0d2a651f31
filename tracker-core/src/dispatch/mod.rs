//! Protocol command dispatcher.
//!
//! Commands written by the central arrive as [`crate::Event::Command`]. The
//! raw id is mapped to a dense [`Command`] through an explicit `TryFrom<u8>`,
//! checked by the [`AccessGuard`], and then looked up in the handler row of
//! the active [`ModeRecord`]. Every admitted command is answered on the
//! response characteristic, either right away or, for commands that go
//! through storage, when the storage controller reports back.

use core::fmt;

use heapless::Vec;

use crate::drivers::{CalibrationProgress, Characteristic, Platform, RadioLink, Sample};
use crate::drivers::{ActivityClassifier, SampleSource};
use crate::event::{Event, EventKind, ProtocolCommand};
use crate::flash::{
    FlashController, FlashError, FlashOutcome, FlashReport, FlashRequest, OperationKind,
    PairingCode, PlayerProfile,
};
use crate::machine::ConnState;
use crate::queue::EventSink;
use crate::trace::{TraceEvent, TraceLog};

pub mod guard;
pub mod modes;

pub use guard::{Access, AccessGuard};
pub use modes::{ActivityTotals, CommandHandler, Measurement, Mode, ModeRecord, SampleHandler};

/// Largest reply body after the command id and status code.
pub const MAX_REPLY_PAYLOAD: usize = 16;
/// Samples consumed per data-ready event before yielding back to the loop.
pub const MAX_SAMPLES_PER_BATCH: usize = 32;

/// Identity of one link's access state.
///
/// Moves on every time the per-link state is reset, so storage outcomes can
/// be matched to the link whose command asked for them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkEpoch(u16);

impl LinkEpoch {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Commands understood by the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    GetStatus,
    GetActivity,
    SetPlayerProfile,
    GetPlayerProfile,
    ReadDailyLog,
    StartMeasurement,
    StartRawStream,
    StartCalibration,
    Stop,
    SetPairingCode,
    ClearPairingCode,
    VerifyPairingCode,
    EnterGuestMode,
    Sleep,
}

impl Command {
    pub const COUNT: usize = 14;

    /// Dense index into a mode's handler row.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Wire id of the command.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Command::GetStatus => 0x01,
            Command::GetActivity => 0x02,
            Command::SetPlayerProfile => 0x10,
            Command::GetPlayerProfile => 0x11,
            Command::ReadDailyLog => 0x12,
            Command::StartMeasurement => 0x20,
            Command::StartRawStream => 0x21,
            Command::StartCalibration => 0x22,
            Command::Stop => 0x23,
            Command::SetPairingCode => 0x30,
            Command::ClearPairingCode => 0x31,
            Command::VerifyPairingCode => 0x32,
            Command::EnterGuestMode => 0x33,
            Command::Sleep => 0x40,
        }
    }

    /// Pairing and profile mutations, which guests may not perform.
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(
            self,
            Command::SetPlayerProfile | Command::SetPairingCode | Command::ClearPairingCode
        )
    }

    /// Commands reachable before the pairing code has been verified.
    #[must_use]
    pub const fn allowed_unverified(self) -> bool {
        matches!(
            self,
            Command::GetStatus | Command::VerifyPairingCode | Command::EnterGuestMode
        )
    }
}

/// Raw id that names no command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UnknownCommand(pub u8);

impl TryFrom<u8> for Command {
    type Error = UnknownCommand;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Ok(match id {
            0x01 => Command::GetStatus,
            0x02 => Command::GetActivity,
            0x10 => Command::SetPlayerProfile,
            0x11 => Command::GetPlayerProfile,
            0x12 => Command::ReadDailyLog,
            0x20 => Command::StartMeasurement,
            0x21 => Command::StartRawStream,
            0x22 => Command::StartCalibration,
            0x23 => Command::Stop,
            0x30 => Command::SetPairingCode,
            0x31 => Command::ClearPairingCode,
            0x32 => Command::VerifyPairingCode,
            0x33 => Command::EnterGuestMode,
            0x40 => Command::Sleep,
            other => return Err(UnknownCommand(other)),
        })
    }
}

/// Status byte carried in every reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Ok,
    UnknownCommand,
    AccessDenied,
    UnsupportedInMode,
    InvalidPayload,
    Busy,
    StorageFailure,
    InvalidState,
    LinkParameters,
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            ErrorCode::Ok => 0x00,
            ErrorCode::UnknownCommand => 0x01,
            ErrorCode::AccessDenied => 0x02,
            ErrorCode::UnsupportedInMode => 0x03,
            ErrorCode::InvalidPayload => 0x04,
            ErrorCode::Busy => 0x05,
            ErrorCode::StorageFailure => 0x06,
            ErrorCode::InvalidState => 0x07,
            ErrorCode::LinkParameters => 0x08,
        }
    }
}

impl From<FlashError> for ErrorCode {
    fn from(error: FlashError) -> Self {
        match error {
            FlashError::Busy | FlashError::QueueFull => ErrorCode::Busy,
            FlashError::LinkParameters => ErrorCode::LinkParameters,
            FlashError::NotMounted
            | FlashError::Driver(_)
            | FlashError::WriteFailed
            | FlashError::EraseFailed => ErrorCode::StorageFailure,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::UnknownCommand => "unknown command",
            ErrorCode::AccessDenied => "access denied",
            ErrorCode::UnsupportedInMode => "unsupported in mode",
            ErrorCode::InvalidPayload => "invalid payload",
            ErrorCode::Busy => "busy",
            ErrorCode::StorageFailure => "storage failure",
            ErrorCode::InvalidState => "invalid state",
            ErrorCode::LinkParameters => "link parameters",
        };
        f.write_str(text)
    }
}

/// Answer notified on the response characteristic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub command: u8,
    pub code: ErrorCode,
    pub payload: Vec<u8, MAX_REPLY_PAYLOAD>,
}

impl Reply {
    #[must_use]
    pub fn ok(command: Command, body: &[u8]) -> Self {
        let len = body.len().min(MAX_REPLY_PAYLOAD);
        let mut payload = Vec::new();
        // Cannot fail: `len` is clamped to the capacity.
        let _ = payload.extend_from_slice(&body[..len]);
        Self {
            command: command.id(),
            code: ErrorCode::Ok,
            payload,
        }
    }

    #[must_use]
    pub fn error(command: u8, code: ErrorCode) -> Self {
        Self {
            command,
            code,
            payload: Vec::new(),
        }
    }

    /// `[command, code, payload…]`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8, { MAX_REPLY_PAYLOAD + 2 }> {
        let mut out = Vec::new();
        let _ = out.push(self.command);
        let _ = out.push(self.code.code());
        let _ = out.extend_from_slice(&self.payload);
        out
    }
}

/// Snapshot of controller state used by the status reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusReport {
    pub state: ConnState,
    pub battery_mv: u16,
    pub flash_busy: bool,
}

/// Everything a command or sample handler may touch besides the dispatcher.
pub struct DispatchEnv<'a, P, Q: ?Sized> {
    pub platform: &'a mut P,
    pub sink: &'a Q,
    pub flash: &'a FlashController,
    pub totals: &'a mut ActivityTotals,
    pub status: StatusReport,
    pub trace: &'a mut TraceLog,
}

/// Active mode record plus the access guard of the current link.
pub struct Dispatcher {
    mode: ModeRecord,
    guard: AccessGuard,
    epoch: LinkEpoch,
    session: ActivityTotals,
}

impl Dispatcher {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: Mode::DailyTracking.record(),
            guard: AccessGuard::new(false),
            epoch: LinkEpoch::new(0),
            session: ActivityTotals {
                steps: 0,
                runs: 0,
                dashes: 0,
            },
        }
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode.mode
    }

    #[must_use]
    pub const fn record(&self) -> &ModeRecord {
        &self.mode
    }

    #[must_use]
    pub const fn guard(&self) -> AccessGuard {
        self.guard
    }

    /// Epoch of the current link's access state.
    #[must_use]
    pub const fn link_epoch(&self) -> LinkEpoch {
        self.epoch
    }

    /// Totals of the running timed session.
    #[must_use]
    pub const fn session(&self) -> ActivityTotals {
        self.session
    }

    /// Swaps in the record for `mode`.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode.record();
        self.session.clear();
    }

    /// Resets the per-link access state and starts a new epoch.
    pub fn reset_link(&mut self, pairing_required: bool) {
        self.guard.reset_link(pairing_required);
        self.epoch = self.epoch.next();
    }

    /// Runs one protocol command and returns the immediate reply, if any.
    pub fn handle<P, Q>(
        &mut self,
        command: &ProtocolCommand,
        env: &mut DispatchEnv<'_, P, Q>,
    ) -> Option<Reply>
    where
        P: Platform,
        Q: EventSink + ?Sized,
    {
        let parsed = match Command::try_from(command.id) {
            Ok(parsed) => parsed,
            Err(UnknownCommand(id)) => {
                return Some(self.reject(id, ErrorCode::UnknownCommand, env.trace));
            }
        };

        match self.guard.check(parsed) {
            Access::Admit => {}
            Access::Deny(code) => return Some(self.reject(command.id, code, env.trace)),
            Access::Ignore => {
                env.trace.record(TraceEvent::CommandRejected {
                    id: command.id,
                    code: ErrorCode::AccessDenied,
                });
                return None;
            }
        }

        let handler = self.mode.handler(parsed);
        self.execute(handler, parsed, &command.payload, env)
    }

    /// Reply owed to the command that started a storage operation.
    ///
    /// Outcomes of requests made on an earlier link touch neither the guard
    /// nor the current central.
    pub fn on_flash_report(&mut self, report: FlashReport, trace: &mut TraceLog) -> Option<Reply> {
        let command = match report.kind {
            OperationKind::UpdatePlayerProfile => Command::SetPlayerProfile,
            OperationKind::PairingWrite => Command::SetPairingCode,
            OperationKind::PairingErase => Command::ClearPairingCode,
            OperationKind::PairingCheck => Command::VerifyPairingCode,
            OperationKind::Idle | OperationKind::WriteDailyLog | OperationKind::RotateLog => {
                return None;
            }
        };
        if report.origin != self.epoch {
            // What is stored still decides whether this link must pair.
            if report.result.is_ok() {
                match report.kind {
                    OperationKind::PairingWrite => self.guard.pairing_required = true,
                    OperationKind::PairingErase => self.guard.pairing_required = false,
                    _ => {}
                }
            }
            trace.record(TraceEvent::FlashStale(report.kind));
            return None;
        }

        match report.result {
            Ok(FlashOutcome::PairingMatch(true)) => {
                self.guard.mark_verified();
                Some(Reply::ok(command, &[]))
            }
            Ok(FlashOutcome::PairingMatch(false)) => {
                Some(Reply::error(command.id(), ErrorCode::AccessDenied))
            }
            Ok(FlashOutcome::Completed | FlashOutcome::LogAppended(_)) => {
                match report.kind {
                    // The central that set the code obviously knows it.
                    OperationKind::PairingWrite => {
                        self.guard.pairing_required = true;
                        self.guard.mark_verified();
                    }
                    OperationKind::PairingErase => self.guard.pairing_required = false,
                    _ => {}
                }
                Some(Reply::ok(command, &[]))
            }
            Err(error) => Some(Reply::error(command.id(), ErrorCode::from(error))),
        }
    }

    /// Drains up to [`MAX_SAMPLES_PER_BATCH`] samples through the active mode.
    ///
    /// Returns the calibration-complete notification when one is due.
    pub fn consume_samples<P, Q>(&mut self, env: &mut DispatchEnv<'_, P, Q>) -> Option<Reply>
    where
        P: Platform,
        Q: EventSink + ?Sized,
    {
        for _ in 0..MAX_SAMPLES_PER_BATCH {
            let sample = env.platform.sensor().next_sample()?;
            if let Some(reply) = self.consume(&sample, env) {
                return Some(reply);
            }
        }

        // More samples are waiting; come back after other events had a turn.
        if env.sink.post(Event::SensorDataReady).is_err() {
            env.trace.record(TraceEvent::QueueDrop(EventKind::SensorDataReady));
        }
        None
    }

    fn consume<P, Q>(&mut self, sample: &Sample, env: &mut DispatchEnv<'_, P, Q>) -> Option<Reply>
    where
        P: Platform,
        Q: EventSink + ?Sized,
    {
        match self.mode.samples {
            SampleHandler::Classify | SampleHandler::ClassifySession => {
                let classification = env.platform.classifier().process(sample);
                env.totals.add(&classification);
                if self.mode.samples == SampleHandler::ClassifySession {
                    self.session.add(&classification);
                }
                if classification.lateral_wake {
                    post(env, Event::SensorWakeup);
                }
                None
            }
            SampleHandler::Stream => {
                if env.status.state.is_connected()
                    && env
                        .platform
                        .radio()
                        .notify(Characteristic::RawData, &sample.to_bytes())
                        .is_err()
                {
                    env.trace.record(TraceEvent::NotifyFailed);
                }
                None
            }
            SampleHandler::Calibrate => match env.platform.classifier().calibrate(sample) {
                CalibrationProgress::InProgress(_) => None,
                CalibrationProgress::Complete => {
                    post(env, Event::ModeChange(Mode::DailyTracking));
                    Some(Reply::ok(Command::StartCalibration, &[100]))
                }
            },
        }
    }

    fn execute<P, Q>(
        &mut self,
        handler: CommandHandler,
        command: Command,
        body: &[u8],
        env: &mut DispatchEnv<'_, P, Q>,
    ) -> Option<Reply>
    where
        P: Platform,
        Q: EventSink + ?Sized,
    {
        match handler {
            CommandHandler::ReplyStatus => Some(Reply::ok(command, &self.status_bytes(env.status))),
            CommandHandler::ReplyActivity => Some(Reply::ok(command, &env.totals.to_bytes())),
            CommandHandler::StoreProfile => match PlayerProfile::parse(body) {
                Some(profile) => self.start_storage(
                    command,
                    FlashRequest::UpdatePlayerProfile(profile),
                    env,
                ),
                None => Some(self.reject(command.id(), ErrorCode::InvalidPayload, env.trace)),
            },
            CommandHandler::ReplyProfile => {
                let profile = env.flash.profile().unwrap_or_default();
                Some(Reply::ok(command, &profile.to_bytes()))
            }
            CommandHandler::ReadLog => {
                let back = match body {
                    [] => 0,
                    [single] => u16::from(*single),
                    [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                };
                match env.flash.read_summary(env.platform.storage(), back) {
                    Ok(Some(summary)) => Some(Reply::ok(command, &summary.to_bytes())),
                    Ok(None) => Some(Reply::ok(command, &[])),
                    Err(error) => Some(self.reject(command.id(), error.into(), env.trace)),
                }
            }
            CommandHandler::StartMeasurement => {
                match Measurement::from_code(body.first().copied().unwrap_or(0)) {
                    Some(kind) => {
                        self.post_or_busy(command, Event::ModeChange(Mode::TimedMeasurement(kind)), env)
                    }
                    None => Some(self.reject(command.id(), ErrorCode::InvalidPayload, env.trace)),
                }
            }
            CommandHandler::StartRawStream => {
                self.post_or_busy(command, Event::ModeChange(Mode::RawStream), env)
            }
            CommandHandler::StartCalibration => {
                self.post_or_busy(command, Event::ModeChange(Mode::Calibration), env)
            }
            CommandHandler::StopMode => {
                if matches!(self.mode.mode, Mode::TimedMeasurement(_)) {
                    let timestamp = match body {
                        [a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
                        _ => 0,
                    };
                    let summary = self.session.summary(timestamp);
                    post(
                        env,
                        Event::FlashRequest(FlashRequest::WriteDailyLog(summary), self.epoch),
                    );
                }
                self.post_or_busy(command, Event::ModeChange(Mode::DailyTracking), env)
            }
            CommandHandler::StorePairing => match PairingCode::parse(body) {
                Some(code) => self.start_storage(command, FlashRequest::PairingWrite(code), env),
                None => Some(self.reject(command.id(), ErrorCode::InvalidPayload, env.trace)),
            },
            CommandHandler::ClearPairing => {
                self.start_storage(command, FlashRequest::PairingErase, env)
            }
            CommandHandler::VerifyPairing => match PairingCode::parse(body) {
                Some(code) => self.start_storage(command, FlashRequest::PairingCheck(code), env),
                None => Some(self.reject(command.id(), ErrorCode::InvalidPayload, env.trace)),
            },
            CommandHandler::EnterGuest => {
                self.guard.enter_guest();
                Some(Reply::ok(command, &[]))
            }
            CommandHandler::RequestSleep => self.post_or_busy(command, Event::SleepRequested, env),
            CommandHandler::Unsupported => {
                Some(self.reject(command.id(), ErrorCode::UnsupportedInMode, env.trace))
            }
        }
    }

    /// Queues a storage request; the reply follows with the storage report.
    fn start_storage<P, Q>(
        &self,
        command: Command,
        request: FlashRequest,
        env: &mut DispatchEnv<'_, P, Q>,
    ) -> Option<Reply>
    where
        Q: EventSink + ?Sized,
    {
        match env.sink.post(Event::FlashRequest(request, self.epoch)) {
            Ok(()) => None,
            Err(_) => {
                env.trace.record(TraceEvent::QueueDrop(EventKind::FlashRequest));
                Some(Reply::error(command.id(), ErrorCode::Busy))
            }
        }
    }

    fn post_or_busy<P, Q>(
        &self,
        command: Command,
        event: Event,
        env: &mut DispatchEnv<'_, P, Q>,
    ) -> Option<Reply>
    where
        Q: EventSink + ?Sized,
    {
        let kind = event.kind();
        match env.sink.post(event) {
            Ok(()) => Some(Reply::ok(command, &[])),
            Err(_) => {
                env.trace.record(TraceEvent::QueueDrop(kind));
                Some(Reply::error(command.id(), ErrorCode::Busy))
            }
        }
    }

    fn reject(&self, id: u8, code: ErrorCode, trace: &mut TraceLog) -> Reply {
        trace.record(TraceEvent::CommandRejected { id, code });
        Reply::error(id, code)
    }

    /// Body of the status reply and of status characteristic reads.
    #[must_use]
    pub fn status_bytes(&self, status: StatusReport) -> [u8; 5] {
        let mut flags = 0u8;
        if self.guard.pairing_required {
            flags |= 0b0001;
        }
        if self.guard.verified {
            flags |= 0b0010;
        }
        if self.guard.guest {
            flags |= 0b0100;
        }
        if status.flash_busy {
            flags |= 0b1000;
        }
        let [lo, hi] = status.battery_mv.to_le_bytes();
        [status.state.code(), self.mode.mode.code(), lo, hi, flags]
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn post<P, Q>(env: &mut DispatchEnv<'_, P, Q>, event: Event)
where
    Q: EventSink + ?Sized,
{
    let kind = event.kind();
    if env.sink.post(event).is_err() {
        env.trace.record(TraceEvent::QueueDrop(kind));
    }
}
