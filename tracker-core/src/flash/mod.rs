//! Nested state machine serialising multi-step storage operations.
//!
//! The lifecycle machine routes storage requests, step markers and driver
//! completions here. Only one operation is active at a time and at most one
//! erase or write transaction is outstanding. A request that arrives while
//! another operation is active is parked, and the oldest parked request goes
//! back on the queue when the active operation ends. When the parking area
//! is full the request is re-posted to the queue tail untouched.
//!
//! Writes need slave latency 0 while a link is up, but the controller never
//! touches the radio: it posts `ParamChangeRequested` and waits for
//! [`FlashController::on_parameters_changed`], then posts
//! `ParamRestoreRequested` once the operation ends.
//!
//! Step markers carry the ticket of the operation that posted them. Force
//! reinit moves the ticket on, so markers still queued for an abandoned
//! operation are recognised and dropped.

use core::fmt;

use heapless::Deque;

use crate::dispatch::{ActivityTotals, LinkEpoch};
use crate::drivers::{Region, SlaveLatency, StorageDriver, StorageError, StorageHandle, StorageStatus};
use crate::event::{Event, EventKind};
use crate::machine::{Fault, LinkState};
use crate::queue::EventSink;
use crate::retry::{RetryCounter, RetryVerdict};
use crate::trace::{TraceEvent, TraceLog};

pub mod layout;
pub mod ops;

use layout::{
    LOG_MAGIC, LogCursor, PAIRING_IMAGE_LEN, PROFILE_IMAGE_LEN, RECORD_LEN, RegionHeader,
    SECTOR_SIZE, decode_record, encode_record, pairing_image, parse_pairing_image,
    parse_profile_image, profile_image, record_offset, sector_offset,
};
pub use ops::{
    Carried, DailySummary, FlashRequest, IDLE_TEMPLATE, OperationKind, OperationRecord,
    PairingCode, PlayerProfile, Sequence, StepFlags, StepHandler, SubEvent, template_for,
};

/// Seconds since the epoch as kept by the real-time clock.
pub type Timestamp = u32;

/// Requests held back while another operation is active.
pub const PARKED_REQUESTS: usize = 4;

/// Internal progress markers of the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    StatusCheck,
    OperationStarted,
}

/// Step marker event payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashStep {
    pub stage: Stage,
    /// Ticket of the operation that posted the marker.
    pub ticket: u16,
}

/// Why a storage operation was abandoned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    /// Regions were not opened.
    NotMounted,
    /// The driver stayed busy past the retry ceiling.
    Busy,
    /// The driver rejected a request.
    Driver(StorageError),
    WriteFailed,
    EraseFailed,
    /// A follow-up event could not be queued.
    QueueFull,
    /// Connection-parameter negotiation gave up.
    LinkParameters,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::NotMounted => f.write_str("storage not mounted"),
            FlashError::Busy => f.write_str("storage busy"),
            FlashError::Driver(error) => write!(f, "{error}"),
            FlashError::WriteFailed => f.write_str("write failed"),
            FlashError::EraseFailed => f.write_str("erase failed"),
            FlashError::QueueFull => f.write_str("event queue full"),
            FlashError::LinkParameters => f.write_str("link parameters unavailable"),
        }
    }
}

/// Successful end of an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOutcome {
    Completed,
    /// A log record was written; carries what went to flash.
    LogAppended(DailySummary),
    /// Result of a pairing check.
    PairingMatch(bool),
}

/// Outcome handed back to the lifecycle machine when an operation ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashReport {
    pub kind: OperationKind,
    /// Link whose command asked for the operation.
    pub origin: LinkEpoch,
    pub result: Result<FlashOutcome, FlashError>,
}

/// Everything a storage handler may touch besides the controller itself.
pub struct FlashEnv<'a, S: ?Sized, Q: ?Sized> {
    pub storage: &'a mut S,
    pub sink: &'a Q,
    pub link: LinkState,
    pub totals: ActivityTotals,
    pub trace: &'a mut TraceLog,
}

#[derive(Copy, Clone, Debug)]
struct Handles {
    profile: StorageHandle,
    log: StorageHandle,
    pairing: StorageHandle,
}

impl Handles {
    const fn get(&self, region: Region) -> StorageHandle {
        match region {
            Region::Profile => self.profile,
            Region::Log => self.log,
            Region::Pairing => self.pairing,
        }
    }
}

/// Storage operation controller.
pub struct FlashController {
    record: OperationRecord,
    origin: LinkEpoch,
    parked: Deque<(FlashRequest, LinkEpoch), PARKED_REQUESTS>,
    ticket: u16,
    storage_retries: RetryCounter,
    handles: Option<Handles>,
    cursor: LogCursor,
    profile: Option<PlayerProfile>,
    pairing: Option<PairingCode>,
}

type Step = Result<Option<FlashReport>, Fault>;

impl FlashController {
    #[must_use]
    pub const fn new(storage_retry_limit: u16) -> Self {
        Self {
            record: IDLE_TEMPLATE,
            origin: LinkEpoch::new(0),
            parked: Deque::new(),
            ticket: 0,
            storage_retries: RetryCounter::new(storage_retry_limit),
            handles: None,
            cursor: LogCursor::blank(),
            profile: None,
            pairing: None,
        }
    }

    /// Opens the regions and loads the cached profile, pairing code and log cursor.
    ///
    /// # Errors
    ///
    /// Propagates the first driver failure; the controller stays unmounted.
    pub fn mount<S>(&mut self, storage: &mut S) -> Result<(), FlashError>
    where
        S: StorageDriver + ?Sized,
    {
        if self.handles.is_some() {
            return Ok(());
        }

        let handles = Handles {
            profile: storage.init(Region::Profile).map_err(FlashError::Driver)?,
            log: storage.init(Region::Log).map_err(FlashError::Driver)?,
            pairing: storage.init(Region::Pairing).map_err(FlashError::Driver)?,
        };

        let mut profile = [0u8; PROFILE_IMAGE_LEN];
        storage
            .read(handles.profile, 0, &mut profile)
            .map_err(FlashError::Driver)?;
        self.profile = parse_profile_image(&profile);

        let mut pairing = [0u8; PAIRING_IMAGE_LEN];
        storage
            .read(handles.pairing, 0, &mut pairing)
            .map_err(FlashError::Driver)?;
        self.pairing = parse_pairing_image(&pairing);

        let mut header = [0u8; layout::HEADER_LEN];
        storage
            .read(handles.log, 0, &mut header)
            .map_err(FlashError::Driver)?;
        let header = RegionHeader::decode(&header, LOG_MAGIC);
        self.cursor = LogCursor::recover(header, |index| {
            let mut bytes = [0u8; RECORD_LEN];
            storage
                .read(handles.log, record_offset(index), &mut bytes)
                .ok()?;
            decode_record(&bytes).map(|(_, generation)| generation)
        });

        self.handles = Some(handles);
        Ok(())
    }

    /// Closes the regions ahead of deep sleep. Refuses while an operation is active.
    pub fn unmount<S>(&mut self, storage: &mut S) -> bool
    where
        S: StorageDriver + ?Sized,
    {
        if !self.record.is_idle() {
            return false;
        }
        if let Some(handles) = self.handles.take() {
            storage.uninit(handles.profile);
            storage.uninit(handles.log);
            storage.uninit(handles.pairing);
        }
        true
    }

    /// Starts `request` made on link `origin`, or defers it when another
    /// operation is active.
    ///
    /// # Errors
    ///
    /// Returns a [`Fault`] only when the operation catalog is inconsistent.
    pub fn request<S, Q>(
        &mut self,
        request: FlashRequest,
        origin: LinkEpoch,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Step
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let kind = request.kind();
        if !self.record.is_idle() {
            env.trace.record(TraceEvent::FlashDeferred(kind));
            let requeued = match self.parked.push_back((request, origin)) {
                Ok(()) => Ok(()),
                Err((request, origin)) => env.sink.post(Event::FlashRequest(request, origin)),
            };
            if requeued.is_err() {
                env.trace.record(TraceEvent::QueueDrop(EventKind::FlashRequest));
            }
            return Ok(None);
        }

        self.record = template_for(kind)?;
        self.record.payload = request.carried();
        self.origin = origin;
        self.ticket = self.ticket.wrapping_add(1);
        self.storage_retries.reset();
        env.trace.record(TraceEvent::FlashStarted(kind));

        match self.post_step(Stage::StatusCheck, env) {
            Ok(()) => Ok(None),
            Err(error) => Ok(Some(self.fail(error, env))),
        }
    }

    /// Handles a step marker.
    ///
    /// # Errors
    ///
    /// [`Fault::MissingOperation`] when a current marker finds no active operation.
    pub fn on_step<S, Q>(&mut self, step: FlashStep, env: &mut FlashEnv<'_, S, Q>) -> Step
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        if step.ticket != self.ticket {
            env.trace.record(TraceEvent::FlashSpurious(EventKind::FlashStep));
            return Ok(None);
        }
        if self.record.is_idle() {
            return Err(Fault::MissingOperation);
        }

        let sub = match step.stage {
            Stage::StatusCheck => SubEvent::StatusCheck,
            Stage::OperationStarted => SubEvent::OperationStarted,
        };
        self.run(self.record.handler(sub), sub, StorageStatus::Success, env)
    }

    /// Handles a write-complete event from the driver.
    ///
    /// # Errors
    ///
    /// Propagates faults from the bound step handler.
    pub fn on_write_complete<S, Q>(
        &mut self,
        status: StorageStatus,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Step
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        self.on_completion(SubEvent::WriteComplete, status, env)
    }

    /// Handles an erase-complete event from the driver.
    ///
    /// # Errors
    ///
    /// Propagates faults from the bound step handler.
    pub fn on_erase_complete<S, Q>(
        &mut self,
        status: StorageStatus,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Step
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        self.on_completion(SubEvent::EraseComplete, status, env)
    }

    /// The link now runs at `latency`; resumes an operation waiting for latency 0.
    pub fn on_parameters_changed<S, Q>(
        &mut self,
        latency: SlaveLatency,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        if !latency.is_zero() || !self.record.steps.contains(StepFlags::REQUEST_LATENCY_0) {
            return None;
        }
        self.record.steps.remove(StepFlags::REQUEST_LATENCY_0);
        self.resume(env)
    }

    /// The link dropped: nothing is owed to the radio any more.
    pub fn on_link_lost<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let waiting = self.record.steps.contains(StepFlags::REQUEST_LATENCY_0);
        self.record.steps.remove(StepFlags::REQUEST_LATENCY_0);
        self.record.steps.remove(StepFlags::REQUEST_LATENCY_1);
        if waiting { self.resume(env) } else { None }
    }

    /// Drops the active operation with `error` and no parameter restore.
    pub fn abandon<S, Q>(
        &mut self,
        error: FlashError,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Option<FlashReport>
    where
        S: ?Sized,
        Q: EventSink + ?Sized,
    {
        let kind = self.record.kind;
        if self.record.is_idle() {
            return None;
        }
        let origin = self.origin;
        self.force_reinit();
        env.trace.record(TraceEvent::FlashFailed { kind, error });
        self.release_parked(env);
        Some(FlashReport {
            kind,
            origin,
            result: Err(error),
        })
    }

    /// Reinstalls the idle record. Calling it again while idle changes nothing.
    ///
    /// Parked requests stay parked until an operation ends.
    pub fn force_reinit(&mut self) {
        if self.record.is_idle() {
            return;
        }
        self.record = IDLE_TEMPLATE;
        self.ticket = self.ticket.wrapping_add(1);
        self.storage_retries.reset();
    }

    /// Reads the summary `back` entries before the newest one.
    ///
    /// # Errors
    ///
    /// Driver failures and an unmounted controller are reported.
    pub fn read_summary<S>(
        &self,
        storage: &mut S,
        back: u16,
    ) -> Result<Option<DailySummary>, FlashError>
    where
        S: StorageDriver + ?Sized,
    {
        let handles = self.handles.ok_or(FlashError::NotMounted)?;
        let Some((index, generation)) = self.cursor.locate(back) else {
            return Ok(None);
        };
        let mut bytes = [0u8; RECORD_LEN];
        storage
            .read(handles.log, record_offset(index), &mut bytes)
            .map_err(FlashError::Driver)?;
        Ok(decode_record(&bytes)
            .filter(|(_, stored)| *stored == generation)
            .map(|(summary, _)| summary))
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.record.kind
    }

    #[must_use]
    pub const fn sequence(&self) -> Sequence {
        self.record.sequence
    }

    #[must_use]
    pub const fn steps(&self) -> StepFlags {
        self.record.steps
    }

    #[must_use]
    pub const fn record(&self) -> &OperationRecord {
        &self.record
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.record.is_idle()
    }

    #[must_use]
    pub const fn is_mounted(&self) -> bool {
        self.handles.is_some()
    }

    #[must_use]
    pub const fn ticket(&self) -> u16 {
        self.ticket
    }

    #[must_use]
    pub const fn profile(&self) -> Option<PlayerProfile> {
        self.profile
    }

    #[must_use]
    pub const fn pairing_code(&self) -> Option<PairingCode> {
        self.pairing
    }

    #[must_use]
    pub const fn cursor(&self) -> LogCursor {
        self.cursor
    }

    /// Number of requests waiting for the active operation to end.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    fn on_completion<S, Q>(
        &mut self,
        sub: SubEvent,
        status: StorageStatus,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Step
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let matches = self
            .record
            .in_flight
            .is_some_and(|step| step.is_erase() == matches!(sub, SubEvent::EraseComplete));
        if !matches {
            let kind = match sub {
                SubEvent::EraseComplete => EventKind::EraseComplete,
                _ => EventKind::WriteComplete,
            };
            env.trace.record(TraceEvent::FlashSpurious(kind));
            return Ok(None);
        }
        self.run(self.record.handler(sub), sub, status, env)
    }

    fn run<S, Q>(
        &mut self,
        handler: StepHandler,
        sub: SubEvent,
        status: StorageStatus,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Step
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        match handler {
            StepHandler::PlanProfile => {
                Ok(self.plan(StepFlags::ERASE_PROFILE.union(StepFlags::WRITE_PROFILE), env))
            }
            StepHandler::PlanPairingWrite => {
                Ok(self.plan(StepFlags::ERASE_PAIRING.union(StepFlags::WRITE_PAIRING), env))
            }
            StepHandler::PlanPairingErase => Ok(self.plan(StepFlags::ERASE_PAIRING, env)),
            StepHandler::PlanRotation => {
                if let Carried::Timestamp(timestamp) = self.record.payload {
                    self.record.payload = Carried::Summary(env.totals.summary(timestamp));
                }
                Ok(self.plan_log_append(env))
            }
            StepHandler::PlanLogAppend => Ok(self.plan_log_append(env)),
            StepHandler::VerifyPairing => Ok(Some(self.verify_pairing(env))),
            StepHandler::IssueNext => Ok(self.issue_next(env)),
            StepHandler::CompleteStep => Ok(self.complete_step(status, env)),
            StepHandler::Unexpected => match sub {
                SubEvent::StatusCheck | SubEvent::OperationStarted => Err(Fault::MissingOperation),
                SubEvent::WriteComplete => {
                    env.trace.record(TraceEvent::FlashSpurious(EventKind::WriteComplete));
                    Ok(None)
                }
                SubEvent::EraseComplete => {
                    env.trace.record(TraceEvent::FlashSpurious(EventKind::EraseComplete));
                    Ok(None)
                }
            },
        }
    }

    fn plan_log_append<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let plan = self.cursor.plan_append();
        self.record.target.append = Some(plan);

        let mut steps = StepFlags::WRITE_LOG;
        if plan.erase_sector {
            steps.insert(StepFlags::ERASE_LOG);
        }
        if plan.rewrite_header {
            steps.insert(StepFlags::ERASE_LOG_HEADER.union(StepFlags::WRITE_LOG_HEADER));
        }
        self.plan(steps, env)
    }

    fn plan<S, Q>(&mut self, steps: StepFlags, env: &mut FlashEnv<'_, S, Q>) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        if self.handles.is_none() {
            return Some(self.fail(FlashError::NotMounted, env));
        }

        self.record.steps = steps;
        self.record.advance(Sequence::StatusChecked);
        self.trace_step(env);

        if env.link.connected {
            self.record.steps.insert(StepFlags::REQUEST_LATENCY_1);
            if !env.link.latency.is_zero() {
                self.record.steps.insert(StepFlags::REQUEST_LATENCY_0);
                self.record.advance(Sequence::AwaitingLatency);
                self.trace_step(env);
                if env.sink.post(Event::ParamChangeRequested).is_err() {
                    env.trace.record(TraceEvent::QueueDrop(EventKind::ParamChangeRequested));
                    return Some(self.fail(FlashError::QueueFull, env));
                }
                return None;
            }
        }

        self.resume(env)
    }

    fn verify_pairing<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>) -> FlashReport
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let Carried::Pairing(presented) = self.record.payload else {
            return self.fail(FlashError::NotMounted, env);
        };
        let Some(handles) = self.handles else {
            return self.fail(FlashError::NotMounted, env);
        };
        self.record.advance(Sequence::StatusChecked);

        let mut image = [0u8; PAIRING_IMAGE_LEN];
        if let Err(error) = env.storage.read(handles.pairing, 0, &mut image) {
            return self.fail(FlashError::Driver(error), env);
        }
        let matched = parse_pairing_image(&image).is_none_or(|stored| stored == presented);
        self.finish(FlashOutcome::PairingMatch(matched), env)
    }

    fn issue_next<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        // A duplicate start marker while a transaction is outstanding.
        if self.record.in_flight.is_some()
            || self.record.steps.contains(StepFlags::REQUEST_LATENCY_0)
        {
            return None;
        }
        self.record.advance(Sequence::Started);

        let Some(step) = self.record.steps.next_storage_step() else {
            return Some(self.finish(FlashOutcome::Completed, env));
        };

        match self.issue(step, env) {
            Ok(()) => {
                self.storage_retries.reset();
                self.record.in_flight = Some(step);
                self.record.advance(if step.is_erase() {
                    Sequence::Erasing
                } else {
                    Sequence::Writing
                });
                self.trace_step(env);
                None
            }
            Err(StorageError::Busy) => match self.storage_retries.record_failure() {
                RetryVerdict::Retry(_) => match self.post_step(Stage::OperationStarted, env) {
                    Ok(()) => None,
                    Err(error) => Some(self.fail(error, env)),
                },
                RetryVerdict::Escalate => Some(self.fail(FlashError::Busy, env)),
            },
            Err(error) => Some(self.fail(FlashError::Driver(error), env)),
        }
    }

    fn issue<S, Q>(&self, step: StepFlags, env: &mut FlashEnv<'_, S, Q>) -> Result<(), StorageError>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let handles = self.handles.ok_or(StorageError::Failed)?;
        let region = step.region().ok_or(StorageError::Failed)?;
        let handle = handles.get(region);
        let append = self.record.target.append;

        match step {
            StepFlags::ERASE_LOG_HEADER | StepFlags::ERASE_PROFILE | StepFlags::ERASE_PAIRING => {
                env.storage.erase(handle, 0, SECTOR_SIZE)
            }
            StepFlags::ERASE_LOG => {
                let plan = append.ok_or(StorageError::Failed)?;
                env.storage.erase(handle, sector_offset(plan.index), SECTOR_SIZE)
            }
            StepFlags::WRITE_LOG_HEADER => {
                let plan = append.ok_or(StorageError::Failed)?;
                let header = RegionHeader::new(LOG_MAGIC, plan.generation).encode();
                env.storage.write(handle, 0, &header)
            }
            StepFlags::WRITE_LOG => {
                let plan = append.ok_or(StorageError::Failed)?;
                let Carried::Summary(summary) = self.record.payload else {
                    return Err(StorageError::Failed);
                };
                let record = encode_record(&summary, plan.generation);
                env.storage.write(handle, record_offset(plan.index), &record)
            }
            StepFlags::WRITE_PROFILE => {
                let Carried::Profile(profile) = self.record.payload else {
                    return Err(StorageError::Failed);
                };
                env.storage.write(handle, 0, &profile_image(&profile))
            }
            StepFlags::WRITE_PAIRING => {
                let Carried::Pairing(code) = self.record.payload else {
                    return Err(StorageError::Failed);
                };
                env.storage.write(handle, 0, &pairing_image(&code))
            }
            _ => Err(StorageError::Failed),
        }
    }

    fn complete_step<S, Q>(
        &mut self,
        status: StorageStatus,
        env: &mut FlashEnv<'_, S, Q>,
    ) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        let step = self.record.in_flight.take()?;
        if status == StorageStatus::Failed {
            let error = if step.is_erase() {
                FlashError::EraseFailed
            } else {
                FlashError::WriteFailed
            };
            return Some(self.fail(error, env));
        }
        self.record.steps.remove(step);
        self.issue_next(env)
    }

    fn resume<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>) -> Option<FlashReport>
    where
        S: StorageDriver + ?Sized,
        Q: EventSink + ?Sized,
    {
        match self.post_step(Stage::OperationStarted, env) {
            Ok(()) => None,
            Err(error) => Some(self.fail(error, env)),
        }
    }

    fn post_step<S, Q>(&self, stage: Stage, env: &mut FlashEnv<'_, S, Q>) -> Result<(), FlashError>
    where
        S: ?Sized,
        Q: EventSink + ?Sized,
    {
        let step = FlashStep {
            stage,
            ticket: self.ticket,
        };
        env.sink.post(Event::FlashStep(step)).map_err(|_| {
            env.trace.record(TraceEvent::QueueDrop(EventKind::FlashStep));
            FlashError::QueueFull
        })
    }

    fn finish<S, Q>(&mut self, outcome: FlashOutcome, env: &mut FlashEnv<'_, S, Q>) -> FlashReport
    where
        S: ?Sized,
        Q: EventSink + ?Sized,
    {
        self.record.advance(Sequence::Finishing);
        self.trace_step(env);

        let mut outcome = outcome;
        match (self.record.kind, self.record.payload) {
            (OperationKind::UpdatePlayerProfile, Carried::Profile(profile)) => {
                self.profile = Some(profile);
            }
            (OperationKind::PairingWrite, Carried::Pairing(code)) => self.pairing = Some(code),
            (OperationKind::PairingErase, _) => self.pairing = None,
            (OperationKind::WriteDailyLog | OperationKind::RotateLog, Carried::Summary(summary)) => {
                if let Some(plan) = self.record.target.append {
                    self.cursor.commit(plan);
                }
                outcome = FlashOutcome::LogAppended(summary);
            }
            _ => {}
        }

        let kind = self.record.kind;
        let origin = self.origin;
        self.restore_latency(env);
        self.force_reinit();
        env.trace.record(TraceEvent::FlashFinished(kind));
        self.release_parked(env);
        FlashReport {
            kind,
            origin,
            result: Ok(outcome),
        }
    }

    fn fail<S, Q>(&mut self, error: FlashError, env: &mut FlashEnv<'_, S, Q>) -> FlashReport
    where
        S: ?Sized,
        Q: EventSink + ?Sized,
    {
        let kind = self.record.kind;
        let origin = self.origin;
        self.restore_latency(env);
        self.force_reinit();
        env.trace.record(TraceEvent::FlashFailed { kind, error });
        self.release_parked(env);
        FlashReport {
            kind,
            origin,
            result: Err(error),
        }
    }

    /// Hands the oldest parked request back to the queue.
    fn release_parked<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>)
    where
        S: ?Sized,
        Q: EventSink + ?Sized,
    {
        let Some((request, origin)) = self.parked.pop_front() else {
            return;
        };
        if let Err(full) = env.sink.post(Event::FlashRequest(request, origin)) {
            env.trace.record(TraceEvent::QueueDrop(EventKind::FlashRequest));
            // Kept for the next operation end; the entry was just freed.
            if let Event::FlashRequest(request, origin) = full.into_event() {
                let _ = self.parked.push_front((request, origin));
            }
        }
    }

    fn restore_latency<S, Q>(&mut self, env: &mut FlashEnv<'_, S, Q>)
    where
        S: ?Sized,
        Q: EventSink + ?Sized,
    {
        if !self.record.steps.contains(StepFlags::REQUEST_LATENCY_1) || !env.link.connected {
            return;
        }
        self.record.steps.remove(StepFlags::REQUEST_LATENCY_1);
        if env.sink.post(Event::ParamRestoreRequested).is_err() {
            env.trace.record(TraceEvent::QueueDrop(EventKind::ParamRestoreRequested));
        }
    }

    fn trace_step<S: ?Sized, Q: ?Sized>(&self, env: &mut FlashEnv<'_, S, Q>) {
        env.trace.record(TraceEvent::FlashStep {
            kind: self.record.kind,
            sequence: self.record.sequence,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;

    /// Driver that accepts everything and remembers nothing.
    struct BlankStorage;

    impl StorageDriver for BlankStorage {
        fn init(&mut self, region: Region) -> Result<StorageHandle, StorageError> {
            Ok(StorageHandle::new(region))
        }

        fn read(&mut self, _: StorageHandle, _: u32, buf: &mut [u8]) -> Result<(), StorageError> {
            buf.fill(0xFF);
            Ok(())
        }

        fn write(&mut self, _: StorageHandle, _: u32, _: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }

        fn erase(&mut self, _: StorageHandle, _: u32, _: u32) -> Result<(), StorageError> {
            Ok(())
        }

        fn uninit(&mut self, _: StorageHandle) {}
    }

    fn env<'a>(
        storage: &'a mut BlankStorage,
        queue: &'a EventQueue<8>,
        trace: &'a mut TraceLog,
    ) -> FlashEnv<'a, BlankStorage, EventQueue<8>> {
        FlashEnv {
            storage,
            sink: queue,
            link: LinkState::disconnected(),
            totals: ActivityTotals::default(),
            trace,
        }
    }

    #[test]
    fn stale_marker_after_reinit_is_ignored() {
        let queue = EventQueue::<8>::new();
        let mut storage = BlankStorage;
        let mut trace = TraceLog::new();
        let mut flash = FlashController::new(4);
        flash.mount(&mut storage).unwrap();

        let mut env = env(&mut storage, &queue, &mut trace);
        flash.request(FlashRequest::PairingErase, LinkEpoch::new(0), &mut env).unwrap();
        flash.force_reinit();

        let Some(Event::FlashStep(step)) = queue.dequeue() else {
            panic!("expected status-check marker");
        };
        assert_eq!(flash.on_step(step, &mut env), Ok(None));
        assert!(flash.is_idle());
    }

    #[test]
    fn current_marker_without_operation_is_a_fault() {
        let queue = EventQueue::<8>::new();
        let mut storage = BlankStorage;
        let mut trace = TraceLog::new();
        let mut flash = FlashController::new(4);
        let mut env = env(&mut storage, &queue, &mut trace);

        let step = FlashStep {
            stage: Stage::StatusCheck,
            ticket: flash.ticket(),
        };
        assert_eq!(flash.on_step(step, &mut env), Err(Fault::MissingOperation));
    }

    #[test]
    fn unmounted_request_fails_at_status_check() {
        let queue = EventQueue::<8>::new();
        let mut storage = BlankStorage;
        let mut trace = TraceLog::new();
        let mut flash = FlashController::new(4);
        let mut env = env(&mut storage, &queue, &mut trace);

        flash.request(FlashRequest::PairingErase, LinkEpoch::new(0), &mut env).unwrap();
        let Some(Event::FlashStep(step)) = queue.dequeue() else {
            panic!("expected status-check marker");
        };
        let report = flash.on_step(step, &mut env).unwrap();
        assert_eq!(
            report,
            Some(FlashReport {
                kind: OperationKind::PairingErase,
                origin: LinkEpoch::new(0),
                result: Err(FlashError::NotMounted),
            })
        );
        assert!(flash.is_idle());
    }

    #[test]
    fn blank_pairing_region_accepts_any_code() {
        let queue = EventQueue::<8>::new();
        let mut storage = BlankStorage;
        let mut trace = TraceLog::new();
        let mut flash = FlashController::new(4);
        flash.mount(&mut storage).unwrap();
        assert_eq!(flash.pairing_code(), None);

        let mut env = env(&mut storage, &queue, &mut trace);
        let code = PairingCode::new(*b"123456");
        flash.request(FlashRequest::PairingCheck(code), LinkEpoch::new(0), &mut env).unwrap();
        let Some(Event::FlashStep(step)) = queue.dequeue() else {
            panic!("expected status-check marker");
        };
        let report = flash.on_step(step, &mut env).unwrap();
        assert_eq!(
            report.map(|report| report.result),
            Some(Ok(FlashOutcome::PairingMatch(true)))
        );
        assert!(queue.is_empty());
    }
}
