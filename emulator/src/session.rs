//! Host-side platform and console session driving the real control plane.
//!
//! The fakes stand in for the radio stack, storage driver, sensor and power
//! controller. They behave like a cooperative central and an ideal flash
//! part: accepted parameter requests and disconnects are answered on the next
//! pump, and storage transactions complete as soon as the loop goes idle.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::ops::Add;
use std::time::Duration;

use tracker_core::config::ControlConfig;
use tracker_core::drivers::{
    ActivityClassifier, CalibrationProgress, Characteristic, Classification,
    ConnectionParameters, Platform, PowerControl, RadioError, RadioLink, Region, Sample,
    SampleSource, SlaveLatency, StorageDriver, StorageError, StorageHandle, StorageStatus,
};
use tracker_core::event::ProtocolCommand;
use tracker_core::flash::layout::{LOG_SECTORS, SECTOR_SIZE};
use tracker_core::trace::TraceId;
use tracker_core::{Controller, Event, EventQueue, Fault};

use crate::script::{self, Directive};

pub const QUEUE_DEPTH: usize = tracker_core::config::DEFAULT_QUEUE_DEPTH;

/// Samples collected before calibration reports complete.
const CALIBRATION_SAMPLES: u8 = 8;
/// Battery reading reported until `battery` overrides it.
const DEFAULT_BATTERY_MV: u16 = 3_900;
/// Upper bound on pump rounds per directive; a livelock shows up as a message.
const MAX_PUMP_ROUNDS: usize = 64;

/// Milliseconds since the session started.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct HostInstant(u64);

impl HostInstant {
    pub const fn millis(self) -> u64 {
        self.0
    }
}

impl Add<Duration> for HostInstant {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

/// Radio stack with a scripted central on the other side.
#[derive(Default)]
pub struct HostRadio {
    busy: u16,
    advertising: bool,
    connected: bool,
    replies: VecDeque<Event>,
    notifications: Vec<(Characteristic, Vec<u8>)>,
}

impl HostRadio {
    fn take_busy(&mut self) -> Result<(), RadioError> {
        if self.busy > 0 {
            self.busy -= 1;
            return Err(RadioError::Busy);
        }
        Ok(())
    }
}

impl RadioLink for HostRadio {
    fn request_connection_parameters(
        &mut self,
        params: ConnectionParameters,
    ) -> Result<(), RadioError> {
        self.take_busy()?;
        if !self.connected {
            return Err(RadioError::InvalidState);
        }
        self.replies.push_back(Event::ParametersChanged(params.latency));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.take_busy()?;
        if self.connected {
            self.connected = false;
            self.replies.push_back(Event::Disconnected);
        }
        Ok(())
    }

    fn notify(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Result<(), RadioError> {
        if !self.connected {
            return Err(RadioError::InvalidState);
        }
        self.notifications.push((characteristic, bytes.to_vec()));
        Ok(())
    }

    fn start_advertising(&mut self) -> Result<(), RadioError> {
        self.advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        self.advertising = false;
        Ok(())
    }
}

/// Flash image per region with NOR semantics; completions queue up.
pub struct HostStorage {
    profile: Vec<u8>,
    log: Vec<u8>,
    pairing: Vec<u8>,
    completions: VecDeque<Event>,
}

impl Default for HostStorage {
    fn default() -> Self {
        let sector = usize::try_from(SECTOR_SIZE).unwrap_or(0);
        let log_sectors = usize::try_from(LOG_SECTORS).unwrap_or(0);
        Self {
            profile: vec![0xFF; sector],
            log: vec![0xFF; sector * log_sectors],
            pairing: vec![0xFF; sector],
            completions: VecDeque::new(),
        }
    }
}

impl HostStorage {
    fn span(&mut self, region: Region, offset: u32, len: usize) -> Result<&mut [u8], StorageError> {
        let start = usize::try_from(offset).map_err(|_| StorageError::OutOfBounds)?;
        let image = match region {
            Region::Profile => &mut self.profile,
            Region::Log => &mut self.log,
            Region::Pairing => &mut self.pairing,
        };
        image
            .get_mut(start..start + len)
            .ok_or(StorageError::OutOfBounds)
    }
}

impl StorageDriver for HostStorage {
    fn init(&mut self, region: Region) -> Result<StorageHandle, StorageError> {
        Ok(StorageHandle::new(region))
    }

    fn read(
        &mut self,
        handle: StorageHandle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        buf.copy_from_slice(self.span(handle.region(), offset, buf.len())?);
        Ok(())
    }

    fn write(
        &mut self,
        handle: StorageHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let span = self.span(handle.region(), offset, data.len())?;
        for (cell, byte) in span.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.completions
            .push_back(Event::WriteComplete(StorageStatus::Success));
        Ok(())
    }

    fn erase(&mut self, handle: StorageHandle, offset: u32, len: u32) -> Result<(), StorageError> {
        let len = usize::try_from(len).map_err(|_| StorageError::OutOfBounds)?;
        self.span(handle.region(), offset, len)?.fill(0xFF);
        self.completions
            .push_back(Event::EraseComplete(StorageStatus::Success));
        Ok(())
    }

    fn uninit(&mut self, _handle: StorageHandle) {}
}

/// Synthetic walking pattern: every other sample is a peak.
#[derive(Default)]
pub struct HostSensor {
    pending: VecDeque<Sample>,
    produced: u32,
}

impl HostSensor {
    fn generate(&mut self, count: u16) {
        for _ in 0..count {
            let peak = self.produced % 2 == 1;
            self.pending.push_back(Sample {
                timestamp: self.produced,
                accel: [0, 0, if peak { 6_000 } else { 4_096 }],
                ..Sample::default()
            });
            self.produced = self.produced.wrapping_add(1);
        }
    }
}

impl SampleSource for HostSensor {
    fn next_sample(&mut self) -> Option<Sample> {
        self.pending.pop_front()
    }
}

/// Counts one step per peak sample.
#[derive(Default)]
pub struct HostClassifier {
    calibrated: u8,
}

impl ActivityClassifier for HostClassifier {
    fn process(&mut self, sample: &Sample) -> Classification {
        Classification {
            steps: u8::from(sample.accel[2] > 5_000),
            ..Classification::default()
        }
    }

    fn calibrate(&mut self, _sample: &Sample) -> CalibrationProgress {
        self.calibrated += 1;
        if self.calibrated >= CALIBRATION_SAMPLES {
            self.calibrated = 0;
            return CalibrationProgress::Complete;
        }
        CalibrationProgress::InProgress(self.calibrated * (100 / CALIBRATION_SAMPLES))
    }

    fn reset(&mut self) {
        self.calibrated = 0;
    }
}

pub struct HostPower {
    battery_mv: u16,
    asleep: bool,
    yields: u32,
    resets: Vec<Fault>,
}

impl Default for HostPower {
    fn default() -> Self {
        Self {
            battery_mv: DEFAULT_BATTERY_MV,
            asleep: false,
            yields: 0,
            resets: Vec::new(),
        }
    }
}

impl PowerControl for HostPower {
    fn sleep_yield(&mut self) {
        self.yields += 1;
    }

    fn enter_deep_sleep(&mut self) {
        self.asleep = true;
    }

    fn battery_millivolts(&mut self) -> Option<u16> {
        Some(self.battery_mv)
    }

    fn reset(&mut self, fault: Fault) {
        self.resets.push(fault);
    }
}

#[derive(Default)]
pub struct HostPlatform {
    pub radio: HostRadio,
    pub storage: HostStorage,
    pub sensor: HostSensor,
    pub classifier: HostClassifier,
    pub power: HostPower,
}

impl Platform for HostPlatform {
    type Instant = HostInstant;
    type Radio = HostRadio;
    type Storage = HostStorage;
    type Sensor = HostSensor;
    type Classifier = HostClassifier;
    type Power = HostPower;

    fn radio(&mut self) -> &mut HostRadio {
        &mut self.radio
    }

    fn storage(&mut self) -> &mut HostStorage {
        &mut self.storage
    }

    fn sensor(&mut self) -> &mut HostSensor {
        &mut self.sensor
    }

    fn classifier(&mut self) -> &mut HostClassifier {
        &mut self.classifier
    }

    fn power(&mut self) -> &mut HostPower {
        &mut self.power
    }
}

pub type HostController<'q> = Controller<'q, HostPlatform, QUEUE_DEPTH>;

/// Console session over a controller borrowing a caller-owned queue.
pub struct Session<'q> {
    controller: HostController<'q>,
    now: HostInstant,
    next_trace: TraceId,
}

impl<'q> Session<'q> {
    pub fn new(queue: &'q EventQueue<QUEUE_DEPTH>, config: ControlConfig) -> Self {
        let controller = Controller::new(queue, HostPlatform::default(), config);
        let mut session = Self {
            controller,
            now: HostInstant::default(),
            next_trace: 0,
        };
        session.post(Event::InitComplete);
        session
    }

    #[cfg(test)]
    pub fn controller(&self) -> &HostController<'q> {
        &self.controller
    }

    /// Boot output produced by `new`.
    pub fn boot(&mut self) -> Vec<String> {
        let mut lines = self.pump();
        self.report(&mut lines);
        lines
    }

    /// Parses and executes one console line.
    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        match script::parse_line(line) {
            Ok(directive) => self.execute(directive),
            Err(err) => vec![format!("ERR syntax {err}")],
        }
    }

    pub fn execute(&mut self, directive: Directive) -> Vec<String> {
        let mut lines = Vec::new();
        match directive {
            Directive::Help => return script::HELP.iter().map(ToString::to_string).collect(),
            Directive::Status => return vec![self.status_line()],
            Directive::Trace => {
                return self
                    .controller
                    .trace()
                    .oldest_first()
                    .map(|record| format!("#{} {}", record.id, record.event))
                    .collect();
            }
            Directive::Connect => {
                self.controller.platform_mut().radio.connected = true;
                self.post(Event::Connected);
            }
            Directive::Disconnect => {
                self.controller.platform_mut().radio.connected = false;
                self.post(Event::Disconnected);
            }
            Directive::Params(latency) => {
                self.post(Event::ParametersChanged(SlaveLatency::new(latency)));
            }
            Directive::Command { id, payload } => {
                self.post(Event::Command(ProtocolCommand::new(id, &payload)));
            }
            Directive::Read(characteristic) => {
                self.post(Event::ReadRequested(characteristic));
            }
            Directive::Advance(duration) => {
                lines.extend(self.advance(duration));
                self.report(&mut lines);
                return lines;
            }
            Directive::Wake => {
                self.controller.platform_mut().power.asleep = false;
                self.post(Event::SensorWakeup);
            }
            Directive::Sleep => {
                self.post(Event::SleepRequested);
            }
            Directive::Samples(count) => {
                self.controller.platform_mut().sensor.generate(count);
                for _ in 0..count {
                    if !self.post(Event::SensorDataReady) {
                        lines.extend(self.pump());
                        self.post(Event::SensorDataReady);
                    }
                }
            }
            Directive::Rollover(timestamp) => {
                self.post(Event::DayRollover(timestamp));
            }
            Directive::Busy(count) => {
                self.controller.platform_mut().radio.busy = count;
                return vec![format!("radio busy for next {count} requests")];
            }
            Directive::Battery(millivolts) => {
                self.controller.platform_mut().power.battery_mv = millivolts;
                return vec![format!("battery now {millivolts} mV")];
            }
        }
        lines.extend(self.pump());
        self.report(&mut lines);
        lines
    }

    fn post(&mut self, event: Event) -> bool {
        self.controller.queue().post(event).is_ok()
    }

    /// Runs the controller until neither it nor the fakes have work left.
    fn pump(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..MAX_PUMP_ROUNDS {
            if let Err(fault) = self.controller.settle(self.now) {
                lines.push(format!("FAULT {fault}"));
            }
            let platform = self.controller.platform_mut();
            let mut replies: Vec<Event> = platform.radio.replies.drain(..).collect();
            replies.extend(platform.storage.completions.drain(..));
            if replies.is_empty() {
                return lines;
            }
            for event in replies {
                if !self.post(event) {
                    lines.push("WARN queue full, simulated reply dropped".to_string());
                }
            }
        }
        lines.push("WARN controller still busy after pump limit".to_string());
        lines
    }

    fn advance(&mut self, duration: Duration) -> Vec<String> {
        let target = self.now + duration;
        let mut lines = Vec::new();
        while let Some(deadline) = self.controller.next_deadline() {
            if deadline > target {
                break;
            }
            self.now = self.now.max(deadline);
            lines.extend(self.pump());
            if self.controller.next_deadline() == Some(deadline) {
                break;
            }
        }
        self.now = target;
        lines.extend(self.pump());
        lines
    }

    fn report(&mut self, lines: &mut Vec<String>) {
        let trace = self.controller.trace();
        for record in trace.since(self.next_trace) {
            lines.push(format!("[{:>8} ms] {}", self.now.millis(), record.event));
        }
        self.next_trace = trace.next_id();

        let notifications: Vec<_> = self
            .controller
            .platform_mut()
            .radio
            .notifications
            .drain(..)
            .collect();
        for (characteristic, bytes) in notifications {
            lines.push(format!("notify {characteristic:?} {}", hex(&bytes)));
        }
        let faults: Vec<_> = self.controller.platform_mut().power.resets.drain(..).collect();
        for fault in faults {
            lines.push(format!("RESET {fault}"));
        }
        lines.push(self.status_line());
    }

    fn status_line(&self) -> String {
        let controller = &self.controller;
        let platform = controller.platform();
        let totals = controller.totals();
        format!(
            "state={} mode={} latency={} flash={} steps={} retries={} advertising={} asleep={} yields={}",
            controller.state(),
            controller.dispatcher().mode(),
            controller.link().latency.events(),
            if controller.flash().is_idle() { "idle" } else { "busy" },
            totals.steps,
            controller.param_retries().attempts(),
            platform.radio.advertising,
            platform.power.asleep,
            platform.power.yields,
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}
