#![allow(dead_code)]

use std::collections::VecDeque;
use std::ops::Add;
use std::time::Duration;

use tracker_core::config::ControlConfig;
use tracker_core::drivers::{
    ActivityClassifier, CalibrationProgress, Characteristic, Classification, ConnectionParameters,
    Platform, PowerControl, RadioError, RadioLink, Region, Sample, SampleSource, SlaveLatency,
    StorageDriver, StorageError, StorageHandle, StorageStatus,
};
use tracker_core::flash::layout::{LOG_SECTORS, SECTOR_SIZE};
use tracker_core::{Controller, Event, EventQueue, Fault};

pub const QUEUE_DEPTH: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant(pub u64);

impl Add<Duration> for MockInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_millis() as u64)
    }
}

pub fn ms(value: u64) -> MockInstant {
    MockInstant(value)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioCall {
    RequestParameters(SlaveLatency),
    Disconnect,
    Notify(Characteristic, Vec<u8>),
    StartAdvertising,
    StopAdvertising,
}

/// Radio stub that logs every call and answers parameter requests from a script.
#[derive(Default)]
pub struct RecordingRadio {
    pub calls: Vec<RadioCall>,
    pub parameter_responses: VecDeque<Result<(), RadioError>>,
}

impl RecordingRadio {
    pub fn latency_requests(&self) -> Vec<SlaveLatency> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::RequestParameters(latency) => Some(*latency),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::Notify(target, bytes) if *target == characteristic => {
                    Some(bytes.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &RadioCall) -> usize {
        self.calls.iter().filter(|call| *call == wanted).count()
    }
}

impl RadioLink for RecordingRadio {
    fn request_connection_parameters(
        &mut self,
        params: ConnectionParameters,
    ) -> Result<(), RadioError> {
        self.calls.push(RadioCall::RequestParameters(params.latency));
        self.parameter_responses.pop_front().unwrap_or(Ok(()))
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.calls.push(RadioCall::Disconnect);
        Ok(())
    }

    fn notify(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Result<(), RadioError> {
        self.calls.push(RadioCall::Notify(characteristic, bytes.to_vec()));
        Ok(())
    }

    fn start_advertising(&mut self) -> Result<(), RadioError> {
        self.calls.push(RadioCall::StartAdvertising);
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        self.calls.push(RadioCall::StopAdvertising);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    Erase { region: Region, offset: u32 },
    Write { region: Region, offset: u32 },
}

impl Transaction {
    pub fn completion(self) -> Event {
        match self {
            Transaction::Erase { .. } => Event::EraseComplete(StorageStatus::Success),
            Transaction::Write { .. } => Event::WriteComplete(StorageStatus::Success),
        }
    }
}

/// NOR-like flash image per region; completions are left for the test to post.
pub struct MemoryStorage {
    pub profile: Vec<u8>,
    pub log: Vec<u8>,
    pub pairing: Vec<u8>,
    pub transactions: Vec<Transaction>,
    pub busy_responses: u16,
    pub open: Vec<Region>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            profile: vec![0xFF; SECTOR_SIZE as usize],
            log: vec![0xFF; (SECTOR_SIZE * LOG_SECTORS) as usize],
            pairing: vec![0xFF; SECTOR_SIZE as usize],
            transactions: Vec::new(),
            busy_responses: 0,
            open: Vec::new(),
        }
    }
}

impl MemoryStorage {
    fn region_mut(&mut self, region: Region) -> &mut Vec<u8> {
        match region {
            Region::Profile => &mut self.profile,
            Region::Log => &mut self.log,
            Region::Pairing => &mut self.pairing,
        }
    }

    fn span(&mut self, region: Region, offset: u32, len: usize) -> Result<&mut [u8], StorageError> {
        let start = offset as usize;
        self.region_mut(region)
            .get_mut(start..start + len)
            .ok_or(StorageError::OutOfBounds)
    }

    fn take_busy(&mut self) -> Result<(), StorageError> {
        if self.busy_responses > 0 {
            self.busy_responses -= 1;
            return Err(StorageError::Busy);
        }
        Ok(())
    }

    pub fn last_transaction(&self) -> Option<Transaction> {
        self.transactions.last().copied()
    }
}

impl StorageDriver for MemoryStorage {
    fn init(&mut self, region: Region) -> Result<StorageHandle, StorageError> {
        self.open.push(region);
        Ok(StorageHandle::new(region))
    }

    fn read(
        &mut self,
        handle: StorageHandle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let span = self.span(handle.region(), offset, buf.len())?;
        buf.copy_from_slice(span);
        Ok(())
    }

    fn write(
        &mut self,
        handle: StorageHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.take_busy()?;
        let span = self.span(handle.region(), offset, data.len())?;
        for (cell, byte) in span.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.transactions.push(Transaction::Write {
            region: handle.region(),
            offset,
        });
        Ok(())
    }

    fn erase(&mut self, handle: StorageHandle, offset: u32, len: u32) -> Result<(), StorageError> {
        self.take_busy()?;
        self.span(handle.region(), offset, len as usize)?.fill(0xFF);
        self.transactions.push(Transaction::Erase {
            region: handle.region(),
            offset,
        });
        Ok(())
    }

    fn uninit(&mut self, handle: StorageHandle) {
        self.open.retain(|region| *region != handle.region());
    }
}

#[derive(Default)]
pub struct ScriptedSensor {
    pub samples: VecDeque<Sample>,
}

impl ScriptedSensor {
    pub fn push(&mut self, count: usize) {
        for index in 0..count {
            self.samples.push_back(Sample {
                timestamp: index as u32,
                ..Sample::default()
            });
        }
    }
}

impl SampleSource for ScriptedSensor {
    fn next_sample(&mut self) -> Option<Sample> {
        self.samples.pop_front()
    }
}

/// Counts one step per sample and finishes calibration after `calibration_len` samples.
#[derive(Default)]
pub struct CountingClassifier {
    pub calibration_len: u8,
    pub calibrated: u8,
    pub resets: usize,
}

impl ActivityClassifier for CountingClassifier {
    fn process(&mut self, _: &Sample) -> Classification {
        Classification {
            steps: 1,
            ..Classification::default()
        }
    }

    fn calibrate(&mut self, _: &Sample) -> CalibrationProgress {
        self.calibrated = self.calibrated.saturating_add(1);
        if self.calibrated >= self.calibration_len {
            CalibrationProgress::Complete
        } else {
            CalibrationProgress::InProgress(self.calibrated)
        }
    }

    fn reset(&mut self) {
        self.calibrated = 0;
        self.resets += 1;
    }
}

#[derive(Default)]
pub struct RecordingPower {
    pub yields: usize,
    pub deep_sleeps: usize,
    pub battery_mv: Option<u16>,
    pub resets: Vec<Fault>,
}

impl PowerControl for RecordingPower {
    fn sleep_yield(&mut self) {
        self.yields += 1;
    }

    fn enter_deep_sleep(&mut self) {
        self.deep_sleeps += 1;
    }

    fn battery_millivolts(&mut self) -> Option<u16> {
        self.battery_mv
    }

    fn reset(&mut self, fault: Fault) {
        self.resets.push(fault);
    }
}

#[derive(Default)]
pub struct MockPlatform {
    pub radio: RecordingRadio,
    pub storage: MemoryStorage,
    pub sensor: ScriptedSensor,
    pub classifier: CountingClassifier,
    pub power: RecordingPower,
}

impl Platform for MockPlatform {
    type Instant = MockInstant;
    type Radio = RecordingRadio;
    type Storage = MemoryStorage;
    type Sensor = ScriptedSensor;
    type Classifier = CountingClassifier;
    type Power = RecordingPower;

    fn radio(&mut self) -> &mut Self::Radio {
        &mut self.radio
    }

    fn storage(&mut self) -> &mut Self::Storage {
        &mut self.storage
    }

    fn sensor(&mut self) -> &mut Self::Sensor {
        &mut self.sensor
    }

    fn classifier(&mut self) -> &mut Self::Classifier {
        &mut self.classifier
    }

    fn power(&mut self) -> &mut Self::Power {
        &mut self.power
    }
}

pub type TestController<'q> = Controller<'q, MockPlatform, QUEUE_DEPTH>;

pub fn controller(queue: &EventQueue<QUEUE_DEPTH>, config: ControlConfig) -> TestController<'_> {
    Controller::new(queue, MockPlatform::default(), config)
}

/// Posts `event` and processes everything that follows from it at `now`.
pub fn deliver(controller: &mut TestController<'_>, event: Event, now: MockInstant) {
    controller
        .queue()
        .post(event)
        .expect("test queue has room");
    controller.settle(now).expect("no fault");
}

/// Boots and settles at t=0.
pub fn booted(queue: &EventQueue<QUEUE_DEPTH>, config: ControlConfig) -> TestController<'_> {
    let mut controller = controller(queue, config);
    deliver(&mut controller, Event::InitComplete, ms(0));
    controller
}

/// Boots, accepts a central, and confirms slave latency 0.
pub fn connected(queue: &EventQueue<QUEUE_DEPTH>, config: ControlConfig) -> TestController<'_> {
    let mut controller = booted(queue, config);
    deliver(&mut controller, Event::Connected, ms(10));
    deliver(
        &mut controller,
        Event::ParametersChanged(SlaveLatency::ZERO),
        ms(20),
    );
    controller
}

/// Posts the completion of the most recent storage transaction.
pub fn complete_last_transaction(controller: &mut TestController<'_>, now: MockInstant) {
    let transaction = controller
        .platform()
        .storage
        .last_transaction()
        .expect("a transaction was issued");
    deliver(controller, transaction.completion(), now);
}
