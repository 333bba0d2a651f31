//! Collaborator interfaces the control plane drives.
//!
//! The radio stack, storage driver, motion sensor, activity classifier and
//! power controller are all external to the control plane. Firmware binds
//! them to real peripherals, the emulator to in-memory fakes, and tests to
//! recording mocks. The no-op implementations at the bottom are handy when a
//! test only cares about one collaborator.

use core::fmt;
use core::ops::Add;
use core::time::Duration;

use crate::machine::Fault;

/// Number of connection events the peripheral may skip.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlaveLatency(u16);

impl SlaveLatency {
    /// Storage transactions require the peripheral to answer every event.
    pub const ZERO: Self = Self(0);
    /// Default power-saving latency used while idle-connected.
    pub const RELAXED: Self = Self(4);

    #[must_use]
    pub const fn new(events: u16) -> Self {
        Self(events)
    }

    #[must_use]
    pub const fn events(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Connection parameters requested from the central.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionParameters {
    /// Minimum connection interval in 1.25 ms units.
    pub interval_min: u16,
    /// Maximum connection interval in 1.25 ms units.
    pub interval_max: u16,
    pub latency: SlaveLatency,
    /// Supervision timeout in 10 ms units.
    pub supervision_timeout: u16,
}

impl ConnectionParameters {
    /// Parameter set used for a given latency target.
    #[must_use]
    pub const fn for_latency(latency: SlaveLatency) -> Self {
        if latency.is_zero() {
            Self {
                interval_min: 12,
                interval_max: 24,
                latency,
                supervision_timeout: 400,
            }
        } else {
            Self {
                interval_min: 80,
                interval_max: 160,
                latency,
                supervision_timeout: 600,
            }
        }
    }
}

/// GATT characteristics the control plane writes to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Characteristic {
    /// Replies to protocol commands.
    Response,
    /// Device state summary.
    Status,
    /// Battery level in millivolts.
    Battery,
    /// Activity totals for the current day.
    Activity,
    /// Last error code reported to the peer.
    LastError,
    /// Raw sample stream.
    RawData,
}

/// Failure reported by the wireless stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RadioError {
    /// The stack is processing another procedure.
    Busy,
    /// The request is not valid in the stack's current state.
    InvalidState,
    /// Non-recoverable stack failure.
    Failed,
}

impl RadioError {
    /// Returns `true` for "try again later" responses.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, RadioError::Busy | RadioError::InvalidState)
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioError::Busy => f.write_str("radio busy"),
            RadioError::InvalidState => f.write_str("radio in invalid state"),
            RadioError::Failed => f.write_str("radio failure"),
        }
    }
}

/// Outbound surface of the wireless protocol stack.
///
/// Inbound traffic (connect, disconnect, parameter updates, writes, reads)
/// arrives as queued [`crate::Event`]s.
pub trait RadioLink {
    /// Asks the central for new connection parameters.
    fn request_connection_parameters(
        &mut self,
        params: ConnectionParameters,
    ) -> Result<(), RadioError>;

    /// Terminates the current connection.
    fn disconnect(&mut self) -> Result<(), RadioError>;

    /// Pushes a value to the peer.
    fn notify(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Result<(), RadioError>;

    /// Starts connectable advertising.
    fn start_advertising(&mut self) -> Result<(), RadioError>;

    /// Stops advertising.
    fn stop_advertising(&mut self) -> Result<(), RadioError>;
}

/// Storage areas reserved for the control plane.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Region {
    Profile,
    Log,
    Pairing,
}

impl Region {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Region::Profile => "profile",
            Region::Log => "log",
            Region::Pairing => "pairing",
        }
    }
}

/// Opened storage region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StorageHandle {
    region: Region,
}

impl StorageHandle {
    #[must_use]
    pub const fn new(region: Region) -> Self {
        Self { region }
    }

    #[must_use]
    pub const fn region(self) -> Region {
        self.region
    }
}

/// Failure returned synchronously by the storage driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// Another transaction is still in flight; try later.
    Busy,
    /// Address or length outside the region.
    OutOfBounds,
    /// Hardware failure.
    Failed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Busy => f.write_str("storage busy"),
            StorageError::OutOfBounds => f.write_str("storage access out of bounds"),
            StorageError::Failed => f.write_str("storage failure"),
        }
    }
}

/// Result carried by asynchronous storage completion events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageStatus {
    Success,
    Failed,
}

/// Storage driver surface.
///
/// `write` and `erase` only start a transaction; the driver reports the end
/// of it by posting [`crate::Event::WriteComplete`] or
/// [`crate::Event::EraseComplete`].
pub trait StorageDriver {
    /// Opens a region.
    fn init(&mut self, region: Region) -> Result<StorageHandle, StorageError>;

    /// Synchronously reads `buf.len()` bytes at `offset`.
    fn read(&mut self, handle: StorageHandle, offset: u32, buf: &mut [u8])
    -> Result<(), StorageError>;

    /// Starts writing `data` at `offset`.
    fn write(&mut self, handle: StorageHandle, offset: u32, data: &[u8])
    -> Result<(), StorageError>;

    /// Starts erasing `len` bytes at `offset`.
    fn erase(&mut self, handle: StorageHandle, offset: u32, len: u32) -> Result<(), StorageError>;

    /// Closes a region.
    fn uninit(&mut self, handle: StorageHandle);
}

/// One inertial sample.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sample {
    pub timestamp: u32,
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
    pub temperature: i16,
}

impl Sample {
    pub const ENCODED_LEN: usize = 18;

    /// Little-endian encoding used by the raw stream characteristic.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.timestamp.to_le_bytes());
        for (axis, value) in self.accel.iter().chain(self.gyro.iter()).enumerate() {
            let at = 4 + axis * 2;
            out[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
        out[16..].copy_from_slice(&self.temperature.to_le_bytes());
        out
    }
}

/// Reader side of the sensor's data queue.
pub trait SampleSource {
    /// Pops the oldest pending sample.
    fn next_sample(&mut self) -> Option<Sample>;
}

/// Output of the activity classifier for one sample.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Classification {
    pub steps: u8,
    pub runs: u8,
    pub dashes: u8,
    pub lateral_wake: bool,
}

/// Orientation calibration progress.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CalibrationProgress {
    /// Percentage collected so far.
    InProgress(u8),
    Complete,
}

/// Step/run/dash counting and orientation calibration.
pub trait ActivityClassifier {
    fn process(&mut self, sample: &Sample) -> Classification;

    fn calibrate(&mut self, sample: &Sample) -> CalibrationProgress;

    /// Drops any partially accumulated state.
    fn reset(&mut self);
}

/// Power and reset control.
pub trait PowerControl {
    /// Waits for one low-power cycle before the caller retries.
    fn sleep_yield(&mut self);

    /// Puts the device into deep sleep until the motion interrupt fires.
    fn enter_deep_sleep(&mut self);

    /// Latest battery reading.
    fn battery_millivolts(&mut self) -> Option<u16>;

    /// Resets the device after an unrecoverable fault.
    ///
    /// Real hardware never returns from this call.
    fn reset(&mut self, fault: Fault);
}

/// Bundle of collaborators plus the monotonic clock type.
pub trait Platform {
    type Instant: Copy + Ord + Add<Duration, Output = Self::Instant>;
    type Radio: RadioLink;
    type Storage: StorageDriver;
    type Sensor: SampleSource;
    type Classifier: ActivityClassifier;
    type Power: PowerControl;

    fn radio(&mut self) -> &mut Self::Radio;

    fn storage(&mut self) -> &mut Self::Storage;

    fn sensor(&mut self) -> &mut Self::Sensor;

    fn classifier(&mut self) -> &mut Self::Classifier;

    fn power(&mut self) -> &mut Self::Power;
}

/// Radio stack that accepts every request.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopRadio;

impl RadioLink for NoopRadio {
    fn request_connection_parameters(&mut self, _: ConnectionParameters) -> Result<(), RadioError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn notify(&mut self, _: Characteristic, _: &[u8]) -> Result<(), RadioError> {
        Ok(())
    }

    fn start_advertising(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        Ok(())
    }
}

/// Sensor with an empty data queue.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopSampleSource;

impl SampleSource for NoopSampleSource {
    fn next_sample(&mut self) -> Option<Sample> {
        None
    }
}

/// Classifier that never detects activity and calibrates instantly.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopClassifier;

impl ActivityClassifier for NoopClassifier {
    fn process(&mut self, _: &Sample) -> Classification {
        Classification::default()
    }

    fn calibrate(&mut self, _: &Sample) -> CalibrationProgress {
        CalibrationProgress::Complete
    }

    fn reset(&mut self) {}
}

/// Power controller that does nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopPower;

impl PowerControl for NoopPower {
    fn sleep_yield(&mut self) {}

    fn enter_deep_sleep(&mut self) {}

    fn battery_millivolts(&mut self) -> Option<u16> {
        None
    }

    fn reset(&mut self, _: Fault) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_invalid_state_are_transient() {
        assert!(RadioError::Busy.is_transient());
        assert!(RadioError::InvalidState.is_transient());
        assert!(!RadioError::Failed.is_transient());
    }

    #[test]
    fn low_latency_parameters_tighten_interval() {
        let low = ConnectionParameters::for_latency(SlaveLatency::ZERO);
        let relaxed = ConnectionParameters::for_latency(SlaveLatency::RELAXED);
        assert!(low.interval_max < relaxed.interval_min);
        assert_eq!(relaxed.latency, SlaveLatency::RELAXED);
    }

    #[test]
    fn sample_encoding_is_little_endian() {
        let sample = Sample {
            timestamp: 0x0102_0304,
            accel: [1, -1, 2],
            gyro: [0, 0, 0x0100],
            temperature: -2,
        };
        let bytes = sample.to_bytes();
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[6..8], &[0xFF, 0xFF]);
        assert_eq!(&bytes[14..16], &[0x00, 0x01]);
        assert_eq!(&bytes[16..], &[0xFE, 0xFF]);
    }
}
