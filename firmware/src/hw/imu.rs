//! Inertial sensor on I2C with data-ready and motion interrupt lines.
//!
//! The IMU task owns the bus. Each data-ready edge reads one burst into the
//! sample channel and posts `SensorDataReady`; the motion line only matters
//! while the device sleeps, where it posts `SensorWakeup`.

use embassy_futures::select::{Either, select};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::i2c::I2c;
use embassy_stm32::mode::Blocking;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use tracker_core::Event;
use tracker_core::drivers::{Sample, SampleSource};

use crate::clock::FirmwareInstant;
use crate::config::{IMU_ADDRESS, SAMPLE_DEPTH};
use crate::runtime;

pub type SampleChannel = Channel<CriticalSectionRawMutex, Sample, SAMPLE_DEPTH>;

pub static SAMPLES: SampleChannel = Channel::new();

mod reg {
    pub const ACCEL_CONFIG: u8 = 0x1C;
    pub const INT_ENABLE: u8 = 0x38;
    pub const ACCEL_XOUT_H: u8 = 0x3B;
    pub const PWR_MGMT_1: u8 = 0x6B;
}

/// ±8 g full scale.
const ACCEL_RANGE_8G: u8 = 0x10;
const DATA_READY_AND_MOTION: u8 = 0x41;
const BURST_LEN: usize = 14;

/// Control-loop side of the sample channel.
pub struct ImuSamples;

impl SampleSource for ImuSamples {
    fn next_sample(&mut self) -> Option<Sample> {
        SAMPLES.try_receive().ok()
    }
}

/// Decodes one big-endian accel/temperature/gyro burst.
pub fn decode_burst(timestamp: u32, raw: &[u8; BURST_LEN]) -> Sample {
    let word = |at: usize| i16::from_be_bytes([raw[at], raw[at + 1]]);
    Sample {
        timestamp,
        accel: [word(0), word(2), word(4)],
        temperature: word(6),
        gyro: [word(8), word(10), word(12)],
    }
}

fn timestamp_millis() -> u32 {
    let millis = FirmwareInstant::now().into_embassy().as_millis();
    u32::try_from(millis & u64::from(u32::MAX)).unwrap_or(0)
}

pub struct Imu<'d> {
    bus: I2c<'d, Blocking>,
}

impl<'d> Imu<'d> {
    pub fn new(bus: I2c<'d, Blocking>) -> Self {
        Self { bus }
    }

    fn write_register(&mut self, register: u8, value: u8) -> bool {
        self.bus.blocking_write(IMU_ADDRESS, &[register, value]).is_ok()
    }

    pub fn configure(&mut self) -> bool {
        self.write_register(reg::PWR_MGMT_1, 0x01)
            && self.write_register(reg::ACCEL_CONFIG, ACCEL_RANGE_8G)
            && self.write_register(reg::INT_ENABLE, DATA_READY_AND_MOTION)
    }

    fn read_sample(&mut self) -> Option<Sample> {
        let mut raw = [0u8; BURST_LEN];
        self.bus
            .blocking_write_read(IMU_ADDRESS, &[reg::ACCEL_XOUT_H], &mut raw)
            .ok()?;
        Some(decode_burst(timestamp_millis(), &raw))
    }
}

#[embassy_executor::task]
pub async fn run(
    mut imu: Imu<'static>,
    mut data_ready: ExtiInput<'static>,
    mut motion: ExtiInput<'static>,
) -> ! {
    if !imu.configure() {
        defmt::warn!("imu: configuration failed");
    }

    loop {
        match select(data_ready.wait_for_rising_edge(), motion.wait_for_rising_edge()).await {
            Either::First(()) => {
                if runtime::is_asleep() {
                    continue;
                }
                let Some(sample) = imu.read_sample() else {
                    defmt::warn!("imu: burst read failed");
                    continue;
                };
                if SAMPLES.try_send(sample).is_err() {
                    defmt::warn!("imu: sample channel full");
                    continue;
                }
                runtime::post(Event::SensorDataReady);
            }
            Either::Second(()) => {
                if runtime::wake_from_sleep() {
                    runtime::post(Event::SensorWakeup);
                }
            }
        }
    }
}
