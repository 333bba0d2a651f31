//! Board-level constants: pins live in `runtime`, everything numeric lives here.

use embassy_time::Duration;
use tracker_core::config::{ControlConfig, DEFAULT_QUEUE_DEPTH};
use tracker_core::flash::layout::{LOG_SECTORS, SECTOR_SIZE};

/// Depth of the control-plane event queue.
pub const QUEUE_DEPTH: usize = DEFAULT_QUEUE_DEPTH;

/// Timing and retry parameters handed to the controller.
pub const CONTROL_CONFIG: ControlConfig = ControlConfig::new();

/// UART link to the radio co-processor.
pub const RADIO_UART_BAUD: u32 = 115_200;
/// Outbound frames buffered for the radio UART before requests report busy.
pub const RADIO_TX_DEPTH: usize = 8;

/// Samples buffered between the IMU task and the control loop.
pub const SAMPLE_DEPTH: usize = 64;
/// 7-bit I2C address of the inertial sensor.
pub const IMU_ADDRESS: u8 = 0x68;

/// Pause taken by `sleep_yield` before a connection-parameter retry.
pub const PARAM_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Reference voltage at which the VREFINT calibration word was taken.
pub const VREFINT_CAL_MV: u32 = 3_000;

/// Storage regions occupy the last pages of the 512 KiB bank.
pub const PROFILE_BASE: u32 = 0x0007_C000;
pub const LOG_BASE: u32 = PROFILE_BASE + SECTOR_SIZE;
pub const PAIRING_BASE: u32 = LOG_BASE + SECTOR_SIZE * LOG_SECTORS;
pub const FLASH_END: u32 = 0x0008_0000;

const _: () = assert!(PAIRING_BASE + SECTOR_SIZE <= FLASH_END);
