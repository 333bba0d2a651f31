//! Monotonic instant handed to the control plane.

use core::ops::Add;

use embassy_time::{Duration, Instant};

/// Embassy instant that accepts `core::time::Duration` offsets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    #[cfg(target_os = "none")]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Instant::from_millis(millis))
    }

    pub const fn into_embassy(self) -> Instant {
        self.0
    }

    /// Seconds since boot, saturated to the log timestamp width.
    pub fn as_secs_u32(self) -> u32 {
        u32::try_from(self.0.as_secs()).unwrap_or(u32::MAX)
    }
}

impl From<Instant> for FirmwareInstant {
    fn from(instant: Instant) -> Self {
        Self(instant)
    }
}

impl From<FirmwareInstant> for Instant {
    fn from(instant: FirmwareInstant) -> Self {
        instant.0
    }
}

impl Add<core::time::Duration> for FirmwareInstant {
    type Output = Self;

    fn add(self, duration: core::time::Duration) -> Self {
        let step = core_duration_to_embassy(duration);
        Self(self.0.checked_add(step).unwrap_or(Instant::MAX))
    }
}

fn core_duration_to_embassy(duration: core::time::Duration) -> Duration {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(micros)
}
