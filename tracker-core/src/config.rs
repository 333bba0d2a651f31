//! Tunable timing and retry parameters.
//!
//! Defaults live in `const`s so the firmware can build a `ControlConfig` in a
//! `static` and the emulator can override individual fields.

use core::time::Duration;

/// How long the device advertises before preparing to sleep.
pub const DEFAULT_ADVERTISING_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period between stopping advertising and entering deep sleep.
pub const DEFAULT_PRE_SLEEP_DELAY: Duration = Duration::from_secs(5);
/// Idle connection time before the device drops the link itself.
pub const DEFAULT_FORCE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(300);
/// How long to wait for the stack to confirm a requested disconnect.
pub const DEFAULT_DISCONNECT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);
/// Fast-reconnect window after an unexpected link loss.
pub const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(10);
/// Battery sampling period.
pub const DEFAULT_BATTERY_PERIOD: Duration = Duration::from_secs(60);
/// Connection-parameter attempts before giving up.
pub const DEFAULT_PARAM_RETRY_LIMIT: u16 = 200;
/// Busy responses tolerated from the storage driver for one step.
pub const DEFAULT_STORAGE_RETRY_LIMIT: u16 = 8;
/// Below this reading the device asks to go to sleep.
pub const DEFAULT_LOW_BATTERY_MV: u16 = 3_300;

/// Number of software timer slots owned by the control loop.
pub const TIMER_SLOTS: usize = 8;
/// Event queue depth used by the firmware and the emulator.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Runtime configuration for the control loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControlConfig {
    pub advertising_timeout: Duration,
    pub pre_sleep_delay: Duration,
    pub force_disconnect_timeout: Duration,
    pub disconnect_confirm_timeout: Duration,
    pub reconnect_window: Duration,
    pub battery_period: Duration,
    pub param_retry_limit: u16,
    pub storage_retry_limit: u16,
    pub low_battery_mv: u16,
}

impl ControlConfig {
    /// Configuration populated with the crate defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            advertising_timeout: DEFAULT_ADVERTISING_TIMEOUT,
            pre_sleep_delay: DEFAULT_PRE_SLEEP_DELAY,
            force_disconnect_timeout: DEFAULT_FORCE_DISCONNECT_TIMEOUT,
            disconnect_confirm_timeout: DEFAULT_DISCONNECT_CONFIRM_TIMEOUT,
            reconnect_window: DEFAULT_RECONNECT_WINDOW,
            battery_period: DEFAULT_BATTERY_PERIOD,
            param_retry_limit: DEFAULT_PARAM_RETRY_LIMIT,
            storage_retry_limit: DEFAULT_STORAGE_RETRY_LIMIT,
            low_battery_mv: DEFAULT_LOW_BATTERY_MV,
        }
    }

    /// Overrides the connection-parameter retry ceiling.
    #[must_use]
    pub const fn with_param_retry_limit(mut self, limit: u16) -> Self {
        self.param_retry_limit = limit;
        self
    }

    /// Overrides the storage busy-retry ceiling.
    #[must_use]
    pub const fn with_storage_retry_limit(mut self, limit: u16) -> Self {
        self.storage_retry_limit = limit;
        self
    }

    /// Overrides the idle-connection timeout.
    #[must_use]
    pub const fn with_force_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.force_disconnect_timeout = timeout;
        self
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::new()
    }
}
