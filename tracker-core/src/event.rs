//! Closed event catalog consumed by the control loop.
//!
//! Every producer (interrupts, wireless stack callbacks, the timer service and
//! the handlers themselves) talks to the consumer exclusively through
//! [`Event`] values. Each variant carries only the payload it needs, and
//! [`Event::kind`] folds the variant into the dense [`EventKind`] index used by
//! the transition tables.

use core::fmt;

use heapless::Vec;

use crate::dispatch::{LinkEpoch, Mode};
use crate::drivers::{Characteristic, SlaveLatency, StorageStatus};
use crate::flash::{FlashRequest, FlashStep, Timestamp};
use crate::timer::{TimerExpiry, TimerId};

/// Largest command body accepted from the wireless link.
pub const MAX_COMMAND_PAYLOAD: usize = 18;

/// Raw protocol command written by the peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolCommand {
    pub id: u8,
    pub payload: Vec<u8, MAX_COMMAND_PAYLOAD>,
}

impl ProtocolCommand {
    /// Builds a command, truncating the body to [`MAX_COMMAND_PAYLOAD`].
    #[must_use]
    pub fn new(id: u8, bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_COMMAND_PAYLOAD);
        let mut payload = Vec::new();
        // Cannot fail: `len` is clamped to the capacity.
        let _ = payload.extend_from_slice(&bytes[..len]);
        Self { id, payload }
    }

    /// Builds a command without a body.
    #[must_use]
    pub fn bare(id: u8) -> Self {
        Self {
            id,
            payload: Vec::new(),
        }
    }
}

/// Unit of work handed from a producer to the single consumer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Boot-time initialisation finished.
    InitComplete,
    /// A peer connected.
    Connected,
    /// The link dropped (peer, supervision timeout, or our own request).
    Disconnected,
    /// The stack applied new connection parameters.
    ParametersChanged(SlaveLatency),
    /// The peer wrote to the command characteristic.
    Command(ProtocolCommand),
    /// The peer read a characteristic.
    ReadRequested(Characteristic),
    /// Switch the active command table.
    ModeChange(Mode),
    /// Motion detected while the radio was idle.
    SensorWakeup,
    /// New samples are waiting in the sample queue.
    SensorDataReady,
    /// Close the link and go to sleep.
    SleepRequested,
    /// A software timer expired.
    Timer(TimerExpiry),
    /// Start (or retry) a storage operation on behalf of the given link.
    FlashRequest(FlashRequest, LinkEpoch),
    /// Internal progress marker of the storage controller.
    FlashStep(FlashStep),
    /// The storage driver finished a write.
    WriteComplete(StorageStatus),
    /// The storage driver finished an erase.
    EraseComplete(StorageStatus),
    /// The storage controller needs slave latency 0.
    ParamChangeRequested,
    /// The storage controller is done with slave latency 0.
    ParamRestoreRequested,
    /// Parameter negotiation exhausted its retries.
    ParamUpdateAbandoned,
    /// The real-time clock crossed midnight.
    DayRollover(Timestamp),
}

impl Event {
    /// Dense kind used as the column index of the transition tables.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Event::InitComplete => EventKind::InitComplete,
            Event::Connected => EventKind::Connected,
            Event::Disconnected => EventKind::Disconnected,
            Event::ParametersChanged(latency) => {
                if latency.is_zero() {
                    EventKind::LowLatencyApplied
                } else {
                    EventKind::RelaxedLatencyApplied
                }
            }
            Event::Command(_) => EventKind::Command,
            Event::ReadRequested(_) => EventKind::ReadRequested,
            Event::ModeChange(_) => EventKind::ModeChange,
            Event::SensorWakeup => EventKind::SensorWakeup,
            Event::SensorDataReady => EventKind::SensorDataReady,
            Event::SleepRequested => EventKind::SleepRequested,
            Event::Timer(expiry) => expiry.id.event_kind(),
            Event::FlashRequest(..) => EventKind::FlashRequest,
            Event::FlashStep(_) => EventKind::FlashStep,
            Event::WriteComplete(_) => EventKind::WriteComplete,
            Event::EraseComplete(_) => EventKind::EraseComplete,
            Event::ParamChangeRequested => EventKind::ParamChangeRequested,
            Event::ParamRestoreRequested => EventKind::ParamRestoreRequested,
            Event::ParamUpdateAbandoned => EventKind::ParamUpdateAbandoned,
            Event::DayRollover(_) => EventKind::DayRollover,
        }
    }

    /// Shorthand for a timer expiry event.
    #[must_use]
    pub const fn timer(id: TimerId, generation: u16) -> Self {
        Event::Timer(TimerExpiry { id, generation })
    }
}

/// Dense discriminant for [`Event`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventKind {
    InitComplete,
    Connected,
    Disconnected,
    LowLatencyApplied,
    RelaxedLatencyApplied,
    Command,
    ReadRequested,
    ModeChange,
    SensorWakeup,
    SensorDataReady,
    SleepRequested,
    AdvertisingTimeout,
    PreSleepTimeout,
    ForceDisconnectTimeout,
    DisconnectConfirmTimeout,
    ReconnectTimeout,
    BatteryTimer,
    FlashRequest,
    FlashStep,
    WriteComplete,
    EraseComplete,
    ParamChangeRequested,
    ParamRestoreRequested,
    ParamUpdateAbandoned,
    DayRollover,
}

impl EventKind {
    /// Number of distinct event kinds.
    pub const COUNT: usize = 25;

    /// Every kind, ordered by [`EventKind::index`].
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::InitComplete,
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::LowLatencyApplied,
        EventKind::RelaxedLatencyApplied,
        EventKind::Command,
        EventKind::ReadRequested,
        EventKind::ModeChange,
        EventKind::SensorWakeup,
        EventKind::SensorDataReady,
        EventKind::SleepRequested,
        EventKind::AdvertisingTimeout,
        EventKind::PreSleepTimeout,
        EventKind::ForceDisconnectTimeout,
        EventKind::DisconnectConfirmTimeout,
        EventKind::ReconnectTimeout,
        EventKind::BatteryTimer,
        EventKind::FlashRequest,
        EventKind::FlashStep,
        EventKind::WriteComplete,
        EventKind::EraseComplete,
        EventKind::ParamChangeRequested,
        EventKind::ParamRestoreRequested,
        EventKind::ParamUpdateAbandoned,
        EventKind::DayRollover,
    ];

    /// Column index into the transition tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short label for logs and transcripts.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            EventKind::InitComplete => "init-complete",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::LowLatencyApplied => "latency-0-applied",
            EventKind::RelaxedLatencyApplied => "latency-relaxed-applied",
            EventKind::Command => "command",
            EventKind::ReadRequested => "read-requested",
            EventKind::ModeChange => "mode-change",
            EventKind::SensorWakeup => "sensor-wakeup",
            EventKind::SensorDataReady => "sensor-data",
            EventKind::SleepRequested => "sleep-requested",
            EventKind::AdvertisingTimeout => "advertising-timeout",
            EventKind::PreSleepTimeout => "pre-sleep-timeout",
            EventKind::ForceDisconnectTimeout => "force-disconnect-timeout",
            EventKind::DisconnectConfirmTimeout => "disconnect-confirm-timeout",
            EventKind::ReconnectTimeout => "reconnect-timeout",
            EventKind::BatteryTimer => "battery-timer",
            EventKind::FlashRequest => "flash-request",
            EventKind::FlashStep => "flash-step",
            EventKind::WriteComplete => "write-complete",
            EventKind::EraseComplete => "erase-complete",
            EventKind::ParamChangeRequested => "param-change-requested",
            EventKind::ParamRestoreRequested => "param-restore-requested",
            EventKind::ParamUpdateAbandoned => "param-update-abandoned",
            EventKind::DayRollover => "day-rollover",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
