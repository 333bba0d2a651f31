//! `(state, event kind) -> (handler, next state)` transition table.
//!
//! [`transition`] is an exhaustive `match` over every event kind and every
//! state, with no wildcard arms, so adding a state or an event kind does not
//! compile until each new cell is decided. The per-state rows are folded from
//! it at compile time into the templates in [`super::state`].

use crate::event::EventKind;

use super::state::ConnState;

/// Work performed when an event is dispatched.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Handler {
    /// Shared do-nothing cell.
    Ignore,
    Boot,
    AcceptConnection,
    RequestLatency0,
    RequestLatency1,
    ConfirmParameters,
    /// The central applied something other than latency 0; ask again.
    RenegotiateLatency0,
    /// The central applied something other than the relaxed latency; ask again.
    RenegotiateLatency1,
    /// Low latency is already in effect; tell the storage controller.
    AckLowLatency,
    LinkLost,
    ResumeAdvertising,
    ReconnectExpired,
    StopAdvertising,
    EnterPreSleep,
    EnterDeepSleep,
    Wake,
    Disconnect,
    AbandonParamUpdate,
    DispatchCommand,
    RejectCommand,
    ServeRead,
    SwitchMode,
    ProcessSamples,
    SampleBattery,
    RouteFlashRequest,
    RouteFlashStep,
    RouteWriteComplete,
    RouteEraseComplete,
    RotateLog,
}

/// State selected after the handler ran.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Next {
    Stay,
    To(ConnState),
}

/// One table cell.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub handler: Handler,
    pub next: Next,
}

impl Transition {
    /// Do nothing, stay put.
    pub const STAY: Self = Self {
        handler: Handler::Ignore,
        next: Next::Stay,
    };

    /// Run `handler` and keep the current state.
    #[must_use]
    pub const fn run(handler: Handler) -> Self {
        Self {
            handler,
            next: Next::Stay,
        }
    }

    /// Run `handler`, then move to `next`.
    #[must_use]
    pub const fn go(handler: Handler, next: ConnState) -> Self {
        Self {
            handler,
            next: Next::To(next),
        }
    }
}

/// The transition table.
#[must_use]
#[allow(clippy::too_many_lines)]
pub const fn transition(state: ConnState, kind: EventKind) -> Transition {
    use ConnState as S;
    use EventKind as K;
    use Handler as H;
    use Transition as T;

    match kind {
        K::InitComplete => match state {
            S::Initializing => T::go(H::Boot, S::Advertising),
            S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::Connected => match state {
            S::Advertising | S::PreSleep | S::AutoReconnectPending => {
                T::go(H::AcceptConnection, S::ParamUpdateLatency0)
            }
            // Retry of a latency request that met a busy stack.
            S::ParamUpdateLatency0 => T::run(H::RequestLatency0),
            S::Initializing
            | S::DeepSleep
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::Disconnected => match state {
            S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1 => T::go(H::LinkLost, S::AutoReconnectPending),
            S::ForcedDisconnect | S::ParamNegotiationFailed => {
                T::go(H::ResumeAdvertising, S::Advertising)
            }
            S::AwaitDisconnectConfirm => T::go(H::EnterPreSleep, S::PreSleep),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::AutoReconnectPending => T::STAY,
        },
        K::LowLatencyApplied => match state {
            S::ParamUpdateLatency0 | S::ConnectedLatency1 => {
                T::go(H::ConfirmParameters, S::ConnectedLatency0)
            }
            S::ConnectedLatency0 => T::run(H::ConfirmParameters),
            S::ParamUpdateLatency1 => T::run(H::RenegotiateLatency1),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::RelaxedLatencyApplied => match state {
            S::ParamUpdateLatency1 | S::ConnectedLatency0 => {
                T::go(H::ConfirmParameters, S::ConnectedLatency1)
            }
            S::ConnectedLatency1 => T::run(H::ConfirmParameters),
            S::ParamUpdateLatency0 => T::run(H::RenegotiateLatency0),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::Command => match state {
            S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1 => T::run(H::DispatchCommand),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::run(H::RejectCommand),
        },
        K::ReadRequested => match state {
            S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1 => T::run(H::ServeRead),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::ModeChange => T::run(H::SwitchMode),
        K::SensorWakeup => match state {
            S::PreSleep | S::DeepSleep => T::go(H::Wake, S::Advertising),
            S::Initializing
            | S::Advertising
            | S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::SensorDataReady => T::run(H::ProcessSamples),
        K::SleepRequested => match state {
            S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1 => T::go(H::Disconnect, S::AwaitDisconnectConfirm),
            S::Advertising | S::AutoReconnectPending => T::go(H::StopAdvertising, S::PreSleep),
            S::Initializing
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::AdvertisingTimeout => match state {
            S::Advertising => T::go(H::StopAdvertising, S::PreSleep),
            S::Initializing
            | S::PreSleep
            | S::DeepSleep
            | S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::PreSleepTimeout => match state {
            S::PreSleep => T::go(H::EnterDeepSleep, S::DeepSleep),
            S::Initializing
            | S::Advertising
            | S::DeepSleep
            | S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::ForceDisconnectTimeout => match state {
            S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1 => T::go(H::Disconnect, S::ForcedDisconnect),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::DisconnectConfirmTimeout => match state {
            S::AwaitDisconnectConfirm => T::go(H::EnterPreSleep, S::PreSleep),
            S::ForcedDisconnect | S::ParamNegotiationFailed => {
                T::go(H::ResumeAdvertising, S::Advertising)
            }
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::AutoReconnectPending => T::STAY,
        },
        K::ReconnectTimeout => match state {
            S::AutoReconnectPending => T::go(H::ReconnectExpired, S::Advertising),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::BatteryTimer => T::run(H::SampleBattery),
        K::FlashRequest => T::run(H::RouteFlashRequest),
        K::FlashStep => T::run(H::RouteFlashStep),
        K::WriteComplete => T::run(H::RouteWriteComplete),
        K::EraseComplete => T::run(H::RouteEraseComplete),
        K::ParamChangeRequested => match state {
            S::ConnectedLatency1 | S::ParamUpdateLatency1 => {
                T::go(H::RequestLatency0, S::ParamUpdateLatency0)
            }
            S::ParamUpdateLatency0 => T::run(H::RequestLatency0),
            S::ConnectedLatency0 => T::run(H::AckLowLatency),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::ParamRestoreRequested => match state {
            S::ConnectedLatency0 | S::ParamUpdateLatency0 => {
                T::go(H::RequestLatency1, S::ParamUpdateLatency1)
            }
            S::ParamUpdateLatency1 => T::run(H::RequestLatency1),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ConnectedLatency1
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::ParamUpdateAbandoned => match state {
            S::ParamUpdateLatency0
            | S::ParamUpdateLatency1
            | S::ConnectedLatency0
            | S::ConnectedLatency1 => T::go(H::AbandonParamUpdate, S::ParamNegotiationFailed),
            S::Initializing
            | S::Advertising
            | S::PreSleep
            | S::DeepSleep
            | S::ForcedDisconnect
            | S::AutoReconnectPending
            | S::AwaitDisconnectConfirm
            | S::ParamNegotiationFailed => T::STAY,
        },
        K::DayRollover => T::run(H::RotateLog),
    }
}

/// Row of `state`, one cell per event kind in [`EventKind::index`] order.
#[must_use]
pub const fn row_for(state: ConnState) -> [Transition; EventKind::COUNT] {
    let mut row = [Transition::STAY; EventKind::COUNT];
    let mut index = 0;
    while index < EventKind::COUNT {
        row[index] = transition(state, EventKind::ALL[index]);
        index += 1;
    }
    row
}
