//! Connection-lifecycle states and the state record the loop swaps wholesale.

use core::fmt;

use crate::drivers::SlaveLatency;
use crate::event::EventKind;

use super::table::{Transition, row_for};

/// Top-level connection-lifecycle state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnState {
    Initializing,
    Advertising,
    PreSleep,
    DeepSleep,
    ParamUpdateLatency0,
    ParamUpdateLatency1,
    ConnectedLatency0,
    ConnectedLatency1,
    ForcedDisconnect,
    AutoReconnectPending,
    AwaitDisconnectConfirm,
    ParamNegotiationFailed,
}

impl ConnState {
    pub const COUNT: usize = 12;

    pub const ALL: [ConnState; Self::COUNT] = [
        ConnState::Initializing,
        ConnState::Advertising,
        ConnState::PreSleep,
        ConnState::DeepSleep,
        ConnState::ParamUpdateLatency0,
        ConnState::ParamUpdateLatency1,
        ConnState::ConnectedLatency0,
        ConnState::ConnectedLatency1,
        ConnState::ForcedDisconnect,
        ConnState::AutoReconnectPending,
        ConnState::AwaitDisconnectConfirm,
        ConnState::ParamNegotiationFailed,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Byte reported by the status reply.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// States in which the link is up and commands are served.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(
            self,
            ConnState::ParamUpdateLatency0
                | ConnState::ParamUpdateLatency1
                | ConnState::ConnectedLatency0
                | ConnState::ConnectedLatency1
        )
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            ConnState::Initializing => "initializing",
            ConnState::Advertising => "advertising",
            ConnState::PreSleep => "pre-sleep",
            ConnState::DeepSleep => "deep-sleep",
            ConnState::ParamUpdateLatency0 => "param-update-0",
            ConnState::ParamUpdateLatency1 => "param-update-1",
            ConnState::ConnectedLatency0 => "connected-0",
            ConnState::ConnectedLatency1 => "connected-1",
            ConnState::ForcedDisconnect => "forced-disconnect",
            ConnState::AutoReconnectPending => "auto-reconnect",
            ConnState::AwaitDisconnectConfirm => "await-disconnect",
            ConnState::ParamNegotiationFailed => "param-negotiation-failed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Link facts the handlers and the storage controller consult.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkState {
    pub connected: bool,
    pub latency: SlaveLatency,
}

impl LinkState {
    #[must_use]
    pub const fn disconnected() -> Self {
        Self {
            connected: false,
            latency: SlaveLatency::RELAXED,
        }
    }

    /// Link freshly established with the stack's default parameters.
    #[must_use]
    pub const fn established() -> Self {
        Self {
            connected: true,
            latency: SlaveLatency::RELAXED,
        }
    }
}

/// Current state plus its handler row.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateRecord {
    pub state: ConnState,
    pub row: [Transition; EventKind::COUNT],
}

impl StateRecord {
    /// Read-only template for `state`.
    #[must_use]
    pub const fn template(state: ConnState) -> Self {
        TEMPLATES[state.index()]
    }

    /// Cell for `kind` in this state's row.
    #[must_use]
    pub const fn cell(&self, kind: EventKind) -> Transition {
        self.row[kind.index()]
    }
}

/// One template per state, folded from the transition table at compile time.
pub const TEMPLATES: [StateRecord; ConnState::COUNT] = {
    let mut templates = [StateRecord {
        state: ConnState::Initializing,
        row: row_for(ConnState::Initializing),
    }; ConnState::COUNT];
    let mut index = 0;
    while index < ConnState::COUNT {
        let state = ConnState::ALL[index];
        templates[index] = StateRecord {
            state,
            row: row_for(state),
        };
        index += 1;
    }
    templates
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_indexed_by_state() {
        for state in ConnState::ALL {
            assert_eq!(StateRecord::template(state).state, state);
        }
    }

    #[test]
    fn only_live_link_states_count_as_connected() {
        assert!(ConnState::ConnectedLatency1.is_connected());
        assert!(ConnState::ParamUpdateLatency0.is_connected());
        assert!(!ConnState::ForcedDisconnect.is_connected());
        assert!(!ConnState::AutoReconnectPending.is_connected());
    }
}
