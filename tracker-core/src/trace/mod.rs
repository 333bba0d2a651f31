//! Trace ring recording what the control loop did.
//!
//! The loop never logs directly: it appends compact [`TraceRecord`]s to a
//! fixed-capacity history buffer, and the firmware (defmt) or emulator
//! (stdout) mirrors new records after each drained batch. When the ring wraps
//! the oldest records are overwritten.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::dispatch::ErrorCode;
use crate::drivers::RadioError;
use crate::event::EventKind;
use crate::flash::{FlashError, OperationKind, Sequence};
use crate::machine::{ConnState, Fault};
use crate::timer::TimerId;

/// Default number of trace records retained.
pub const TRACE_CAPACITY: usize = 64;

/// Monotonic identifier assigned to each record.
pub type TraceId = u32;

/// Something worth remembering about one handled event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    /// The lifecycle machine changed state.
    Transition {
        from: ConnState,
        to: ConnState,
        cause: EventKind,
    },
    /// An event could not be posted.
    QueueDrop(EventKind),
    /// An expiry arrived for a timer that was stopped or rearmed since.
    StaleTimer(TimerId),
    /// Timer expiries lost to a full queue during one poll.
    TimerDrop { dropped: usize },
    /// The wireless stack refused a request.
    RadioFailed(RadioError),
    /// A storage operation was installed.
    FlashStarted(OperationKind),
    /// A storage request arrived while another operation was active.
    FlashDeferred(OperationKind),
    /// The storage controller advanced.
    FlashStep {
        kind: OperationKind,
        sequence: Sequence,
    },
    /// A storage operation finished.
    FlashFinished(OperationKind),
    /// A storage operation was abandoned.
    FlashFailed {
        kind: OperationKind,
        error: FlashError,
    },
    /// A storage completion arrived with nothing outstanding.
    FlashSpurious(EventKind),
    /// A storage report belonged to a link that has since closed.
    FlashStale(OperationKind),
    /// A connection-parameter request hit a transient error.
    ParamRetry { attempt: u16 },
    /// Parameter negotiation gave up.
    ParamEscalated,
    /// A protocol command was refused.
    CommandRejected { id: u8, code: ErrorCode },
    /// A notification could not be delivered.
    NotifyFailed,
    /// The control loop hit an unrecoverable fault.
    Fault(Fault),
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Transition { from, to, cause } => {
                write!(f, "state {from} -> {to} on {cause}")
            }
            TraceEvent::QueueDrop(kind) => write!(f, "queue full, dropped {kind}"),
            TraceEvent::StaleTimer(id) => write!(f, "stale {id} expiry ignored"),
            TraceEvent::TimerDrop { dropped } => write!(f, "{dropped} timer expiries dropped"),
            TraceEvent::RadioFailed(error) => write!(f, "{error}"),
            TraceEvent::FlashStarted(kind) => write!(f, "flash {kind} started"),
            TraceEvent::FlashDeferred(kind) => write!(f, "flash {kind} deferred"),
            TraceEvent::FlashStep { kind, sequence } => write!(f, "flash {kind} at {sequence}"),
            TraceEvent::FlashFinished(kind) => write!(f, "flash {kind} finished"),
            TraceEvent::FlashFailed { kind, error } => write!(f, "flash {kind} failed: {error}"),
            TraceEvent::FlashSpurious(kind) => write!(f, "flash ignored stray {kind}"),
            TraceEvent::FlashStale(kind) => write!(f, "flash {kind} outcome owed to a closed link"),
            TraceEvent::ParamRetry { attempt } => write!(f, "param request retry #{attempt}"),
            TraceEvent::ParamEscalated => f.write_str("param negotiation abandoned"),
            TraceEvent::CommandRejected { id, code } => {
                write!(f, "command 0x{id:02x} rejected: {code}")
            }
            TraceEvent::NotifyFailed => f.write_str("notification not delivered"),
            TraceEvent::Fault(fault) => write!(f, "fault: {fault}"),
        }
    }
}

/// One entry of the trace ring.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceRecord {
    pub id: TraceId,
    pub event: TraceEvent,
}

/// Fixed-capacity trace history.
pub struct TraceLog<const CAPACITY: usize = TRACE_CAPACITY> {
    ring: HistoryBuf<TraceRecord, CAPACITY>,
    next_id: TraceId,
}

impl<const CAPACITY: usize> TraceLog<CAPACITY> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_id: 0,
        }
    }

    /// Appends a record and returns its id.
    pub fn record(&mut self, event: TraceEvent) -> TraceId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.ring.write(TraceRecord { id, event });
        id
    }

    /// Records in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TraceRecord> {
        self.ring.oldest_ordered()
    }

    /// Records with an id at or after `first`, oldest first.
    pub fn since(&self, first: TraceId) -> impl Iterator<Item = &TraceRecord> {
        self.ring
            .oldest_ordered()
            .filter(move |record| record.id.wrapping_sub(first) < TraceId::MAX / 2)
    }

    /// Id the next record will receive.
    #[must_use]
    pub const fn next_id(&self) -> TraceId {
        self.next_id
    }

    #[must_use]
    pub fn latest(&self) -> Option<&TraceRecord> {
        self.ring.recent()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns `true` when any retained record matches `predicate`.
    pub fn contains(&self, predicate: impl Fn(&TraceEvent) -> bool) -> bool {
        self.ring.oldest_ordered().any(|record| predicate(&record.event))
    }
}

impl<const CAPACITY: usize> Default for TraceLog<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}
