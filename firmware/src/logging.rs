//! Mirrors control-plane trace records to the console.
//!
//! The controller only appends to its trace ring. After every drained batch
//! the control task calls [`mirror`] with the id it stopped at last time, and
//! each newer record goes out through defmt on the target or stdout on the
//! host.

use tracker_core::EventKind;
use tracker_core::Fault;
use tracker_core::trace::{TraceEvent, TraceId, TraceLog, TraceRecord};

/// Emits every record from `next` on and returns the id to resume from.
pub fn mirror(trace: &TraceLog, next: TraceId) -> TraceId {
    for record in trace.since(next) {
        emit(record, severity(&record.event));
    }
    trace.next_id()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Severity {
    Info,
    Warn,
    Error,
}

fn severity(event: &TraceEvent) -> Severity {
    match event {
        TraceEvent::Fault(_) => Severity::Error,
        TraceEvent::QueueDrop(_)
        | TraceEvent::TimerDrop { .. }
        | TraceEvent::RadioFailed(_)
        | TraceEvent::FlashFailed { .. }
        | TraceEvent::ParamEscalated
        | TraceEvent::NotifyFailed => Severity::Warn,
        TraceEvent::Transition { .. }
        | TraceEvent::StaleTimer(_)
        | TraceEvent::FlashStarted(_)
        | TraceEvent::FlashDeferred(_)
        | TraceEvent::FlashStep { .. }
        | TraceEvent::FlashFinished(_)
        | TraceEvent::FlashSpurious(_)
        | TraceEvent::FlashStale(_)
        | TraceEvent::ParamRetry { .. }
        | TraceEvent::CommandRejected { .. } => Severity::Info,
    }
}

#[cfg(target_os = "none")]
fn emit(record: &TraceRecord, severity: Severity) {
    let event = defmt::Display2Format(&record.event);
    match severity {
        Severity::Info => defmt::info!("trace #{} {}", record.id, event),
        Severity::Warn => defmt::warn!("trace #{} {}", record.id, event),
        Severity::Error => defmt::error!("trace #{} {}", record.id, event),
    }
}

#[cfg(not(target_os = "none"))]
fn emit(record: &TraceRecord, severity: Severity) {
    println!("trace #{} [{:?}] {}", record.id, severity, record.event);
}

/// A producer found the event queue full; the controller never saw the event.
#[cfg(target_os = "none")]
pub fn producer_drop(kind: EventKind) {
    defmt::warn!("queue full, producer dropped {}", kind.label());
}

#[cfg(not(target_os = "none"))]
pub fn producer_drop(kind: EventKind) {
    println!("queue full, producer dropped {kind}");
}

/// The control loop stopped on `fault` and is about to reset the device.
#[cfg(target_os = "none")]
pub fn fault(fault: Fault) {
    defmt::error!("control loop fault: {}", defmt::Display2Format(&fault));
}

#[cfg(not(target_os = "none"))]
pub fn fault(fault: Fault) {
    println!("control loop fault: {fault}");
}
