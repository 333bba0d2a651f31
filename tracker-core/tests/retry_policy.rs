mod support;

use support::{QUEUE_DEPTH, RadioCall, booted, connected, deliver, ms};
use tracker_core::config::{ControlConfig, DEFAULT_PARAM_RETRY_LIMIT};
use tracker_core::dispatch::ErrorCode;
use tracker_core::drivers::{Characteristic, RadioError, SlaveLatency, StorageStatus};
use tracker_core::flash::FlashError;
use tracker_core::event::ProtocolCommand;
use tracker_core::machine::ConnState;
use tracker_core::retry::{RetryCounter, RetryVerdict};
use tracker_core::trace::TraceEvent;
use tracker_core::{Event, EventQueue};

fn escalations(trace: &tracker_core::trace::TraceLog) -> usize {
    trace
        .oldest_first()
        .filter(|record| record.event == TraceEvent::ParamEscalated)
        .count()
}

#[test]
fn counter_escalates_on_the_limit_th_failure_only() {
    let mut counter = RetryCounter::new(3);
    assert_eq!(counter.record_failure(), RetryVerdict::Retry(1));
    assert_eq!(counter.record_failure(), RetryVerdict::Retry(2));
    assert_eq!(counter.record_failure(), RetryVerdict::Escalate);
    assert_eq!(counter.attempts(), 0);
    assert_eq!(counter.record_failure(), RetryVerdict::Retry(1));
}

#[test]
fn two_hundred_busy_responses_escalate_exactly_once() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut controller = booted(&queue, ControlConfig::new());
    let limit = usize::from(DEFAULT_PARAM_RETRY_LIMIT);
    controller
        .platform_mut()
        .radio
        .parameter_responses
        .extend(std::iter::repeat_n(Err(RadioError::Busy), limit));

    deliver(&mut controller, Event::Connected, ms(10));

    assert_eq!(controller.platform().radio.latency_requests().len(), limit);
    assert_eq!(controller.platform().power.yields, limit - 1);
    assert_eq!(escalations(controller.trace()), 1);
    assert_eq!(controller.state(), ConnState::ParamNegotiationFailed);
    assert_eq!(controller.platform().radio.count(&RadioCall::Disconnect), 1);
    assert_eq!(controller.param_retries().attempts(), 0);

    // The link goes down and the device is discoverable again.
    deliver(&mut controller, Event::Disconnected, ms(20));
    assert_eq!(controller.state(), ConnState::Advertising);
}

#[test]
fn success_just_below_the_limit_clears_the_counter() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut controller = booted(&queue, ControlConfig::new());
    let below = usize::from(DEFAULT_PARAM_RETRY_LIMIT) - 1;
    controller
        .platform_mut()
        .radio
        .parameter_responses
        .extend(std::iter::repeat_n(Err(RadioError::InvalidState), below));

    deliver(&mut controller, Event::Connected, ms(10));
    assert_eq!(controller.state(), ConnState::ParamUpdateLatency0);
    assert_eq!(controller.param_retries().attempts(), u16::try_from(below).unwrap());

    deliver(
        &mut controller,
        Event::ParametersChanged(SlaveLatency::ZERO),
        ms(20),
    );
    assert_eq!(controller.state(), ConnState::ConnectedLatency0);
    assert_eq!(controller.param_retries().attempts(), 0);
    assert_eq!(escalations(controller.trace()), 0);
}

#[test]
fn hard_radio_failure_escalates_immediately() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut controller = booted(&queue, ControlConfig::new());
    controller
        .platform_mut()
        .radio
        .parameter_responses
        .push_back(Err(RadioError::Failed));

    deliver(&mut controller, Event::Connected, ms(10));

    assert_eq!(controller.platform().radio.latency_requests().len(), 1);
    assert_eq!(controller.state(), ConnState::ParamNegotiationFailed);
    assert!(
        controller
            .trace()
            .contains(|event| *event == TraceEvent::RadioFailed(RadioError::Failed))
    );
}

#[test]
fn abandoned_negotiation_fails_the_waiting_storage_operation() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let config = ControlConfig::new().with_param_retry_limit(3);
    let mut controller = connected(&queue, config);

    // Settle on the relaxed parameters first.
    deliver(&mut controller, Event::ParamRestoreRequested, ms(30));
    deliver(
        &mut controller,
        Event::ParametersChanged(SlaveLatency::RELAXED),
        ms(40),
    );
    assert_eq!(controller.state(), ConnState::ConnectedLatency1);

    controller
        .platform_mut()
        .radio
        .parameter_responses
        .extend(std::iter::repeat_n(Err(RadioError::Busy), 3));
    deliver(
        &mut controller,
        Event::Command(ProtocolCommand::new(0x10, &[180, 0, 75, 0, 30, 90])),
        ms(50),
    );

    assert_eq!(controller.state(), ConnState::ParamNegotiationFailed);
    assert!(controller.flash().is_idle());
    assert_eq!(controller.last_error(), ErrorCode::LinkParameters);
    assert_eq!(
        controller.platform().radio.notifications(Characteristic::Response),
        vec![vec![0x10, ErrorCode::LinkParameters.code()]]
    );
    assert!(controller.platform().storage.transactions.is_empty());
}

#[test]
fn storage_reinit_restarts_the_parameter_budget() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut controller = connected(&queue, ControlConfig::new());
    controller
        .platform_mut()
        .radio
        .parameter_responses
        .extend(std::iter::repeat_n(Err(RadioError::Busy), 2));

    deliver(&mut controller, Event::ParamRestoreRequested, ms(30));
    assert_eq!(controller.param_retries().attempts(), 2);

    deliver(
        &mut controller,
        Event::Command(ProtocolCommand::new(0x10, &[180, 0, 75, 0, 30, 90])),
        ms(40),
    );
    assert!(!controller.flash().is_idle());
    assert!(!controller.platform().storage.transactions.is_empty());

    deliver(
        &mut controller,
        Event::EraseComplete(StorageStatus::Failed),
        ms(50),
    );

    assert!(controller.flash().is_idle());
    assert_eq!(controller.param_retries().attempts(), 0);
    assert_eq!(
        controller.platform().radio.notifications(Characteristic::Response),
        vec![vec![0x10, ErrorCode::from(FlashError::EraseFailed).code()]]
    );
}
