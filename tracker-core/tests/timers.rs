mod support;

use std::time::Duration;

use support::{MockInstant, QUEUE_DEPTH, booted, connected, deliver, ms};
use tracker_core::config::{ControlConfig, TIMER_SLOTS};
use tracker_core::event::ProtocolCommand;
use tracker_core::machine::ConnState;
use tracker_core::timer::{TimerId, TimerMode, TimerService};
use tracker_core::trace::TraceEvent;
use tracker_core::{Event, EventKind, EventQueue};

const T: Duration = Duration::from_millis(1_000);

fn expiries(queue: &EventQueue<QUEUE_DEPTH>) -> Vec<EventKind> {
    std::iter::from_fn(|| queue.dequeue())
        .map(|event| event.kind())
        .collect()
}

#[test]
fn force_disconnect_fires_once_when_left_alone() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut timers = TimerService::<MockInstant, TIMER_SLOTS>::new();
    timers
        .start(TimerId::ForceDisconnect, T, TimerMode::OneShot, ms(0))
        .unwrap();

    for now in (0..1_000).step_by(100) {
        assert_eq!(timers.poll(ms(now), &queue).fired, 0);
    }
    assert_eq!(timers.poll(ms(1_000), &queue).fired, 1);
    assert_eq!(timers.poll(ms(5_000), &queue).fired, 0);
    assert_eq!(expiries(&queue), vec![EventKind::ForceDisconnectTimeout]);
}

#[test]
fn restart_before_deadline_never_fires_early() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut timers = TimerService::<MockInstant, TIMER_SLOTS>::new();
    timers
        .start(TimerId::ForceDisconnect, T, TimerMode::OneShot, ms(0))
        .unwrap();

    timers.poll(ms(900), &queue);
    timers
        .restart(TimerId::ForceDisconnect, T, TimerMode::OneShot, ms(900))
        .unwrap();

    assert_eq!(timers.poll(ms(1_000), &queue).fired, 0);
    assert_eq!(timers.poll(ms(1_899), &queue).fired, 0);
    assert!(queue.is_empty());
    assert_eq!(timers.poll(ms(1_900), &queue).fired, 1);
    assert_eq!(expiries(&queue), vec![EventKind::ForceDisconnectTimeout]);
}

#[test]
fn stop_discards_expiry_already_in_queue() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut timers = TimerService::<MockInstant, TIMER_SLOTS>::new();
    timers
        .start(TimerId::Reconnect, T, TimerMode::OneShot, ms(0))
        .unwrap();
    timers.poll(ms(1_000), &queue);
    timers.stop(TimerId::Reconnect);

    let Some(Event::Timer(expiry)) = queue.dequeue() else {
        panic!("expected an expiry");
    };
    assert!(!timers.is_current(expiry));
}

#[test]
fn command_traffic_postpones_forced_disconnect() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let config = ControlConfig::new().with_force_disconnect_timeout(T);
    let mut controller = connected(&queue, config);
    assert_eq!(controller.state(), ConnState::ConnectedLatency0);

    // The link came up at t=10; a command at t=900 pushes the deadline to 1900.
    deliver(
        &mut controller,
        Event::Command(ProtocolCommand::bare(0x01)),
        ms(900),
    );
    controller.settle(ms(1_010)).unwrap();
    assert_eq!(controller.state(), ConnState::ConnectedLatency0);

    controller.settle(ms(1_900)).unwrap();
    assert_eq!(controller.state(), ConnState::ForcedDisconnect);
}

#[test]
fn stale_expiry_is_traced_and_ignored() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let config = ControlConfig::new().with_force_disconnect_timeout(T);
    let mut controller = connected(&queue, config);

    // Expiry generated at the deadline but still queued when a command rearms the timer.
    controller.poll_timers(ms(1_010));
    queue
        .post(Event::Command(ProtocolCommand::bare(0x01)))
        .unwrap();
    let mut pending: Vec<Event> = std::iter::from_fn(|| queue.dequeue()).collect();
    pending.rotate_left(1);
    for event in pending {
        controller.handle(event, ms(1_010)).unwrap();
    }

    assert_eq!(controller.state(), ConnState::ConnectedLatency0);
    assert!(
        controller
            .trace()
            .contains(|event| *event == TraceEvent::StaleTimer(TimerId::ForceDisconnect))
    );
}

#[test]
fn advertising_window_closes_into_pre_sleep_then_deep_sleep() {
    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let config = ControlConfig::new();
    let mut controller = booted(&queue, config);
    assert_eq!(controller.state(), ConnState::Advertising);

    let advertising_ms = config.advertising_timeout.as_millis() as u64;
    let pre_sleep_ms = config.pre_sleep_delay.as_millis() as u64;

    controller.settle(ms(advertising_ms)).unwrap();
    assert_eq!(controller.state(), ConnState::PreSleep);

    controller.settle(ms(advertising_ms + pre_sleep_ms)).unwrap();
    assert_eq!(controller.state(), ConnState::DeepSleep);
    assert_eq!(controller.platform().power.deep_sleeps, 1);
    assert!(controller.platform().storage.open.is_empty());
}
