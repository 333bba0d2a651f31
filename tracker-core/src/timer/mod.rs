//! Cooperative software timers built on top of the event queue.
//!
//! The service never calls back into the control loop: an expired timer simply
//! posts [`Event::Timer`] and leaves the reaction to the transition table.
//! Every start or stop bumps the timer's generation, and the expiry event
//! carries the generation it was armed with, so an expiry that was already
//! queued when the timer got restarted is recognised as stale and ignored.

use core::fmt;
use core::ops::Add;
use core::time::Duration;

use crate::event::{Event, EventKind};
use crate::queue::EventSink;

/// Logical timers used by the control plane.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimerId {
    Advertising,
    PreSleep,
    ForceDisconnect,
    DisconnectConfirm,
    Reconnect,
    Battery,
}

impl TimerId {
    pub const COUNT: usize = 6;

    pub const ALL: [TimerId; Self::COUNT] = [
        TimerId::Advertising,
        TimerId::PreSleep,
        TimerId::ForceDisconnect,
        TimerId::DisconnectConfirm,
        TimerId::Reconnect,
        TimerId::Battery,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Event kind posted when this timer expires.
    #[must_use]
    pub const fn event_kind(self) -> EventKind {
        match self {
            TimerId::Advertising => EventKind::AdvertisingTimeout,
            TimerId::PreSleep => EventKind::PreSleepTimeout,
            TimerId::ForceDisconnect => EventKind::ForceDisconnectTimeout,
            TimerId::DisconnectConfirm => EventKind::DisconnectConfirmTimeout,
            TimerId::Reconnect => EventKind::ReconnectTimeout,
            TimerId::Battery => EventKind::BatteryTimer,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            TimerId::Advertising => "advertising",
            TimerId::PreSleep => "pre-sleep",
            TimerId::ForceDisconnect => "force-disconnect",
            TimerId::DisconnectConfirm => "disconnect-confirm",
            TimerId::Reconnect => "reconnect",
            TimerId::Battery => "battery",
        }
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a timer re-arms itself after firing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerMode {
    OneShot,
    Repeating,
}

/// Payload of a timer expiry event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerExpiry {
    pub id: TimerId,
    pub generation: u16,
}

/// Failure starting a timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerError {
    /// Every scheduler slot is occupied.
    Exhausted,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::Exhausted => f.write_str("timer slots exhausted"),
        }
    }
}

/// Counts reported by [`TimerService::poll`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PollReport {
    pub fired: usize,
    pub dropped: usize,
}

#[derive(Copy, Clone, Debug)]
struct TimerEntry<I> {
    id: TimerId,
    deadline: I,
    period: Duration,
    mode: TimerMode,
    generation: u16,
}

/// Fixed pool of software timers.
pub struct TimerService<I, const SLOTS: usize> {
    slots: [Option<TimerEntry<I>>; SLOTS],
    generations: [u16; TimerId::COUNT],
}

impl<I, const SLOTS: usize> TimerService<I, SLOTS>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Creates a service with every slot idle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; SLOTS],
            generations: [0; TimerId::COUNT],
        }
    }

    /// Arms `id` to fire `duration` after `now`, stopping it first if needed.
    ///
    /// Returns the generation stamped on the eventual expiry event.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Exhausted`] when every slot is taken.
    pub fn start(
        &mut self,
        id: TimerId,
        duration: Duration,
        mode: TimerMode,
        now: I,
    ) -> Result<u16, TimerError> {
        self.stop(id);

        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(TimerError::Exhausted)?;

        let generation = self.generations[id.index()];
        *slot = Some(TimerEntry {
            id,
            deadline: now + duration,
            period: duration,
            mode,
            generation,
        });

        Ok(generation)
    }

    /// Same as [`TimerService::start`]; spelled out for call sites that rearm.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Exhausted`] when every slot is taken.
    pub fn restart(
        &mut self,
        id: TimerId,
        duration: Duration,
        mode: TimerMode,
        now: I,
    ) -> Result<u16, TimerError> {
        self.start(id, duration, mode, now)
    }

    /// Cancels `id` and invalidates any expiry already queued for it.
    ///
    /// Returns `true` when the timer was armed.
    pub fn stop(&mut self, id: TimerId) -> bool {
        let generation = &mut self.generations[id.index()];
        *generation = generation.wrapping_add(1);

        let mut was_running = false;
        for slot in &mut self.slots {
            if matches!(slot, Some(entry) if entry.id == id) {
                *slot = None;
                was_running = true;
            }
        }
        was_running
    }

    /// Returns `true` while `id` is armed.
    #[must_use]
    pub fn is_running(&self, id: TimerId) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|entry| entry.id == id)
    }

    /// Returns `true` when `expiry` was produced by the current arming of its timer.
    #[must_use]
    pub fn is_current(&self, expiry: TimerExpiry) -> bool {
        self.generations[expiry.id.index()] == expiry.generation
    }

    /// Earliest pending deadline, if any timer is armed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        self.slots.iter().flatten().map(|entry| entry.deadline).min()
    }

    /// Posts an expiry for every timer whose deadline is at or before `now`.
    ///
    /// Posting is best-effort: an expiry that does not fit in the queue is
    /// counted in [`PollReport::dropped`] and the timer still counts as fired.
    pub fn poll<S>(&mut self, now: I, sink: &S) -> PollReport
    where
        S: EventSink + ?Sized,
    {
        let mut report = PollReport::default();

        for slot in &mut self.slots {
            let Some(entry) = slot else {
                continue;
            };
            if entry.deadline > now {
                continue;
            }

            match sink.post(Event::timer(entry.id, entry.generation)) {
                Ok(()) => report.fired += 1,
                Err(_) => report.dropped += 1,
            }

            match entry.mode {
                TimerMode::OneShot => *slot = None,
                TimerMode::Repeating => {
                    let next = entry.deadline + entry.period;
                    entry.deadline = if next > now { next } else { now + entry.period };
                }
            }
        }

        report
    }
}

impl<I, const SLOTS: usize> Default for TimerService<I, SLOTS>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct MockInstant(u64);

    impl Add<Duration> for MockInstant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self::Output {
            Self(self.0 + rhs.as_millis() as u64)
        }
    }

    fn ms(value: u64) -> MockInstant {
        MockInstant(value)
    }

    #[test]
    fn one_shot_fires_once_at_deadline() {
        let queue = EventQueue::<8>::new();
        let mut timers = TimerService::<MockInstant, 4>::new();
        timers
            .start(TimerId::Advertising, Duration::from_millis(100), TimerMode::OneShot, ms(0))
            .unwrap();

        assert_eq!(timers.poll(ms(99), &queue).fired, 0);
        assert_eq!(timers.poll(ms(100), &queue).fired, 1);
        assert_eq!(timers.poll(ms(500), &queue).fired, 0);
        assert!(!timers.is_running(TimerId::Advertising));

        let event = queue.dequeue().expect("expiry queued");
        assert_eq!(event.kind(), EventKind::AdvertisingTimeout);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn repeating_timer_rearms() {
        let queue = EventQueue::<8>::new();
        let mut timers = TimerService::<MockInstant, 4>::new();
        timers
            .start(TimerId::Battery, Duration::from_millis(10), TimerMode::Repeating, ms(0))
            .unwrap();

        assert_eq!(timers.poll(ms(10), &queue).fired, 1);
        assert_eq!(timers.next_deadline(), Some(ms(20)));
        assert_eq!(timers.poll(ms(45), &queue).fired, 1);
        assert_eq!(timers.next_deadline(), Some(ms(55)));
    }

    #[test]
    fn restart_invalidates_queued_expiry() {
        let queue = EventQueue::<8>::new();
        let mut timers = TimerService::<MockInstant, 4>::new();
        timers
            .start(TimerId::ForceDisconnect, Duration::from_millis(5), TimerMode::OneShot, ms(0))
            .unwrap();
        timers.poll(ms(5), &queue);

        timers
            .restart(TimerId::ForceDisconnect, Duration::from_millis(5), TimerMode::OneShot, ms(5))
            .unwrap();

        let Some(Event::Timer(expiry)) = queue.dequeue() else {
            panic!("expected timer expiry");
        };
        assert!(!timers.is_current(expiry));
    }

    #[test]
    fn exhausted_pool_is_reported() {
        let mut timers = TimerService::<MockInstant, 1>::new();
        timers
            .start(TimerId::Advertising, Duration::from_millis(1), TimerMode::OneShot, ms(0))
            .unwrap();
        let result =
            timers.start(TimerId::Reconnect, Duration::from_millis(1), TimerMode::OneShot, ms(0));
        assert_eq!(result, Err(TimerError::Exhausted));

        // Restarting the same id reuses its own slot.
        assert!(
            timers
                .start(TimerId::Advertising, Duration::from_millis(2), TimerMode::OneShot, ms(0))
                .is_ok()
        );
    }

    #[test]
    fn full_queue_counts_dropped_expiry() {
        let queue = EventQueue::<1>::new();
        queue.post(Event::Connected).unwrap();
        let mut timers = TimerService::<MockInstant, 2>::new();
        timers
            .start(TimerId::PreSleep, Duration::from_millis(1), TimerMode::OneShot, ms(0))
            .unwrap();

        let report = timers.poll(ms(1), &queue);
        assert_eq!(report, PollReport { fired: 0, dropped: 1 });
        assert!(!timers.is_running(TimerId::PreSleep));
    }
}
