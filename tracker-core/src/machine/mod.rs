//! Connection-lifecycle state machine and the control loop context.
//!
//! [`Controller`] owns every piece of mutable control-plane state: the current
//! [`StateRecord`], the timers, the storage controller, the command
//! dispatcher, the retry counters and the trace ring. Producers only ever see
//! the [`EventQueue`]. Each dequeued event is dispatched through the active
//! row of the transition table: the handler in the cell runs first, and the
//! next state is then taken from the cell unconditionally.

use core::fmt;

use crate::config::{ControlConfig, TIMER_SLOTS};
use crate::dispatch::{ActivityTotals, DispatchEnv, Dispatcher, ErrorCode, StatusReport};
use crate::drivers::{Platform, PowerControl};
use crate::event::Event;
use crate::flash::{FlashController, FlashEnv};
use crate::queue::EventQueue;
use crate::retry::RetryCounter;
use crate::timer::{PollReport, TimerService};
use crate::trace::{TraceEvent, TraceLog};

mod handlers;
pub mod state;
pub mod table;

pub use state::{ConnState, LinkState, StateRecord, TEMPLATES};
pub use table::{Handler, Next, Transition, transition};

/// Upper bound on poll/drain rounds performed by [`Controller::settle`].
pub const MAX_SETTLE_ROUNDS: usize = 64;

/// Unrecoverable control-plane failure; the device resets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// A timer could not be armed.
    TimerExhausted,
    /// A storage step arrived with no operation installed.
    MissingOperation,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::TimerExhausted => f.write_str("timer slots exhausted"),
            Fault::MissingOperation => f.write_str("storage step without operation"),
        }
    }
}

/// Single consumer of the event queue.
pub struct Controller<'q, P: Platform, const N: usize> {
    queue: &'q EventQueue<N>,
    platform: P,
    config: ControlConfig,
    state: StateRecord,
    timers: TimerService<P::Instant, TIMER_SLOTS>,
    flash: FlashController,
    dispatcher: Dispatcher,
    param_retries: RetryCounter,
    link: LinkState,
    totals: ActivityTotals,
    battery_mv: u16,
    last_error: ErrorCode,
    trace: TraceLog,
}

impl<'q, P: Platform, const N: usize> Controller<'q, P, N> {
    pub fn new(queue: &'q EventQueue<N>, platform: P, config: ControlConfig) -> Self {
        Self {
            queue,
            platform,
            config,
            state: StateRecord::template(ConnState::Initializing),
            timers: TimerService::new(),
            flash: FlashController::new(config.storage_retry_limit),
            dispatcher: Dispatcher::new(),
            param_retries: RetryCounter::new(config.param_retry_limit),
            link: LinkState::disconnected(),
            totals: ActivityTotals::default(),
            battery_mv: 0,
            last_error: ErrorCode::Ok,
            trace: TraceLog::new(),
        }
    }

    /// Dispatches one event through the active row.
    ///
    /// # Errors
    ///
    /// Returns the [`Fault`] raised by the handler; the state is left as it
    /// was before the event.
    pub fn handle(&mut self, event: Event, now: P::Instant) -> Result<(), Fault> {
        if let Event::Timer(expiry) = event
            && !self.timers.is_current(expiry)
        {
            self.trace.record(TraceEvent::StaleTimer(expiry.id));
            return Ok(());
        }

        let kind = event.kind();
        let cell = self.state.cell(kind);
        self.run(cell.handler, &event, now)?;

        if let Next::To(next) = cell.next {
            let from = self.state.state;
            if next != from {
                self.trace.record(TraceEvent::Transition {
                    from,
                    to: next,
                    cause: kind,
                });
            }
            self.state = StateRecord::template(next);
        }
        Ok(())
    }

    /// Posts expiries for every timer due at `now`.
    pub fn poll_timers(&mut self, now: P::Instant) -> PollReport {
        let report = self.timers.poll(now, self.queue);
        if report.dropped > 0 {
            self.trace.record(TraceEvent::TimerDrop {
                dropped: report.dropped,
            });
        }
        report
    }

    /// Handles at most one queue's worth of events.
    ///
    /// A fault is traced and handed to [`PowerControl::reset`] before it is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first [`Fault`] raised by a handler.
    pub fn drain(&mut self, now: P::Instant) -> Result<usize, Fault> {
        let mut handled = 0;
        while handled < N {
            let Some(event) = self.queue.dequeue() else {
                break;
            };
            handled += 1;
            if let Err(fault) = self.handle(event, now) {
                self.trace.record(TraceEvent::Fault(fault));
                self.platform.power().reset(fault);
                return Err(fault);
            }
        }
        Ok(handled)
    }

    /// Polls timers and drains until nothing is left to do at `now`.
    ///
    /// # Errors
    ///
    /// Returns the first [`Fault`] raised by a handler.
    pub fn settle(&mut self, now: P::Instant) -> Result<usize, Fault> {
        let mut total = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            self.poll_timers(now);
            let handled = self.drain(now)?;
            if handled == 0 {
                break;
            }
            total += handled;
        }
        Ok(total)
    }

    /// Earliest deadline the loop must wake up for.
    #[must_use]
    pub fn next_deadline(&self) -> Option<P::Instant> {
        self.timers.next_deadline()
    }

    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state.state
    }

    #[must_use]
    pub const fn state_record(&self) -> &StateRecord {
        &self.state
    }

    #[must_use]
    pub const fn link(&self) -> LinkState {
        self.link
    }

    #[must_use]
    pub const fn flash(&self) -> &FlashController {
        &self.flash
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub const fn timers(&self) -> &TimerService<P::Instant, TIMER_SLOTS> {
        &self.timers
    }

    #[must_use]
    pub const fn trace(&self) -> &TraceLog {
        &self.trace
    }

    #[must_use]
    pub const fn totals(&self) -> ActivityTotals {
        self.totals
    }

    #[must_use]
    pub const fn param_retries(&self) -> RetryCounter {
        self.param_retries
    }

    #[must_use]
    pub const fn battery_mv(&self) -> u16 {
        self.battery_mv
    }

    #[must_use]
    pub const fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    #[must_use]
    pub const fn queue(&self) -> &'q EventQueue<N> {
        self.queue
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Storage controller plus the environment its handlers need.
    fn flash_parts(&mut self) -> (&mut FlashController, FlashEnv<'_, P::Storage, EventQueue<N>>) {
        (
            &mut self.flash,
            FlashEnv {
                storage: self.platform.storage(),
                sink: self.queue,
                link: self.link,
                totals: self.totals,
                trace: &mut self.trace,
            },
        )
    }

    /// Dispatcher plus the environment its handlers need.
    fn dispatch_parts(&mut self) -> (&mut Dispatcher, DispatchEnv<'_, P, EventQueue<N>>) {
        let status = StatusReport {
            state: self.state.state,
            battery_mv: self.battery_mv,
            flash_busy: !self.flash.is_idle(),
        };
        (
            &mut self.dispatcher,
            DispatchEnv {
                platform: &mut self.platform,
                sink: self.queue,
                flash: &self.flash,
                totals: &mut self.totals,
                status,
                trace: &mut self.trace,
            },
        )
    }
}
