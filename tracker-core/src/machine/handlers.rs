use core::time::Duration;

use crate::dispatch::{ErrorCode, LinkEpoch, Reply, StatusReport};
use crate::drivers::{
    ActivityClassifier, Characteristic, ConnectionParameters, Platform, PowerControl, RadioLink,
    SlaveLatency,
};
use crate::event::Event;
use crate::flash::{FlashError, FlashOutcome, FlashReport, FlashRequest, OperationKind};
use crate::retry::RetryVerdict;
use crate::timer::{TimerError, TimerId, TimerMode};
use crate::trace::TraceEvent;

use super::{Controller, Fault, Handler, LinkState};

impl<P: Platform, const N: usize> Controller<'_, P, N> {
    /// Runs the handler selected by the active row.
    pub(super) fn run(
        &mut self,
        handler: Handler,
        event: &Event,
        now: P::Instant,
    ) -> Result<(), Fault> {
        match handler {
            Handler::Ignore => {}
            Handler::Boot => self.boot(now)?,
            Handler::AcceptConnection => self.accept_connection(event, now)?,
            Handler::RequestLatency0 => self.request_latency(SlaveLatency::ZERO, event.clone()),
            Handler::RequestLatency1 => self.request_latency(SlaveLatency::RELAXED, event.clone()),
            Handler::ConfirmParameters => {
                if let Event::ParametersChanged(latency) = *event {
                    self.link.latency = latency;
                    self.param_retries.reset();
                    self.flash_latency_changed(latency);
                }
            }
            Handler::RenegotiateLatency0 => self.renegotiate(event, Event::ParamChangeRequested),
            Handler::RenegotiateLatency1 => self.renegotiate(event, Event::ParamRestoreRequested),
            Handler::AckLowLatency => self.flash_latency_changed(self.link.latency),
            Handler::LinkLost => {
                self.shut_link();
                self.advertise();
                self.arm(TimerId::Reconnect, self.config.reconnect_window, TimerMode::OneShot, now)?;
            }
            Handler::ResumeAdvertising => {
                self.shut_link();
                self.advertise();
                self.arm_advertising(now)?;
            }
            Handler::ReconnectExpired => self.arm_advertising(now)?,
            Handler::StopAdvertising => {
                if let Err(error) = self.platform.radio().stop_advertising() {
                    self.trace.record(TraceEvent::RadioFailed(error));
                }
                self.timers.stop(TimerId::Advertising);
                self.timers.stop(TimerId::Reconnect);
                self.arm(TimerId::PreSleep, self.config.pre_sleep_delay, TimerMode::OneShot, now)?;
            }
            Handler::EnterPreSleep => {
                self.shut_link();
                self.arm(TimerId::PreSleep, self.config.pre_sleep_delay, TimerMode::OneShot, now)?;
            }
            Handler::EnterDeepSleep => self.enter_deep_sleep(),
            Handler::Wake => {
                self.timers.stop(TimerId::PreSleep);
                self.mount_storage();
                self.advertise();
                self.arm_advertising(now)?;
                self.arm(TimerId::Battery, self.config.battery_period, TimerMode::Repeating, now)?;
            }
            Handler::Disconnect => self.disconnect(now)?,
            Handler::AbandonParamUpdate => {
                self.abandon_flash(FlashError::LinkParameters);
                self.param_retries.reset();
                self.disconnect(now)?;
            }
            Handler::DispatchCommand => {
                if let Event::Command(command) = event {
                    self.arm(
                        TimerId::ForceDisconnect,
                        self.config.force_disconnect_timeout,
                        TimerMode::OneShot,
                        now,
                    )?;
                    let (dispatcher, mut env) = self.dispatch_parts();
                    let reply = dispatcher.handle(command, &mut env);
                    if let Some(reply) = reply {
                        self.send_reply(reply);
                    }
                }
            }
            Handler::RejectCommand => {
                if let Event::Command(command) = event {
                    self.trace.record(TraceEvent::CommandRejected {
                        id: command.id,
                        code: ErrorCode::InvalidState,
                    });
                    self.send_reply(Reply::error(command.id, ErrorCode::InvalidState));
                }
            }
            Handler::ServeRead => {
                if let Event::ReadRequested(characteristic) = *event {
                    self.serve_read(characteristic);
                }
            }
            Handler::SwitchMode => {
                if let Event::ModeChange(mode) = *event {
                    self.dispatcher.set_mode(mode);
                    self.platform.classifier().reset();
                }
            }
            Handler::ProcessSamples => {
                let (dispatcher, mut env) = self.dispatch_parts();
                let reply = dispatcher.consume_samples(&mut env);
                if let Some(reply) = reply {
                    self.send_reply(reply);
                }
            }
            Handler::SampleBattery => self.sample_battery(),
            Handler::RouteFlashRequest => {
                if let Event::FlashRequest(request, origin) = *event {
                    self.start_flash(request, origin)?;
                }
            }
            Handler::RouteFlashStep => {
                if let Event::FlashStep(step) = *event {
                    let (flash, mut env) = self.flash_parts();
                    let report = flash.on_step(step, &mut env)?;
                    self.handle_report(report);
                }
            }
            Handler::RouteWriteComplete => {
                if let Event::WriteComplete(status) = *event {
                    let (flash, mut env) = self.flash_parts();
                    let report = flash.on_write_complete(status, &mut env)?;
                    self.handle_report(report);
                }
            }
            Handler::RouteEraseComplete => {
                if let Event::EraseComplete(status) = *event {
                    let (flash, mut env) = self.flash_parts();
                    let report = flash.on_erase_complete(status, &mut env)?;
                    self.handle_report(report);
                }
            }
            Handler::RotateLog => {
                if let Event::DayRollover(timestamp) = *event {
                    let origin = self.dispatcher.link_epoch();
                    self.start_flash(FlashRequest::RotateLog(timestamp), origin)?;
                }
            }
        }
        Ok(())
    }

    fn boot(&mut self, now: P::Instant) -> Result<(), Fault> {
        self.mount_storage();
        self.dispatcher.reset_link(self.flash.pairing_code().is_some());
        self.advertise();
        self.arm_advertising(now)?;
        self.arm(TimerId::Battery, self.config.battery_period, TimerMode::Repeating, now)
    }

    fn accept_connection(&mut self, event: &Event, now: P::Instant) -> Result<(), Fault> {
        self.timers.stop(TimerId::Advertising);
        self.timers.stop(TimerId::PreSleep);
        self.timers.stop(TimerId::Reconnect);

        self.link = LinkState::established();
        self.param_retries.reset();
        self.dispatcher.reset_link(self.flash.pairing_code().is_some());
        self.arm(
            TimerId::ForceDisconnect,
            self.config.force_disconnect_timeout,
            TimerMode::OneShot,
            now,
        )?;

        self.request_latency(SlaveLatency::ZERO, event.clone());
        Ok(())
    }

    /// Asks the central for `target`; `trigger` is re-posted on a transient failure.
    fn request_latency(&mut self, target: SlaveLatency, trigger: Event) {
        let params = ConnectionParameters::for_latency(target);
        match self.platform.radio().request_connection_parameters(params) {
            Ok(()) => {}
            Err(error) if error.is_transient() => self.parameter_failure(trigger),
            Err(error) => {
                self.trace.record(TraceEvent::RadioFailed(error));
                self.escalate_parameters();
            }
        }
    }

    /// The central applied parameters other than the ones asked for.
    fn renegotiate(&mut self, event: &Event, trigger: Event) {
        if let Event::ParametersChanged(latency) = *event {
            self.link.latency = latency;
        }
        self.parameter_failure(trigger);
    }

    fn parameter_failure(&mut self, trigger: Event) {
        match self.param_retries.record_failure() {
            RetryVerdict::Retry(attempt) => {
                self.trace.record(TraceEvent::ParamRetry { attempt });
                self.platform.power().sleep_yield();
                self.post(trigger);
            }
            RetryVerdict::Escalate => self.escalate_parameters(),
        }
    }

    fn escalate_parameters(&mut self) {
        self.param_retries.reset();
        self.trace.record(TraceEvent::ParamEscalated);
        self.post(Event::ParamUpdateAbandoned);
    }

    fn flash_latency_changed(&mut self, latency: SlaveLatency) {
        let (flash, mut env) = self.flash_parts();
        let report = flash.on_parameters_changed(latency, &mut env);
        self.handle_report(report);
    }

    fn start_flash(&mut self, request: FlashRequest, origin: LinkEpoch) -> Result<(), Fault> {
        let (flash, mut env) = self.flash_parts();
        let report = flash.request(request, origin, &mut env)?;
        self.handle_report(report);
        Ok(())
    }

    fn abandon_flash(&mut self, error: FlashError) {
        let (flash, mut env) = self.flash_parts();
        let report = flash.abandon(error, &mut env);
        self.handle_report(report);
    }

    /// Routes the end of a storage operation to the totals and the owed reply.
    ///
    /// Every report follows a storage reinit, which also restarts the
    /// parameter retry budget.
    fn handle_report(&mut self, report: Option<FlashReport>) {
        let Some(report) = report else {
            return;
        };
        self.param_retries.reset();
        match report.result {
            Err(error) => self.last_error = ErrorCode::from(error),
            Ok(FlashOutcome::LogAppended(summary)) if report.kind == OperationKind::RotateLog => {
                self.totals.deduct(&summary);
            }
            Ok(_) => {}
        }
        if let Some(reply) = self.dispatcher.on_flash_report(report, &mut self.trace) {
            self.send_reply(reply);
        }
    }

    /// Tears down per-link state once the link is gone.
    fn shut_link(&mut self) {
        self.link = LinkState::disconnected();
        self.timers.stop(TimerId::ForceDisconnect);
        self.timers.stop(TimerId::DisconnectConfirm);
        self.param_retries.reset();
        self.dispatcher.reset_link(self.flash.pairing_code().is_some());

        let (flash, mut env) = self.flash_parts();
        let report = flash.on_link_lost(&mut env);
        self.handle_report(report);
    }

    fn disconnect(&mut self, now: P::Instant) -> Result<(), Fault> {
        if let Err(error) = self.platform.radio().disconnect() {
            self.trace.record(TraceEvent::RadioFailed(error));
        }
        self.timers.stop(TimerId::ForceDisconnect);
        self.arm(
            TimerId::DisconnectConfirm,
            self.config.disconnect_confirm_timeout,
            TimerMode::OneShot,
            now,
        )
    }

    fn enter_deep_sleep(&mut self) {
        self.timers.stop(TimerId::Battery);
        self.timers.stop(TimerId::PreSleep);
        if !self.flash.is_idle() {
            self.abandon_flash(FlashError::NotMounted);
        }
        self.flash.unmount(self.platform.storage());
        self.platform.power().enter_deep_sleep();
    }

    fn mount_storage(&mut self) {
        if let Err(error) = self.flash.mount(self.platform.storage()) {
            self.last_error = ErrorCode::from(error);
            self.trace.record(TraceEvent::FlashFailed {
                kind: OperationKind::Idle,
                error,
            });
        }
    }

    fn advertise(&mut self) {
        if let Err(error) = self.platform.radio().start_advertising() {
            self.trace.record(TraceEvent::RadioFailed(error));
        }
    }

    fn serve_read(&mut self, characteristic: Characteristic) {
        match characteristic {
            Characteristic::Status => {
                let status = StatusReport {
                    state: self.state.state,
                    battery_mv: self.battery_mv,
                    flash_busy: !self.flash.is_idle(),
                };
                let bytes = self.dispatcher.status_bytes(status);
                self.notify(characteristic, &bytes);
            }
            Characteristic::Battery => {
                let bytes = self.battery_mv.to_le_bytes();
                self.notify(characteristic, &bytes);
            }
            Characteristic::Activity => {
                let bytes = self.totals.to_bytes();
                self.notify(characteristic, &bytes);
            }
            Characteristic::LastError => {
                let bytes = [self.last_error.code()];
                self.notify(characteristic, &bytes);
            }
            // Write-only or notify-only.
            Characteristic::Response | Characteristic::RawData => {}
        }
    }

    fn sample_battery(&mut self) {
        let Some(millivolts) = self.platform.power().battery_millivolts() else {
            return;
        };
        self.battery_mv = millivolts;
        if self.link.connected {
            self.notify(Characteristic::Battery, &millivolts.to_le_bytes());
        }
        if millivolts < self.config.low_battery_mv {
            self.post(Event::SleepRequested);
        }
    }

    /// Notifies a reply on the response characteristic while a link is up.
    fn send_reply(&mut self, reply: Reply) {
        if reply.code != ErrorCode::Ok {
            self.last_error = reply.code;
        }
        if self.link.connected {
            self.notify(Characteristic::Response, &reply.encode());
        }
    }

    fn notify(&mut self, characteristic: Characteristic, bytes: &[u8]) {
        if self.platform.radio().notify(characteristic, bytes).is_err() {
            self.trace.record(TraceEvent::NotifyFailed);
        }
    }

    fn post(&mut self, event: Event) {
        let kind = event.kind();
        if self.queue.post(event).is_err() {
            self.trace.record(TraceEvent::QueueDrop(kind));
        }
    }

    fn arm_advertising(&mut self, now: P::Instant) -> Result<(), Fault> {
        self.arm(
            TimerId::Advertising,
            self.config.advertising_timeout,
            TimerMode::OneShot,
            now,
        )
    }

    fn arm(
        &mut self,
        id: TimerId,
        duration: Duration,
        mode: TimerMode,
        now: P::Instant,
    ) -> Result<(), Fault> {
        self.timers
            .start(id, duration, mode, now)
            .map(|_| ())
            .map_err(|TimerError::Exhausted| Fault::TimerExhausted)
    }
}
