mod support;

use support::{MemoryStorage, QUEUE_DEPTH, Transaction};
use tracker_core::dispatch::{ActivityTotals, LinkEpoch};
use tracker_core::drivers::{Region, SlaveLatency, StorageStatus};
use tracker_core::flash::layout::{PROFILE_MAGIC, SECTOR_SIZE};
use tracker_core::flash::{
    DailySummary, FlashController, FlashEnv, FlashError, FlashOutcome, FlashReport, FlashRequest,
    IDLE_TEMPLATE, OperationKind, PARKED_REQUESTS, PairingCode, PlayerProfile, Sequence, Stage,
    StepFlags,
};
use tracker_core::machine::LinkState;
use tracker_core::trace::{TraceEvent, TraceLog};
use tracker_core::{Event, EventKind, EventQueue};

const PROFILE: PlayerProfile = PlayerProfile {
    height_cm: 181,
    weight_kg: 74,
    age: 27,
    stride_cm: 92,
};

const LOW_LATENCY_LINK: LinkState = LinkState {
    connected: true,
    latency: SlaveLatency::ZERO,
};

const ORIGIN: LinkEpoch = LinkEpoch::new(1);

/// Storage controller wired to an in-memory driver and a private queue.
struct Rig {
    queue: EventQueue<QUEUE_DEPTH>,
    storage: MemoryStorage,
    trace: TraceLog,
    flash: FlashController,
    link: LinkState,
    totals: ActivityTotals,
    /// Events the controller posted for the lifecycle machine.
    raised: Vec<Event>,
}

impl Rig {
    fn new(link: LinkState) -> Self {
        Self::with_storage(link, MemoryStorage::default())
    }

    fn with_storage(link: LinkState, mut storage: MemoryStorage) -> Self {
        let mut flash = FlashController::new(8);
        flash.mount(&mut storage).expect("mount");
        Self {
            queue: EventQueue::new(),
            storage,
            trace: TraceLog::new(),
            flash,
            link,
            totals: ActivityTotals::default(),
            raised: Vec::new(),
        }
    }

    fn parts(&mut self) -> (&mut FlashController, FlashEnv<'_, MemoryStorage, EventQueue<QUEUE_DEPTH>>) {
        (
            &mut self.flash,
            FlashEnv {
                storage: &mut self.storage,
                sink: &self.queue,
                link: self.link,
                totals: self.totals,
                trace: &mut self.trace,
            },
        )
    }

    fn request(&mut self, request: FlashRequest) -> Option<FlashReport> {
        let (flash, mut env) = self.parts();
        flash.request(request, ORIGIN, &mut env).expect("no fault")
    }

    /// Handles exactly one queued event addressed to the controller.
    fn step(&mut self) -> Option<FlashReport> {
        let event = self.queue.dequeue().expect("queued event");
        if !matches!(
            event,
            Event::FlashStep(_) | Event::WriteComplete(_) | Event::EraseComplete(_)
        ) {
            self.raised.push(event);
            return None;
        }

        let (flash, mut env) = self.parts();
        let report = match event {
            Event::FlashStep(step) => flash.on_step(step, &mut env),
            Event::WriteComplete(status) => flash.on_write_complete(status, &mut env),
            Event::EraseComplete(status) => flash.on_erase_complete(status, &mut env),
            _ => Ok(None),
        };
        report.expect("no fault")
    }

    /// Runs queued work, completing each transaction, until a report or silence.
    fn pump(&mut self) -> Option<FlashReport> {
        loop {
            if self.queue.is_empty() {
                if self.flash.record().in_flight.is_none() {
                    return None;
                }
                let done = self.storage.last_transaction().expect("transaction");
                self.queue.post(done.completion()).unwrap();
            }
            if let Some(report) = self.step() {
                self.drain_raised();
                return Some(report);
            }
        }
    }

    fn drain_raised(&mut self) {
        while let Some(event) = self.queue.dequeue() {
            self.raised.push(event);
        }
    }

    fn raised_count(&self, kind: EventKind) -> usize {
        self.raised.iter().filter(|event| event.kind() == kind).count()
    }
}

#[test]
fn profile_write_erases_then_writes_and_restores_latency_once() {
    let mut rig = Rig::new(LOW_LATENCY_LINK);

    assert_eq!(rig.request(FlashRequest::UpdatePlayerProfile(PROFILE)), None);
    assert_eq!(rig.flash.kind(), OperationKind::UpdatePlayerProfile);

    // Status check.
    assert_eq!(rig.step(), None);
    let steps = rig.flash.steps();
    assert!(steps.contains(StepFlags::ERASE_PROFILE.union(StepFlags::WRITE_PROFILE)));
    assert!(!steps.contains(StepFlags::ERASE_LOG));
    assert!(!steps.contains(StepFlags::REQUEST_LATENCY_0));

    // Operation started: the erase goes out first.
    assert_eq!(rig.step(), None);
    assert_eq!(rig.flash.sequence(), Sequence::Erasing);
    assert_eq!(
        rig.storage.transactions,
        vec![Transaction::Erase {
            region: Region::Profile,
            offset: 0
        }]
    );

    rig.queue
        .post(Event::EraseComplete(StorageStatus::Success))
        .unwrap();
    assert_eq!(rig.step(), None);
    assert_eq!(rig.flash.sequence(), Sequence::Writing);

    rig.queue
        .post(Event::WriteComplete(StorageStatus::Success))
        .unwrap();
    let report = rig.step();
    rig.drain_raised();

    assert_eq!(
        report,
        Some(FlashReport {
            kind: OperationKind::UpdatePlayerProfile,
            origin: ORIGIN,
            result: Ok(FlashOutcome::Completed),
        })
    );
    assert!(rig.flash.is_idle());
    assert_eq!(rig.raised_count(EventKind::ParamRestoreRequested), 1);
    assert_eq!(rig.flash.profile(), Some(PROFILE));
    assert_eq!(&rig.storage.profile[..4], &PROFILE_MAGIC);
}

#[test]
fn disconnected_profile_write_plans_only_storage_steps() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();

    assert_eq!(
        rig.flash.steps(),
        StepFlags::ERASE_PROFILE.union(StepFlags::WRITE_PROFILE)
    );
    let report = rig.pump();
    assert_eq!(report.map(|report| report.result), Some(Ok(FlashOutcome::Completed)));
    assert_eq!(rig.raised_count(EventKind::ParamRestoreRequested), 0);
}

#[test]
fn relaxed_link_waits_for_latency_zero_before_touching_flash() {
    let mut rig = Rig::new(LinkState::established());
    rig.request(FlashRequest::PairingErase);
    rig.step();

    assert_eq!(rig.flash.sequence(), Sequence::AwaitingLatency);
    assert!(rig.flash.steps().contains(StepFlags::REQUEST_LATENCY_0));
    rig.drain_raised();
    assert_eq!(rig.raised, vec![Event::ParamChangeRequested]);
    assert!(rig.storage.transactions.is_empty());

    {
        let (flash, mut env) = rig.parts();
        assert_eq!(flash.on_parameters_changed(SlaveLatency::RELAXED, &mut env), None);
    }
    assert!(rig.queue.is_empty());

    {
        let (flash, mut env) = rig.parts();
        assert_eq!(flash.on_parameters_changed(SlaveLatency::ZERO, &mut env), None);
    }
    let Some(Event::FlashStep(step)) = rig.queue.dequeue() else {
        panic!("expected operation-started marker");
    };
    assert_eq!(step.stage, Stage::OperationStarted);
    assert_eq!(step.ticket, rig.flash.ticket());
}

#[test]
fn request_during_active_operation_is_parked_until_it_ends() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    let before = *rig.flash.record();

    let code = PairingCode::new(*b"424242");
    assert_eq!(rig.request(FlashRequest::PairingWrite(code)), None);
    assert_eq!(*rig.flash.record(), before);
    assert_eq!(rig.flash.parked(), 1);

    // Only the profile marker is queued; nothing cycles through the queue.
    assert_eq!(rig.queue.len(), 1);
    let report = rig.pump();
    assert_eq!(report.map(|report| report.kind), Some(OperationKind::UpdatePlayerProfile));
    assert_eq!(rig.flash.parked(), 0);
    assert_eq!(
        rig.raised,
        vec![Event::FlashRequest(FlashRequest::PairingWrite(code), ORIGIN)]
    );

    let deferrals = rig
        .trace
        .oldest_first()
        .filter(|record| record.event == TraceEvent::FlashDeferred(OperationKind::PairingWrite))
        .count();
    assert_eq!(deferrals, 1);
}

#[test]
fn requests_beyond_the_parking_area_go_to_the_queue_tail() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    for _ in 0..=PARKED_REQUESTS {
        assert_eq!(rig.request(FlashRequest::PairingErase), None);
    }
    assert_eq!(rig.flash.parked(), PARKED_REQUESTS);

    assert!(matches!(rig.queue.dequeue(), Some(Event::FlashStep(_))));
    assert_eq!(
        rig.queue.dequeue(),
        Some(Event::FlashRequest(FlashRequest::PairingErase, ORIGIN))
    );
}

#[test]
fn completion_of_the_wrong_kind_is_spurious() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();
    rig.step();
    assert_eq!(rig.flash.sequence(), Sequence::Erasing);

    rig.queue
        .post(Event::WriteComplete(StorageStatus::Success))
        .unwrap();
    assert_eq!(rig.step(), None);
    assert_eq!(rig.flash.sequence(), Sequence::Erasing);
    assert!(rig.flash.record().in_flight.is_some());
    assert!(rig.trace.contains(|event| {
        *event == TraceEvent::FlashSpurious(EventKind::WriteComplete)
    }));
}

#[test]
fn busy_driver_is_retried_until_it_accepts() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.storage.busy_responses = 3;
    rig.request(FlashRequest::PairingErase);

    let report = rig.pump();
    assert_eq!(report.map(|report| report.result), Some(Ok(FlashOutcome::Completed)));
    assert_eq!(rig.storage.transactions.len(), 1);
}

#[test]
fn busy_driver_past_the_ceiling_fails_the_operation() {
    let mut rig = Rig::new(LOW_LATENCY_LINK);
    rig.storage.busy_responses = 8;
    rig.request(FlashRequest::PairingErase);

    let report = rig.pump();
    assert_eq!(
        report,
        Some(FlashReport {
            kind: OperationKind::PairingErase,
            origin: ORIGIN,
            result: Err(FlashError::Busy),
        })
    );
    assert!(rig.flash.is_idle());
    assert!(rig.storage.transactions.is_empty());
    assert_eq!(rig.raised_count(EventKind::ParamRestoreRequested), 1);
}

#[test]
fn failed_erase_abandons_and_returns_to_idle() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();
    rig.step();

    rig.queue
        .post(Event::EraseComplete(StorageStatus::Failed))
        .unwrap();
    assert_eq!(
        rig.step(),
        Some(FlashReport {
            kind: OperationKind::UpdatePlayerProfile,
            origin: ORIGIN,
            result: Err(FlashError::EraseFailed),
        })
    );
    assert!(rig.flash.is_idle());
    assert_eq!(rig.flash.profile(), None);
}

/// Reinits twice and checks the second call changed nothing.
fn reinit_twice(rig: &mut Rig) {
    let ticket = rig.flash.ticket();

    rig.flash.force_reinit();
    let once = (*rig.flash.record(), rig.flash.ticket());
    rig.flash.force_reinit();
    let twice = (*rig.flash.record(), rig.flash.ticket());

    assert_eq!(once, twice);
    assert_eq!(once.0, IDLE_TEMPLATE);
    assert_eq!(rig.flash.steps(), StepFlags::NONE);
    assert_eq!(rig.flash.sequence(), Sequence::Idle);
    assert!(rig.flash.record().in_flight.is_none());
    assert_ne!(once.1, ticket);
}

fn spurious(rig: &Rig, kind: EventKind) -> bool {
    rig.trace.contains(|event| *event == TraceEvent::FlashSpurious(kind))
}

#[test]
fn force_reinit_twice_equals_once() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::PairingErase);
    reinit_twice(&mut rig);

    // The marker of the abandoned operation is now stale.
    assert_eq!(rig.step(), None);
    assert!(rig.flash.is_idle());
    assert!(spurious(&rig, EventKind::FlashStep));
}

#[test]
fn force_reinit_while_awaiting_latency_forgets_the_wait() {
    let mut rig = Rig::new(LinkState::established());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();
    assert_eq!(rig.flash.sequence(), Sequence::AwaitingLatency);
    assert!(rig.flash.steps().contains(StepFlags::REQUEST_LATENCY_0));
    assert!(rig.flash.steps().contains(StepFlags::ERASE_PROFILE));

    reinit_twice(&mut rig);
    rig.drain_raised();

    // The confirmation that arrives afterwards resumes nothing.
    let (flash, mut env) = rig.parts();
    assert_eq!(flash.on_parameters_changed(SlaveLatency::ZERO, &mut env), None);
    assert!(rig.queue.is_empty());
    assert!(rig.storage.transactions.is_empty());
}

#[test]
fn force_reinit_while_erasing_turns_the_completion_spurious() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();
    rig.step();
    assert_eq!(rig.flash.sequence(), Sequence::Erasing);
    assert!(rig.flash.record().in_flight.is_some());

    reinit_twice(&mut rig);

    rig.queue
        .post(Event::EraseComplete(StorageStatus::Success))
        .unwrap();
    assert_eq!(rig.step(), None);
    assert!(spurious(&rig, EventKind::EraseComplete));
    assert!(rig.flash.is_idle());
    assert_eq!(rig.storage.transactions.len(), 1);
}

#[test]
fn force_reinit_while_writing_turns_the_completion_spurious() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();
    rig.step();
    rig.queue
        .post(Event::EraseComplete(StorageStatus::Success))
        .unwrap();
    rig.step();
    assert_eq!(rig.flash.sequence(), Sequence::Writing);
    assert!(rig.flash.steps().contains(StepFlags::WRITE_PROFILE));

    reinit_twice(&mut rig);

    rig.queue
        .post(Event::WriteComplete(StorageStatus::Success))
        .unwrap();
    assert_eq!(rig.step(), None);
    assert!(spurious(&rig, EventKind::WriteComplete));
    assert!(rig.flash.is_idle());
    assert_eq!(rig.flash.profile(), None);
}

#[test]
fn abandon_reports_without_restoring_parameters() {
    let mut rig = Rig::new(LOW_LATENCY_LINK);
    rig.request(FlashRequest::UpdatePlayerProfile(PROFILE));
    rig.step();

    let report = {
        let (flash, mut env) = rig.parts();
        flash.abandon(FlashError::LinkParameters, &mut env)
    };
    assert_eq!(
        report.map(|report| report.result),
        Some(Err(FlashError::LinkParameters))
    );
    rig.drain_raised();
    assert_eq!(rig.raised_count(EventKind::ParamRestoreRequested), 0);
    let (flash, mut env) = rig.parts();
    assert_eq!(flash.abandon(FlashError::LinkParameters, &mut env), None);
}

#[test]
fn appended_summary_survives_remount() {
    let summary = DailySummary {
        timestamp: 1_700_000_000,
        steps: 8_421,
        runs: 12,
        dashes: 3,
    };
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::WriteDailyLog(summary));
    rig.step();
    assert_eq!(
        rig.flash.steps(),
        StepFlags::ERASE_LOG_HEADER
            .union(StepFlags::ERASE_LOG)
            .union(StepFlags::WRITE_LOG_HEADER)
            .union(StepFlags::WRITE_LOG)
    );

    let report = rig.pump();
    assert_eq!(
        report.map(|report| report.result),
        Some(Ok(FlashOutcome::LogAppended(summary)))
    );
    assert_eq!(rig.flash.cursor().next, 1);
    assert_eq!(rig.flash.read_summary(&mut rig.storage, 0), Ok(Some(summary)));

    let remounted = Rig::with_storage(LinkState::disconnected(), rig.storage);
    assert_eq!(remounted.flash.cursor(), rig.flash.cursor());
    let mut storage = remounted.storage;
    assert_eq!(remounted.flash.read_summary(&mut storage, 0), Ok(Some(summary)));
    assert_eq!(remounted.flash.read_summary(&mut storage, 1), Ok(None));
}

#[test]
fn second_append_skips_header_and_sector_erase() {
    let summary = DailySummary {
        timestamp: 86_400,
        steps: 100,
        runs: 1,
        dashes: 0,
    };
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::WriteDailyLog(summary));
    rig.pump();

    rig.storage.transactions.clear();
    rig.request(FlashRequest::WriteDailyLog(DailySummary {
        timestamp: 172_800,
        ..summary
    }));
    rig.pump();

    assert_eq!(
        rig.storage.transactions,
        vec![Transaction::Write {
            region: Region::Log,
            offset: SECTOR_SIZE + 16,
        }]
    );
}

#[test]
fn rotation_snapshots_running_totals() {
    let mut rig = Rig::new(LinkState::disconnected());
    rig.totals = ActivityTotals {
        steps: 5_000,
        runs: 7,
        dashes: 2,
    };
    rig.request(FlashRequest::RotateLog(86_400));

    let report = rig.pump();
    assert_eq!(
        report,
        Some(FlashReport {
            kind: OperationKind::RotateLog,
            origin: ORIGIN,
            result: Ok(FlashOutcome::LogAppended(DailySummary {
                timestamp: 86_400,
                steps: 5_000,
                runs: 7,
                dashes: 2,
            })),
        })
    );
}

#[test]
fn pairing_check_compares_against_stored_code() {
    let stored = PairingCode::new(*b"135790");
    let mut rig = Rig::new(LinkState::disconnected());
    rig.request(FlashRequest::PairingWrite(stored));
    rig.pump();
    assert_eq!(rig.flash.pairing_code(), Some(stored));

    rig.request(FlashRequest::PairingCheck(PairingCode::new(*b"000000")));
    assert_eq!(
        rig.pump().map(|report| report.result),
        Some(Ok(FlashOutcome::PairingMatch(false)))
    );

    rig.request(FlashRequest::PairingCheck(stored));
    assert_eq!(
        rig.pump().map(|report| report.result),
        Some(Ok(FlashOutcome::PairingMatch(true)))
    );
}
