//! End-to-end cycle tests for pumpsync-core.
//!
//! These drive the orchestrator through a sequence of wakes the way the
//! service does, with the mock bridge producing a sensor reading every five
//! minutes, and check what reaches the notifier and the upload dispatcher.

use std::sync::Arc;

use pumpsync_core::mock::{
    LinkStep, MemoryStore, MockDeviceLink, MockFailure, RecordingNotifier,
    RecordingUploadDispatcher, RecordingWakeScheduler,
};
use pumpsync_core::{
    HealthWarning, PersistentStore, StatusKind, SyncContext, SyncOrchestrator, SyncSettings,
    UploadTarget, forward_events,
};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const T0: OffsetDateTime = datetime!(2024-03-01 08:00:00 UTC);
const MAC: u64 = 0x0023_F745_12AB_CDEF;

type Orchestrator = SyncOrchestrator<MockDeviceLink, MemoryStore, RecordingWakeScheduler>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("pumpsync_core=debug")
        .try_init();
}

/// Point the mock pump at the latest sensor reading at `now`.
fn sensor_tick(o: &Orchestrator, now: OffsetDateTime) {
    let k = (now - T0).whole_seconds().div_euclid(300);
    o.link().update_status(|s| {
        s.cgm_active = true;
        s.calibration_due_minutes = 240;
        s.sgv = 100 + (k % 40) as u16;
        s.cgm_device_time = Some(T0 + Duration::seconds(k * 300));
    });
}

#[tokio::test(start_paused = true)]
async fn test_polls_follow_sensor_cycle() {
    init_tracing();

    let mut orchestrator = SyncOrchestrator::new(
        MockDeviceLink::new("1234567", MAC),
        MemoryStore::new(),
        RecordingWakeScheduler::default(),
        SyncContext::new(SyncSettings::default()),
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let uploader = Arc::new(RecordingUploadDispatcher::default());
    let forwarder = tokio::spawn(forward_events(
        orchestrator.subscribe(),
        Arc::clone(&notifier),
        Arc::clone(&uploader),
    ));

    let mut now = T0 + Duration::seconds(60);
    let mut wakes = Vec::new();
    for _ in 0..12 {
        sensor_tick(&orchestrator, now);
        let outcome = orchestrator.run_cycle(now).await;

        assert!(!outcome.busy, "busy at {now}");
        let snapshot = outcome.snapshot.expect("poll succeeded");
        assert!(snapshot.flags.sgv, "missed reading at {now}");
        assert!(outcome.next_wake > now);

        wakes.push(outcome.next_wake);
        now = outcome.next_wake;
    }

    // Once anchored, polls land 30 seconds after every reading.
    assert_eq!(wakes[0], T0 + Duration::seconds(330));
    for pair in wakes.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::minutes(5));
    }
    assert_eq!(orchestrator.store().commit_count(), 12);
    assert_eq!(orchestrator.wake().armed(), wakes);

    drop(orchestrator);
    forwarder.await.unwrap();

    let lines = notifier.lines();
    let sgv_lines = lines.iter().filter(|(_, text)| text.starts_with("SGV: ")).count();
    assert_eq!(sgv_lines, 12);
    assert!(!lines.iter().any(|(kind, _)| *kind == StatusKind::Warning));

    let uploads = uploader.requests();
    assert_eq!(uploads.len(), 12);
    assert!(
        uploads
            .iter()
            .all(|(target, delay)| *target == UploadTarget::Nightscout
                && *delay == std::time::Duration::from_secs(1))
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_raise_one_warning() {
    init_tracing();

    let mut orchestrator = SyncOrchestrator::new(
        MockDeviceLink::new("1234567", MAC),
        MemoryStore::new(),
        RecordingWakeScheduler::default(),
        SyncContext::new(SyncSettings::default()),
    );
    let mut events = orchestrator.subscribe();

    let mut now = T0 + Duration::seconds(60);
    sensor_tick(&orchestrator, now);
    now = orchestrator.run_cycle(now).await.next_wake;

    orchestrator
        .link()
        .fail_on(LinkStep::ReadStatus, MockFailure::Timeout);

    let mut fired = Vec::new();
    for attempt in 1..=6 {
        let outcome = orchestrator.run_cycle(now).await;
        assert!(outcome.error.is_some());
        assert!(outcome.next_wake > now);
        if outcome.warnings.contains(&HealthWarning::CommsErrors) {
            fired.push(attempt);
        }
        now = outcome.next_wake;
    }
    assert_eq!(fired, vec![4]);

    // Nothing from the failed polls reached the store.
    assert_eq!(orchestrator.store().commit_count(), 1);
    assert_eq!(
        orchestrator
            .store()
            .history(MAC, T0 - Duration::hours(1))
            .unwrap()
            .len(),
        1
    );

    orchestrator.link().clear_failures();
    sensor_tick(&orchestrator, now);
    let outcome = orchestrator.run_cycle(now).await;
    assert!(outcome.is_success());

    let mut timeouts = 0;
    while let Ok(event) = events.try_recv() {
        if let pumpsync_core::SyncEvent::Status { text, .. } = event
            && text == "Timeout communicating with the bridge / pump."
        {
            timeouts += 1;
        }
    }
    assert_eq!(timeouts, 6);
}
