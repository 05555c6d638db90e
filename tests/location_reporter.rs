use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use driver_link::TrackingConfig;
use driver_link::credentials::{DriverStatus, InMemoryCredentials};
use driver_link::events::{DriverEvent, ErrorKind, EventBus};
use driver_link::location::{
    GetLastSample, IsTracking, JobReference, LocationAccuracy, LocationError, LocationReporter,
    LocationReporterArgs, PositionFix, SetActiveJob, StartTracking, StopTracking, TrackingStart,
};
use driver_link::testing::{EventRecorder, FakePositionProvider, RecordingSink, sample_fix};
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};

type Reporter = ActorRef<LocationReporter<FakePositionProvider, RecordingSink>>;

struct Harness {
    reporter: Reporter,
    provider: FakePositionProvider,
    sink: RecordingSink,
    credentials: InMemoryCredentials,
    bus: EventBus,
    events: EventRecorder,
}

fn harness() -> Harness {
    let provider = FakePositionProvider::new();
    let sink = RecordingSink::default();
    let credentials = InMemoryCredentials::new(Some("token"));
    let bus = EventBus::new();
    let events = EventRecorder::attach(&bus);
    let reporter = LocationReporter::spawn(LocationReporterArgs {
        config: TrackingConfig::default(),
        provider: provider.clone(),
        sink: sink.clone(),
        credentials: Arc::new(credentials.clone()),
        events: bus.clone(),
    });
    Harness {
        reporter,
        provider,
        sink,
        credentials,
        bus,
        events,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn start(reporter: &Reporter) -> TrackingStart {
    reporter.ask(StartTracking).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn start_sends_an_immediate_fix_and_subscribes_with_tracking_options() {
    let h = harness();

    assert_eq!(start(&h.reporter).await, TrackingStart::Started);
    assert!(h.reporter.ask(IsTracking).await.unwrap());

    let updates = h.sink.updates();
    assert_eq!(updates.len(), 1, "current position is sent right away");
    assert_eq!(updates[0].sample.latitude, 52.520008);
    assert_eq!(updates[0].status, DriverStatus::Online);
    assert_eq!(updates[0].job, None);

    let options = h.provider.last_options().expect("subscribed");
    assert_eq!(options.accuracy, LocationAccuracy::Balanced);
    assert_eq!(options.interval, Duration::from_secs(10));
    assert_eq!(options.min_distance_m, 0.0);

    let last = h.reporter.ask(GetLastSample).await.unwrap();
    assert_eq!(last, Some(updates[0].sample.clone()));
}

#[tokio::test(start_paused = true)]
async fn second_start_keeps_a_single_subscription() {
    let h = harness();
    assert_eq!(start(&h.reporter).await, TrackingStart::Started);
    assert_eq!(start(&h.reporter).await, TrackingStart::AlreadyActive);

    assert_eq!(h.provider.watch_calls(), 1);
    assert_eq!(h.provider.live_watches(), 1);
    assert_eq!(h.sink.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_without_a_session_reports_nothing_to_stop() {
    let h = harness();
    assert!(!h.reporter.ask(StopTracking).await.unwrap());
    assert!(!h.reporter.ask(IsTracking).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn stop_releases_the_subscription_and_ignores_late_fixes() {
    let h = harness();
    start(&h.reporter).await;

    assert!(h.reporter.ask(StopTracking).await.unwrap());
    settle().await;
    assert_eq!(h.provider.live_watches(), 0);
    assert_eq!(h.provider.push(sample_fix(1.0, 1.0)), 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.provider.watch_calls(), 1, "watchdog stopped with the session");
}

#[tokio::test(start_paused = true)]
async fn permission_denied_leaves_tracking_inactive() {
    let h = harness();
    h.provider.set_permission(false);

    assert_eq!(start(&h.reporter).await, TrackingStart::PermissionDenied);
    assert!(!h.reporter.ask(IsTracking).await.unwrap());
    assert_eq!(h.provider.watch_calls(), 0);
    assert!(h.sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unavailable_position_fails_the_start() {
    let h = harness();
    h.provider.fail_current_with(Some("gps disabled"));

    let err = h.reporter.ask(StartTracking).await.unwrap_err();
    assert!(matches!(
        err,
        SendError::HandlerError(LocationError::Unavailable(ref msg)) if msg == "gps disabled"
    ));
    assert!(!h.reporter.ask(IsTracking).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn samples_carry_status_job_speed_and_battery() {
    let h = harness();
    h.provider.set_battery(Some(42));
    h.credentials.set_status(DriverStatus::parse("BUSY"));
    start(&h.reporter).await;

    h.reporter
        .ask(SetActiveJob(Some(JobReference::from("pool-9"))))
        .await
        .unwrap();
    let fix = PositionFix {
        latitude: 48.8566,
        longitude: 2.3522,
        accuracy: Some(8.0),
        heading: Some(270.0),
        speed: Some(5.0),
        captured_at: Utc::now(),
    };
    assert_eq!(h.provider.push(fix), 1);
    settle().await;

    let updates = h.sink.updates();
    assert_eq!(updates.len(), 2);
    let latest = &updates[1];
    assert_eq!(latest.status.as_str(), "BUSY");
    assert_eq!(latest.job, Some(JobReference::Text("pool-9".to_string())));
    assert!((latest.sample.speed_kmh - 18.0).abs() < 1e-9);
    assert_eq!(latest.sample.heading, 270.0);
    assert_eq!(latest.sample.battery_level, Some(42));

    h.reporter.ask(SetActiveJob(None)).await.unwrap();
    h.provider.push(sample_fix(48.857, 2.353));
    settle().await;
    assert_eq!(h.sink.updates()[2].job, None);
}

#[tokio::test(start_paused = true)]
async fn negative_or_missing_speed_is_reported_as_zero() {
    let h = harness();
    start(&h.reporter).await;

    let mut fix = sample_fix(0.0, 0.0);
    fix.speed = Some(-1.0);
    h.provider.push(fix);
    settle().await;

    let updates = h.sink.updates();
    assert_eq!(updates[0].sample.speed_kmh, 0.0);
    assert_eq!(updates[1].sample.speed_kmh, 0.0);
}

#[tokio::test(start_paused = true)]
async fn watchdog_restarts_a_silent_subscription() {
    let h = harness();
    start(&h.reporter).await;

    // Ticks at 20s and 40s see less than 45s of silence.
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(h.provider.watch_calls(), 1);
    assert_eq!(h.sink.len(), 1);

    // The 60s tick tears down, the restart lands one second later.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(h.provider.watch_calls(), 1);
    assert!(!h.reporter.ask(IsTracking).await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.provider.watch_calls(), 2);
    assert_eq!(h.provider.live_watches(), 1, "old subscription released");
    assert_eq!(h.sink.len(), 2, "restart sends a fresh fix");
    assert!(h.reporter.ask(IsTracking).await.unwrap());
    assert!(h.events.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn watchdog_keeps_restarting_a_feed_that_stays_silent() {
    let h = harness();
    start(&h.reporter).await;

    // Restart at 61s; the new watchdog ticks at 81s, 101s and 121s and
    // restarts again at 122s.
    tokio::time::sleep(Duration::from_secs(62)).await;
    assert_eq!(h.provider.watch_calls(), 2);

    tokio::time::sleep(Duration::from_secs(68)).await;
    assert_eq!(h.provider.watch_calls(), 3, "watchdog survived the first restart");
    assert_eq!(h.provider.live_watches(), 1);
    assert_eq!(h.sink.len(), 3);
    assert!(h.reporter.ask(IsTracking).await.unwrap());
    assert!(h.events.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn steady_updates_keep_the_watchdog_quiet() {
    let h = harness();
    start(&h.reporter).await;

    for i in 0..12 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.provider.push(sample_fix(10.0 + i as f64 * 0.001, 20.0)), 1);
    }
    settle().await;

    assert_eq!(h.provider.watch_calls(), 1);
    assert_eq!(h.sink.len(), 13);
}

#[tokio::test(start_paused = true)]
async fn stop_during_restart_delay_cancels_the_restart() {
    let h = harness();
    start(&h.reporter).await;

    tokio::time::sleep(Duration::from_millis(60_500)).await;
    assert!(!h.reporter.ask(IsTracking).await.unwrap());
    assert!(h.reporter.ask(StopTracking).await.unwrap(), "restart was pending");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.provider.watch_calls(), 1);
    assert!(!h.reporter.ask(IsTracking).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn failed_restart_reports_location_unavailable() {
    let h = harness();
    start(&h.reporter).await;
    h.provider.fail_current_with(Some("provider unavailable"));

    let reported = h
        .events
        .wait_until(Duration::from_secs(120), |events| {
            events.iter().any(|e| matches!(e, DriverEvent::Error(_)))
        })
        .await;
    assert!(reported);

    let error = h
        .events
        .events()
        .into_iter()
        .find_map(|e| match e {
            DriverEvent::Error(err) => Some(err),
            _ => None,
        })
        .unwrap();
    assert_eq!(error.kind, ErrorKind::LocationUnavailable);
    assert_eq!(error.kind.code(), "LOCATION_UNAVAILABLE");
    assert!(!error.kind.is_fatal());
    assert!(error.message.contains("provider unavailable"));
    assert!(!h.reporter.ask(IsTracking).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn explicit_start_after_failed_restart_recovers() {
    let h = harness();
    start(&h.reporter).await;
    h.provider.set_permission(false);

    tokio::time::sleep(Duration::from_secs(62)).await;
    assert_eq!(h.events.errors(), vec![ErrorKind::LocationUnavailable]);

    h.provider.set_permission(true);
    assert_eq!(start(&h.reporter).await, TrackingStart::Started);
    assert_eq!(h.provider.watch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resends_the_last_sample_with_current_tags() {
    let h = harness();

    h.bus.emit(DriverEvent::ConnectionStatus { connected: true });
    settle().await;
    assert!(h.sink.is_empty(), "nothing to resend yet");

    start(&h.reporter).await;
    h.reporter
        .ask(SetActiveJob(Some(JobReference::Numeric(314))))
        .await
        .unwrap();

    h.bus.emit(DriverEvent::ConnectionStatus { connected: false });
    settle().await;
    assert_eq!(h.sink.len(), 1);

    h.bus.emit(DriverEvent::ConnectionStatus { connected: true });
    settle().await;

    let updates = h.sink.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].sample, updates[0].sample);
    assert_eq!(updates[1].job, Some(JobReference::Numeric(314)));
}

#[tokio::test(start_paused = true)]
async fn stopped_reporter_unsubscribes_from_the_bus() {
    let h = harness();
    start(&h.reporter).await;

    let _ = h.reporter.stop_gracefully().await;
    h.reporter.wait_for_shutdown().await;
    settle().await;
    assert_eq!(h.provider.live_watches(), 0);

    h.bus.emit(DriverEvent::ConnectionStatus { connected: true });
    settle().await;
    assert_eq!(h.sink.len(), 1);
}
