//! Location reporter actor.
//!
//! Owns the device subscription and the staleness watchdog. The feed and the
//! watchdog run as spawned tasks that message the actor; every message carries
//! the tracking epoch it was started under so callbacks from a torn-down
//! session are dropped.

use std::time::Duration;

use futures_util::StreamExt;
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::provider::{LocationError, PositionProvider, PositionStream, WatchOptions};
use super::sample::{JobReference, LocationSample, LocationUpdate, PositionFix};
use crate::config::TrackingConfig;
use crate::credentials::SharedCredentials;
use crate::events::{DriverEvent, ErrorEvent, ErrorKind, EventBus, EventKind, ListenerId};

/// Where tagged samples go. Sending never waits for the outcome.
pub trait LocationSink: Send + Sync + 'static {
    fn send_location(&self, update: LocationUpdate);
}

pub struct LocationReporterArgs<P, S> {
    pub config: TrackingConfig,
    pub provider: P,
    pub sink: S,
    pub credentials: SharedCredentials,
    pub events: EventBus,
}

struct TrackingSession {
    started_at: Instant,
    last_update: Instant,
    feed_task: JoinHandle<()>,
    watchdog_task: JoinHandle<()>,
}

impl TrackingSession {
    fn cancel(self) {
        self.feed_task.abort();
        self.watchdog_task.abort();
    }
}

pub struct LocationReporter<P: PositionProvider, S: LocationSink> {
    config: TrackingConfig,
    provider: P,
    sink: S,
    credentials: SharedCredentials,
    events: EventBus,
    actor_ref: ActorRef<Self>,
    session: Option<TrackingSession>,
    epoch: u64,
    restart_task: Option<JoinHandle<()>>,
    last_sample: Option<LocationSample>,
    active_job: Option<JobReference>,
    updates: u64,
    reconnect_listener: Option<ListenerId>,
}

impl<P: PositionProvider, S: LocationSink> Actor for LocationReporter<P, S> {
    type Args = LocationReporterArgs<P, S>;
    type Error = LocationError;

    fn name() -> &'static str {
        "LocationReporter"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let LocationReporterArgs {
            config,
            provider,
            sink,
            credentials,
            events,
        } = args;

        // Weak so the bus does not keep the reporter alive.
        let weak = actor_ref.downgrade();
        let reconnect_listener = events.on(EventKind::ConnectionStatus, move |event| {
            if !matches!(event, DriverEvent::ConnectionStatus { connected: true }) {
                return;
            }
            let Some(reporter) = weak.upgrade() else {
                return;
            };
            if reporter.tell(ResendLastSample).try_send().is_err() {
                warn!("could not queue location resend after reconnect");
            }
        });

        Ok(Self {
            config,
            provider,
            sink,
            credentials,
            events,
            actor_ref,
            session: None,
            epoch: 0,
            restart_task: None,
            last_sample: None,
            active_job: None,
            updates: 0,
            reconnect_listener: Some(reconnect_listener),
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        self.cancel_restart();
        self.teardown();
        if let Some(id) = self.reconnect_listener.take() {
            self.events.off(id);
        }
        Ok(())
    }
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStart {
    Started,
    AlreadyActive,
    /// Tracking stays inactive; the caller should prompt the user.
    PermissionDenied,
}

#[derive(Debug)]
pub struct StartTracking;

impl<P: PositionProvider, S: LocationSink> KameoMessage<StartTracking> for LocationReporter<P, S> {
    type Reply = Result<TrackingStart, LocationError>;

    async fn handle(
        &mut self,
        _msg: StartTracking,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.session.is_none() {
            // An explicit start supersedes a pending watchdog restart.
            self.cancel_restart();
        }
        self.start().await
    }
}

/// Stop sampling. Replies whether a session (or pending restart) was cancelled.
#[derive(Debug)]
pub struct StopTracking;

impl<P: PositionProvider, S: LocationSink> KameoMessage<StopTracking> for LocationReporter<P, S> {
    type Reply = bool;

    async fn handle(
        &mut self,
        _msg: StopTracking,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let restart_pending = self.cancel_restart();
        let was_active = self.teardown();
        if was_active {
            info!("location tracking stopped");
        } else {
            debug!(restart_pending, "location tracking already stopped");
        }
        // Invalidate anything still in flight from the cancelled restart.
        self.epoch = self.epoch.wrapping_add(1);
        was_active || restart_pending
    }
}

#[derive(Debug)]
pub struct SetActiveJob(pub Option<JobReference>);

impl<P: PositionProvider, S: LocationSink> KameoMessage<SetActiveJob> for LocationReporter<P, S> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: SetActiveJob,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(job = ?msg.0, "active job updated");
        self.active_job = msg.0;
    }
}

/// Re-send the last known sample, tagged with the current status and job.
#[derive(Debug)]
pub struct ResendLastSample;

impl<P: PositionProvider, S: LocationSink> KameoMessage<ResendLastSample>
    for LocationReporter<P, S>
{
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: ResendLastSample,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(sample) = self.last_sample.clone() else {
            return;
        };
        info!("connection restored, resending last location");
        self.forward(sample);
    }
}

#[derive(Debug)]
pub struct IsTracking;

impl<P: PositionProvider, S: LocationSink> KameoMessage<IsTracking> for LocationReporter<P, S> {
    type Reply = bool;

    async fn handle(
        &mut self,
        _msg: IsTracking,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.session.is_some()
    }
}

#[derive(Debug)]
pub struct GetLastSample;

impl<P: PositionProvider, S: LocationSink> KameoMessage<GetLastSample> for LocationReporter<P, S> {
    type Reply = Result<Option<LocationSample>, LocationError>;

    async fn handle(
        &mut self,
        _msg: GetLastSample,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.last_sample.clone())
    }
}

struct PositionUpdate {
    epoch: u64,
    fix: PositionFix,
}

impl<P: PositionProvider, S: LocationSink> KameoMessage<PositionUpdate> for LocationReporter<P, S> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: PositionUpdate,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.session.is_none() {
            return;
        }
        self.on_fix(msg.fix);
    }
}

struct WatchdogTick {
    epoch: u64,
}

impl<P: PositionProvider, S: LocationSink> KameoMessage<WatchdogTick> for LocationReporter<P, S> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: WatchdogTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let stale_for = session.last_update.elapsed();
        if stale_for <= self.config.stale_threshold {
            return;
        }

        warn!(
            stale_ms = duration_ms(stale_for),
            tracking_ms = duration_ms(session.started_at.elapsed()),
            restart_in_ms = duration_ms(self.config.restart_delay),
            "location updates stalled, restarting tracking"
        );
        self.teardown();
        self.schedule_restart();
    }
}

struct RestartDue {
    epoch: u64,
}

impl<P: PositionProvider, S: LocationSink> KameoMessage<RestartDue> for LocationReporter<P, S> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RestartDue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch {
            return;
        }
        self.restart_task = None;

        let failure = match self.start().await {
            Ok(TrackingStart::Started) => {
                info!("location tracking restarted");
                return;
            }
            Ok(TrackingStart::AlreadyActive) => return,
            Ok(TrackingStart::PermissionDenied) => LocationError::PermissionDenied,
            Err(err) => err,
        };

        warn!(error = %failure, "location tracking restart failed");
        self.events.emit(DriverEvent::Error(ErrorEvent::with_message(
            ErrorKind::LocationUnavailable,
            failure.to_string(),
        )));
    }
}

impl<P: PositionProvider, S: LocationSink> LocationReporter<P, S> {
    async fn start(&mut self) -> Result<TrackingStart, LocationError> {
        if self.session.is_some() {
            info!("location tracking already active, skipping duplicate start");
            return Ok(TrackingStart::AlreadyActive);
        }

        if !self.provider.request_permission().await {
            warn!("location permission denied");
            return Ok(TrackingStart::PermissionDenied);
        }

        let fix = self.provider.current_position().await?;
        let stream = self
            .provider
            .watch_position(WatchOptions::from(&self.config))
            .await?;

        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        let now = Instant::now();
        self.session = Some(TrackingSession {
            started_at: now,
            last_update: now,
            feed_task: self.spawn_feed(stream, epoch),
            watchdog_task: self.spawn_watchdog(epoch),
        });
        self.on_fix(fix);

        info!(
            interval_ms = duration_ms(self.config.sample_interval),
            min_distance_m = self.config.min_distance_m,
            accuracy = ?self.config.accuracy,
            "location tracking started"
        );
        Ok(TrackingStart::Started)
    }

    /// Drop the session. Returns whether one existed.
    fn teardown(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.cancel();
                self.epoch = self.epoch.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    fn cancel_restart(&mut self) -> bool {
        match self.restart_task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn schedule_restart(&mut self) {
        self.cancel_restart();
        let actor_ref = self.actor_ref.clone();
        let delay = self.config.restart_delay;
        let epoch = self.epoch;
        self.restart_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref.tell(RestartDue { epoch }).send().await;
        }));
    }

    fn spawn_feed(&self, mut stream: PositionStream, epoch: u64) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            while let Some(fix) = stream.next().await {
                if actor_ref
                    .tell(PositionUpdate { epoch, fix })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!(epoch, "position feed ended");
        })
    }

    fn spawn_watchdog(&self, epoch: u64) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        let period = self.config.watchdog_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref.tell(WatchdogTick { epoch }).send().await.is_err() {
                    break;
                }
            }
        })
    }

    fn on_fix(&mut self, fix: PositionFix) {
        self.updates = self.updates.wrapping_add(1);
        if self.config.log_every > 0 && self.updates % self.config.log_every == 0 {
            info!(
                update = self.updates,
                lat = format_args!("{:.6}", fix.latitude),
                lng = format_args!("{:.6}", fix.longitude),
                "location update"
            );
        }

        if let Some(session) = self.session.as_mut() {
            session.last_update = Instant::now();
        }

        let sample = LocationSample::from_fix(&fix, self.provider.battery_level());
        self.last_sample = Some(sample.clone());
        self.forward(sample);
    }

    fn forward(&self, sample: LocationSample) {
        self.sink.send_location(LocationUpdate {
            sample,
            status: self.credentials.driver_status(),
            job: self.active_job.clone(),
        });
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
