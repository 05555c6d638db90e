//! Composition root: spawns the connection and location actors, wires them to
//! one event bus, and maps app lifecycle events onto them.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::connection::{
    Connect, ConnectionActor, ConnectionActorArgs, Disconnect, GetConnectionState,
    GetConnectionStats,
};
use crate::core::{
    ConnectionState, ConnectionStats, ExponentialBackoffReconnect, LinkError, LinkResult,
};
use crate::credentials::SharedCredentials;
use crate::events::{DriverEvent, EventBus, EventKind, ListenerId};
use crate::location::{
    IsTracking, JobReference, LocationReporter, LocationReporterArgs, PositionProvider,
    SetActiveJob, StartTracking, StopTracking, TrackingStart,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

pub type ConnectionRef<T> = ActorRef<ConnectionActor<T, ExponentialBackoffReconnect>>;
pub type ReporterRef<P, T> = ActorRef<LocationReporter<P, ConnectionRef<T>>>;

/// App lifecycle signals the core reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Driver toggled online (or the app launched with an online driver).
    WentOnline { driver_id: String },
    WentOffline,
    /// App returned to the foreground.
    Foregrounded,
    EnteredDeliveryFlow(JobReference),
    LeftDeliveryFlow,
}

pub struct DriverLink<P: PositionProvider, T: WsTransport = TungsteniteTransport> {
    connection: ConnectionRef<T>,
    reporter: ReporterRef<P, T>,
    events: EventBus,
    online_driver: Option<String>,
    /// Set by a fatal error; only an explicit connect clears it.
    fatal: Arc<AtomicBool>,
    fatal_listener: ListenerId,
}

impl<P: PositionProvider, T: WsTransport> DriverLink<P, T> {
    pub fn spawn(
        config: LinkConfig,
        credentials: SharedCredentials,
        transport: T,
        provider: P,
    ) -> LinkResult<Self> {
        config.validate()?;
        let events = EventBus::new();
        let reconnect = ExponentialBackoffReconnect::new(
            config.connection.backoff_base,
            config.connection.backoff_max,
            config.connection.max_reconnect_attempts,
        );
        let tracking = config.tracking.clone();

        let connection = ConnectionActor::spawn(ConnectionActorArgs {
            config,
            credentials: credentials.clone(),
            transport,
            reconnect,
            events: events.clone(),
        });
        let reporter = LocationReporter::spawn(LocationReporterArgs {
            config: tracking,
            provider,
            sink: connection.clone(),
            credentials,
            events: events.clone(),
        });

        let fatal = Arc::new(AtomicBool::new(false));
        let latch = fatal.clone();
        let fatal_listener = events.on(EventKind::Error, move |event| {
            if matches!(event, DriverEvent::Error(err) if err.kind.is_fatal()) {
                latch.store(true, Ordering::SeqCst);
            }
        });

        Ok(Self {
            connection,
            reporter,
            events,
            online_driver: None,
            fatal,
            fatal_listener,
        })
    }

    pub async fn handle_lifecycle(&mut self, event: LifecycleEvent) -> LinkResult<()> {
        info!(event = ?event, "lifecycle event");
        match event {
            LifecycleEvent::WentOnline { driver_id } => {
                self.online_driver = Some(driver_id.clone());
                let connected = self.connect(driver_id).await;
                self.start_tracking().await?;
                connected
            }
            LifecycleEvent::WentOffline => {
                self.online_driver = None;
                self.stop_tracking().await?;
                self.disconnect().await
            }
            LifecycleEvent::Foregrounded => {
                let Some(driver_id) = self.online_driver.clone() else {
                    return Ok(());
                };
                if self.has_fatal_error() {
                    info!("fatal session error pending, not reconnecting on foreground");
                } else if self.connection_state().await? == ConnectionState::Idle {
                    self.connect(driver_id).await?;
                }
                if !self.is_tracking().await? {
                    self.start_tracking().await?;
                }
                Ok(())
            }
            LifecycleEvent::EnteredDeliveryFlow(job) => self.set_active_job(Some(job)).await,
            LifecycleEvent::LeftDeliveryFlow => self.set_active_job(None).await,
        }
    }

    pub async fn connect(&self, driver_id: impl Into<String>) -> LinkResult<()> {
        self.fatal.store(false, Ordering::SeqCst);
        match self
            .connection
            .ask(Connect {
                driver_id: driver_id.into(),
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(SendError::HandlerError(err)) => Err(err),
            Err(err) => Err(actor_error(err)),
        }
    }

    /// True after a fatal error until the next explicit connect.
    pub fn has_fatal_error(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) -> LinkResult<()> {
        self.connection.ask(Disconnect).await.map_err(actor_error)
    }

    pub async fn connection_state(&self) -> LinkResult<ConnectionState> {
        self.connection
            .ask(GetConnectionState)
            .await
            .map_err(actor_error)
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.connection_state().await, Ok(ConnectionState::Open))
    }

    pub async fn connection_stats(&self) -> LinkResult<ConnectionStats> {
        self.connection
            .ask(GetConnectionStats)
            .await
            .map_err(actor_error)
    }

    pub async fn start_tracking(&self) -> LinkResult<TrackingStart> {
        match self.reporter.ask(StartTracking).await {
            Ok(outcome) => {
                if outcome == TrackingStart::PermissionDenied {
                    warn!("location permission denied, tracking not started");
                }
                Ok(outcome)
            }
            Err(SendError::HandlerError(err)) => Err(err.into()),
            Err(err) => Err(actor_error(err)),
        }
    }

    pub async fn stop_tracking(&self) -> LinkResult<bool> {
        self.reporter.ask(StopTracking).await.map_err(actor_error)
    }

    pub async fn is_tracking(&self) -> LinkResult<bool> {
        self.reporter.ask(IsTracking).await.map_err(actor_error)
    }

    pub async fn set_active_job(&self, job: Option<JobReference>) -> LinkResult<()> {
        self.reporter
            .ask(SetActiveJob(job))
            .await
            .map_err(actor_error)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&DriverEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn connection(&self) -> &ConnectionRef<T> {
        &self.connection
    }

    pub fn reporter(&self) -> &ReporterRef<P, T> {
        &self.reporter
    }

    /// Stop both actors; their on-stop hooks cancel every timer and close the socket.
    pub async fn shutdown(self) {
        self.events.off(self.fatal_listener);
        let _ = self.reporter.stop_gracefully().await;
        self.reporter.wait_for_shutdown().await;
        let _ = self.connection.stop_gracefully().await;
        self.connection.wait_for_shutdown().await;
        info!("driver link shut down");
    }
}

fn actor_error<M, E>(err: SendError<M, E>) -> LinkError
where
    SendError<M, E>: Display,
{
    LinkError::ActorError(err.to_string())
}
