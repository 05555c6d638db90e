//! Realtime connection actor.
//!
//! The socket read loop, heartbeat timer and reconnect timer run as spawned
//! tasks that message the actor; the actor owns state and policy. Each socket
//! generation gets a fresh epoch and every task message carries the epoch it
//! was spawned under, so late callbacks from a replaced socket are dropped.

use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::StreamExt;
use kameo::error::{ActorStopReason, SendError};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, PanicError, WeakActorRef};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::protocol::{InboundMessage, OutboundMessage, decode_inbound};
use super::writer::{CloseSocket, FrameWriter, WriteFrame};
use crate::config::{LinkConfig, redact_token};
use crate::core::{
    CLOSE_NORMAL, CloseDisposition, ConnectionHealth, ConnectionState, ConnectionStats,
    ExponentialBackoffReconnect, JsonHeartbeat, LinkError, LinkResult, ReconnectStrategy,
    WsCloseFrame, WsFrame,
};
use crate::credentials::SharedCredentials;
use crate::events::{DriverEvent, ErrorEvent, ErrorKind, EventBus};
use crate::location::{LocationSink, LocationUpdate};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

/// Log every n-th successful location send.
const LOCATION_LOG_EVERY: u64 = 5;
/// Upper bound on delivering the close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ConnectionActorArgs<
    T: WsTransport = TungsteniteTransport,
    R: ReconnectStrategy = ExponentialBackoffReconnect,
> {
    pub config: LinkConfig,
    pub credentials: SharedCredentials,
    pub transport: T,
    pub reconnect: R,
    pub events: EventBus,
}

pub struct ConnectionActor<
    T: WsTransport = TungsteniteTransport,
    R: ReconnectStrategy = ExponentialBackoffReconnect,
> {
    config: LinkConfig,
    credentials: SharedCredentials,
    transport: T,
    reconnect: R,
    events: EventBus,
    actor_ref: ActorRef<Self>,
    state: ConnectionState,
    driver_id: Option<String>,
    epoch: u64,
    health: ConnectionHealth,
    heartbeat: JsonHeartbeat,
    writer: Option<ActorRef<FrameWriter<T::Writer>>>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    refresh_used: bool,
    locations_sent: u64,
}

impl<T: WsTransport, R: ReconnectStrategy> Actor for ConnectionActor<T, R> {
    type Args = ConnectionActorArgs<T, R>;
    type Error = LinkError;

    fn name() -> &'static str {
        "ConnectionActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> LinkResult<Self> {
        let ConnectionActorArgs {
            config,
            credentials,
            transport,
            reconnect,
            events,
        } = args;
        config.validate()?;
        let heartbeat = JsonHeartbeat::new(config.connection.heartbeat_interval);

        Ok(Self {
            config,
            credentials,
            transport,
            reconnect,
            events,
            actor_ref,
            state: ConnectionState::Idle,
            driver_id: None,
            epoch: 0,
            health: ConnectionHealth::new(),
            heartbeat,
            writer: None,
            connect_task: None,
            reader_task: None,
            heartbeat_task: None,
            reconnect_task: None,
            refresh_used: false,
            locations_sent: 0,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> LinkResult<()> {
        self.epoch = self.epoch.wrapping_add(1);
        self.cancel_reconnect();
        let was_open = self.state == ConnectionState::Open;
        self.teardown_socket(was_open).await;
        self.state = ConnectionState::Idle;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: PanicError,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        async move {
            // Told messages that reply with an error land here too; the
            // connection must outlive a failed `Connect`.
            error!(error = ?err, "ConnectionActor handler failed");
            Ok(ControlFlow::Continue(()))
        }
    }
}

/// Open the realtime socket for a driver. No-op while connecting or open.
#[derive(Debug)]
pub struct Connect {
    pub driver_id: String,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<Connect> for ConnectionActor<T, R> {
    type Reply = LinkResult<()>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                debug!(
                    driver = %msg.driver_id,
                    state = ?self.state,
                    "already connected or connecting"
                );
                return Ok(());
            }
            ConnectionState::Idle | ConnectionState::Closing => {}
        }

        self.driver_id = Some(msg.driver_id);
        self.cancel_reconnect();
        self.reconnect.reset();
        self.refresh_used = false;
        self.open_socket()
    }
}

/// Close the socket with a normal closure and cancel every pending timer.
#[derive(Debug)]
pub struct Disconnect;

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<Disconnect> for ConnectionActor<T, R> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let previous = self.state;
        let was_active = matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Open
        );

        self.state = ConnectionState::Closing;
        self.epoch = self.epoch.wrapping_add(1);
        self.cancel_reconnect();
        self.teardown_socket(previous == ConnectionState::Open).await;
        self.reconnect.reset();
        self.state = ConnectionState::Idle;

        if was_active {
            info!(previous = ?previous, "realtime socket disconnected");
            self.events
                .emit(DriverEvent::ConnectionStatus { connected: false });
        }
    }
}

/// Fire-and-forget location send. Replies `false` when not open or the write failed.
#[derive(Debug)]
pub struct SendLocation(pub LocationUpdate);

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<SendLocation> for ConnectionActor<T, R> {
    type Reply = bool;

    async fn handle(
        &mut self,
        msg: SendLocation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.state != ConnectionState::Open {
            debug!(state = ?self.state, "realtime socket not open, dropping location");
            return false;
        }

        let payload = msg.0.payload();
        let text = match OutboundMessage::LocationUpdate(payload).encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode location update");
                return false;
            }
        };

        match self.write(WsFrame::text(text)).await {
            Ok(()) => {
                self.locations_sent = self.locations_sent.wrapping_add(1);
                if self.locations_sent % LOCATION_LOG_EVERY == 0 {
                    info!(
                        sent = self.locations_sent,
                        lat = msg.0.sample.latitude,
                        lng = msg.0.sample.longitude,
                        "location sent"
                    );
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to send location");
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct GetConnectionState;

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<GetConnectionState>
    for ConnectionActor<T, R>
{
    type Reply = LinkResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: GetConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state)
    }
}

#[derive(Debug)]
pub struct GetConnectionStats;

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<GetConnectionStats>
    for ConnectionActor<T, R>
{
    type Reply = LinkResult<ConnectionStats>;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.get_stats())
    }
}

struct ConnectionEstablished<T: WsTransport> {
    epoch: u64,
    reader: T::Reader,
    writer: T::Writer,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<ConnectionEstablished<T>>
    for ConnectionActor<T, R>
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(epoch = msg.epoch, "discarding socket from a superseded connect");
            return;
        }
        self.on_open(msg.reader, msg.writer);
    }
}

struct ConnectionFailed {
    epoch: u64,
    error: String,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<ConnectionFailed>
    for ConnectionActor<T, R>
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ConnectionFailed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_task = None;
        self.state = ConnectionState::Idle;
        self.events
            .emit(DriverEvent::ConnectionStatus { connected: false });
        let reason = format!("handshake failed: {}", msg.error);
        self.schedule_reconnect("connection_failed", &reason);
    }
}

struct InboundFrame {
    epoch: u64,
    frame: WsFrame,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<InboundFrame> for ConnectionActor<T, R> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: InboundFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Open {
            return;
        }
        self.health.record_message();
        if let Some(bytes) = msg.frame.payload() {
            self.dispatch(bytes);
        }
    }
}

struct SocketClosed {
    epoch: u64,
    close: Option<WsCloseFrame>,
    reason: String,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<SocketClosed> for ConnectionActor<T, R> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: SocketClosed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Open {
            return;
        }
        self.on_closed(msg.close, msg.reason).await;
    }
}

struct HeartbeatTick {
    epoch: u64,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<HeartbeatTick> for ConnectionActor<T, R> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: HeartbeatTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Open {
            return;
        }
        let ping = match OutboundMessage::Ping.encode() {
            Ok(text) => WsFrame::text(text),
            Err(err) => {
                warn!(error = %err, "failed to encode heartbeat ping");
                return;
            }
        };
        self.heartbeat.record_ping();
        debug!("sending heartbeat ping");
        if let Err(err) = self.write(ping).await {
            warn!(error = %err, "heartbeat ping failed");
            self.on_closed(None, format!("ping send failed: {err}")).await;
        }
    }
}

struct ReconnectDue {
    epoch: u64,
}

impl<T: WsTransport, R: ReconnectStrategy> KameoMessage<ReconnectDue> for ConnectionActor<T, R> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ReconnectDue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Idle {
            return;
        }
        self.reconnect_task = None;
        if let Err(err) = self.open_socket() {
            warn!(error = %err, "scheduled reconnect could not start");
        }
    }
}

impl<T: WsTransport, R: ReconnectStrategy> ConnectionActor<T, R> {
    /// Idle -> Connecting. Fails fast without a token or driver id.
    fn open_socket(&mut self) -> LinkResult<()> {
        let Some(driver_id) = self.driver_id.clone() else {
            return Err(LinkError::InvalidState("no driver id to connect".to_string()));
        };
        let Some(token) = self.credentials.token() else {
            error!(driver = %driver_id, "no authentication token found");
            self.state = ConnectionState::Idle;
            self.events
                .emit(DriverEvent::Error(ErrorEvent::new(ErrorKind::MissingToken)));
            return Err(LinkError::MissingToken);
        };
        let url = self.config.realtime_url(&driver_id, &token)?;

        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        self.state = ConnectionState::Connecting;
        info!(
            url = %redact_token(&url),
            attempt = self.reconnect.attempts(),
            "connecting realtime socket"
        );

        let transport = self.transport.clone();
        let actor_ref = self.actor_ref.clone();
        self.connect_task = Some(tokio::spawn(async move {
            match transport.connect(url.to_string()).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(ConnectionEstablished::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = actor_ref
                        .tell(ConnectionFailed {
                            epoch,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        }));
        Ok(())
    }

    fn on_open(&mut self, reader: T::Reader, writer: T::Writer) {
        self.connect_task = None;
        self.state = ConnectionState::Open;
        self.reconnect.reset();
        self.heartbeat.reset();
        self.health.reset();

        self.writer = Some(FrameWriter::spawn(FrameWriter::new(writer)));
        self.reader_task = Some(self.spawn_reader(reader));
        self.heartbeat_task = Some(self.spawn_heartbeat());

        info!(
            driver = self.driver_id.as_deref().unwrap_or_default(),
            "realtime socket open"
        );
        self.events
            .emit(DriverEvent::ConnectionStatus { connected: true });
    }

    /// Open -> Idle after the server or network ended the socket.
    async fn on_closed(&mut self, close: Option<WsCloseFrame>, reason: String) {
        let code = close.as_ref().map(|frame| frame.code);
        info!(
            code,
            close_reason = close.as_ref().map(|frame| frame.reason.as_str()),
            reason = %reason,
            "realtime socket closed"
        );

        self.epoch = self.epoch.wrapping_add(1);
        self.teardown_socket(false).await;
        self.state = ConnectionState::Idle;
        self.events
            .emit(DriverEvent::ConnectionStatus { connected: false });

        match CloseDisposition::classify(code) {
            CloseDisposition::RefreshCredentials => self.refresh_and_reconnect().await,
            CloseDisposition::DuplicateSession => {
                warn!("session opened from another device, not reconnecting");
                self.emit_error(ErrorKind::DuplicateSession);
            }
            CloseDisposition::Reconnect => self.schedule_reconnect("socket_closed", &reason),
        }
    }

    async fn refresh_and_reconnect(&mut self) {
        if self.refresh_used {
            warn!("token rejected again after refresh");
            self.emit_error(ErrorKind::SessionExpired);
            return;
        }
        self.refresh_used = true;

        info!("token rejected, attempting refresh");
        match self.credentials.refresh_token().await {
            Ok(Some(_)) => {
                info!("token refreshed, reconnecting");
                if let Err(err) = self.open_socket() {
                    warn!(error = %err, "reconnect after refresh could not start");
                }
            }
            Ok(None) => {
                warn!("token refresh unavailable");
                self.emit_error(ErrorKind::SessionExpired);
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                self.emit_error(ErrorKind::TokenRefreshFailed);
            }
        }
    }

    fn schedule_reconnect(&mut self, event: &str, reason: &str) {
        if !self.reconnect.should_retry() {
            error!(
                event = %event,
                reason = %reason,
                attempts = self.reconnect.attempts(),
                "max reconnect attempts reached"
            );
            self.emit_error(ErrorKind::MaxReconnectAttempts);
            return;
        }

        let delay = self.reconnect.next_delay();
        self.health.increment_reconnect();
        self.log_reconnect_plan(event, reason, delay);

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        self.cancel_reconnect();
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref.tell(ReconnectDue { epoch }).send().await;
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    /// Abort IO tasks and stop the writer, sending a normal closure first when asked.
    async fn teardown_socket(&mut self, send_close: bool) {
        for task in [
            self.connect_task.take(),
            self.reader_task.take(),
            self.heartbeat_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.heartbeat.reset();

        let Some(writer) = self.writer.take() else {
            return;
        };
        if send_close {
            let close = CloseSocket {
                code: CLOSE_NORMAL,
                reason: self.config.connection.close_reason.clone(),
            };
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.ask(close)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "close frame not delivered"),
                Err(_) => {
                    warn!(
                        timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                        "close frame stalled, dropping the socket"
                    );
                    writer.kill();
                    writer.wait_for_shutdown().await;
                    return;
                }
            }
        }
        let _ = writer.stop_gracefully().await;
        writer.wait_for_shutdown().await;
    }

    async fn write(&mut self, frame: WsFrame) -> LinkResult<()> {
        let Some(writer) = self.writer.as_ref() else {
            return Err(LinkError::InvalidState("no writer".to_string()));
        };
        match writer.ask(WriteFrame { frame }).await {
            Ok(()) => {
                self.health.record_sent();
                Ok(())
            }
            Err(SendError::HandlerError(err)) => Err(err),
            Err(err) => Err(LinkError::ActorError(err.to_string())),
        }
    }

    fn dispatch(&mut self, bytes: &[u8]) {
        let message = match decode_inbound(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "dropping unparseable message");
                return;
            }
        };

        match message {
            InboundMessage::Pong => {
                if let Some(rtt) = self.heartbeat.on_pong() {
                    self.health.record_rtt(rtt);
                    debug!(rtt_us = rtt.as_micros() as u64, "heartbeat pong");
                }
            }
            InboundMessage::ConnectionAck(_) => info!("connection acknowledged by server"),
            InboundMessage::Unknown(kind) => debug!(kind = %kind, "ignoring unknown message type"),
            other => {
                if let Some(event) = other.into_event() {
                    debug!(kind = ?event.kind(), "dispatching server event");
                    self.events.emit(event);
                }
            }
        }
    }

    fn spawn_reader(&self, mut reader: T::Reader) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let (close, reason) = loop {
                match reader.next().await {
                    Some(Ok(WsFrame::Close(frame))) => break (frame, "remote closed".to_string()),
                    Some(Ok(frame)) => {
                        if actor_ref
                            .tell(InboundFrame { epoch, frame })
                            .send()
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(err)) => break (None, format!("read error: {err}")),
                    None => break (None, "stream ended".to_string()),
                }
            };
            let _ = actor_ref
                .tell(SocketClosed {
                    epoch,
                    close,
                    reason,
                })
                .send()
                .await;
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;
        let period = self.heartbeat.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref.tell(HeartbeatTick { epoch }).send().await.is_err() {
                    break;
                }
            }
        })
    }

    fn emit_error(&self, kind: ErrorKind) {
        self.events.emit(DriverEvent::Error(ErrorEvent::new(kind)));
    }

    fn log_reconnect_plan(&self, event: &str, reason: &str, delay: Duration) {
        let stats = self.health.get_stats();
        warn!(
            driver = self.driver_id.as_deref().unwrap_or_default(),
            event = %event,
            reason = %reason,
            attempt = self.reconnect.attempts(),
            delay_ms = delay.as_millis().min(u64::MAX as u128) as u64,
            uptime_ms = stats.uptime.as_millis().min(u64::MAX as u128) as u64,
            messages = stats.messages_received,
            reconnects = stats.reconnects,
            "realtime reconnect scheduled"
        );
    }
}

impl<T: WsTransport, R: ReconnectStrategy> LocationSink for ActorRef<ConnectionActor<T, R>> {
    fn send_location(&self, update: LocationUpdate) {
        if self.tell(SendLocation(update)).try_send().is_err() {
            warn!("connection mailbox unavailable, dropping location");
        }
    }
}
