//! Test doubles for driving the realtime core without a socket or a GPS.
//!
//! Intended for integration tests here and in the host app: an in-memory
//! [`MockTransport`] whose server side hands out one [`MockSocket`] per
//! accepted connect, a scriptable [`FakePositionProvider`], a
//! [`RecordingSink`] and an [`EventRecorder`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, Stream, stream};
use tokio::sync::{mpsc, watch};

use crate::core::{LinkError, WsFrame};
use crate::events::{DriverEvent, ErrorKind, EventBus, EventKind};
use crate::location::{
    LocationError, LocationSink, LocationUpdate, PositionFix, PositionProvider, PositionStream,
    ProviderFuture, WatchOptions,
};
use crate::transport::{WsTransport, WsTransportConnectFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How the mock server answers the next connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Fail(String),
}

struct TransportState {
    script: VecDeque<ConnectOutcome>,
    urls: Vec<String>,
}

/// In-memory transport. Every accepted connect yields a fresh [`MockSocket`]
/// on the paired [`MockServer`]; unscripted attempts are accepted.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    sockets_tx: mpsc::UnboundedSender<MockSocket>,
}

impl MockTransport {
    pub fn new() -> (Self, MockServer) {
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(TransportState {
            script: VecDeque::new(),
            urls: Vec::new(),
        }));
        (
            Self {
                state: Arc::clone(&state),
                sockets_tx,
            },
            MockServer { state, sockets_rx },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(&self, url: String) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let state = Arc::clone(&self.state);
        let sockets_tx = self.sockets_tx.clone();
        Box::pin(async move {
            let outcome = {
                let mut state = lock(&state);
                state.urls.push(url.clone());
                state.script.pop_front().unwrap_or(ConnectOutcome::Accept)
            };
            if let ConnectOutcome::Fail(reason) = outcome {
                return Err(LinkError::ConnectionFailed(reason));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let stalled = Arc::new(AtomicBool::new(false));
            sockets_tx
                .send(MockSocket {
                    url,
                    outbound_rx,
                    inbound_tx: Some(inbound_tx),
                    stalled: stalled.clone(),
                })
                .map_err(|_| LinkError::ConnectionFailed("mock server dropped".to_string()))?;
            let writer = MockWriter {
                tx: outbound_tx,
                stalled,
            };
            Ok((MockReader { rx: inbound_rx }, writer))
        })
    }
}

/// Test-side handle paired with [`MockTransport`].
pub struct MockServer {
    state: Arc<Mutex<TransportState>>,
    sockets_rx: mpsc::UnboundedReceiver<MockSocket>,
}

impl MockServer {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MockSocket> {
        self.sockets_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockSocket> {
        tokio::time::timeout(timeout, self.sockets_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Reject the next `count` connect attempts.
    pub fn fail_next(&self, count: usize) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state
                .script
                .push_back(ConnectOutcome::Fail("connection refused".to_string()));
        }
    }

    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        lock(&self.state).script.push_back(outcome);
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).urls.len()
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.state).urls.clone()
    }
}

/// Server end of one accepted connection.
pub struct MockSocket {
    pub url: String,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
    stalled: Arc<AtomicBool>,
}

impl MockSocket {
    /// Next frame written by the client.
    pub async fn recv(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next client text frame parsed as JSON, skipping control frames.
    pub async fn recv_json(&mut self) -> Option<sonic_rs::Value> {
        while let Some(frame) = self.outbound_rx.recv().await {
            if let WsFrame::Text(bytes) = frame {
                return sonic_rs::from_slice(&bytes).ok();
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<WsFrame> {
        self.outbound_rx.try_recv().ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WsFrame::text(text))
    }

    /// Send a close frame and end the inbound stream.
    pub fn close(&mut self, code: u16, reason: &str) {
        self.send(WsFrame::close(code, reason));
        self.inbound_tx = None;
    }

    /// Make every later client write hang, like a full send buffer.
    pub fn stall_writes(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// End the inbound stream without a close frame (network loss).
    pub fn drop_connection(&mut self) {
        self.inbound_tx = None;
    }

    fn send(&self, frame: WsFrame) -> bool {
        self.inbound_tx
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }
}

pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl Stream for MockReader {
    type Item = Result<WsFrame, LinkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

pub struct MockWriter {
    tx: mpsc::UnboundedSender<WsFrame>,
    stalled: Arc<AtomicBool>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = LinkError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.stalled.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(|_| LinkError::TransportError {
            context: "mock_write",
            error: "mock socket closed".to_string(),
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

struct ProviderState {
    permission: AtomicBool,
    watch_calls: AtomicUsize,
    live_watches: Arc<AtomicUsize>,
    current: Mutex<Option<PositionFix>>,
    current_error: Mutex<Option<String>>,
    battery: Mutex<Option<u8>>,
    last_options: Mutex<Option<WatchOptions>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<PositionFix>>>,
}

/// Scriptable position provider. Fixes are only delivered when pushed.
#[derive(Clone)]
pub struct FakePositionProvider {
    state: Arc<ProviderState>,
}

impl Default for FakePositionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePositionProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ProviderState {
                permission: AtomicBool::new(true),
                watch_calls: AtomicUsize::new(0),
                live_watches: Arc::new(AtomicUsize::new(0)),
                current: Mutex::new(None),
                current_error: Mutex::new(None),
                battery: Mutex::new(None),
                last_options: Mutex::new(None),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.state.permission.store(granted, Ordering::SeqCst);
    }

    /// Fix returned by `current_position`; defaults to a fixed point stamped now.
    pub fn set_current(&self, fix: PositionFix) {
        *lock(&self.state.current) = Some(fix);
    }

    pub fn fail_current_with(&self, error: Option<&str>) {
        *lock(&self.state.current_error) = error.map(str::to_string);
    }

    pub fn set_battery(&self, level: Option<u8>) {
        *lock(&self.state.battery) = level;
    }

    /// Deliver a fix to every live subscription; returns how many received it.
    pub fn push(&self, fix: PositionFix) -> usize {
        let mut watchers = lock(&self.state.watchers);
        watchers.retain(|tx| tx.send(fix.clone()).is_ok());
        watchers.len()
    }

    pub fn watch_calls(&self) -> usize {
        self.state.watch_calls.load(Ordering::SeqCst)
    }

    /// Subscriptions whose stream has not been dropped yet.
    pub fn live_watches(&self) -> usize {
        self.state.live_watches.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<WatchOptions> {
        lock(&self.state.last_options).clone()
    }
}

pub fn sample_fix(latitude: f64, longitude: f64) -> PositionFix {
    PositionFix::new(latitude, longitude, Utc::now())
}

struct LiveWatch(Arc<AtomicUsize>);

impl Drop for LiveWatch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PositionProvider for FakePositionProvider {
    fn request_permission(&self) -> ProviderFuture<'_, bool> {
        let granted = self.state.permission.load(Ordering::SeqCst);
        Box::pin(async move { granted })
    }

    fn current_position(&self) -> ProviderFuture<'_, Result<PositionFix, LocationError>> {
        let result = match lock(&self.state.current_error).clone() {
            Some(err) => Err(LocationError::Unavailable(err)),
            None => Ok(lock(&self.state.current)
                .clone()
                .unwrap_or_else(|| sample_fix(52.520008, 13.404954))),
        };
        Box::pin(async move { result })
    }

    fn watch_position(
        &self,
        options: WatchOptions,
    ) -> ProviderFuture<'_, Result<PositionStream, LocationError>> {
        self.state.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.state.live_watches.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.last_options) = Some(options);

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state.watchers).push(tx);
        let guard = LiveWatch(Arc::clone(&self.state.live_watches));
        let feed = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|fix| (fix, (rx, guard)))
        });
        let stream: PositionStream = Box::pin(feed);
        Box::pin(async move { Ok(stream) })
    }

    fn battery_level(&self) -> Option<u8> {
        *lock(&self.state.battery)
    }
}

/// Sink that records every update it is handed.
#[derive(Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<LocationUpdate>>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<LocationUpdate> {
        lock(&self.updates).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.updates).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocationSink for RecordingSink {
    fn send_location(&self, update: LocationUpdate) {
        lock(&self.updates).push(update);
    }
}

/// Records every event published on a bus.
#[derive(Clone)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<DriverEvent>>>,
    changed: watch::Receiver<u64>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (tx, changed) = watch::channel(0u64);
        let tx = Arc::new(tx);
        for kind in [
            EventKind::ConnectionStatus,
            EventKind::OrderAssigned,
            EventKind::OrderCancelled,
            EventKind::OrderUnassigned,
            EventKind::Error,
        ] {
            let events = Arc::clone(&events);
            let tx = Arc::clone(&tx);
            bus.on(kind, move |event| {
                lock(&events).push(event.clone());
                tx.send_modify(|n| *n += 1);
            });
        }
        Self { events, changed }
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        lock(&self.events).clone()
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                DriverEvent::Error(err) => Some(err.kind),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<bool> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                DriverEvent::ConnectionStatus { connected } => Some(*connected),
                _ => None,
            })
            .collect()
    }

    /// Wait until `pred` holds over the recorded events or `timeout` passes.
    pub async fn wait_until<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[DriverEvent]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changed = self.changed.clone();
        loop {
            if pred(&lock(&self.events)) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changed.changed()).await {
                Ok(Ok(())) => {}
                _ => return pred(&lock(&self.events)),
            }
        }
    }
}
