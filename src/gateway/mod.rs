//! Client for the external agent-runner gateway.
//!
//! A [`GatewayClient`] owns one background driver task that connects,
//! keeps the socket alive with pings, dispatches inbound frames as
//! [`GatewayEvent`]s and reconnects with exponential backoff. Outbound
//! messages submitted while disconnected wait in a FIFO queue and are
//! flushed ahead of anything sent after the next successful connect.

pub mod backoff;
pub mod protocol;

use crate::error::{CoreError, CoreResult};
use anyhow::{Context, anyhow};
use arc_swap::{ArcSwap, ArcSwapOption};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

pub use backoff::{MAX_RECONNECT_DELAY, ReconnectPolicy, reconnect_delay};
pub use protocol::{GatewayMessage, OutboundMessage, ProtocolError, SpawnCommand, StatusUpdate};

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";

const CLOSE_REASON: &str = "Client disconnecting";
const EVENT_CAPACITY: usize = 256;
/// How long `disconnect` waits for the close frame to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Outcome = Result<(), String>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOptions {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` on the upgrade request.
    pub token: Option<String>,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: None,
            reconnect_interval: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

impl GatewayOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_interval, self.max_reconnect_attempts)
    }
}

/// Socket lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Automatic reconnection gave up; `connect()` must be called again.
    ReconnectExhausted,
}

/// Everything the client reports to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    AgentStatus(StatusUpdate),
    GatewayError(Value),
    /// Inbound frame with an unrecognized `type`.
    Message { kind: String, raw: Value },
    /// Client-side failure: bad frame, failed connect.
    ClientError(String),
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectExhausted,
}

/// Snapshot of the connection for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub queued: usize,
    pub reconnect_attempts: u32,
}

impl GatewayStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            queued: 0,
            reconnect_attempts: 0,
        }
    }
}

/// Something that can ask an external runner to start an agent.
pub trait AgentRunner: Send + Sync {
    /// Returns true if the command went out now, false if it was queued
    /// (or dropped, for runners that cannot send at all).
    fn spawn_agent(&self, command: SpawnCommand) -> bool;
}

/// Runner used when the gateway is turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRunner;

impl AgentRunner for DisabledRunner {
    fn spawn_agent(&self, command: SpawnCommand) -> bool {
        debug!(session_id = %command.session_id, "Gateway disabled; spawn not sent");
        false
    }
}

struct Outbox {
    /// Present only while a session is live.
    writer: Option<mpsc::UnboundedSender<OutboundMessage>>,
    queue: VecDeque<OutboundMessage>,
}

struct Shared {
    options: GatewayOptions,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<GatewayEvent>,
    outbox: Mutex<Outbox>,
    attempts: AtomicU32,
    retry_now: Notify,
    /// `connect()` callers waiting for the outcome of the next attempt.
    waiters: Mutex<Vec<oneshot::Sender<Outcome>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn resolve_waiters(&self, outcome: &Outcome) {
        for waiter in lock(&self.waiters).drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Queue a `connect()` caller for the next outcome, or `None` if the
    /// socket is already up.
    ///
    /// The state is checked under the waiters lock. The driver publishes
    /// `Connected` before it drains the waiters, so a caller either sees the
    /// new state here or is drained by the driver.
    fn register_waiter(&self) -> Option<oneshot::Receiver<Outcome>> {
        let mut waiters = lock(&self.waiters);
        if *self.state.borrow() == ConnectionState::Connected {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.push(tx);
        Some(rx)
    }

    fn send(&self, message: OutboundMessage) -> bool {
        let mut guard = lock(&self.outbox);
        let outbox = &mut *guard;
        if let Some(writer) = &outbox.writer {
            match writer.send(message) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(message)) => outbox.queue.push_back(message),
            }
        } else {
            outbox.queue.push_back(message);
        }
        trace!(queued = outbox.queue.len(), "Queued gateway message");
        false
    }

    fn dispatch_inbound(&self, text: &str) {
        match GatewayMessage::parse(text) {
            Ok(GatewayMessage::Pong) => trace!("Gateway pong"),
            Ok(GatewayMessage::Status(update)) => {
                debug!(
                    session_id = %update.session_id,
                    status = %update.status,
                    "Agent status from gateway"
                );
                self.emit(GatewayEvent::AgentStatus(update));
            }
            Ok(GatewayMessage::Error(payload)) => {
                error!(payload = %payload, "Gateway reported an error");
                self.emit(GatewayEvent::GatewayError(payload));
            }
            Ok(GatewayMessage::Other { kind, raw }) => {
                debug!(kind = %kind, "Unrecognized gateway message");
                self.emit(GatewayEvent::Message { kind, raw });
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse gateway message");
                self.emit(GatewayEvent::ClientError(format!(
                    "Failed to parse message: {e}"
                )));
            }
        }
    }
}

struct DriverHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DriverHandle {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A resilient connection to the agent-runner gateway.
pub struct GatewayClient {
    shared: Arc<Shared>,
    driver: Mutex<Option<DriverHandle>>,
}

impl GatewayClient {
    pub fn new(options: GatewayOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(options, events)
    }

    /// Build a client that publishes on an existing event channel.
    pub fn with_events(options: GatewayOptions, events: broadcast::Sender<GatewayEvent>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                options,
                state,
                events,
                outbox: Mutex::new(Outbox {
                    writer: None,
                    queue: VecDeque::new(),
                }),
                attempts: AtomicU32::new(0),
                retry_now: Notify::new(),
                waiters: Mutex::new(Vec::new()),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.shared.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Messages waiting for the next connection.
    pub fn queued_messages(&self) -> usize {
        lock(&self.shared.outbox).queue.len()
    }

    /// Reconnect attempts scheduled since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> GatewayStatus {
        let state = self.state();
        GatewayStatus {
            state,
            connected: state == ConnectionState::Connected,
            queued: self.queued_messages(),
            reconnect_attempts: self.reconnect_attempts(),
        }
    }

    /// Start connecting in the background without waiting for the result.
    pub fn start(&self) {
        self.ensure_driver();
    }

    /// Connect, resolving with the outcome of the first attempt.
    ///
    /// Returns immediately if already connected or connecting. On failure
    /// the client keeps retrying in the background. If a reconnect is
    /// pending, the attempt happens now instead of after the delay.
    pub async fn connect(&self) -> CoreResult<()> {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Ok(());
        }

        let Some(rx) = self.shared.register_waiter() else {
            return Ok(());
        };
        self.ensure_driver();

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(CoreError::GatewayUnavailable(reason)),
            Err(_) => Err(CoreError::GatewayUnavailable(
                "connection attempt was cancelled".to_string(),
            )),
        }
    }

    fn ensure_driver(&self) {
        let mut driver = lock(&self.driver);
        if let Some(handle) = driver.as_ref()
            && handle.is_running()
        {
            if self.state() == ConnectionState::Disconnected {
                self.shared.retry_now.notify_one();
            }
            return;
        }

        self.shared.attempts.store(0, Ordering::SeqCst);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(drive(self.shared.clone(), shutdown_rx));
        *driver = Some(DriverHandle {
            shutdown,
            task: Some(task),
        });
    }

    /// Close the socket with a normal closure and stop reconnecting.
    pub async fn disconnect(&self) {
        let handle = lock(&self.driver).take();
        if let Some(mut handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Some(task) = handle.task.take() {
                let abort = task.abort_handle();
                if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                    abort.abort();
                }
            }
        }

        lock(&self.shared.outbox).writer = None;
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared
            .resolve_waiters(&Err("client disconnected".to_string()));
    }

    /// Send now if connected (true), otherwise queue (false).
    pub fn send_message(&self, message: OutboundMessage) -> bool {
        self.shared.send(message)
    }

    /// Ask the runner to start `agent` on `task` for `session_id`.
    pub fn spawn_agent(
        &self,
        agent: &str,
        task: &str,
        session_id: &str,
        config: Option<Value>,
    ) -> bool {
        self.send_message(OutboundMessage::Spawn(SpawnCommand::new(
            agent, task, session_id, config,
        )))
    }

    pub fn ping(&self) -> bool {
        self.send_message(OutboundMessage::Ping)
    }
}

impl AgentRunner for GatewayClient {
    fn spawn_agent(&self, command: SpawnCommand) -> bool {
        self.send_message(OutboundMessage::Spawn(command))
    }
}

async fn open_socket(options: &GatewayOptions) -> anyhow::Result<WsStream> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid gateway url {}", options.url))?;
    if let Some(token) = options.token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("gateway token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _response) = tokio::time::timeout(options.connect_timeout, connect_async(request))
        .await
        .map_err(|_| {
            anyhow!(
                "connect timed out after {}ms",
                options.connect_timeout.as_millis()
            )
        })??;
    Ok(stream)
}

/// Connection loop: connect, run a session, back off, repeat.
async fn drive(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let policy = shared.options.policy();

    loop {
        shared.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            result = open_socket(&shared.options) => result,
            _ = shutdown.changed() => {
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        match attempt {
            Ok(stream) => {
                shared.attempts.store(0, Ordering::SeqCst);
                info!(url = %shared.options.url, "Connected to gateway");
                let end = run_session(&shared, stream, &mut shutdown).await;
                shared.set_state(ConnectionState::Disconnected);
                info!(code = end.code, reason = %end.reason, "Disconnected from gateway");
                shared.emit(GatewayEvent::Disconnected {
                    code: end.code,
                    reason: end.reason,
                });
                if end.shutdown {
                    return;
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(url = %shared.options.url, error = %message, "Gateway connection failed");
                shared.set_state(ConnectionState::Disconnected);
                shared.emit(GatewayEvent::ClientError(message.clone()));
                shared.emit(GatewayEvent::Disconnected {
                    code: u16::from(CloseCode::Abnormal),
                    reason: message.clone(),
                });
                shared.resolve_waiters(&Err(message));
            }
        }

        let scheduled = shared.attempts.load(Ordering::SeqCst);
        let Some(delay) = policy.next_delay(scheduled) else {
            error!(attempts = scheduled, "Max gateway reconnection attempts reached");
            shared.set_state(ConnectionState::ReconnectExhausted);
            shared.emit(GatewayEvent::ReconnectExhausted);
            shared.resolve_waiters(&Err("reconnect attempts exhausted".to_string()));
            return;
        };
        let attempt = scheduled + 1;
        shared.attempts.store(attempt, Ordering::SeqCst);
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to gateway"
        );
        shared.emit(GatewayEvent::Reconnecting { attempt, delay });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.retry_now.notified() => debug!("Gateway reconnect triggered early"),
            _ = shutdown.changed() => return,
        }
    }
}

struct SessionEnd {
    code: u16,
    reason: String,
    /// The session ended because the client asked it to.
    shutdown: bool,
}

impl SessionEnd {
    fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: u16::from(CloseCode::Abnormal),
            reason: reason.into(),
            shutdown: false,
        }
    }
}

/// Serve one live socket until it closes, fails or shutdown is requested.
async fn run_session(
    shared: &Shared,
    stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut source) = stream.split();
    let (writer, mut outgoing) = mpsc::unbounded_channel();

    // Queued messages go into the channel before the writer is published,
    // so they precede anything sent from here on.
    let flushed = {
        let mut guard = lock(&shared.outbox);
        let outbox = &mut *guard;
        let flushed = outbox.queue.len();
        for message in outbox.queue.drain(..) {
            let _ = writer.send(message);
        }
        outbox.writer = Some(writer);
        flushed
    };
    if flushed > 0 {
        info!(count = flushed, "Flushing queued gateway messages");
    }
    shared.set_state(ConnectionState::Connected);
    shared.emit(GatewayEvent::Connected);
    shared.resolve_waiters(&Ok(()));

    let period = shared.options.ping_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failed = None;

    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: CLOSE_REASON.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "Failed to send close frame");
                }
                break SessionEnd {
                    code: u16::from(CloseCode::Normal),
                    reason: CLOSE_REASON.to_string(),
                    shutdown: true,
                };
            }
            Some(message) = outgoing.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Dropping unserializable gateway message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    warn!(error = %e, "Gateway write failed; message requeued");
                    failed = Some(message);
                    break SessionEnd::abnormal(e.to_string());
                }
            }
            _ = keepalive.tick() => {
                let ping = serde_json::json!({ "type": "ping" }).to_string();
                if let Err(e) = sink.send(Message::text(ping)).await {
                    break SessionEnd::abnormal(e.to_string());
                }
                trace!("Gateway ping sent");
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch_inbound(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared.dispatch_inbound(text),
                    Err(_) => debug!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((u16::from(CloseCode::Status), String::new()));
                    break SessionEnd { code, reason, shutdown: false };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::abnormal(e.to_string()),
                None => break SessionEnd::abnormal("connection closed"),
            }
        }
    };

    // Anything written to the channel but not to the socket goes back to the
    // front of the queue, ahead of messages queued since the writer closed.
    let mut guard = lock(&shared.outbox);
    let outbox = &mut *guard;
    outbox.writer = None;
    let mut requeue: VecDeque<OutboundMessage> = failed.into_iter().collect();
    while let Ok(message) = outgoing.try_recv() {
        requeue.push_back(message);
    }
    if !requeue.is_empty() {
        debug!(count = requeue.len(), "Requeued unsent gateway messages");
        requeue.extend(outbox.queue.drain(..));
        outbox.queue = requeue;
    }

    end
}

/// Process-wide gateway connection, created on first use.
pub struct SharedGateway {
    options: ArcSwap<GatewayOptions>,
    client: ArcSwapOption<GatewayClient>,
    events: broadcast::Sender<GatewayEvent>,
    init: Mutex<()>,
}

impl SharedGateway {
    pub fn new(options: GatewayOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            options: ArcSwap::from_pointee(options),
            client: ArcSwapOption::empty(),
            events,
            init: Mutex::new(()),
        }
    }

    pub fn options(&self) -> Arc<GatewayOptions> {
        self.options.load_full()
    }

    /// The live client, creating and starting it on first use.
    pub fn client(&self) -> Arc<GatewayClient> {
        if let Some(client) = self.client.load_full() {
            return client;
        }
        let _guard = lock(&self.init);
        if let Some(client) = self.client.load_full() {
            return client;
        }

        let options = GatewayOptions::clone(&self.options.load());
        info!(url = %options.url, "Creating gateway client");
        let client = Arc::new(GatewayClient::with_events(options, self.events.clone()));
        client.start();
        self.client.store(Some(client.clone()));
        client
    }

    /// The client, if one has been created.
    pub fn current(&self) -> Option<Arc<GatewayClient>> {
        self.client.load_full()
    }

    /// Events from whichever client is current, surviving reconfiguration.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> CoreResult<()> {
        self.client().connect().await
    }

    /// Dispose of the current client and install one built from `options`.
    pub async fn reconfigure(&self, options: GatewayOptions) -> Arc<GatewayClient> {
        self.options.store(Arc::new(options));
        if let Some(previous) = self.client.swap(None) {
            previous.disconnect().await;
        }
        self.client()
    }

    pub async fn shutdown(&self) {
        if let Some(client) = self.client.swap(None) {
            client.disconnect().await;
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.current()
            .map(|c| c.status())
            .unwrap_or_else(GatewayStatus::disconnected)
    }
}

impl AgentRunner for SharedGateway {
    fn spawn_agent(&self, command: SpawnCommand) -> bool {
        self.client()
            .send_message(OutboundMessage::Spawn(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_options() -> GatewayOptions {
        GatewayOptions {
            url: "ws://127.0.0.1:9".to_string(),
            reconnect_interval: Duration::from_millis(10),
            max_reconnect_attempts: 1,
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn default_options_match_documented_values() {
        let options = GatewayOptions::default();
        assert_eq!(options.url, DEFAULT_GATEWAY_URL);
        assert_eq!(options.reconnect_interval, Duration::from_secs(5));
        assert_eq!(options.max_reconnect_attempts, 10);
        assert_eq!(options.ping_interval, Duration::from_secs(30));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn messages_queue_while_never_connected() {
        let client = GatewayClient::new(offline_options());
        assert!(!client.spawn_agent("Ada", "t: ", "s1", None));
        assert!(!client.ping());
        assert_eq!(client.queued_messages(), 2);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn inbound_frames_become_events() {
        let client = GatewayClient::new(offline_options());
        let mut events = client.subscribe();

        client.shared.dispatch_inbound(r#"{"type":"pong"}"#);
        client
            .shared
            .dispatch_inbound(r#"{"type":"error","payload":{"message":"nope"}}"#);
        client.shared.dispatch_inbound("{oops");

        assert!(matches!(
            events.try_recv().unwrap(),
            GatewayEvent::GatewayError(_)
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            GatewayEvent::ClientError(_)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_waiters_are_checked_against_state() {
        let client = GatewayClient::new(offline_options());

        let rx = client.shared.register_waiter().expect("waiter while disconnected");
        client.shared.set_state(ConnectionState::Connected);
        client.shared.resolve_waiters(&Ok(()));
        assert_eq!(rx.await.expect("waiter resolved"), Ok(()));

        assert!(client.shared.register_waiter().is_none());
        assert!(lock(&client.shared.waiters).is_empty());
        client.connect().await.expect("already connected");
        assert!(lock(&client.driver).is_none());
    }

    #[test]
    fn disabled_runner_never_sends() {
        assert!(!DisabledRunner.spawn_agent(SpawnCommand::new("a", "t", "s", None)));
    }

    #[tokio::test]
    async fn shared_gateway_reports_disconnected_before_first_use() {
        let gateway = SharedGateway::new(offline_options());
        assert!(gateway.current().is_none());
        assert_eq!(gateway.status().state, ConnectionState::Disconnected);
        gateway.shutdown().await;
    }
}
