//! Gateway client against a real local WebSocket server.

use futures_util::{SinkExt, StreamExt};
use mission_control::error::CoreError;
use mission_control::gateway::{
    AgentRunner, ConnectionState, GatewayClient, GatewayEvent, GatewayOptions, SharedGateway,
    SpawnCommand,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(5);

/// One accepted socket, driven through channels.
struct Conn {
    incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
    authorization: Option<String>,
}

impl Conn {
    async fn next_text(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.incoming.recv())
                .await
                .expect("frame before timeout")
                .expect("connection open");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).expect("client sends JSON");
            }
        }
    }

    /// Next frame that is not an application-level ping.
    async fn next_non_ping(&mut self) -> Value {
        loop {
            let value = self.next_text().await;
            if value["type"] != "ping" {
                return value;
            }
        }
    }

    fn send_text(&self, text: &str) {
        self.outgoing
            .send(Message::text(text.to_string()))
            .expect("server writer alive");
    }
}

struct TestGateway {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<Conn>,
}

impl TestGateway {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
                let callback = move |request: &Request, response: Response| {
                    let auth = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = auth_tx.send(auth);
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let authorization = auth_rx.try_recv().ok().flatten();
                let (mut sink, mut source) = ws.split();

                let (in_tx, incoming) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    while let Some(Ok(message)) = source.next().await {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                });

                let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
                tokio::spawn(async move {
                    while let Some(message) = out_rx.recv().await {
                        if sink.send(message).await.is_err() {
                            return;
                        }
                    }
                    let _ = sink.close().await;
                });

                let conn = Conn {
                    incoming,
                    outgoing,
                    authorization,
                };
                if conn_tx.send(conn).is_err() {
                    break;
                }
            }
        });

        Self { addr, conns }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn options(&self) -> GatewayOptions {
        GatewayOptions {
            reconnect_interval: Duration::from_millis(300),
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
            ..GatewayOptions::new(self.url())
        }
    }

    async fn accept(&mut self) -> Conn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("client connected before timeout")
            .expect("server running")
    }
}

async fn wait_for_state(client: &GatewayClient, want: ConnectionState) {
    let mut state = client.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("state never became {want:?}"))
        .expect("client alive");
}

/// Next event that is not connection bookkeeping.
async fn next_payload_event(events: &mut broadcast::Receiver<GatewayEvent>) -> GatewayEvent {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open");
        match event {
            GatewayEvent::Connected | GatewayEvent::Reconnecting { .. } => continue,
            other => return other,
        }
    }
}

fn spawn(agent: &str, session_id: &str) -> SpawnCommand {
    SpawnCommand::new(agent, format!("{agent} task: details"), session_id, None)
}

#[tokio::test]
async fn connected_spawn_is_sent_immediately() {
    let mut server = TestGateway::start().await;
    let client = GatewayClient::new(GatewayOptions {
        token: Some("s3cret".into()),
        ..server.options()
    });

    client.connect().await.expect("connect");
    let mut conn = server.accept().await;
    assert!(client.is_connected());
    assert_eq!(conn.authorization.as_deref(), Some("Bearer s3cret"));

    assert!(AgentRunner::spawn_agent(&client, spawn("Ada", "s1")));
    assert_eq!(client.queued_messages(), 0);

    let frame = conn.next_non_ping().await;
    assert_eq!(frame["type"], "spawn");
    assert_eq!(frame["agent"], "Ada");
    assert_eq!(frame["task"], "Ada task: details");
    assert_eq!(frame["sessionId"], "s1");
    assert_eq!(frame["config"], serde_json::json!({}));

    client.disconnect().await;
}

#[tokio::test]
async fn queued_messages_flush_in_order_before_new_ones() {
    let mut server = TestGateway::start().await;
    let client = GatewayClient::new(server.options());

    assert!(!client.spawn_agent("a", "first", "s1", None));
    assert!(!client.spawn_agent("a", "second", "s2", None));
    assert_eq!(client.queued_messages(), 2);

    client.connect().await.expect("connect");
    let mut conn = server.accept().await;
    assert!(client.spawn_agent("a", "third", "s3", None));

    let order: Vec<Value> = vec![
        conn.next_non_ping().await["sessionId"].clone(),
        conn.next_non_ping().await["sessionId"].clone(),
        conn.next_non_ping().await["sessionId"].clone(),
    ];
    assert_eq!(order, vec!["s1", "s2", "s3"]);
    assert_eq!(client.queued_messages(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn dropped_socket_queues_then_reconnects() {
    let mut server = TestGateway::start().await;
    let client = GatewayClient::new(server.options());
    let mut events = client.subscribe();

    client.connect().await.expect("connect");
    let conn = server.accept().await;
    drop(conn);

    match next_payload_event(&mut events).await {
        GatewayEvent::Disconnected { .. } => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }
    wait_for_state(&client, ConnectionState::Disconnected).await;

    assert!(!client.spawn_agent("a", "queued", "s-queued", None));
    assert_eq!(client.queued_messages(), 1);

    let mut conn = server.accept().await;
    wait_for_state(&client, ConnectionState::Connected).await;
    assert!(client.spawn_agent("a", "fresh", "s-fresh", None));

    assert_eq!(conn.next_non_ping().await["sessionId"], "s-queued");
    assert_eq!(conn.next_non_ping().await["sessionId"], "s-fresh");
    assert_eq!(client.reconnect_attempts(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn inbound_frames_are_dispatched() {
    let mut server = TestGateway::start().await;
    let client = GatewayClient::new(server.options());
    let mut events = client.subscribe();

    client.connect().await.expect("connect");
    let conn = server.accept().await;

    conn.send_text(r#"{"type":"pong"}"#);
    conn.send_text(
        r#"{"type":"status","payload":{"sessionId":"s1","status":"running","output":"hello"}}"#,
    );
    conn.send_text("this is not json");
    conn.send_text(r#"{"type":"error","payload":{"message":"runner overloaded"}}"#);
    conn.send_text(r#"{"type":"heartbeat","load":0.5}"#);

    match next_payload_event(&mut events).await {
        GatewayEvent::AgentStatus(update) => {
            assert_eq!(update.session_id, "s1");
            assert_eq!(update.status, "running");
            assert_eq!(update.output.as_deref(), Some("hello"));
        }
        other => panic!("pong must be swallowed; got {other:?}"),
    }
    assert!(matches!(
        next_payload_event(&mut events).await,
        GatewayEvent::ClientError(_)
    ));
    match next_payload_event(&mut events).await {
        GatewayEvent::GatewayError(payload) => {
            assert_eq!(payload["message"], "runner overloaded");
        }
        other => panic!("expected GatewayError, got {other:?}"),
    }
    match next_payload_event(&mut events).await {
        GatewayEvent::Message { kind, raw } => {
            assert_eq!(kind, "heartbeat");
            assert_eq!(raw["load"], 0.5);
        }
        other => panic!("expected Message, got {other:?}"),
    }
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn keepalive_pings_are_sent() {
    let mut server = TestGateway::start().await;
    let client = GatewayClient::new(GatewayOptions {
        ping_interval: Duration::from_millis(50),
        ..server.options()
    });

    client.connect().await.expect("connect");
    let mut conn = server.accept().await;
    assert_eq!(conn.next_text().await["type"], "ping");
    assert_eq!(client.queued_messages(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_closes_normally_and_stays_down() {
    let mut server = TestGateway::start().await;
    let client = GatewayClient::new(server.options());

    client.connect().await.expect("connect");
    let mut conn = server.accept().await;
    client.disconnect().await;

    let close = loop {
        let message = timeout(WAIT, conn.incoming.recv())
            .await
            .expect("close frame before timeout")
            .expect("close frame delivered");
        if let Message::Close(frame) = message {
            break frame.expect("close frame has a payload");
        }
    };
    assert_eq!(close.code, CloseCode::Normal);
    assert_eq!(close.reason.as_str(), "Client disconnecting");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let reconnect = timeout(Duration::from_millis(700), server.conns.recv()).await;
    assert!(reconnect.is_err(), "client reconnected after disconnect");
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = GatewayClient::new(GatewayOptions {
        reconnect_interval: Duration::from_millis(10),
        max_reconnect_attempts: 3,
        connect_timeout: Duration::from_millis(500),
        ..GatewayOptions::new(format!("ws://{addr}"))
    });
    let mut events = client.subscribe();
    client.start();

    let mut attempts = Vec::new();
    let mut closes = Vec::new();
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        match event {
            GatewayEvent::Reconnecting { attempt, delay } => attempts.push((attempt, delay)),
            GatewayEvent::Disconnected { code, .. } => closes.push(code),
            GatewayEvent::ReconnectExhausted => break,
            _ => {}
        }
    }

    let numbers: Vec<u32> = attempts.iter().map(|(n, _)| *n).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    // The first attempt and each of the three retries fail abnormally.
    assert_eq!(closes, vec![1006; 4]);
    let delays: Vec<Duration> = attempts.iter().map(|(_, d)| *d).collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(client.state(), ConnectionState::ReconnectExhausted);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::GatewayUnavailable(_)));
}

#[tokio::test]
async fn shared_gateway_keeps_subscribers_across_reconfigure() {
    let mut server = TestGateway::start().await;
    let gateway = SharedGateway::new(GatewayOptions::new("ws://127.0.0.1:9"));
    let mut events = gateway.subscribe();

    let client = gateway.reconfigure(server.options()).await;
    let _conn = server.accept().await;
    wait_for_state(&client, ConnectionState::Connected).await;

    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        if event == GatewayEvent::Connected {
            break;
        }
    }
    assert!(gateway.status().connected);
    assert!(gateway.spawn_agent(spawn("Ada", "s1")));

    gateway.shutdown().await;
    assert!(gateway.current().is_none());
}
