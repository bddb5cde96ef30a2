//! Shared test utilities for the realtime integration tests.
//!
//! `MockConnector` stands in for the WebSocket transport: every successful
//! connect hands the test a `ServerEnd` that plays the broker.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use duet_core::error::{DuetError, DuetResult};
use duet_e2ee::KeyStorageManager;
use duet_realtime::{
    ClientSettings, Command, Connector, Credential, EventSink, Frame, Link, Packet,
    RealtimeClient, ReconnectPolicy, SyncEvent, Topic,
};

pub const PAIRING: &str = "p1";
pub const TOKEN: &str = "tok-1";
pub const WS_URL: &str = "ws://broker.test/ws";

const LINK_CAPACITY: usize = 128;
const WAIT: Duration = Duration::from_secs(60);

/// Settings with heartbeats off and a 1 s backoff base.
pub fn test_settings() -> ClientSettings {
    ClientSettings {
        ws_url: WS_URL.into(),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
        heartbeat_ms: (0, 0),
        connect_timeout: Duration::from_secs(5),
    }
}

/// Connector whose transports are in-memory channels.
pub struct MockConnector {
    failures_left: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    /// Refuses the first `fail_first` connects.
    pub fn new(fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures_left: AtomicU32::new(fail_first),
            attempts: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    /// When each connect was attempted, in order.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Gaps between consecutive attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        self.attempts()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> DuetResult<Link> {
        self.attempts.lock().unwrap().push(Instant::now());
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DuetError::Connection("connection refused".into()));
        }

        let (outbound, from_client) = mpsc::channel(LINK_CAPACITY);
        let (to_client, inbound) = mpsc::channel(LINK_CAPACITY);
        let _ = self.servers.send(ServerEnd {
            url: url.to_string(),
            from_client,
            to_client,
            pending: VecDeque::new(),
            heartbeats: 0,
        });
        Ok(Link { outbound, inbound })
    }
}

/// The broker side of one mock transport.
pub struct ServerEnd {
    pub url: String,
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<DuetResult<String>>,
    pending: VecDeque<Frame>,
    /// Bare EOL heartbeats received from the client so far.
    pub heartbeats: usize,
}

impl ServerEnd {
    /// Next frame from the client, or None once the client closed the link.
    pub async fn try_next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            let text = timeout(WAIT, self.from_client.recv())
                .await
                .expect("timed out waiting for a client frame")?;
            for packet in Packet::decode_all(&text).expect("client sent a malformed frame") {
                match packet {
                    Packet::Heartbeat => self.heartbeats += 1,
                    Packet::Frame(frame) => self.pending.push_back(frame),
                }
            }
        }
    }

    pub async fn next_frame(&mut self) -> Frame {
        self.try_next_frame()
            .await
            .expect("client closed the link")
    }

    /// Everything the client sends until it closes the link.
    pub async fn frames_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_next_frame().await {
            frames.push(frame);
        }
        frames
    }

    /// Count heartbeats already queued without waiting for more.
    pub fn drain_heartbeats(&mut self) -> usize {
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(packets) = Packet::decode_all(&text) {
                for packet in packets {
                    match packet {
                        Packet::Heartbeat => self.heartbeats += 1,
                        Packet::Frame(frame) => self.pending.push_back(frame),
                    }
                }
            }
        }
        self.heartbeats
    }

    /// Answer the CONNECT frame; returns it for inspection.
    pub async fn accept(&mut self, heart_beat: &str) -> Frame {
        let connect = self.next_frame().await;
        assert_eq!(connect.command, Command::Connect);
        self.send_frame(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", heart_beat),
        )
        .await;
        connect
    }

    /// Accept and collect the subscription burst that follows.
    pub async fn accept_and_subscriptions(&mut self, heart_beat: &str) -> (Frame, Vec<Frame>) {
        let connect = self.accept(heart_beat).await;
        let mut subscriptions = Vec::new();
        for _ in 0..Topic::ALL.len() {
            subscriptions.push(self.next_frame().await);
        }
        (connect, subscriptions)
    }

    pub async fn send_frame(&self, frame: Frame) {
        self.send_raw(&frame.encode()).await;
    }

    pub async fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Ok(text.to_string())).await;
    }

    /// Deliver `body` on `topic` the way the broker does.
    pub async fn push(&self, topic: Topic, body: &str) {
        self.send_frame(message_frame(topic, body)).await;
    }

    /// Report a transport error to the client.
    pub async fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .send(Err(DuetError::Connection(reason.into())))
            .await;
    }
}

/// A client wired to a mock connector and an event channel.
pub struct Harness {
    pub client: RealtimeClient,
    pub connector: Arc<MockConnector>,
    pub keys: KeyStorageManager,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    sink: EventSink,
}

impl Harness {
    pub fn new(settings: ClientSettings, fail_first: u32) -> Self {
        let (connector, servers) = MockConnector::new(fail_first);
        let keys = KeyStorageManager::in_memory();
        let client = RealtimeClient::new(settings, connector.clone(), keys.clone());
        let (sink, events) = EventSink::channel();
        Self {
            client,
            connector,
            keys,
            servers,
            events,
            sink,
        }
    }

    pub async fn start(&self) {
        self.client
            .connect(Credential::new(TOKEN, 1), PAIRING, self.sink.clone())
            .await;
    }

    /// Start and complete the handshake; returns the broker end.
    pub async fn connected(&mut self) -> ServerEnd {
        self.start().await;
        let mut server = self.next_server().await;
        server.accept_and_subscriptions("0,0").await;
        assert_eq!(self.next_event().await, SyncEvent::Connected);
        server
    }

    pub async fn next_server(&mut self) -> ServerEnd {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connect")
            .expect("connector dropped")
    }

    pub async fn next_event(&mut self) -> SyncEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub fn try_event(&mut self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }
}

/// A MESSAGE frame carrying `body` on `topic`.
pub fn message_frame(topic: Topic, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("subscription", topic.subscription_id())
        .header("destination", topic.subscribe_destination(PAIRING))
        .header("message-id", uuid::Uuid::new_v4().to_string())
        .header("content-type", "application/json")
        .with_body(body)
}

/// A chat payload as the server serializes it.
pub fn chat_json(id: i64, content: &str) -> String {
    serde_json::json!({
        "id": id,
        "senderId": 2,
        "content": content,
        "type": "TEXT",
        "isRead": false,
        "createdAt": "2024-05-01T09:30:00"
    })
    .to_string()
}
