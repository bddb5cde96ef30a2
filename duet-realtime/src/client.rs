//! Realtime sync client.
//!
//! One STOMP session per pairing over a [`Connector`] transport. The client
//! subscribes to every pairing topic, decodes inbound payloads defensively,
//! decrypts the E2EE chat topic with the stored shared key and reconnects
//! with exponential backoff when the connection drops.
//!
//! Lifecycle:
//! - `connect()` stores the session inputs and spawns the connection task
//! - the task handshakes, subscribes and pumps frames until the link dies
//! - a lost link schedules a reconnect after `base * 2^(attempt-1)`
//! - `disconnect()` bumps the session generation, which invalidates every
//!   task spawned for the previous session

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use duet_core::config::AppConfig;
use duet_core::constants::{heartbeat, MAX_HANDLED_MESSAGE_HISTORY};
use duet_core::error::{DuetError, DuetResult};
use duet_e2ee::{CryptoManager, EncryptedEnvelope, KeyStorageManager};

use crate::events::{
    BucketSync, ChatMessage, ConnectionState, E2eeChatMessage, EventSink, FinanceSync,
    MessageType, OutgoingChatMessage, OutgoingE2eeMessage, OutgoingReadReceipt, OutgoingTyping,
    ReadReceipt, ScheduleSync, SyncEvent, TypingIndicator,
};
use crate::stomp::{Command, Frame, Heartbeat, Packet};
use crate::topics::Topic;
use crate::transport::{Connector, Link, WsConnector};

/// Who the session authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token, sent in the URL query and the CONNECT frame.
    pub token: String,
    pub user_id: i64,
}

impl Credential {
    pub fn new(token: impl Into<String>, user_id: i64) -> Self {
        Self {
            token: token.into(),
            user_id,
        }
    }
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(duet_core::constants::reconnect::BASE_DELAY_MS),
            max_attempts: duet_core::constants::reconnect::MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Everything the client needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// WebSocket endpoint without the token query.
    pub ws_url: String,
    pub reconnect: ReconnectPolicy,
    /// Heartbeat offer `(outgoing, incoming)` in milliseconds.
    pub heartbeat_ms: (u64, u64),
    /// Bound on transport open plus STOMP handshake.
    pub connect_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &AppConfig) -> DuetResult<Self> {
        let realtime = &config.realtime;
        Ok(Self {
            ws_url: config.server.effective_ws_url()?,
            reconnect: ReconnectPolicy {
                base_delay: realtime.reconnect_base_delay(),
                max_attempts: realtime.max_reconnect_attempts,
            },
            heartbeat_ms: (realtime.heartbeat_outgoing_ms, realtime.heartbeat_incoming_ms),
            connect_timeout: realtime.connect_timeout(),
        })
    }
}

/// Mutable session data; only touched with the session lock held.
struct Session {
    state: ConnectionState,
    attempts: u32,
    credential: Option<Credential>,
    pairing_id: Option<String>,
    sink: Option<EventSink>,
    /// Cleared by `disconnect()` and by reconnect exhaustion.
    active: bool,
    /// Bumped on every `connect()`/`disconnect()`; tasks carry the value
    /// they were spawned with and exit once it no longer matches.
    generation: u64,
    connection_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    outbound: Option<mpsc::Sender<String>>,
    handled_message_ids: VecDeque<i64>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            credential: None,
            pairing_id: None,
            sink: None,
            active: false,
            generation: 0,
            connection_task: None,
            reconnect_task: None,
            outbound: None,
            handled_message_ids: VecDeque::new(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }

    /// Record a chat message id; false if it was already delivered.
    fn first_delivery(&mut self, id: i64) -> bool {
        if self.handled_message_ids.contains(&id) {
            return false;
        }
        self.handled_message_ids.push_back(id);
        if self.handled_message_ids.len() > MAX_HANDLED_MESSAGE_HISTORY {
            self.handled_message_ids.pop_front();
        }
        true
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    keys: KeyStorageManager,
    settings: ClientSettings,
    session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
}

/// STOMP pub/sub client for one pairing.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    /// Client over a real WebSocket transport.
    pub fn from_config(config: &AppConfig, keys: KeyStorageManager) -> DuetResult<Self> {
        let settings = ClientSettings::from_config(config)?;
        let connector = Arc::new(WsConnector::new(settings.connect_timeout));
        Ok(Self::new(settings, connector, keys))
    }

    pub fn new(
        settings: ClientSettings,
        connector: Arc<dyn Connector>,
        keys: KeyStorageManager,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                keys,
                settings,
                session: Mutex::new(Session::new()),
                state_tx,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.session.lock().await.state
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful handshake.
    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.session.lock().await.attempts
    }

    /// Start a session and return immediately.
    ///
    /// Readiness arrives as [`SyncEvent::Connected`] on `sink`. Calling this
    /// while a session is running shuts that session down first, exactly as
    /// [`disconnect`](Self::disconnect) would, then replaces it.
    pub async fn connect(&self, credential: Credential, pairing_id: &str, sink: EventSink) {
        let mut session = self.inner.session.lock().await;
        if session.active {
            self.inner.shut_down(&mut session);
        } else {
            stop_tasks(&mut session);
            session.outbound = None;
        }

        session.generation += 1;
        session.active = true;
        session.attempts = 0;
        session.credential = Some(credential);
        session.pairing_id = Some(pairing_id.to_string());
        session.sink = Some(sink);
        session.handled_message_ids.clear();
        self.inner.set_state(&mut session, ConnectionState::Connecting);

        info!("realtime connecting for pairing {}", pairing_id);
        let generation = session.generation;
        session.connection_task = Some(spawn_connection(self.inner.clone(), generation));
    }

    /// Tear the session down. Safe in any state.
    pub async fn disconnect(&self) {
        let mut session = self.inner.session.lock().await;
        self.inner.shut_down(&mut session);
        info!("realtime disconnected");
    }

    /// Publish a JSON payload on `topic`.
    pub async fn send<T: Serialize + ?Sized>(&self, topic: Topic, payload: &T) -> DuetResult<()> {
        let body = serde_json::to_string(payload)?;
        self.publish(topic, body).await
    }

    /// Encrypt `plaintext` with the shared key and publish it; returns the tempId.
    pub async fn send_encrypted(&self, topic: Topic, plaintext: &str) -> DuetResult<String> {
        let key = self.inner.keys.shared_key()?.ok_or(DuetError::MissingSharedKey)?;
        let envelope = CryptoManager::encrypt_message(&key, plaintext)?;
        let temp_id = new_temp_id();
        let payload = OutgoingE2eeMessage {
            encrypted_content: envelope.encrypted_content,
            iv: envelope.iv,
            message_type: MessageType::Text,
            temp_id: temp_id.clone(),
        };
        self.send(topic, &payload).await?;
        Ok(temp_id)
    }

    /// Publish a plain text chat message; returns the tempId.
    pub async fn send_chat(&self, content: &str) -> DuetResult<String> {
        let temp_id = new_temp_id();
        let payload = OutgoingChatMessage {
            content: content.to_string(),
            message_type: MessageType::Text,
            image_url: None,
            temp_id: temp_id.clone(),
        };
        self.send(Topic::Chat, &payload).await?;
        Ok(temp_id)
    }

    pub async fn send_typing(&self, is_typing: bool) -> DuetResult<()> {
        self.send(Topic::Typing, &OutgoingTyping { is_typing }).await
    }

    pub async fn send_read_receipt(&self, last_read_message_id: i64) -> DuetResult<()> {
        self.send(Topic::ReadReceipt, &OutgoingReadReceipt { last_read_message_id })
            .await
    }

    async fn publish(&self, topic: Topic, body: String) -> DuetResult<()> {
        let (outbound, pairing_id) = {
            let session = self.inner.session.lock().await;
            if session.state != ConnectionState::Connected {
                return Err(DuetError::NotConnected);
            }
            match (&session.outbound, &session.pairing_id) {
                (Some(out), Some(id)) => (out.clone(), id.clone()),
                _ => return Err(DuetError::NotConnected),
            }
        };
        let frame = Frame::send(&topic.publish_destination(&pairing_id), body);
        outbound
            .send(frame.encode())
            .await
            .map_err(|_| DuetError::NotConnected)?;
        debug!("published on {}", topic);
        Ok(())
    }
}

impl Inner {
    /// End the current session: invalidate its tasks, unsubscribe and send
    /// DISCONNECT on a live link, and tell the session's sink if it was
    /// connected. Leaves the session inactive and `Disconnected`.
    fn shut_down(&self, session: &mut Session) {
        session.generation += 1;
        session.active = false;
        stop_tasks(session);

        if let Some(outbound) = session.outbound.take() {
            for topic in Topic::ALL {
                let frame = Frame::unsubscribe(&topic.subscription_id());
                if outbound.try_send(frame.encode()).is_err() {
                    break;
                }
            }
            let _ = outbound.try_send(Frame::disconnect("disconnect").encode());
        }

        let was = session.state;
        self.set_state(session, ConnectionState::Disconnected);
        if was == ConnectionState::Connected {
            if let Some(sink) = &session.sink {
                sink.emit(SyncEvent::Disconnected { reason: None });
            }
        }

        session.attempts = 0;
        session.credential = None;
        session.pairing_id = None;
        session.sink = None;
        session.handled_message_ids.clear();
    }

    fn set_state(&self, session: &mut Session, new_state: ConnectionState) {
        if session.state != new_state {
            info!("realtime state: {} -> {}", session.state, new_state);
            session.state = new_state;
            let _ = self.state_tx.send(new_state);
        }
    }

    async fn emit(&self, generation: u64, event: SyncEvent) {
        let sink = {
            let session = self.session.lock().await;
            if !session.is_current(generation) {
                return;
            }
            session.sink.clone()
        };
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Open the transport, handshake, subscribe, then pump frames until the
    /// link fails. Returns `Ok` only when the session went stale.
    async fn run_session(&self, generation: u64) -> DuetResult<()> {
        let (credential, pairing_id) = {
            let session = self.session.lock().await;
            if !session.is_current(generation) {
                return Ok(());
            }
            match (&session.credential, &session.pairing_id) {
                (Some(c), Some(p)) => (c.clone(), p.clone()),
                _ => return Ok(()),
            }
        };

        let url = socket_url(&self.settings.ws_url, &credential.token)?;
        let host = url.host_str().unwrap_or_default().to_string();
        let mut link = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(url.as_str()),
        )
        .await
        .map_err(|_| DuetError::Connection("transport connect timed out".into()))??;

        let heartbeat = self.handshake(&mut link, &host, &credential.token).await?;

        {
            let mut session = self.session.lock().await;
            if !session.is_current(generation) {
                return Ok(());
            }
            session.attempts = 0;
            session.outbound = Some(link.outbound.clone());
            self.set_state(&mut session, ConnectionState::Connected);
            if let Some(sink) = &session.sink {
                sink.emit(SyncEvent::Connected);
            }
        }
        info!("realtime connected (heartbeat {:?})", heartbeat);

        for topic in Topic::ALL {
            let frame = Frame::subscribe(&topic.subscription_id(), &topic.subscribe_destination(&pairing_id));
            send_text(&link, frame.encode()).await?;
        }
        debug!("subscribed to {} topics", Topic::ALL.len());

        self.pump(generation, &mut link, &pairing_id, heartbeat).await
    }

    async fn handshake(&self, link: &mut Link, host: &str, token: &str) -> DuetResult<Heartbeat> {
        send_text(link, Frame::connect(host, token, self.settings.heartbeat_ms).encode()).await?;

        let wait = async {
            loop {
                let text = match link.inbound.recv().await {
                    Some(result) => result?,
                    None => return Err(DuetError::Connection("closed during handshake".into())),
                };
                for packet in Packet::decode_each(&text) {
                    let frame = match packet {
                        Ok(Packet::Frame(frame)) => frame,
                        Ok(Packet::Heartbeat) => continue,
                        Err(e) => {
                            warn!("skipping malformed frame during handshake: {}", e);
                            continue;
                        }
                    };
                    match frame.command {
                        Command::Connected => {
                            return Heartbeat::negotiate(
                                self.settings.heartbeat_ms,
                                frame.get("heart-beat"),
                            );
                        }
                        Command::Error => return Err(error_frame(&frame)),
                        other => debug!("ignoring {} before CONNECTED", other),
                    }
                }
            }
        };

        tokio::time::timeout(self.settings.connect_timeout, wait)
            .await
            .map_err(|_| DuetError::Connection("STOMP handshake timed out".into()))?
    }

    async fn pump(
        &self,
        generation: u64,
        link: &mut Link,
        pairing_id: &str,
        heartbeat: Heartbeat,
    ) -> DuetResult<()> {
        let mut ticker = (heartbeat.outgoing_ms > 0).then(|| {
            let period = Duration::from_millis(heartbeat.outgoing_ms);
            tokio::time::interval_at(Instant::now() + period, period)
        });
        let silence_limit = (heartbeat.incoming_ms > 0).then(|| {
            Duration::from_millis(heartbeat.incoming_ms) * heartbeat::GRACE_FACTOR
        });
        let mut last_seen = Instant::now();

        loop {
            let deadline = silence_limit.map(|limit| last_seen + limit);
            tokio::select! {
                inbound = link.inbound.recv() => {
                    last_seen = Instant::now();
                    let text = match inbound {
                        Some(result) => result?,
                        None => return Err(DuetError::Connection("transport closed".into())),
                    };
                    for packet in Packet::decode_each(&text) {
                        let frame = match packet {
                            Ok(Packet::Frame(frame)) => frame,
                            Ok(Packet::Heartbeat) => continue,
                            Err(e) => {
                                warn!("skipping malformed frame: {}", e);
                                continue;
                            }
                        };
                        match frame.command {
                            Command::Message => self.dispatch(generation, pairing_id, &frame).await,
                            Command::Error => return Err(error_frame(&frame)),
                            Command::Receipt => debug!("receipt {:?}", frame.get("receipt-id")),
                            other => debug!("ignoring unexpected {} frame", other),
                        }
                    }
                }
                _ = tick(&mut ticker) => {
                    send_text(link, Packet::Heartbeat.encode()).await?;
                }
                _ = sleep_until(deadline) => {
                    return Err(DuetError::Connection("server heartbeat missed".into()));
                }
            }
        }
    }

    /// Route one MESSAGE frame to the sink. Decode failures are logged and
    /// dropped so one bad payload never blocks the topic.
    async fn dispatch(&self, generation: u64, pairing_id: &str, frame: &Frame) {
        let topic = frame
            .get("subscription")
            .and_then(Topic::from_subscription_id)
            .or_else(|| {
                frame
                    .get("destination")
                    .and_then(|d| Topic::from_destination(d, pairing_id))
            });
        let Some(topic) = topic else {
            warn!("message for unknown subscription {:?}", frame.get("subscription"));
            return;
        };

        let event = match self.decode_event(generation, topic, &frame.body).await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(DuetError::Crypto(reason)) => {
                warn!("dropping undecryptable message: {}", reason);
                SyncEvent::Error(format!("could not decrypt message: {reason}"))
            }
            Err(DuetError::MissingSharedKey) => {
                warn!("encrypted message received without a shared key");
                SyncEvent::Error("encrypted message received without a shared key".into())
            }
            Err(e) => {
                warn!("dropping malformed {} payload: {}", topic, e);
                return;
            }
        };
        debug!("dispatching {} from {}", event.name(), topic);
        self.emit(generation, event).await;
    }

    async fn decode_event(
        &self,
        generation: u64,
        topic: Topic,
        body: &str,
    ) -> DuetResult<Option<SyncEvent>> {
        let event = match topic {
            Topic::Chat => {
                let message: ChatMessage = decode(body)?;
                return Ok(self
                    .first_delivery(generation, message.id)
                    .await
                    .then_some(SyncEvent::ChatMessage {
                        message,
                        encrypted: false,
                    }));
            }
            Topic::E2eeChat => {
                let wire: E2eeChatMessage = decode(body)?;
                let key = self.keys.shared_key()?.ok_or(DuetError::MissingSharedKey)?;
                let envelope = EncryptedEnvelope {
                    encrypted_content: wire.encrypted_content.clone(),
                    iv: wire.iv.clone(),
                };
                let plaintext = CryptoManager::decrypt_message(&key, &envelope)?;
                let message = wire.into_plain(plaintext);
                return Ok(self
                    .first_delivery(generation, message.id)
                    .await
                    .then_some(SyncEvent::ChatMessage {
                        message,
                        encrypted: true,
                    }));
            }
            Topic::ReadReceipt => SyncEvent::ReadReceipt(decode::<ReadReceipt>(body)?),
            Topic::Typing => SyncEvent::Typing(decode::<TypingIndicator>(body)?),
            Topic::Schedule => SyncEvent::Schedule(decode::<ScheduleSync>(body)?),
            Topic::Bucket => SyncEvent::Bucket(decode::<BucketSync>(body)?),
            Topic::Finance => SyncEvent::Finance(decode::<FinanceSync>(body)?),
        };
        Ok(Some(event))
    }

    async fn first_delivery(&self, generation: u64, id: i64) -> bool {
        let mut session = self.session.lock().await;
        if !session.is_current(generation) {
            return false;
        }
        let first = session.first_delivery(id);
        if !first {
            debug!("duplicate chat message {} skipped", id);
        }
        first
    }

    /// Bookkeeping after a session task ends with an error.
    async fn on_connection_lost(self: &Arc<Self>, generation: u64, err: DuetError) {
        let mut session = self.session.lock().await;
        if !session.is_current(generation) {
            debug!("stale session ended: {}", err);
            return;
        }

        let was = session.state;
        session.outbound = None;
        self.set_state(&mut session, ConnectionState::Disconnected);
        if was == ConnectionState::Connected {
            warn!("realtime connection lost: {}", err);
            if let Some(sink) = &session.sink {
                sink.emit(SyncEvent::Disconnected {
                    reason: Some(err.to_string()),
                });
            }
        } else {
            warn!("realtime connect failed: {}", err);
        }

        if session.credential.is_none() || session.pairing_id.is_none() {
            session.active = false;
            return;
        }

        session.attempts += 1;
        let attempt = session.attempts;
        let max = self.settings.reconnect.max_attempts;
        if attempt > max {
            error!("giving up after {} reconnect attempts", max);
            session.active = false;
            if let Some(sink) = &session.sink {
                sink.emit(SyncEvent::Error(format!(
                    "connection lost; gave up after {max} reconnect attempts: {err}"
                )));
            }
            return;
        }

        let delay = self.settings.reconnect.delay(attempt);
        warn!("reconnect attempt {}/{} in {:?}", attempt, max, delay);
        session.reconnect_task = Some(schedule_reconnect(self.clone(), generation, delay));
    }
}

fn spawn_connection(inner: Arc<Inner>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = inner.run_session(generation).await {
            inner.on_connection_lost(generation, e).await;
        }
    })
}

fn schedule_reconnect(inner: Arc<Inner>, generation: u64, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;

        let mut session = inner.session.lock().await;
        if !session.is_current(generation) {
            info!("reconnect cancelled");
            return;
        }
        inner.set_state(&mut session, ConnectionState::Connecting);
        session.connection_task = Some(spawn_connection(inner.clone(), generation));
    })
}

fn stop_tasks(session: &mut Session) {
    if let Some(handle) = session.reconnect_task.take() {
        handle.abort();
    }
    if let Some(handle) = session.connection_task.take() {
        handle.abort();
    }
}

fn socket_url(ws_url: &str, token: &str) -> DuetResult<url::Url> {
    let mut url = url::Url::parse(ws_url)
        .map_err(|e| DuetError::Config(format!("invalid websocket url {ws_url:?}: {e}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

async fn send_text(link: &Link, text: String) -> DuetResult<()> {
    link.outbound
        .send(text)
        .await
        .map_err(|_| DuetError::Connection("transport closed".into()))
}

fn error_frame(frame: &Frame) -> DuetError {
    let message = frame.get("message").unwrap_or("no message");
    DuetError::Connection(format!("broker error: {message}"))
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> DuetResult<T> {
    serde_json::from_str(body).map_err(|e| DuetError::Decode(e.to_string()))
}

fn new_temp_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
