use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{self, GatewayFrame, Opcode};
use super::events::{
    close_code, event_name, ConnectionProperties, DispatchEvent, HelloData, IdentifyData,
    PresenceData, ReadyData, ResumeData, UpdateVoiceStateData,
};
use super::heartbeat::{HeartbeatMonitor, HeartbeatTimer, TickOutcome, HELLO_TIMEOUT};
use crate::error::{Error, Result};

pub const GATEWAY_VERSION: u8 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Resumption data for one logical session. Memory-resident only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: String,
    pub last_sequence: u64,
    pub resume_gateway_url: String,
    pub shard_id: u32,
    pub shard_count: u32,
}

impl SessionState {
    /// Record a dispatch sequence number. Returns the number of skipped
    /// sequence numbers, if any.
    pub fn observe_sequence(&mut self, seq: u64) -> Option<u64> {
        if seq <= self.last_sequence {
            return None;
        }
        let gap = seq - self.last_sequence - 1;
        self.last_sequence = seq;
        (gap > 0).then_some(gap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Resumable,
    NonResumable,
    Fatal,
}

/// Classify a close code. `None` is a dropped connection without a close frame.
pub fn classify_close(code: Option<u16>) -> DisconnectKind {
    match code {
        Some(close_code::AUTH_FAILED)
        | Some(close_code::INVALID_SHARD)
        | Some(close_code::SHARDING_REQUIRED)
        | Some(close_code::INVALID_API_VERSION)
        | Some(close_code::INVALID_INTENTS)
        | Some(close_code::DISALLOWED_INTENTS) => DisconnectKind::Fatal,
        Some(close_code::NORMAL)
        | Some(close_code::GOING_AWAY)
        | Some(close_code::NOT_AUTHENTICATED)
        | Some(close_code::INVALID_SEQ)
        | Some(close_code::SESSION_TIMED_OUT) => DisconnectKind::NonResumable,
        _ => DisconnectKind::Resumable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Identify,
    Resume,
}

/// Apply a disconnect to the stored session and pick the next handshake.
/// A resume happens only when the disconnect was resumable and a session
/// survived it.
pub fn after_disconnect(kind: DisconnectKind, session: &mut Option<SessionState>) -> Handshake {
    if kind != DisconnectKind::Resumable {
        *session = None;
    }
    match session {
        Some(_) => Handshake::Resume,
        None => Handshake::Identify,
    }
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Upper bound for the next delay.
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    pub intents: u64,
    pub shard_id: u32,
    pub shard_count: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive undecodable frames tolerated before the connection is torn down.
    pub malformed_frame_limit: u32,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("shard_id", &self.shard_id)
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

/// Append the protocol query to a gateway base URL.
pub fn gateway_url(base: &str) -> String {
    let base = base.split('?').next().unwrap_or(base).trim_end_matches('/');
    format!("{base}/?v={GATEWAY_VERSION}&encoding=json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStatus {
    pub status: ConnectionStatus,
    pub latency: Option<Duration>,
}

enum Control {
    Send(GatewayFrame),
    Reconnect,
}

/// Cloneable write side of a shard. Sends are rejected while the connection is
/// not established instead of being queued onto a dead socket.
#[derive(Clone)]
pub struct GatewayHandle {
    shard_id: u32,
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<ShardStatus>,
    reconnect_lock: Arc<Mutex<()>>,
}

impl GatewayHandle {
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn status(&self) -> ShardStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().status == ConnectionStatus::Connected
    }

    /// Resolves once the shard reports `Connected`.
    pub async fn wait_connected(&mut self) -> Result<()> {
        self.status
            .wait_for(|s| s.status == ConnectionStatus::Connected)
            .await
            .map(|_| ())
            .map_err(|_| Error::NotConnected)
    }

    pub fn send(&self, frame: GatewayFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.control
            .send(Control::Send(frame))
            .map_err(|_| Error::NotConnected)
    }

    /// Opcode 4: join, move, or leave (`channel_id = None`) a voice channel.
    pub fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        let data = UpdateVoiceStateData {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.map(str::to_string),
            self_mute,
            self_deaf,
        };
        self.send(GatewayFrame::with_data(Opcode::VoiceStateUpdate, &data))
    }

    /// Opcode 3: replace the bot's activity and status on this shard.
    pub fn update_presence(&self, presence: &PresenceData) -> Result<()> {
        self.send(GatewayFrame::with_data(Opcode::PresenceUpdate, presence))
    }

    /// Ask the session to drop the socket and resume. Returns false if a
    /// reconnect is already in flight.
    pub fn request_reconnect(&self) -> bool {
        match self.reconnect_lock.try_lock() {
            Ok(_guard) => self.control.send(Control::Reconnect).is_ok(),
            Err(_) => false,
        }
    }
}

/// Why a single connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    Shutdown,
    Closed(Option<u16>),
    InvalidSession { resumable: bool },
    /// Server opcode 7 or a local request.
    ReconnectRequested,
    HeartbeatFailed,
    ProtocolViolation,
    Network(Error),
}

impl ConnectionEnd {
    fn kind(&self) -> DisconnectKind {
        match self {
            ConnectionEnd::Closed(code) => classify_close(*code),
            ConnectionEnd::InvalidSession { resumable: false } => DisconnectKind::NonResumable,
            ConnectionEnd::Shutdown => DisconnectKind::NonResumable,
            _ => DisconnectKind::Resumable,
        }
    }
}

/// Owns one shard's connection lifecycle: handshake, sequence tracking,
/// heartbeats, reconnect policy and event fan-out.
pub struct GatewaySession {
    config: GatewayConfig,
    session: Option<SessionState>,
    backoff: Backoff,
    heartbeat: HeartbeatMonitor,
    malformed: u32,
    events: mpsc::UnboundedSender<DispatchEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    status: watch::Sender<ShardStatus>,
    reconnect_lock: Arc<Mutex<()>>,
    /// Held from the start of a reconnect until READY/RESUMED.
    reconnect_guard: Option<OwnedMutexGuard<()>>,
    cancel: CancellationToken,
}

impl GatewaySession {
    pub fn new(
        config: GatewayConfig,
        events: mpsc::UnboundedSender<DispatchEvent>,
        cancel: CancellationToken,
    ) -> (Self, GatewayHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ShardStatus {
            status: ConnectionStatus::Disconnected,
            latency: None,
        });
        let reconnect_lock = Arc::new(Mutex::new(()));
        let handle = GatewayHandle {
            shard_id: config.shard_id,
            control: control_tx,
            status: status_rx,
            reconnect_lock: reconnect_lock.clone(),
        };
        let session = Self {
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            config,
            session: None,
            heartbeat: HeartbeatMonitor::new(),
            malformed: 0,
            events,
            control: control_rx,
            status: status_tx,
            reconnect_lock,
            reconnect_guard: None,
            cancel,
        };
        (session, handle)
    }

    /// Run until cancelled (`Ok`) or a fatal close (`Err`).
    pub async fn run(mut self) -> Result<()> {
        let shard = self.config.shard_id;
        let mut delay = Duration::ZERO;

        loop {
            if self.reconnect_guard.is_none() {
                self.reconnect_guard = Some(self.reconnect_lock.clone().lock_owned().await);
            }
            self.set_status(ConnectionStatus::Connecting);

            if !delay.is_zero() {
                tracing::debug!(shard, ?delay, attempt = self.backoff.attempt(), "waiting before reconnect");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let url = match &self.session {
                Some(s) => gateway_url(&s.resume_gateway_url),
                None => gateway_url(&self.config.url),
            };
            let end = match self.connect(&url).await {
                Ok(ws) => self.drive(ws).await,
                Err(e) => ConnectionEnd::Network(e),
            };

            self.heartbeat.stop();
            self.set_status(ConnectionStatus::Disconnected);
            self.drain_stale_commands();

            if let ConnectionEnd::Shutdown = end {
                break;
            }

            let kind = end.kind();
            match &end {
                ConnectionEnd::Closed(code) => {
                    tracing::warn!(shard, close_code = ?code, ?kind, "gateway connection closed")
                }
                ConnectionEnd::Network(e) => tracing::warn!(shard, "gateway connection failed: {e}"),
                other => tracing::info!(shard, reason = ?other, ?kind, "gateway connection ended"),
            }

            if kind == DisconnectKind::Fatal {
                let code = match end {
                    ConnectionEnd::Closed(Some(code)) => code,
                    _ => 0,
                };
                tracing::error!(shard, close_code = code, "gateway rejected this client, not retrying");
                return Err(if code == close_code::AUTH_FAILED {
                    Error::AuthenticationRejected
                } else {
                    Error::FatalClose { code }
                });
            }

            let next = after_disconnect(kind, &mut self.session);
            tracing::debug!(shard, ?next, "scheduling reconnect");
            delay = self.backoff.next_delay();
        }

        self.set_status(ConnectionStatus::Disconnected);
        tracing::info!(shard, "gateway session stopped");
        Ok(())
    }

    async fn connect(&self, url: &str) -> Result<WsStream> {
        tracing::debug!(shard = self.config.shard_id, url, "connecting to gateway");
        let (ws, _) = tokio::time::timeout(HELLO_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| Error::DisconnectedResumable(None))??;
        Ok(ws)
    }

    async fn drive(&mut self, ws: WsStream) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();
        self.malformed = 0;

        let hello = match tokio::time::timeout(HELLO_TIMEOUT, self.wait_hello(&mut stream)).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(end)) => return end,
            Err(_) => {
                tracing::warn!(shard = self.config.shard_id, "no HELLO within timeout");
                return ConnectionEnd::Network(Error::ProtocolViolation("hello timeout".into()));
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        let handshake = self.handshake_frame();
        if let Err(e) = send_frame(&mut sink, &handshake).await {
            return ConnectionEnd::Network(e);
        }

        self.heartbeat.start(interval);
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let _timer = HeartbeatTimer::spawn(interval, tick_tx);
        let cancel = self.cancel.clone();

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ConnectionEnd::Shutdown,
                Some(at) = tick_rx.recv() => match self.heartbeat.on_tick(at) {
                    TickOutcome::Send => {
                        if let Err(e) = send_frame(&mut sink, &self.heartbeat_frame()).await {
                            break ConnectionEnd::Network(e);
                        }
                    }
                    TickOutcome::Failed => {
                        tracing::warn!(shard = self.config.shard_id, "heartbeat not acknowledged, connection is a zombie");
                        break ConnectionEnd::HeartbeatFailed;
                    }
                    TickOutcome::Ignored => {}
                },
                Some(control) = self.control.recv() => match control {
                    Control::Send(frame) => {
                        if let Err(e) = send_frame(&mut sink, &frame).await {
                            break ConnectionEnd::Network(e);
                        }
                    }
                    Control::Reconnect => break ConnectionEnd::ReconnectRequested,
                },
                msg = stream.next() => match msg {
                    None => break ConnectionEnd::Closed(None),
                    Some(Err(e)) => break ConnectionEnd::Network(e.into()),
                    Some(Ok(Message::Close(frame))) => {
                        break ConnectionEnd::Closed(frame.map(|f| u16::from(f.code)))
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.handle_payload(text.as_bytes(), &mut sink).await {
                            break end;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Some(end) = self.handle_payload(&bytes, &mut sink).await {
                            break end;
                        }
                    }
                    Some(Ok(_)) => {}
                },
            }
        };

        // Anything but a clean shutdown keeps the session resumable on the
        // remote side, so close with a non-1000 code.
        let code = match end {
            ConnectionEnd::Shutdown => close_code::NORMAL,
            ConnectionEnd::Closed(_) | ConnectionEnd::Network(_) => return end,
            _ => close_code::CLIENT_RECONNECT,
        };
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })))
            .await;
        end
    }

    async fn wait_hello(
        &mut self,
        stream: &mut WsSource,
    ) -> std::result::Result<HelloData, ConnectionEnd> {
        loop {
            let bytes = match stream.next().await {
                None => return Err(ConnectionEnd::Closed(None)),
                Some(Err(e)) => return Err(ConnectionEnd::Network(e.into())),
                Some(Ok(Message::Close(frame))) => {
                    return Err(ConnectionEnd::Closed(frame.map(|f| u16::from(f.code))))
                }
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(_)) => continue,
            };
            match codec::decode(&bytes) {
                Ok(frame) if frame.opcode == Opcode::Hello => {
                    match frame.payload_as::<HelloData>() {
                        Ok(hello) => return Ok(hello),
                        Err(e) => {
                            if self.note_malformed(&e) {
                                return Err(ConnectionEnd::ProtocolViolation);
                            }
                        }
                    }
                }
                Ok(frame) => {
                    tracing::debug!(shard = self.config.shard_id, op = frame.opcode.as_u8(), "ignoring frame before HELLO")
                }
                Err(e) => {
                    if self.note_malformed(&e) {
                        return Err(ConnectionEnd::ProtocolViolation);
                    }
                }
            }
        }
    }

    fn handshake_frame(&self) -> GatewayFrame {
        match &self.session {
            Some(state) => {
                tracing::info!(shard = self.config.shard_id, seq = state.last_sequence, "resuming gateway session");
                GatewayFrame::with_data(
                    Opcode::Resume,
                    &ResumeData {
                        token: self.config.token.clone(),
                        session_id: state.session_id.clone(),
                        seq: state.last_sequence,
                    },
                )
            }
            None => {
                tracing::info!(shard = self.config.shard_id, "identifying");
                GatewayFrame::with_data(
                    Opcode::Identify,
                    &IdentifyData {
                        token: self.config.token.clone(),
                        intents: self.config.intents,
                        properties: ConnectionProperties::default(),
                        shard: Some([self.config.shard_id, self.config.shard_count]),
                    },
                )
            }
        }
    }

    fn heartbeat_frame(&self) -> GatewayFrame {
        GatewayFrame::heartbeat(self.session.as_ref().map(|s| s.last_sequence))
    }

    /// Returns true once the malformed-frame limit is exceeded.
    fn note_malformed(&mut self, error: &dyn std::error::Error) -> bool {
        self.malformed += 1;
        tracing::warn!(
            shard = self.config.shard_id,
            count = self.malformed,
            "dropping malformed gateway frame: {error}"
        );
        self.malformed > self.config.malformed_frame_limit
    }

    async fn handle_payload(&mut self, bytes: &[u8], sink: &mut WsSink) -> Option<ConnectionEnd> {
        let frame = match codec::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                return self
                    .note_malformed(&e)
                    .then_some(ConnectionEnd::ProtocolViolation);
            }
        };
        self.malformed = 0;
        let shard = self.config.shard_id;

        match frame.opcode {
            Opcode::Dispatch => return self.handle_dispatch(frame),
            Opcode::Heartbeat => {
                if self.heartbeat.on_request(Instant::now()) == TickOutcome::Send {
                    if let Err(e) = send_frame(sink, &self.heartbeat_frame()).await {
                        return Some(ConnectionEnd::Network(e));
                    }
                }
            }
            Opcode::HeartbeatAck => {
                self.heartbeat.on_ack(Instant::now());
                let latency = self.heartbeat.latency();
                self.status.send_modify(|s| s.latency = latency);
            }
            Opcode::Reconnect => {
                tracing::info!(shard, "gateway asked us to reconnect");
                return Some(ConnectionEnd::ReconnectRequested);
            }
            Opcode::InvalidSession => {
                let resumable = frame.payload.as_bool().unwrap_or(false);
                tracing::warn!(shard, resumable, "session invalidated");
                return Some(ConnectionEnd::InvalidSession { resumable });
            }
            Opcode::Hello => tracing::debug!(shard, "duplicate HELLO ignored"),
            other => tracing::debug!(shard, op = other.as_u8(), "ignoring gateway opcode"),
        }
        None
    }

    fn handle_dispatch(&mut self, frame: GatewayFrame) -> Option<ConnectionEnd> {
        let shard = self.config.shard_id;
        // decode() guarantees both on dispatch frames
        let (Some(seq), Some(name)) = (frame.sequence, frame.event_name) else {
            return None;
        };

        if let Some(state) = self.session.as_mut() {
            if let Some(missed) = state.observe_sequence(seq) {
                tracing::warn!(shard, seq, missed, "sequence gap in dispatch stream");
            }
        }

        match name.as_str() {
            event_name::READY => {
                let ready: ReadyData = match serde_json::from_value(frame.payload.clone()) {
                    Ok(ready) => ready,
                    Err(e) => {
                        return self
                            .note_malformed(&e)
                            .then_some(ConnectionEnd::ProtocolViolation)
                    }
                };
                let [shard_id, shard_count] = ready
                    .shard
                    .unwrap_or([self.config.shard_id, self.config.shard_count]);
                tracing::info!(
                    shard,
                    user = %ready.user.username,
                    user_id = %ready.user.id,
                    "gateway session ready"
                );
                self.session = Some(SessionState {
                    session_id: ready.session_id,
                    last_sequence: seq,
                    resume_gateway_url: ready.resume_gateway_url,
                    shard_id,
                    shard_count,
                });
                self.on_established();
            }
            event_name::RESUMED => {
                tracing::info!(shard, seq, "gateway session resumed");
                self.on_established();
            }
            _ => {}
        }

        let event = DispatchEvent {
            shard_id: shard,
            sequence: seq,
            name,
            payload: frame.payload,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(shard, "event receiver dropped");
        }
        None
    }

    fn on_established(&mut self) {
        self.backoff.reset();
        self.reconnect_guard = None;
        self.set_status(ConnectionStatus::Connected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|s| {
            let changed = s.status != status;
            s.status = status;
            changed
        });
    }

    fn drain_stale_commands(&mut self) {
        while let Ok(control) = self.control.try_recv() {
            if let Control::Send(frame) = control {
                tracing::debug!(
                    shard = self.config.shard_id,
                    op = frame.opcode.as_u8(),
                    "discarding command queued on a dead connection"
                );
            }
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &GatewayFrame) -> Result<()> {
    sink.send(Message::Text(codec::encode(frame).into())).await?;
    Ok(())
}
