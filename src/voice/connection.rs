use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::crypto::{EncryptionMode, VoiceCipher, KEY_LEN};
use super::events::{
    close_code, opcode, ClientDisconnect, IncomingSpeaking, OutgoingSpeaking, SelectProtocol,
    SelectProtocolData, SessionDescription, VoiceFrame, VoiceHello, VoiceIdentify, VoiceReady,
    VoiceResume, SPEAKING_MICROPHONE, VOICE_GATEWAY_VERSION,
};
use super::transport::{receive_loop, VoiceTransport};
use super::udp;
use crate::audio::pipeline::InboundPacket;
use crate::error::{Error, Result};
use crate::gateway::heartbeat::{HeartbeatMonitor, HeartbeatTimer, TickOutcome};
use crate::gateway::session::Backoff;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Upper bound on one voice handshake, socket open to session description.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive failed reconnects before the call is abandoned.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const NORMAL_CLOSE: u16 = 1000;
const CLIENT_RECONNECT_CLOSE: u16 = 4900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePhase {
    Disconnected,
    AwaitingServerInfo,
    ConnectingVoiceSocket,
    AwaitingSessionDescription,
    Ready,
}

/// Endpoint and token from a VOICE_SERVER_UPDATE.
#[derive(Clone, PartialEq, Eq)]
pub struct VoiceServerInfo {
    pub endpoint: String,
    pub token: String,
}

impl fmt::Debug for VoiceServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceServerInfo")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open a voice connection: the paired state and
/// server updates from the main gateway.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub guild_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub session_id: String,
    pub server: VoiceServerInfo,
}

/// Negotiated parameters of a live voice session.
#[derive(Clone)]
pub struct VoiceSessionState {
    pub guild_id: String,
    pub channel_id: String,
    pub endpoint: String,
    pub voice_token: String,
    pub ssrc: u32,
    pub secret_key: [u8; KEY_LEN],
    pub encryption_mode: EncryptionMode,
}

impl fmt::Debug for VoiceSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSessionState")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("voice_token", &"<redacted>")
            .field("ssrc", &self.ssrc)
            .field("secret_key", &"<redacted>")
            .field("encryption_mode", &self.encryption_mode)
            .finish()
    }
}

/// What to do after the voice socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceDisconnect {
    /// Reconnect to the same endpoint and resume.
    Resume,
    /// Reconnect and identify from scratch.
    Reidentify,
    /// The call is over.
    End,
}

pub fn classify_voice_close(code: Option<u16>) -> VoiceDisconnect {
    match code {
        Some(close_code::AUTH_FAILED)
        | Some(close_code::SESSION_INVALID)
        | Some(close_code::SERVER_NOT_FOUND)
        | Some(close_code::UNKNOWN_PROTOCOL)
        | Some(close_code::DISCONNECTED)
        | Some(close_code::UNKNOWN_ENCRYPTION_MODE) => VoiceDisconnect::End,
        Some(close_code::NOT_AUTHENTICATED) | Some(close_code::SESSION_TIMEOUT) => {
            VoiceDisconnect::Reidentify
        }
        _ => VoiceDisconnect::Resume,
    }
}

/// `wss://` unless the endpoint already names a scheme.
pub fn voice_url(endpoint: &str) -> String {
    let base = if endpoint.contains("://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("wss://{}", endpoint.trim_end_matches('/'))
    };
    format!("{base}/?v={VOICE_GATEWAY_VERSION}")
}

pub enum ConnectionCommand {
    Speaking(bool),
    /// Region migration: move to a new endpoint without ending the call.
    Migrate(VoiceServerInfo),
}

#[derive(Debug, Clone)]
pub struct VoiceConnectionConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for VoiceConnectionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// Channels the rest of the call uses to observe and steer a connection.
pub struct ConnectionHandles {
    pub commands: mpsc::UnboundedSender<ConnectionCommand>,
    pub phase: watch::Receiver<VoicePhase>,
    pub transport: watch::Receiver<Option<Arc<VoiceTransport>>>,
}

#[derive(Debug)]
enum VoiceEnd {
    Shutdown,
    Closed(Option<u16>),
    Migrate(VoiceServerInfo),
    HeartbeatFailed,
    Failed(Error),
}

/// Drives one guild's voice control socket: handshake, UDP setup,
/// heartbeats and reconnects. The published transport is `Some` only while
/// the phase is `Ready`.
pub struct VoiceConnection {
    info: ConnectionInfo,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    phase: watch::Sender<VoicePhase>,
    transport: watch::Sender<Option<Arc<VoiceTransport>>>,
    /// Kept across reconnects so a resume continues the same UDP session.
    session: Option<(VoiceSessionState, Arc<VoiceTransport>)>,
    ssrc_users: Arc<DashMap<u32, String>>,
    inbound: Option<mpsc::Sender<InboundPacket>>,
    heartbeat: HeartbeatMonitor,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl VoiceConnection {
    pub fn new(
        info: ConnectionInfo,
        config: VoiceConnectionConfig,
        ssrc_users: Arc<DashMap<u32, String>>,
        inbound: Option<mpsc::Sender<InboundPacket>>,
        cancel: CancellationToken,
    ) -> (Self, ConnectionHandles) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(VoicePhase::ConnectingVoiceSocket);
        let (transport_tx, transport_rx) = watch::channel(None);
        let connection = Self {
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            info,
            commands: commands_rx,
            phase: phase_tx,
            transport: transport_tx,
            session: None,
            ssrc_users,
            inbound,
            heartbeat: HeartbeatMonitor::new(),
            cancel,
        };
        let handles = ConnectionHandles {
            commands: commands_tx,
            phase: phase_rx,
            transport: transport_rx,
        };
        (connection, handles)
    }

    pub async fn run(mut self) {
        let guild_id = self.info.guild_id.clone();
        let mut delay = Duration::ZERO;

        loop {
            if !delay.is_zero() {
                tracing::debug!(%guild_id, ?delay, "waiting before voice reconnect");
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = &mut sleep => break,
                        command = self.commands.recv() => match command {
                            Some(ConnectionCommand::Migrate(server)) => {
                                self.info.server = server;
                                self.session = None;
                                break;
                            }
                            // not speaking while disconnected
                            Some(ConnectionCommand::Speaking(_)) => {}
                            None => self.cancel.cancel(),
                        },
                    }
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.phase.send_replace(VoicePhase::ConnectingVoiceSocket);

            let url = voice_url(&self.info.server.endpoint);
            let end = match connect(&url).await {
                Ok(ws) => self.drive(ws).await,
                Err(e) => VoiceEnd::Failed(e),
            };
            self.heartbeat.stop();
            self.transport.send_replace(None);

            match end {
                VoiceEnd::Shutdown => break,
                VoiceEnd::Migrate(server) => {
                    tracing::info!(%guild_id, endpoint = %server.endpoint, "voice server moved, reconnecting");
                    self.info.server = server;
                    self.session = None;
                    self.backoff.reset();
                    delay = Duration::ZERO;
                    continue;
                }
                VoiceEnd::Closed(code) => match classify_voice_close(code) {
                    VoiceDisconnect::End => {
                        tracing::warn!(%guild_id, close_code = ?code, "voice connection closed for good");
                        break;
                    }
                    VoiceDisconnect::Reidentify => {
                        tracing::info!(%guild_id, close_code = ?code, "voice session expired, identifying again");
                        self.session = None;
                    }
                    VoiceDisconnect::Resume => {
                        tracing::info!(%guild_id, close_code = ?code, "voice connection dropped, resuming")
                    }
                },
                VoiceEnd::HeartbeatFailed => {
                    tracing::warn!(%guild_id, "voice heartbeat not acknowledged")
                }
                VoiceEnd::Failed(e) => tracing::warn!(%guild_id, "voice connection failed: {e}"),
            }

            if self.backoff.attempt() >= MAX_RECONNECT_ATTEMPTS {
                tracing::error!(%guild_id, "giving up on voice connection");
                break;
            }
            delay = self.backoff.next_delay();
        }

        self.transport.send_replace(None);
        self.phase.send_replace(VoicePhase::Disconnected);
        tracing::info!(%guild_id, "voice connection stopped");
    }

    async fn drive(&mut self, ws: WsStream) -> VoiceEnd {
        let (mut sink, mut stream) = ws.split();

        let cancel = self.cancel.clone();
        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut sink, &mut stream));
        let (interval, transport) = tokio::select! {
            _ = cancel.cancelled() => return VoiceEnd::Shutdown,
            result = handshake => match result {
                Ok(Ok(established)) => established,
                Ok(Err(end)) => return end,
                Err(_) => return VoiceEnd::Failed(Error::VoiceNegotiationTimeout),
            },
        };

        let connection_cancel = self.cancel.child_token();
        let _stop_receive = connection_cancel.clone().drop_guard();
        if let Some(inbound) = &self.inbound {
            tokio::spawn(receive_loop(transport.clone(), inbound.clone(), connection_cancel));
        }

        self.backoff.reset();
        self.transport.send_replace(Some(transport.clone()));
        self.phase.send_replace(VoicePhase::Ready);
        tracing::info!(guild_id = %self.info.guild_id, ssrc = transport.ssrc(), "voice connection ready");

        self.heartbeat.start(interval);
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let _timer = HeartbeatTimer::spawn(interval, tick_tx);

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break VoiceEnd::Shutdown,
                Some(at) = tick_rx.recv() => match self.heartbeat.on_tick(at) {
                    TickOutcome::Send => {
                        let frame = VoiceFrame::new(opcode::HEARTBEAT, &heartbeat_nonce());
                        if let Err(e) = send_frame(&mut sink, &frame).await {
                            break VoiceEnd::Failed(e);
                        }
                    }
                    TickOutcome::Failed => break VoiceEnd::HeartbeatFailed,
                    TickOutcome::Ignored => {}
                },
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Speaking(speaking)) => {
                        let frame = VoiceFrame::new(
                            opcode::SPEAKING,
                            &OutgoingSpeaking {
                                speaking: if speaking { SPEAKING_MICROPHONE } else { 0 },
                                delay: 0,
                                ssrc: transport.ssrc(),
                            },
                        );
                        if let Err(e) = send_frame(&mut sink, &frame).await {
                            break VoiceEnd::Failed(e);
                        }
                    }
                    Some(ConnectionCommand::Migrate(server)) => break VoiceEnd::Migrate(server),
                    None => break VoiceEnd::Shutdown,
                },
                msg = stream.next() => match read_frame(msg) {
                    Ok(Some(frame)) => self.handle_frame(frame),
                    Ok(None) => {}
                    Err(end) => break end,
                },
            }
        };

        let code = match end {
            VoiceEnd::Shutdown | VoiceEnd::Migrate(_) => NORMAL_CLOSE,
            VoiceEnd::Closed(_) => return end,
            _ => CLIENT_RECONNECT_CLOSE,
        };
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })))
            .await;
        end
    }

    /// Hello, identify or resume, and on identify the UDP setup through to
    /// the session description.
    async fn handshake(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsSource,
    ) -> std::result::Result<(Duration, Arc<VoiceTransport>), VoiceEnd> {
        let hello: VoiceHello = self.expect(stream, opcode::HELLO).await?;
        let interval = Duration::from_secs_f64(hello.heartbeat_interval.max(1.0) / 1000.0);

        if let Some((state, transport)) = self.session.clone() {
            tracing::debug!(guild_id = %state.guild_id, "resuming voice session");
            let resume = VoiceFrame::new(
                opcode::RESUME,
                &VoiceResume {
                    server_id: self.info.guild_id.clone(),
                    session_id: self.info.session_id.clone(),
                    token: self.info.server.token.clone(),
                },
            );
            send_frame(sink, &resume).await.map_err(VoiceEnd::Failed)?;
            self.expect_op(stream, opcode::RESUMED).await?;
            return Ok((interval, transport));
        }

        let identify = VoiceFrame::new(
            opcode::IDENTIFY,
            &VoiceIdentify {
                server_id: self.info.guild_id.clone(),
                user_id: self.info.user_id.clone(),
                session_id: self.info.session_id.clone(),
                token: self.info.server.token.clone(),
            },
        );
        send_frame(sink, &identify).await.map_err(VoiceEnd::Failed)?;
        let ready: VoiceReady = self.expect(stream, opcode::READY).await?;

        let mode = EncryptionMode::negotiate(&ready.modes).ok_or_else(|| {
            VoiceEnd::Failed(Error::ProtocolViolation(format!(
                "no supported encryption mode in {:?}",
                ready.modes
            )))
        })?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| VoiceEnd::Failed(e.into()))?;
        socket
            .connect((ready.ip.as_str(), ready.port))
            .await
            .map_err(|e| VoiceEnd::Failed(e.into()))?;
        let external = udp::discover(&socket, ready.ssrc)
            .await
            .map_err(|e| VoiceEnd::Failed(e.into()))?;
        tracing::debug!(ssrc = ready.ssrc, ip = %external.ip, port = external.port, "ip discovery complete");

        let select = VoiceFrame::new(
            opcode::SELECT_PROTOCOL,
            &SelectProtocol {
                protocol: "udp",
                data: SelectProtocolData {
                    address: external.ip,
                    port: external.port,
                    mode: mode.as_str().to_string(),
                },
            },
        );
        send_frame(sink, &select).await.map_err(VoiceEnd::Failed)?;
        self.phase.send_replace(VoicePhase::AwaitingSessionDescription);

        let description: SessionDescription =
            self.expect(stream, opcode::SESSION_DESCRIPTION).await?;
        let mode: EncryptionMode = description
            .mode
            .parse()
            .map_err(|e: super::crypto::CryptoError| VoiceEnd::Failed(e.into()))?;
        let secret_key: [u8; KEY_LEN] = description.secret_key.as_slice().try_into().map_err(|_| {
            VoiceEnd::Failed(Error::ProtocolViolation(format!(
                "voice secret key has {} bytes",
                description.secret_key.len()
            )))
        })?;
        let cipher = VoiceCipher::new(mode, &secret_key).map_err(|e| VoiceEnd::Failed(e.into()))?;

        let transport = Arc::new(VoiceTransport::new(Arc::new(socket), ready.ssrc, cipher));
        let state = VoiceSessionState {
            guild_id: self.info.guild_id.clone(),
            channel_id: self.info.channel_id.clone(),
            endpoint: self.info.server.endpoint.clone(),
            voice_token: self.info.server.token.clone(),
            ssrc: ready.ssrc,
            secret_key,
            encryption_mode: mode,
        };
        tracing::debug!(session = ?state, "voice session negotiated");
        self.session = Some((state, transport.clone()));
        Ok((interval, transport))
    }

    async fn expect<T: serde::de::DeserializeOwned>(
        &mut self,
        stream: &mut WsSource,
        op: u8,
    ) -> std::result::Result<T, VoiceEnd> {
        let frame = self.expect_op(stream, op).await?;
        frame.data().map_err(|e| {
            VoiceEnd::Failed(Error::ProtocolViolation(format!("voice op {op} payload: {e}")))
        })
    }

    /// Read until a frame with opcode `op` arrives; other frames are handled
    /// as usual.
    async fn expect_op(
        &mut self,
        stream: &mut WsSource,
        op: u8,
    ) -> std::result::Result<VoiceFrame, VoiceEnd> {
        loop {
            match read_frame(stream.next().await)? {
                Some(frame) if frame.op == op => return Ok(frame),
                Some(frame) => self.handle_frame(frame),
                None => {}
            }
        }
    }

    fn handle_frame(&mut self, frame: VoiceFrame) {
        match frame.op {
            opcode::HEARTBEAT_ACK => self.heartbeat.on_ack(Instant::now()),
            opcode::SPEAKING => match frame.data::<IncomingSpeaking>() {
                Ok(speaking) => {
                    self.ssrc_users.insert(speaking.ssrc, speaking.user_id);
                }
                Err(e) => tracing::debug!("bad speaking payload: {e}"),
            },
            opcode::CLIENT_DISCONNECT => {
                if let Ok(gone) = frame.data::<ClientDisconnect>() {
                    self.ssrc_users.retain(|_, user| *user != gone.user_id);
                }
            }
            op => tracing::trace!(op, "ignoring voice opcode"),
        }
    }
}

async fn connect(url: &str) -> Result<WsStream> {
    tracing::debug!(url, "connecting to voice gateway");
    let (ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| Error::VoiceNegotiationTimeout)??;
    Ok(ws)
}

/// `Ok(None)` for frames to skip: pings, undecodable text.
fn read_frame(
    msg: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> std::result::Result<Option<VoiceFrame>, VoiceEnd> {
    let text = match msg {
        None => return Err(VoiceEnd::Closed(None)),
        Some(Err(e)) => return Err(VoiceEnd::Failed(e.into())),
        Some(Ok(Message::Close(frame))) => {
            return Err(VoiceEnd::Closed(frame.map(|f| u16::from(f.code))))
        }
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => return Ok(None),
    };
    match serde_json::from_str::<VoiceFrame>(text.as_str()) {
        Ok(frame) => Ok(Some(frame)),
        Err(e) => {
            tracing::warn!("dropping malformed voice frame: {e}");
            Ok(None)
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &VoiceFrame) -> Result<()> {
    let text = serde_json::to_string(frame)
        .map_err(|e| Error::EncodeDecodeFailure(e.to_string()))?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

fn heartbeat_nonce() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
