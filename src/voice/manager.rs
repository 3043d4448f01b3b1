use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::connection::{
    ConnectionCommand, ConnectionInfo, VoiceConnection, VoiceConnectionConfig, VoicePhase,
    VoiceServerInfo,
};
use super::transport::TransportSink;
use crate::audio::opus::{FrameDecoder, OpusDecoder, OpusEncoder};
use crate::audio::pipeline::{AudioPlayer, AudioReceiver, PlaybackHandle, SpeakerStream};
use crate::audio::AudioSource;
use crate::error::{Error, Result};
use crate::gateway::events::{
    event_name, DispatchEvent, GuildDeleteData, ReadyData, VoiceServerData, VoiceStateData,
};
use crate::gateway::GatewayHandle;

/// Capability to send opcode 4 on the gateway connection that owns a guild.
pub trait VoiceStateSender: Send + Sync {
    fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()>;
}

impl VoiceStateSender for GatewayHandle {
    fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        GatewayHandle::update_voice_state(self, guild_id, channel_id, self_mute, self_deaf)
    }
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Applies separately to the gateway event pair and to the voice
    /// handshake.
    pub negotiation_timeout: Duration,
    /// Decode incoming audio into per-speaker streams.
    pub receive: bool,
    pub connection: VoiceConnectionConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(10),
            receive: false,
            connection: VoiceConnectionConfig::default(),
        }
    }
}

/// A joined voice channel. Cloning shares the same call; the call ends on
/// [`VoiceManager::leave`], a guild removal or a fatal voice close.
#[derive(Clone)]
pub struct Call {
    join_id: u64,
    guild_id: String,
    channel_id: String,
    playback: PlaybackHandle,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    phase: watch::Receiver<VoicePhase>,
    speakers: Arc<Mutex<Option<mpsc::Receiver<SpeakerStream>>>>,
    cancel: CancellationToken,
}

impl Call {
    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn phase(&self) -> VoicePhase {
        *self.phase.borrow()
    }

    pub fn playback(&self) -> PlaybackHandle {
        self.playback.clone()
    }

    pub async fn play(&self, source: impl AudioSource + 'static) -> Result<()> {
        self.playback.play(source).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.playback.stop().await
    }

    /// New remote speakers, when receiving is enabled. Only the first caller
    /// gets the stream.
    pub async fn take_speakers(&self) -> Option<mpsc::Receiver<SpeakerStream>> {
        self.speakers.lock().await.take()
    }

    /// Wait for the voice connection to become ready; fails if it gives up.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut phase = self.phase.clone();
        let reached = phase
            .wait_for(|p| matches!(p, VoicePhase::Ready | VoicePhase::Disconnected))
            .await
            .map(|p| *p)
            .map_err(|_| Error::NotConnected)?;
        match reached {
            VoicePhase::Ready => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    fn migrate(&self, server: VoiceServerInfo) {
        if self.commands.send(ConnectionCommand::Migrate(server)).is_err() {
            tracing::debug!(guild_id = %self.guild_id, "voice connection already gone");
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct PendingJoin {
    join_id: u64,
    channel_id: String,
    session_id: Option<String>,
    server: Option<VoiceServerInfo>,
    ready: oneshot::Sender<ConnectionInfo>,
}

/// Pairs the gateway's voice state and voice server updates into calls.
pub struct VoiceManager {
    gateway: Arc<dyn VoiceStateSender>,
    config: VoiceConfig,
    user_id: OnceLock<String>,
    pending: DashMap<String, PendingJoin>,
    calls: DashMap<String, Call>,
    next_join: AtomicU64,
    cancel: CancellationToken,
}

impl VoiceManager {
    pub fn new(
        gateway: Arc<dyn VoiceStateSender>,
        config: VoiceConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            config,
            user_id: OnceLock::new(),
            pending: DashMap::new(),
            calls: DashMap::new(),
            next_join: AtomicU64::new(1),
            cancel,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    pub fn call(&self, guild_id: &str) -> Option<Call> {
        self.calls.get(guild_id).map(|c| c.clone())
    }

    pub fn phase(&self, guild_id: &str) -> VoicePhase {
        if self.pending.contains_key(guild_id) {
            return VoicePhase::AwaitingServerInfo;
        }
        self.calls
            .get(guild_id)
            .map(|c| c.phase())
            .unwrap_or(VoicePhase::Disconnected)
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Join (or move to) a voice channel and wait until audio can flow. A
    /// later join for the same guild supersedes this one, which then fails
    /// with [`Error::JoinCancelled`].
    pub async fn join(&self, guild_id: &str, channel_id: &str) -> Result<Call> {
        if let Some(call) = self.call(guild_id) {
            if call.channel_id == channel_id && call.phase() == VoicePhase::Ready {
                return Ok(call);
            }
        }

        let join_id = self.next_join.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            guild_id.to_string(),
            PendingJoin {
                join_id,
                channel_id: channel_id.to_string(),
                session_id: None,
                server: None,
                ready: tx,
            },
        );
        // the platform sends no audio to a deafened member
        let self_deaf = !self.config.receive;
        if let Err(e) = self
            .gateway
            .update_voice_state(guild_id, Some(channel_id), false, self_deaf)
        {
            self.pending.remove_if(guild_id, |_, p| p.join_id == join_id);
            return Err(e);
        }
        tracing::info!(%guild_id, %channel_id, join_id, "joining voice channel");

        let info = match tokio::time::timeout(self.config.negotiation_timeout, rx).await {
            Ok(Ok(info)) => info,
            Ok(Err(_)) => {
                tracing::info!(%guild_id, join_id, "voice join superseded");
                return Err(Error::JoinCancelled);
            }
            Err(_) => {
                tracing::warn!(%guild_id, "voice state/server pair did not arrive in time");
                return Err(self.abort_join(guild_id, join_id));
            }
        };

        if let Some((_, previous)) = self.calls.remove(guild_id) {
            previous.shutdown();
        }
        let call = self.start_call(join_id, info)?;
        self.calls.insert(guild_id.to_string(), call.clone());

        match tokio::time::timeout(self.config.negotiation_timeout, call.wait_ready()).await {
            Ok(Ok(())) => Ok(call),
            _ => {
                tracing::warn!(%guild_id, "voice connection did not become ready");
                Err(self.abort_join(guild_id, join_id))
            }
        }
    }

    /// Leave the guild's voice channel, ending any call.
    pub fn leave(&self, guild_id: &str) -> Result<()> {
        self.pending.remove(guild_id);
        if let Some((_, call)) = self.calls.remove(guild_id) {
            call.shutdown();
        }
        self.gateway.update_voice_state(guild_id, None, false, false)
    }

    /// Undo a failed join. Only this join's own pending entry or call is
    /// touched; if a newer join or a leave took over, nothing is sent.
    fn abort_join(&self, guild_id: &str, join_id: u64) -> Error {
        let pending = self
            .pending
            .remove_if(guild_id, |_, p| p.join_id == join_id)
            .is_some();
        let call = self.calls.remove_if(guild_id, |_, c| c.join_id == join_id);
        if let Some((_, call)) = &call {
            call.shutdown();
        }
        if !pending && call.is_none() {
            return Error::JoinCancelled;
        }
        if let Err(e) = self.gateway.update_voice_state(guild_id, None, false, false) {
            tracing::debug!(%guild_id, "could not send voice leave: {e}");
        }
        Error::VoiceNegotiationTimeout
    }

    fn start_call(&self, join_id: u64, info: ConnectionInfo) -> Result<Call> {
        let cancel = self.cancel.child_token();
        let ssrc_users = Arc::new(DashMap::new());

        let (inbound, speakers) = if self.config.receive {
            let (packets_tx, packets_rx) = mpsc::channel(256);
            let (receiver, speakers) = AudioReceiver::new(
                packets_rx,
                ssrc_users.clone(),
                Box::new(|| {
                    OpusDecoder::new().map(|d| Box::new(d) as Box<dyn FrameDecoder>)
                }),
                cancel.clone(),
            );
            tokio::spawn(receiver.run());
            (Some(packets_tx), Some(speakers))
        } else {
            (None, None)
        };

        let guild_id = info.guild_id.clone();
        let channel_id = info.channel_id.clone();
        let (connection, handles) = VoiceConnection::new(
            info,
            self.config.connection.clone(),
            ssrc_users,
            inbound,
            cancel.clone(),
        );

        let sink = Arc::new(TransportSink::new(handles.transport, handles.commands.clone()));
        let encoder = OpusEncoder::new()?;
        let (player, playback) = AudioPlayer::new(sink, Box::new(encoder), cancel.clone());
        player.spawn();
        tokio::spawn(connection.run());

        Ok(Call {
            join_id,
            guild_id,
            channel_id,
            playback,
            commands: handles.commands,
            phase: handles.phase,
            speakers: Arc::new(Mutex::new(speakers)),
            cancel,
        })
    }

    /// Feed a gateway dispatch. Only voice-relevant events do anything.
    pub fn handle_event(&self, event: &DispatchEvent) {
        match event.name.as_str() {
            event_name::READY => {
                if let Ok(ready) = serde_json::from_value::<ReadyData>(event.payload.clone()) {
                    let _ = self.user_id.set(ready.user.id);
                }
            }
            event_name::VOICE_STATE_UPDATE => {
                match serde_json::from_value::<VoiceStateData>(event.payload.clone()) {
                    Ok(state) => self.on_voice_state(state),
                    Err(e) => tracing::debug!("bad VOICE_STATE_UPDATE payload: {e}"),
                }
            }
            event_name::VOICE_SERVER_UPDATE => {
                match serde_json::from_value::<VoiceServerData>(event.payload.clone()) {
                    Ok(server) => self.on_voice_server(server),
                    Err(e) => tracing::debug!("bad VOICE_SERVER_UPDATE payload: {e}"),
                }
            }
            event_name::GUILD_DELETE => {
                if let Ok(guild) = serde_json::from_value::<GuildDeleteData>(event.payload.clone()) {
                    self.pending.remove(&guild.id);
                    if let Some((_, call)) = self.calls.remove(&guild.id) {
                        tracing::info!(guild_id = %guild.id, unavailable = guild.unavailable, "guild removed, ending call");
                        call.shutdown();
                    }
                }
            }
            _ => {}
        }
    }

    fn on_voice_state(&self, state: VoiceStateData) {
        if self.user_id() != Some(state.user_id.as_str()) {
            return;
        }
        let Some(guild_id) = state.guild_id else {
            return;
        };

        if let Some(mut pending) = self.pending.get_mut(&guild_id) {
            if state.channel_id.as_deref() == Some(pending.channel_id.as_str()) {
                pending.session_id = Some(state.session_id);
            }
        } else if state.channel_id.is_none() {
            if let Some((_, call)) = self.calls.remove(&guild_id) {
                tracing::info!(%guild_id, "disconnected from voice");
                call.shutdown();
            }
        } else if let Some(mut call) = self.calls.get_mut(&guild_id) {
            if let Some(channel_id) = state.channel_id {
                call.channel_id = channel_id;
            }
        }
        self.try_complete(&guild_id);
    }

    fn on_voice_server(&self, server: VoiceServerData) {
        let guild_id = server.guild_id;
        let Some(endpoint) = server.endpoint else {
            tracing::debug!(%guild_id, "voice server being reallocated, waiting");
            return;
        };
        let info = VoiceServerInfo {
            endpoint,
            token: server.token,
        };

        if let Some(mut pending) = self.pending.get_mut(&guild_id) {
            pending.server = Some(info);
        } else if let Some(call) = self.call(&guild_id) {
            call.migrate(info);
            return;
        }
        self.try_complete(&guild_id);
    }

    fn try_complete(&self, guild_id: &str) {
        let complete = self
            .pending
            .get(guild_id)
            .is_some_and(|p| p.session_id.is_some() && p.server.is_some());
        if !complete {
            return;
        }
        let (Some(user_id), Some((_, pending))) = (self.user_id(), self.pending.remove(guild_id))
        else {
            return;
        };
        let (Some(session_id), Some(server)) = (pending.session_id, pending.server) else {
            return;
        };
        let info = ConnectionInfo {
            guild_id: guild_id.to_string(),
            channel_id: pending.channel_id,
            user_id: user_id.to_string(),
            session_id,
            server,
        };
        if pending.ready.send(info).is_err() {
            tracing::debug!(%guild_id, "join was abandoned before voice info arrived");
        }
    }
}
