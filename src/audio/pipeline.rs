use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::jitter::{JitterBuffer, Playout};
use super::opus::{FrameDecoder, FrameEncoder, OpusError};
use super::pacer::FramePacer;
use super::rtp::AudioFrame;
use super::source::{next_frame, AudioSource, FrameStatus};
use super::{
    FRAME_DURATION, FRAME_LEN, KEEPALIVE_INTERVAL, SAMPLES_PER_FRAME, SILENCE_FRAME,
    TRAILING_SILENCE_FRAMES,
};
use crate::error::{Error, Result};

/// Where encoded frames go: in production, encrypt and send over the voice
/// UDP socket.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: &AudioFrame) -> Result<()>;
    async fn set_speaking(&self, speaking: bool) -> Result<()>;
}

/// Assigns RTP sequence numbers and timestamps to outgoing payloads.
#[derive(Debug, Clone)]
pub struct FrameSequencer {
    sequence: u16,
    timestamp: u32,
}

impl FrameSequencer {
    /// Random starting point, as RTP recommends.
    pub fn new() -> Self {
        Self::starting_at(rand::random(), rand::random())
    }

    pub fn starting_at(sequence: u16, timestamp: u32) -> Self {
        Self {
            sequence,
            timestamp,
        }
    }

    pub fn next(&mut self, opus_payload: Bytes) -> AudioFrame {
        let frame = AudioFrame {
            sequence: self.sequence,
            timestamp: self.timestamp,
            opus_payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
        frame
    }
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self::new()
    }
}

pub enum PlayerCommand {
    Play(Box<dyn AudioSource>),
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStatus {
    pub playing: bool,
    /// Number of playbacks that have run to completion or been stopped.
    pub completed: u64,
}

/// Caller side of a voice session's audio player.
#[derive(Clone)]
pub struct PlaybackHandle {
    commands: mpsc::Sender<PlayerCommand>,
    status: watch::Receiver<PlayerStatus>,
}

impl PlaybackHandle {
    /// Start playing `source`, replacing whatever is playing now.
    pub async fn play(&self, source: impl AudioSource + 'static) -> Result<()> {
        self.commands
            .send(PlayerCommand::Play(Box::new(source)))
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(PlayerCommand::Stop)
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub fn status(&self) -> PlayerStatus {
        *self.status.borrow()
    }

    /// Wait until at least `count` playbacks have completed.
    pub async fn wait_completed(&mut self, count: u64) -> Result<()> {
        self.status
            .wait_for(|s| s.completed >= count)
            .await
            .map(|_| ())
            .map_err(|_| Error::NotConnected)
    }
}

enum PlayOutcome {
    /// Source ran dry; the current slot is still unused.
    Finished,
    Stopped,
    Shutdown,
}

/// Send side of the audio pipeline. Owns the encoder and RTP counters for one
/// voice session and paces output at one frame per 20 ms.
pub struct AudioPlayer {
    sink: Arc<dyn FrameSink>,
    encoder: Box<dyn FrameEncoder>,
    sequencer: FrameSequencer,
    commands: mpsc::Receiver<PlayerCommand>,
    status: watch::Sender<PlayerStatus>,
    keepalive: Duration,
    cancel: CancellationToken,
}

impl AudioPlayer {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        encoder: Box<dyn FrameEncoder>,
        cancel: CancellationToken,
    ) -> (Self, PlaybackHandle) {
        let (tx, rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(PlayerStatus::default());
        let player = Self {
            sink,
            encoder,
            sequencer: FrameSequencer::new(),
            commands: rx,
            status: status_tx,
            keepalive: KEEPALIVE_INTERVAL,
            cancel,
        };
        let handle = PlaybackHandle {
            commands: tx,
            status: status_rx,
        };
        (player, handle)
    }

    pub fn with_sequencer(mut self, sequencer: FrameSequencer) -> Self {
        self.sequencer = sequencer;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        loop {
            let source = tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(PlayerCommand::Play(source)) => source,
                    Some(PlayerCommand::Stop) => continue,
                    None => break,
                },
                _ = tokio::time::sleep(self.keepalive) => {
                    self.send_payload(Bytes::from_static(&SILENCE_FRAME)).await;
                    continue;
                }
            };
            if let PlayOutcome::Shutdown = self.play(source).await {
                break;
            }
        }
        tracing::debug!("audio player stopped");
    }

    async fn play(&mut self, mut source: Box<dyn AudioSource>) -> PlayOutcome {
        self.speaking(true).await;
        self.status.send_modify(|s| s.playing = true);

        let mut pacer = FramePacer::new();
        let mut pcm = vec![0i16; FRAME_LEN];
        let mut frames: u64 = 0;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break PlayOutcome::Shutdown,
                cmd = self.commands.recv() => match cmd {
                    Some(PlayerCommand::Play(next)) => {
                        tracing::debug!(frames, "playback replaced by a new source");
                        source = next;
                    }
                    Some(PlayerCommand::Stop) => break PlayOutcome::Stopped,
                    None => break PlayOutcome::Shutdown,
                },
                _ = pacer.tick() => match next_frame(source.as_mut(), &mut pcm) {
                    FrameStatus::Ready => {
                        let payload = match self.encoder.encode(&pcm) {
                            Ok(packet) => Bytes::from(packet),
                            Err(e) => {
                                tracing::warn!("opus encode failed, sending silence: {e}");
                                Bytes::from_static(&SILENCE_FRAME)
                            }
                        };
                        self.send_payload(payload).await;
                        frames += 1;
                    }
                    FrameStatus::Underrun => {
                        self.send_payload(Bytes::from_static(&SILENCE_FRAME)).await
                    }
                    FrameStatus::Finished => break PlayOutcome::Finished,
                },
            }
        };

        if !matches!(outcome, PlayOutcome::Shutdown) {
            for i in 0..TRAILING_SILENCE_FRAMES {
                if i > 0 || matches!(outcome, PlayOutcome::Stopped) {
                    pacer.tick().await;
                }
                self.send_payload(Bytes::from_static(&SILENCE_FRAME)).await;
            }
        }
        self.speaking(false).await;
        self.status.send_modify(|s| {
            s.playing = false;
            s.completed += 1;
        });
        tracing::debug!(frames, "playback finished");
        outcome
    }

    async fn send_payload(&mut self, payload: Bytes) {
        let frame = self.sequencer.next(payload);
        if let Err(e) = self.sink.send_frame(&frame).await {
            tracing::debug!(seq = frame.sequence, "dropping audio frame: {e}");
        }
    }

    async fn speaking(&mut self, speaking: bool) {
        if let Err(e) = self.sink.set_speaking(speaking).await {
            tracing::warn!(speaking, "failed to update speaking state: {e}");
        }
    }
}

/// A decrypted inbound voice packet, before decoding.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub ssrc: u32,
    pub sequence: u16,
    pub opus: Bytes,
}

/// Decoded audio from one remote speaker, one `Vec` per 20 ms frame. Ends
/// when the speaker has been silent for a while or the session closes.
pub struct SpeakerStream {
    pub ssrc: u32,
    pub user_id: Option<String>,
    pub samples: mpsc::Receiver<Vec<i16>>,
}

pub type DecoderFactory =
    Box<dyn Fn() -> std::result::Result<Box<dyn FrameDecoder>, OpusError> + Send + Sync>;

/// Playout ticks without a frame before a speaker's stream is closed.
const SPEAKER_IDLE_TICKS: u32 = 250;

struct Speaker {
    jitter: JitterBuffer<Bytes>,
    decoder: Box<dyn FrameDecoder>,
    tx: mpsc::Sender<Vec<i16>>,
    idle_ticks: u32,
}

/// Receive side: per-SSRC reorder buffers drained on a 20 ms playout clock.
pub struct AudioReceiver {
    packets: mpsc::Receiver<InboundPacket>,
    speakers_tx: mpsc::Sender<SpeakerStream>,
    ssrc_users: Arc<DashMap<u32, String>>,
    new_decoder: DecoderFactory,
    cancel: CancellationToken,
}

impl AudioReceiver {
    pub fn new(
        packets: mpsc::Receiver<InboundPacket>,
        ssrc_users: Arc<DashMap<u32, String>>,
        new_decoder: DecoderFactory,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<SpeakerStream>) {
        let (speakers_tx, speakers_rx) = mpsc::channel(16);
        let receiver = Self {
            packets,
            speakers_tx,
            ssrc_users,
            new_decoder,
            cancel,
        };
        (receiver, speakers_rx)
    }

    pub async fn run(mut self) {
        let mut speakers: HashMap<u32, Speaker> = HashMap::new();
        let mut playout = tokio::time::interval(FRAME_DURATION);
        playout.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                packet = self.packets.recv() => {
                    let Some(packet) = packet else { break };
                    self.accept(&mut speakers, packet);
                }
                _ = playout.tick() => {
                    speakers.retain(|ssrc, speaker| play_out(*ssrc, speaker));
                }
            }
        }
    }

    fn accept(&self, speakers: &mut HashMap<u32, Speaker>, packet: InboundPacket) {
        if !speakers.contains_key(&packet.ssrc) {
            let decoder = match (self.new_decoder)() {
                Ok(decoder) => decoder,
                Err(e) => {
                    tracing::warn!(ssrc = packet.ssrc, "cannot create decoder: {e}");
                    return;
                }
            };
            let (tx, rx) = mpsc::channel(50);
            let stream = SpeakerStream {
                ssrc: packet.ssrc,
                user_id: self.ssrc_users.get(&packet.ssrc).map(|u| u.clone()),
                samples: rx,
            };
            if self.speakers_tx.try_send(stream).is_err() {
                tracing::debug!(ssrc = packet.ssrc, "no listener for new speaker");
            }
            speakers.insert(
                packet.ssrc,
                Speaker {
                    jitter: JitterBuffer::new(),
                    decoder,
                    tx,
                    idle_ticks: 0,
                },
            );
        }
        if let Some(speaker) = speakers.get_mut(&packet.ssrc) {
            speaker.jitter.insert(packet.sequence, packet.opus);
        }
    }
}

/// One playout tick for one speaker. Returns false once the speaker should
/// be dropped.
fn play_out(ssrc: u32, speaker: &mut Speaker) -> bool {
    let decoded = match speaker.jitter.pull() {
        Playout::Frame(packet) => {
            speaker.idle_ticks = 0;
            speaker
                .decoder
                .decode(Some(&packet))
                .or_else(|_| speaker.decoder.decode(None))
        }
        Playout::Missing => speaker.decoder.decode(None),
        Playout::Buffering => {
            speaker.idle_ticks += 1;
            return speaker.idle_ticks < SPEAKER_IDLE_TICKS && !speaker.tx.is_closed();
        }
    };
    match decoded {
        Ok(pcm) => match speaker.tx.try_send(pcm) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        },
        Err(e) => {
            tracing::debug!(ssrc, "decode failed: {e}");
            true
        }
    }
}
