use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::manager::VoiceManager;
use super::state::VoiceStateCache;
use crate::audio::pipeline::SpeakerStream;
use crate::audio::{CHANNELS, SAMPLE_RATE};
use crate::config::FollowChannel;

/// Keeps the bot in one voice channel for as long as people are in it.
///
/// Evaluation is level-triggered against the voice state cache, so it is safe
/// to call after every voice state change in the followed guild.
pub struct VoiceFollower {
    target: FollowChannel,
    voice: Arc<VoiceManager>,
    states: Arc<VoiceStateCache>,
    joining: AtomicBool,
}

impl VoiceFollower {
    pub fn new(target: FollowChannel, voice: Arc<VoiceManager>, states: Arc<VoiceStateCache>) -> Self {
        Self {
            target,
            voice,
            states,
            joining: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.target.guild_id
    }

    /// Join when someone is in the followed channel, leave once it is empty.
    /// Returns the join task, if one was started.
    pub fn evaluate(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let FollowChannel {
            guild_id,
            channel_id,
        } = &self.target;
        let listeners = self
            .states
            .listeners(guild_id, channel_id, self.voice.user_id());
        let call = self.voice.call(guild_id);

        if listeners == 0 {
            if call.is_some_and(|c| c.channel_id() == channel_id) {
                tracing::info!(%guild_id, %channel_id, "followed channel is empty, leaving");
                if let Err(e) = self.voice.leave(guild_id) {
                    tracing::warn!(%guild_id, "could not leave followed channel: {e}");
                }
            }
            return None;
        }

        // a call elsewhere in the guild was asked for explicitly; leave it be
        if call.is_some() || self.voice.user_id().is_none() {
            return None;
        }
        if self.joining.swap(true, Ordering::AcqRel) {
            return None;
        }

        let follower = self.clone();
        Some(tokio::spawn(async move {
            let guild_id = follower.target.guild_id.clone();
            let channel_id = follower.target.channel_id.clone();
            tracing::info!(%guild_id, %channel_id, listeners, "following users into voice");
            let joined = follower.voice.join(&guild_id, &channel_id).await;
            follower.joining.store(false, Ordering::Release);
            match joined {
                Ok(call) => {
                    if let Some(speakers) = call.take_speakers().await {
                        tokio::spawn(collect_speakers(speakers));
                    }
                    // everyone may have left while the join was in flight
                    follower.evaluate();
                }
                Err(e) => tracing::warn!(%guild_id, "could not follow into voice: {e}"),
            }
        }))
    }
}

/// Drain every speaker of a call, logging how much audio each produced.
pub async fn collect_speakers(mut speakers: mpsc::Receiver<SpeakerStream>) {
    while let Some(speaker) = speakers.recv().await {
        tokio::spawn(async move {
            let ssrc = speaker.ssrc;
            let user_id = speaker.user_id.clone().unwrap_or_else(|| "-".to_string());
            let samples = collect_speaker(speaker).await;
            let millis = samples * 1000 / (u64::from(SAMPLE_RATE) * CHANNELS as u64);
            tracing::info!(ssrc, user_id = %user_id, samples, millis, "speaker stream ended");
        });
    }
}

/// Total interleaved samples received from one speaker until the stream closes.
pub async fn collect_speaker(mut speaker: SpeakerStream) -> u64 {
    let mut total = 0u64;
    while let Some(pcm) = speaker.samples.recv().await {
        total += pcm.len() as u64;
    }
    total
}
