use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::events::{
    event_name, DispatchEvent, GuildCreateData, GuildDeleteData, PresenceData, VoiceStateData,
};
use crate::gateway::session::{GatewayConfig, GatewayHandle, GatewaySession, ShardStatus};
use crate::gateway::{intents, CommandDispatcher, DispatcherBuilder};
use crate::http::{GatewayBot, RestClient};
use crate::snowflake;
use crate::voice::{VoiceConfig, VoiceFollower, VoiceManager, VoiceStateCache, VoiceStateSender};

/// Gap between identify buckets.
const IDENTIFY_SPACING: Duration = Duration::from_secs(5);
/// How long shutdown waits for shards to close their sockets.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capability to post a message into a channel.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, channel_id: &str, content: &str) -> Result<()>;

    /// Remove a message, e.g. one that exposed the master key.
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()>;
}

/// Capability to look up a user's current voice channel.
pub trait VoiceStateProvider: Send + Sync {
    fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> Option<String>;
}

/// Routes guild-scoped gateway sends to the shard that owns the guild.
pub struct ShardRouter {
    shards: Vec<GatewayHandle>,
}

impl ShardRouter {
    pub fn new(shards: Vec<GatewayHandle>) -> Self {
        Self { shards }
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard(&self, shard_id: u32) -> Option<&GatewayHandle> {
        self.shards.get(shard_id as usize)
    }

    pub fn for_guild(&self, guild_id: &str) -> Option<&GatewayHandle> {
        let shard = snowflake::shard_for_guild_str(guild_id, self.shard_count());
        self.shards.get(shard as usize)
    }

    pub fn statuses(&self) -> Vec<(u32, ShardStatus)> {
        self.shards.iter().map(|h| (h.shard_id(), h.status())).collect()
    }
}

impl VoiceStateSender for ShardRouter {
    fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        self.for_guild(guild_id)
            .ok_or(Error::NotConnected)?
            .update_voice_state(guild_id, channel_id, self_mute, self_deaf)
    }
}

/// What command handlers get to work with.
pub struct BotContext {
    pub voice: Arc<VoiceManager>,
    pub voice_states: Arc<dyn VoiceStateProvider>,
    pub shards: Arc<ShardRouter>,
    pub replies: Arc<dyn ReplySink>,
    pub cancel: CancellationToken,
    pub started: Instant,
}

impl BotContext {
    pub async fn reply(&self, channel_id: Option<&str>, content: &str) -> Result<()> {
        match channel_id {
            Some(channel_id) => self.replies.reply(channel_id, content).await,
            None => Ok(()),
        }
    }
}

/// Fans decoded events out to voice, the state cache, the follower and the
/// dispatcher, in arrival order.
pub struct EventRouter {
    voice: Arc<VoiceManager>,
    voice_states: Arc<VoiceStateCache>,
    shards: Arc<ShardRouter>,
    presence: PresenceData,
    follower: Option<Arc<VoiceFollower>>,
    dispatcher: CommandDispatcher,
}

impl EventRouter {
    pub fn new(
        voice: Arc<VoiceManager>,
        voice_states: Arc<VoiceStateCache>,
        shards: Arc<ShardRouter>,
        presence: PresenceData,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            voice,
            voice_states,
            shards,
            presence,
            follower: None,
            dispatcher,
        }
    }

    pub fn with_follower(mut self, follower: Option<Arc<VoiceFollower>>) -> Self {
        self.follower = follower;
        self
    }

    pub fn route(&self, event: DispatchEvent) {
        self.voice.handle_event(&event);
        match event.name.as_str() {
            event_name::READY => self.set_presence(event.shard_id),
            event_name::GUILD_CREATE => {
                if let Ok(guild) = serde_json::from_value::<GuildCreateData>(event.payload.clone()) {
                    self.voice_states.load_guild(&guild);
                    self.follow(&guild.id);
                }
            }
            event_name::GUILD_DELETE => {
                if let Ok(guild) = serde_json::from_value::<GuildDeleteData>(event.payload.clone()) {
                    self.voice_states.forget_guild(&guild.id);
                }
            }
            event_name::VOICE_STATE_UPDATE => {
                if let Ok(state) = serde_json::from_value::<VoiceStateData>(event.payload.clone()) {
                    self.voice_states.apply(&state);
                    if let Some(guild_id) = &state.guild_id {
                        self.follow(guild_id);
                    }
                }
            }
            _ => {}
        }
        // handler results are observed by the dispatcher's own tasks
        drop(self.dispatcher.dispatch(event));
    }

    fn set_presence(&self, shard_id: u32) {
        let Some(shard) = self.shards.shard(shard_id) else {
            return;
        };
        if let Err(e) = shard.update_presence(&self.presence) {
            tracing::warn!(shard = shard_id, "could not set presence: {e}");
        }
    }

    fn follow(&self, guild_id: &str) {
        if let Some(follower) = self.follower.as_ref().filter(|f| f.guild_id() == guild_id) {
            follower.evaluate();
        }
    }
}

/// How and when shards are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub url: String,
    pub shard_count: u32,
    /// Shards identifying in the same bucket.
    pub max_concurrency: u32,
    /// Wait before the first identify, when the daily start budget is spent.
    pub initial_wait: Duration,
}

impl ShardPlan {
    pub fn from_gateway(gateway: GatewayBot) -> Self {
        let shard_count = gateway.shards.max(1);
        let (max_concurrency, initial_wait) = match gateway.session_start_limit {
            Some(limit) => {
                if limit.remaining < shard_count {
                    tracing::warn!(
                        remaining = limit.remaining,
                        total = limit.total,
                        shards = shard_count,
                        "session start budget is lower than the shard count"
                    );
                }
                let wait = if limit.remaining == 0 {
                    Duration::from_millis(limit.reset_after)
                } else {
                    Duration::ZERO
                };
                (limit.max_concurrency.max(1), wait)
            }
            None => (1, Duration::ZERO),
        };
        Self {
            url: gateway.url,
            shard_count,
            max_concurrency,
            initial_wait,
        }
    }

    /// Shards start in buckets of `max_concurrency`, one bucket per spacing.
    pub fn start_delay(&self, shard_id: u32) -> Duration {
        self.initial_wait + IDENTIFY_SPACING * (shard_id / self.max_concurrency.max(1))
    }
}

/// Log a warning for every listened-to event the configured intents will
/// never deliver.
pub fn warn_missing_intents(configured: u64, dispatcher: &CommandDispatcher) -> Vec<String> {
    let mut events: Vec<&str> = dispatcher.names().collect();
    events.push(event_name::MESSAGE_CREATE);
    events.push(event_name::VOICE_STATE_UPDATE);
    let missing: Vec<String> = intents::missing_for(configured, events)
        .into_iter()
        .map(str::to_string)
        .collect();
    for event in &missing {
        tracing::warn!(event = %event, intents = configured, "event will not be delivered with the configured intents");
    }
    missing
}

/// Starts every shard and runs the event loop until cancelled or a shard
/// fails fatally.
pub struct Client {
    config: Config,
    rest: RestClient,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        let rest = RestClient::new(&config.api_url, &config.token);
        Self {
            config,
            rest,
            cancel,
        }
    }

    /// Run with the built-in command set.
    pub async fn run(self) -> Result<()> {
        self.run_with(crate::commands::register).await
    }

    pub async fn run_with<F>(self, register: F) -> Result<()>
    where
        F: FnOnce(DispatcherBuilder, Arc<BotContext>) -> DispatcherBuilder,
    {
        let plan = self.resolve_gateway().await?;
        let shard_count = plan.shard_count;
        if !plan.initial_wait.is_zero() {
            tracing::warn!(wait = ?plan.initial_wait, "session start budget exhausted, delaying identify");
        }
        tracing::info!(
            url = %plan.url,
            shards = shard_count,
            max_concurrency = plan.max_concurrency,
            "starting gateway shards"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut shards = JoinSet::new();
        let mut handles = Vec::new();
        for shard_id in 0..shard_count {
            let (session, handle) = GatewaySession::new(
                GatewayConfig {
                    url: plan.url.clone(),
                    token: self.config.token.clone(),
                    intents: self.config.intents,
                    shard_id,
                    shard_count,
                    backoff_base: self.config.reconnect_base,
                    backoff_max: self.config.reconnect_max,
                    malformed_frame_limit: self.config.malformed_frame_limit,
                },
                events_tx.clone(),
                self.cancel.clone(),
            );
            handles.push(handle);
            let cancel = self.cancel.clone();
            let delay = plan.start_delay(shard_id);
            shards.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                session.run().await
            });
        }
        drop(events_tx);

        let router = Arc::new(ShardRouter::new(handles));
        let voice = Arc::new(VoiceManager::new(
            router.clone(),
            VoiceConfig {
                negotiation_timeout: self.config.voice_timeout,
                receive: self.config.voice_receive,
                ..VoiceConfig::default()
            },
            self.cancel.child_token(),
        ));
        let voice_states = Arc::new(VoiceStateCache::new());
        let replies: Arc<dyn ReplySink> = Arc::new(self.rest.clone());
        let follower = self.config.follow_channel.clone().map(|target| {
            tracing::info!(guild_id = %target.guild_id, channel_id = %target.channel_id, "following voice channel");
            Arc::new(VoiceFollower::new(target, voice.clone(), voice_states.clone()))
        });
        let ctx = Arc::new(BotContext {
            voice: voice.clone(),
            voice_states: voice_states.clone(),
            shards: router.clone(),
            replies: replies.clone(),
            cancel: self.cancel.clone(),
            started: Instant::now(),
        });

        let builder = DispatcherBuilder::new(self.config.prefix.clone())
            .master_key(self.config.master_key.as_deref());
        let dispatcher = register(builder, ctx).build(replies);
        if self.config.master_key.is_none() {
            tracing::info!("no master key configured, privileged commands are disabled");
        }
        warn_missing_intents(self.config.intents, &dispatcher);
        let events = EventRouter::new(
            voice,
            voice_states,
            router,
            self.config.presence(),
            dispatcher,
        )
        .with_follower(follower);

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                event = events_rx.recv() => match event {
                    Some(event) => events.route(event),
                    None => break Ok(()),
                },
                Some(joined) = shards.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!("shard stopped: {e}");
                        if e.is_fatal() {
                            break Err(e);
                        }
                    }
                    Err(e) => tracing::error!("shard task failed: {e}"),
                },
            }
        };

        // new dispatch stops here; in-flight handlers finish on their own
        self.cancel.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while shards.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("shards did not close in time");
            shards.abort_all();
        }
        tracing::info!("client stopped");
        outcome
    }

    async fn resolve_gateway(&self) -> Result<ShardPlan> {
        let fixed = |shard_count| ShardPlan {
            url: self.config.gateway_url.clone(),
            shard_count,
            max_concurrency: 1,
            initial_wait: Duration::ZERO,
        };
        if let Some(count) = self.config.shards {
            return Ok(fixed(count));
        }
        match self.rest.get_gateway_bot().await {
            Ok(gateway) => Ok(ShardPlan::from_gateway(gateway)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("gateway discovery failed, using one shard on the configured url: {e}");
                Ok(fixed(1))
            }
        }
    }
}
