use dashmap::DashMap;

use crate::client::VoiceStateProvider;
use crate::gateway::events::{GuildCreateData, VoiceStateData};

/// Where a user currently is in voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedVoiceState {
    pub guild_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub session_id: String,
    pub bot: bool,
}

/// In-memory voice presence, keyed by (guild, user). Fed from GUILD_CREATE
/// and VOICE_STATE_UPDATE dispatches.
#[derive(Debug, Default)]
pub struct VoiceStateCache {
    states: DashMap<(String, String), CachedVoiceState>,
}

impl VoiceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a voice state update. Returns the channel the user was in before,
    /// if it differs from the new one.
    pub fn apply(&self, update: &VoiceStateData) -> Option<String> {
        let guild_id = update.guild_id.clone()?;
        let key = (guild_id.clone(), update.user_id.clone());

        let previous = match &update.channel_id {
            Some(channel_id) => self
                .states
                .insert(
                    key,
                    CachedVoiceState {
                        guild_id,
                        user_id: update.user_id.clone(),
                        channel_id: channel_id.clone(),
                        session_id: update.session_id.clone(),
                        bot: update.is_bot(),
                    },
                )
                .map(|old| old.channel_id),
            None => self.states.remove(&key).map(|(_, old)| old.channel_id),
        };
        previous.filter(|old| update.channel_id.as_deref() != Some(old.as_str()))
    }

    /// Replace everything known about a guild with its GUILD_CREATE snapshot.
    pub fn load_guild(&self, guild: &GuildCreateData) {
        self.forget_guild(&guild.id);
        for state in &guild.voice_states {
            let Some(channel_id) = &state.channel_id else {
                continue;
            };
            self.states.insert(
                (guild.id.clone(), state.user_id.clone()),
                CachedVoiceState {
                    guild_id: guild.id.clone(),
                    user_id: state.user_id.clone(),
                    channel_id: channel_id.clone(),
                    session_id: state.session_id.clone(),
                    bot: state.is_bot(),
                },
            );
        }
    }

    pub fn forget_guild(&self, guild_id: &str) {
        self.states.retain(|(guild, _), _| guild != guild_id);
    }

    pub fn user_state(&self, guild_id: &str, user_id: &str) -> Option<CachedVoiceState> {
        self.states
            .get(&(guild_id.to_string(), user_id.to_string()))
            .map(|s| s.clone())
    }

    /// Users currently in a voice channel.
    pub fn channel_members(&self, guild_id: &str, channel_id: &str) -> Vec<String> {
        self.states
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.guild_id == guild_id && s.channel_id == channel_id
            })
            .map(|entry| entry.value().user_id.clone())
            .collect()
    }

    /// Non-bot users in a voice channel, not counting `except`.
    pub fn listeners(&self, guild_id: &str, channel_id: &str, except: Option<&str>) -> usize {
        self.states
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.guild_id == guild_id
                    && s.channel_id == channel_id
                    && !s.bot
                    && except != Some(s.user_id.as_str())
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl VoiceStateProvider for VoiceStateCache {
    fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> Option<String> {
        self.user_state(guild_id, user_id).map(|s| s.channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(user: &str, channel: Option<&str>) -> VoiceStateData {
        VoiceStateData {
            guild_id: Some("g1".into()),
            channel_id: channel.map(str::to_string),
            user_id: user.into(),
            session_id: format!("sess-{user}"),
            member: None,
        }
    }

    #[test]
    fn test_join_move_leave() {
        let cache = VoiceStateCache::new();
        assert_eq!(cache.apply(&update("u1", Some("c1"))), None);
        assert_eq!(cache.voice_channel_of("g1", "u1").as_deref(), Some("c1"));

        // mute toggles resend the same channel
        assert_eq!(cache.apply(&update("u1", Some("c1"))), None);

        assert_eq!(cache.apply(&update("u1", Some("c2"))).as_deref(), Some("c1"));
        assert_eq!(cache.channel_members("g1", "c2"), vec!["u1".to_string()]);

        assert_eq!(cache.apply(&update("u1", None)).as_deref(), Some("c2"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_guild_replaces_snapshot() {
        let cache = VoiceStateCache::new();
        cache.apply(&update("stale", Some("c9")));

        let guild: GuildCreateData = serde_json::from_value(serde_json::json!({
            "id": "g1",
            "voice_states": [
                {"channel_id": "c1", "user_id": "u1", "session_id": "s1"},
                {"channel_id": "c1", "user_id": "u2", "session_id": "s2"}
            ]
        }))
        .unwrap();
        cache.load_guild(&guild);

        assert_eq!(cache.len(), 2);
        assert!(cache.user_state("g1", "stale").is_none());
        let mut members = cache.channel_members("g1", "c1");
        members.sort();
        assert_eq!(members, vec!["u1", "u2"]);

        cache.forget_guild("g1");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_listeners_skip_bots_and_self() {
        let cache = VoiceStateCache::new();
        cache.apply(&update("me", Some("c1")));
        cache.apply(&update("u1", Some("c1")));
        let mut music = update("music", Some("c1"));
        music.member = serde_json::from_value(serde_json::json!({
            "user": {"id": "music", "bot": true}
        }))
        .unwrap();
        cache.apply(&music);

        assert_eq!(cache.listeners("g1", "c1", Some("me")), 1);
        cache.apply(&update("u1", None));
        assert_eq!(cache.listeners("g1", "c1", Some("me")), 0);
        assert_eq!(cache.listeners("g1", "c1", None), 1);
    }

    #[test]
    fn test_updates_without_guild_ignored() {
        let cache = VoiceStateCache::new();
        let mut dm = update("u1", Some("c1"));
        dm.guild_id = None;
        assert_eq!(cache.apply(&dm), None);
        assert!(cache.is_empty());
    }
}
