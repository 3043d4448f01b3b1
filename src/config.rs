use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::events::{Activity, OnlineStatus, PresenceData};
use crate::gateway::intents;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
pub const DEFAULT_API_URL: &str = "https://discord.com/api/v10";

/// The voice channel the bot follows users into, as `<guild_id>:<channel_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowChannel {
    pub guild_id: String,
    pub channel_id: String,
}

impl FromStr for FollowChannel {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let (guild_id, channel_id) = s.trim().split_once(':').ok_or(())?;
        if guild_id.is_empty() || channel_id.is_empty() {
            return Err(());
        }
        Ok(Self {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct Config {
    pub token: String,
    /// Unset (or empty) disables privileged commands entirely.
    pub master_key: Option<String>,
    pub gateway_url: String,
    pub api_url: String,
    pub intents: u64,
    /// `None` uses the platform's recommended shard count.
    pub shards: Option<u32>,
    pub prefix: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub voice_timeout: Duration,
    pub voice_receive: bool,
    pub malformed_frame_limit: u32,
    /// Shown as "Watching <activity>".
    pub activity: Option<String>,
    pub status: OnlineStatus,
    pub follow_channel: Option<FollowChannel>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("gateway_url", &self.gateway_url)
            .field("api_url", &self.api_url)
            .field("intents", &self.intents)
            .field("shards", &self.shards)
            .field("prefix", &self.prefix)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("voice_timeout", &self.voice_timeout)
            .field("voice_receive", &self.voice_receive)
            .field("malformed_frame_limit", &self.malformed_frame_limit)
            .field("activity", &self.activity)
            .field("status", &self.status)
            .field("follow_channel", &self.follow_channel)
            .finish()
    }
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("DISCORD_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("DISCORD_TOKEN is required".into()))?;

        let master_key = std::env::var("ACCORDBOT_MASTER_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let reconnect_base = Duration::from_millis(parsed_or("ACCORDBOT_RECONNECT_BASE_MS", 1000));
        let reconnect_max = Duration::from_millis(parsed_or("ACCORDBOT_RECONNECT_MAX_MS", 60_000));

        Ok(Self {
            token,
            master_key,
            gateway_url: std::env::var("ACCORDBOT_GATEWAY_URL")
                .unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string()),
            api_url: std::env::var("ACCORDBOT_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            intents: parsed_or("ACCORDBOT_INTENTS", intents::DEFAULT),
            shards: std::env::var("ACCORDBOT_SHARDS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &u32| n > 0),
            prefix: std::env::var("ACCORDBOT_PREFIX")
                .ok()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "!".to_string()),
            reconnect_base,
            reconnect_max: reconnect_max.max(reconnect_base),
            voice_timeout: Duration::from_secs(parsed_or("ACCORDBOT_VOICE_TIMEOUT_SECS", 10)),
            voice_receive: flag("ACCORDBOT_VOICE_RECEIVE"),
            malformed_frame_limit: parsed_or("ACCORDBOT_MALFORMED_FRAME_LIMIT", 5),
            activity: std::env::var("ACCORDBOT_ACTIVITY")
                .ok()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            status: parsed_or("ACCORDBOT_STATUS", OnlineStatus::Online),
            follow_channel: std::env::var("ACCORDBOT_FOLLOW_CHANNEL")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }

    /// Presence set on every READY.
    pub fn presence(&self) -> PresenceData {
        PresenceData::new(self.activity.clone().map(Activity::watching), self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DISCORD_TOKEN",
            "ACCORDBOT_MASTER_KEY",
            "ACCORDBOT_GATEWAY_URL",
            "ACCORDBOT_API_URL",
            "ACCORDBOT_INTENTS",
            "ACCORDBOT_SHARDS",
            "ACCORDBOT_PREFIX",
            "ACCORDBOT_RECONNECT_BASE_MS",
            "ACCORDBOT_RECONNECT_MAX_MS",
            "ACCORDBOT_VOICE_TIMEOUT_SECS",
            "ACCORDBOT_VOICE_RECEIVE",
            "ACCORDBOT_MALFORMED_FRAME_LIMIT",
            "ACCORDBOT_ACTIVITY",
            "ACCORDBOT_STATUS",
            "ACCORDBOT_FOLLOW_CHANNEL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_missing_token_is_an_error() {
        clear_env();
        assert!(matches!(Config::from_env(), Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_default_config() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "abc");
        let config = Config::from_env().unwrap();
        assert_eq!(config.token, "abc");
        assert!(config.master_key.is_none());
        assert_eq!(config.gateway_url, DEFAULT_GATEWAY_URL);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.intents, intents::DEFAULT);
        assert_eq!(config.shards, None);
        assert_eq!(config.prefix, "!");
        assert_eq!(config.reconnect_base, Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
        assert_eq!(config.voice_timeout, Duration::from_secs(10));
        assert!(!config.voice_receive);
        assert_eq!(config.malformed_frame_limit, 5);
        assert_eq!(config.status, OnlineStatus::Online);
        assert!(config.activity.is_none());
        assert!(config.follow_channel.is_none());
        assert!(config.presence().activities.is_empty());
    }

    #[test]
    #[serial]
    fn test_presence_and_follow_channel() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "abc");
        std::env::set_var("ACCORDBOT_ACTIVITY", "over pyro.host");
        std::env::set_var("ACCORDBOT_STATUS", "dnd");
        std::env::set_var("ACCORDBOT_FOLLOW_CHANNEL", "600:700");
        let config = Config::from_env().unwrap();
        let presence = config.presence();
        assert_eq!(presence.status, OnlineStatus::Dnd);
        assert_eq!(presence.activities, vec![Activity::watching("over pyro.host")]);
        assert_eq!(
            config.follow_channel,
            Some(FollowChannel {
                guild_id: "600".into(),
                channel_id: "700".into()
            })
        );

        std::env::set_var("ACCORDBOT_STATUS", "busy");
        std::env::set_var("ACCORDBOT_FOLLOW_CHANNEL", "700");
        let config = Config::from_env().unwrap();
        assert_eq!(config.status, OnlineStatus::Online);
        assert!(config.follow_channel.is_none());
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "abc");
        std::env::set_var("ACCORDBOT_MASTER_KEY", "hunter2");
        std::env::set_var("ACCORDBOT_SHARDS", "4");
        std::env::set_var("ACCORDBOT_PREFIX", "?");
        std::env::set_var("ACCORDBOT_VOICE_RECEIVE", "true");
        std::env::set_var("ACCORDBOT_INTENTS", "513");
        let config = Config::from_env().unwrap();
        assert_eq!(config.master_key.as_deref(), Some("hunter2"));
        assert_eq!(config.shards, Some(4));
        assert_eq!(config.prefix, "?");
        assert!(config.voice_receive);
        assert_eq!(config.intents, 513);
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_fall_back_to_defaults() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "abc");
        std::env::set_var("ACCORDBOT_SHARDS", "0");
        std::env::set_var("ACCORDBOT_RECONNECT_BASE_MS", "soon");
        std::env::set_var("ACCORDBOT_VOICE_TIMEOUT_SECS", "-3");
        let config = Config::from_env().unwrap();
        assert_eq!(config.shards, None);
        assert_eq!(config.reconnect_base, Duration::from_secs(1));
        assert_eq!(config.voice_timeout, Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn test_empty_master_key_disables_privileged_commands() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "abc");
        std::env::set_var("ACCORDBOT_MASTER_KEY", "");
        let config = Config::from_env().unwrap();
        assert!(config.master_key.is_none());
    }

    #[test]
    #[serial]
    fn test_debug_redacts_secrets() {
        clear_env();
        std::env::set_var("DISCORD_TOKEN", "super-secret-token");
        std::env::set_var("ACCORDBOT_MASTER_KEY", "master-secret");
        let rendered = format!("{:?}", Config::from_env().unwrap());
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("master-secret"));
    }
}
