use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::client::ReplySink;
use crate::error::{Error, Result};

/// Messages longer than this are rejected by the platform.
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

/// `GET /gateway/bot` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: u32,
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

/// The REST calls the bot core needs: gateway discovery, replies and removing
/// messages that leaked the master key.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bot {}", self.token))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status == 401 {
            return Err(Error::AuthenticationRejected);
        }
        Err(Error::Api { status, body })
    }

    pub async fn get_gateway_bot(&self) -> Result<GatewayBot> {
        let url = format!("{}/gateway/bot", self.base_url);
        let resp = self.authorized(self.client.get(&url)).send().await?;
        let gateway = Self::check(resp).await?.json::<GatewayBot>().await?;
        tracing::debug!(url = %gateway.url, shards = gateway.shards, "fetched gateway info");
        Ok(gateway)
    }

    pub async fn create_message(&self, channel_id: &str, content: &str) -> Result<()> {
        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let builder = self.client.post(&url).json(&json!({
            "content": truncate(content, MAX_MESSAGE_LEN),
            "allowed_mentions": { "parse": [] },
        }));
        let resp = self.authorized(builder).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let url = format!("{}/channels/{channel_id}/messages/{message_id}", self.base_url);
        let resp = self.authorized(self.client.delete(&url)).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ReplySink for RestClient {
    async fn reply(&self, channel_id: &str, content: &str) -> Result<()> {
        self.create_message(channel_id, content).await
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        RestClient::delete_message(self, channel_id, message_id).await
    }
}

/// Cut to at most `max` characters.
fn truncate(content: &str, max: usize) -> &str {
    match content.char_indices().nth(max) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}
