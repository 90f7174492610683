//! Anonboard Discord Adapter
//!
//! Discord REST API client (member lookup, DM channels, message delivery with
//! chunking) and the Gateway websocket that feeds direct messages to the core

pub mod gateway;

pub use gateway::DiscordGateway;

use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

pub const DISCORD_MAX_MESSAGE_LEN: usize = 2000;

/// Discord error code for "Unknown Member".
const UNKNOWN_MEMBER_CODE: u64 = 10007;

#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("discord {endpoint} request failed: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("discord {endpoint} rate limited, retry after {retry_after:.2}s")]
    RateLimited {
        endpoint: &'static str,
        retry_after: f64,
    },
    #[error("discord {endpoint} HTTP {status}: {body}")]
    Http {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("discord {endpoint} decode failed: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl DiscordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Discord ids are 64-bit snowflakes serialized as strings.
pub(crate) fn snowflake<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

pub(crate) fn optional_snowflake<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|value| value.parse().map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    #[serde(deserialize_with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannel {
    #[serde(deserialize_with = "snowflake")]
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessage {
    #[serde(deserialize_with = "snowflake")]
    pub id: u64,
    #[serde(deserialize_with = "snowflake")]
    pub channel_id: u64,
    #[serde(default, deserialize_with = "optional_snowflake")]
    pub guild_id: Option<u64>,
    pub author: DiscordUser,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    retry_after: Option<f64>,
}

fn is_unknown_member(body: &str) -> bool {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|parsed| parsed.code == UNKNOWN_MEMBER_CODE)
        .unwrap_or(false)
}

pub struct DiscordClient {
    client: Client,
    api_base: String,
    authorization: String,
    guild_id: u64,
    dm_channels: Mutex<HashMap<u64, u64>>,
}

impl DiscordClient {
    pub fn new(bot_token: &str, api_base: &str, guild_id: u64) -> Result<Self, DiscordError> {
        Ok(Self {
            client: Self::build_client()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            authorization: format!("Bot {}", bot_token),
            guild_id,
            dm_channels: Mutex::new(HashMap::new()),
        })
    }

    fn build_client() -> Result<Client, DiscordError> {
        ClientBuilder::new()
            .user_agent(concat!(
                "DiscordBot (https://github.com/anonboard/anonboard, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .pool_idle_timeout(Duration::from_secs(600))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(DiscordError::Client)
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, DiscordError> {
        let resp = request
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .send()
            .await
            .map_err(|source| DiscordError::Transport { endpoint, source })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.retry_after)
                .unwrap_or(1.0);
            return Err(DiscordError::RateLimited {
                endpoint,
                retry_after,
            });
        }

        Err(DiscordError::Http {
            endpoint,
            status,
            body,
        })
    }

    pub async fn get_current_user(&self) -> Result<DiscordUser, DiscordError> {
        const ENDPOINT: &str = "getCurrentUser";
        let resp = self
            .send(ENDPOINT, self.client.get(self.url("/users/@me")))
            .await?;
        resp.json()
            .await
            .map_err(|source| DiscordError::Decode {
                endpoint: ENDPOINT,
                source,
            })
    }

    /// `Ok(false)` when Discord answers "Unknown Member". Any other 404 (for
    /// example an unknown guild) is an error.
    pub async fn is_guild_member(&self, guild_id: u64, user_id: u64) -> Result<bool, DiscordError> {
        let url = self.url(&format!("/guilds/{}/members/{}", guild_id, user_id));
        match self.send("getGuildMember", self.client.get(url)).await {
            Ok(_) => Ok(true),
            Err(DiscordError::Http { body, .. }) if is_unknown_member(&body) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Opens (or reuses) the DM channel with `user_id`.
    pub async fn open_dm_channel(&self, user_id: u64) -> Result<u64, DiscordError> {
        const ENDPOINT: &str = "createDM";
        if let Some(channel_id) = self.dm_channels.lock().await.get(&user_id).copied() {
            return Ok(channel_id);
        }

        let payload = serde_json::json!({ "recipient_id": user_id.to_string() });
        let resp = self
            .send(
                ENDPOINT,
                self.client.post(self.url("/users/@me/channels")).json(&payload),
            )
            .await?;
        let channel: DiscordChannel = resp.json().await.map_err(|source| DiscordError::Decode {
            endpoint: ENDPOINT,
            source,
        })?;

        self.dm_channels.lock().await.insert(user_id, channel.id);
        Ok(channel.id)
    }

    /// Posts `text`, split into several messages if it exceeds Discord's limit.
    /// Mentions are rendered but never ping anyone.
    pub async fn create_message(&self, channel_id: u64, text: &str) -> Result<(), DiscordError> {
        let url = self.url(&format!("/channels/{}/messages", channel_id));
        for chunk in chunk_message(text) {
            let payload = serde_json::json!({
                "content": chunk,
                "allowed_mentions": { "parse": [] },
            });
            self.send("createMessage", self.client.post(&url).json(&payload))
                .await?;
        }
        Ok(())
    }

    pub async fn send_direct_message(&self, user_id: u64, text: &str) -> Result<(), DiscordError> {
        let channel_id = self.open_dm_channel(user_id).await?;
        match self.create_message(channel_id, text).await {
            Err(err) if err.is_not_found() => {
                warn!(user_id, "cached DM channel vanished, reopening");
                self.dm_channels.lock().await.remove(&user_id);
                let channel_id = self.open_dm_channel(user_id).await?;
                self.create_message(channel_id, text).await
            }
            other => other,
        }
    }
}

/// Splits on the last newline, space or sentence end before the limit,
/// counting characters rather than bytes.
pub fn chunk_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= DISCORD_MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + DISCORD_MAX_MESSAGE_LEN).min(chars.len());

        if end < chars.len() {
            if let Some(split) = (start..end)
                .rev()
                .find(|&i| matches!(chars[i], '\n' | ' ' | '.' | '!' | '?' | '。'))
            {
                end = split + 1;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}
