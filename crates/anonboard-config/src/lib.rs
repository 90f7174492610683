//! Anonboard Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const TOKEN_ENV_VAR: &str = "DISCORD_BOT_TOKEN";
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub discord: DiscordConfig,
    #[serde(default)]
    pub gate: GateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    /// Falls back to `DISCORD_BOT_TOKEN` when absent.
    #[serde(default)]
    pub bot_token: Option<String>,
    pub guild_id: u64,
    pub public_channel_id: u64,
    pub audit_channel_id: u64,
    pub warning_channel_id: u64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
}

impl DiscordConfig {
    pub fn resolved_token(&self) -> Option<String> {
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .or_else(|| {
                std::env::var(TOKEN_ENV_VAR)
                    .ok()
                    .map(|token| token.trim().to_string())
                    .filter(|token| !token.is_empty())
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_interval_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_in_window")]
    pub max_in_window: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_interval_secs(),
            window_secs: default_interval_secs(),
            max_in_window: default_max_in_window(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_interval_secs() -> u64 {
    5
}

fn default_max_in_window() -> usize {
    5
}

fn default_max_concurrency() -> usize {
    8
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("anonboard").join("config.toml"))
    }

    /// Resolves `core.data_dir`, expanding a leading `~`. Defaults to `~/.anonboard`.
    pub fn data_dir(&self) -> PathBuf {
        let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match self.core.data_dir.as_deref() {
            Some("~") => home(),
            Some(dir) if dir.starts_with("~/") => home().join(dir.trim_start_matches("~/")),
            Some(dir) => PathBuf::from(dir),
            None => home().join(".anonboard"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let discord = &self.discord;

        if discord.resolved_token().is_none() {
            anyhow::bail!(
                "discord.bot_token is empty and {} is not set",
                TOKEN_ENV_VAR
            );
        }

        if discord.guild_id == 0 {
            anyhow::bail!("discord.guild_id must be set");
        }

        let destinations = [
            ("public_channel_id", discord.public_channel_id),
            ("audit_channel_id", discord.audit_channel_id),
            ("warning_channel_id", discord.warning_channel_id),
        ];
        let mut seen = HashSet::new();
        for (name, id) in destinations {
            if id == 0 {
                anyhow::bail!("discord.{} must be set", name);
            }
            if !seen.insert(id) {
                anyhow::bail!(
                    "discord.{} ({}) duplicates another destination channel",
                    name,
                    id
                );
            }
        }

        let api_base = url::Url::parse(&discord.api_base)
            .map_err(|e| anyhow::anyhow!("discord.api_base is not a valid URL: {}", e))?;
        if !matches!(api_base.scheme(), "http" | "https") {
            anyhow::bail!("discord.api_base must use http or https");
        }

        let gateway = url::Url::parse(&discord.gateway_url)
            .map_err(|e| anyhow::anyhow!("discord.gateway_url is not a valid URL: {}", e))?;
        if !matches!(gateway.scheme(), "ws" | "wss") {
            anyhow::bail!("discord.gateway_url must use ws or wss");
        }

        let gate = &self.gate;
        if gate.cooldown_secs == 0 {
            anyhow::bail!("gate.cooldown_secs must be > 0");
        }
        if gate.window_secs == 0 {
            anyhow::bail!("gate.window_secs must be > 0");
        }
        if gate.max_in_window == 0 {
            anyhow::bail!("gate.max_in_window must be > 0");
        }
        if gate.max_concurrency == 0 {
            anyhow::bail!("gate.max_concurrency must be > 0");
        }

        Ok(())
    }
}
