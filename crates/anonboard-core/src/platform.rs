//! Collaborator implementations backed by Discord and the SQLite message log.

use anonboard_discord::DiscordClient;
use anonboard_storage::Storage;
use anyhow::Result;
use tokio::sync::Mutex;

use crate::{MembershipDirectory, MessageLog, Messenger};

#[async_trait::async_trait]
impl MembershipDirectory for DiscordClient {
    async fn is_member(&self, user_id: u64) -> Result<bool> {
        Ok(self.is_guild_member(self.guild_id(), user_id).await?)
    }
}

#[async_trait::async_trait]
impl Messenger for DiscordClient {
    async fn send_direct(&self, user_id: u64, text: &str) -> Result<()> {
        Ok(self.send_direct_message(user_id, text).await?)
    }

    async fn send_to_channel(&self, channel_id: u64, text: &str) -> Result<()> {
        Ok(self.create_message(channel_id, text).await?)
    }
}

#[async_trait::async_trait]
impl MessageLog for Mutex<Storage> {
    async fn append(&self, content: &str, sender: u64) -> Result<i64> {
        self.lock().await.append_message(content, sender)
    }
}
