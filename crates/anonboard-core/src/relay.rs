//! Outbound side of the board: anonymous relay, attributed audit copy, and
//! the moderators' warning log.

use anonboard_config::DiscordConfig;
use anonboard_policy::{AdmissionOutcome, SenderId};
use std::sync::Arc;
use tracing::warn;

use crate::Messenger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destinations {
    pub public_channel: u64,
    pub audit_channel: u64,
    pub warning_channel: u64,
}

impl From<&DiscordConfig> for Destinations {
    fn from(config: &DiscordConfig) -> Self {
        Self {
            public_channel: config.public_channel_id,
            audit_channel: config.audit_channel_id,
            warning_channel: config.warning_channel_id,
        }
    }
}

pub fn mention(user_id: SenderId) -> String {
    format!("<@{}>", user_id)
}

pub struct RelayGateway {
    messenger: Arc<dyn Messenger>,
    destinations: Destinations,
}

impl RelayGateway {
    pub fn new(messenger: Arc<dyn Messenger>, destinations: Destinations) -> Self {
        Self {
            messenger,
            destinations,
        }
    }

    /// Posts `text` verbatim to the public channel and an attributed copy to
    /// the audit channel. Failures are logged and not retried.
    pub async fn publish(&self, text: &str, sender: SenderId) {
        if let Err(e) = self
            .messenger
            .send_to_channel(self.destinations.public_channel, text)
            .await
        {
            warn!(
                channel_id = self.destinations.public_channel,
                "Failed to relay anonymous message: {:#}", e
            );
        }

        let audit_line = format!("{}: {}", mention(sender), text);
        if let Err(e) = self
            .messenger
            .send_to_channel(self.destinations.audit_channel, &audit_line)
            .await
        {
            warn!(
                channel_id = self.destinations.audit_channel,
                "Failed to write audit copy: {:#}", e
            );
        }
    }

    pub async fn log_warning(&self, sender: SenderId, outcome: &AdmissionOutcome, content: &str) {
        let Some(reason) = outcome.audit_reason() else {
            return;
        };

        let line = format!("Warning sent: {} - {}: {}", mention(sender), reason, content);
        if let Err(e) = self
            .messenger
            .send_to_channel(self.destinations.warning_channel, &line)
            .await
        {
            warn!(
                channel_id = self.destinations.warning_channel,
                "Failed to write warning log entry: {:#}", e
            );
        }
    }
}
