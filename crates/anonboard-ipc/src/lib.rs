//! Anonboard IPC
//!
//! Event bus carrying inbound platform messages from adapters to the core

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub schema_version: u16,
    pub trace_id: String,
    pub channel: String,
    pub kind: MessageKind,
    /// Platform channel the message arrived in (the DM channel for direct messages).
    pub channel_id: Option<u64>,
    /// `None` for direct messages.
    pub guild_id: Option<u64>,
    pub message_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Message { from: u64, text: String },
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            kind,
            channel_id: None,
            guild_id: None,
            message_id: None,
        }
    }

    pub fn with_channel_id(mut self, channel_id: u64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_guild_id(mut self, guild_id: u64) -> Self {
        self.guild_id = Some(guild_id);
        self
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }

    pub fn sender(&self) -> u64 {
        match &self.kind {
            MessageKind::Message { from, .. } => *from,
        }
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inbound: inbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    /// Fails when nothing is subscribed.
    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound
            .send(envelope)
            .map_err(|e| anyhow::anyhow!("no subscriber for envelope {}", e.0.trace_id))?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
