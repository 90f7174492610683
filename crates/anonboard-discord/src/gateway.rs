//! Discord Gateway session: hello, identify, heartbeats, dispatch decoding,
//! and reconnect with back-off.

use anonboard_ipc::{Envelope, EventBus, MessageKind};
use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{DiscordMessage, DiscordUser};

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;
pub const GATEWAY_INTENTS: u64 = INTENT_GUILDS | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;

/// Close codes after which reconnecting cannot succeed (bad token, bad intents, ...).
const FATAL_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Hello {
    heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct Ready {
    user: DiscordUser,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Reconnect,
    Fatal(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    None,
    HeartbeatNow,
    Acked,
    Reconnect,
}

pub struct DiscordGateway {
    bot_token: String,
    gateway_url: String,
    reconnect_delay: Duration,
    event_bus: Option<EventBus>,
}

impl DiscordGateway {
    pub fn new(bot_token: &str, gateway_url: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            gateway_url: gateway_url.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Keeps a session alive forever; returns only on a fatal close.
    pub async fn run(&self) -> Result<()> {
        info!("Discord gateway started");
        loop {
            match self.run_session().await {
                Ok(SessionEnd::Fatal(reason)) => {
                    return Err(anyhow!("discord gateway closed permanently: {}", reason));
                }
                Ok(SessionEnd::Reconnect) => {
                    info!("Discord gateway session ended, reconnecting");
                }
                Err(err) => {
                    warn!("Discord gateway error: {:#}", err);
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn run_session(&self) -> Result<SessionEnd> {
        let (socket, _) = connect_async(self.gateway_url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.gateway_url))?;
        let (mut sink, mut stream) = socket.split();

        let hello = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let payload: GatewayPayload = serde_json::from_str(&text)?;
                    if payload.op != OP_HELLO {
                        return Err(anyhow!("expected Hello, got op {}", payload.op));
                    }
                    break serde_json::from_value::<Hello>(payload.d)?;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(SessionEnd::Reconnect),
            }
        };

        sink.send(Message::text(self.identify_payload().to_string()))
            .await?;
        debug!(
            heartbeat_ms = hello.heartbeat_interval,
            "Discord gateway identified"
        );

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(hello.heartbeat_interval.max(1)));
        let mut sequence: Option<u64> = None;
        let mut self_id: Option<u64> = None;
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        warn!("Discord gateway heartbeat not acknowledged, reconnecting");
                        return Ok(SessionEnd::Reconnect);
                    }
                    sink.send(Message::text(heartbeat_payload(sequence).to_string())).await?;
                    awaiting_ack = true;
                }
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => return Err(err.into()),
                        None => return Ok(SessionEnd::Reconnect),
                    };

                    match message {
                        Message::Text(text) => {
                            let payload: GatewayPayload = match serde_json::from_str(&text) {
                                Ok(payload) => payload,
                                Err(err) => {
                                    warn!("Undecodable gateway payload: {}", err);
                                    continue;
                                }
                            };
                            if payload.s.is_some() {
                                sequence = payload.s;
                            }
                            match self.handle_payload(payload, &mut self_id) {
                                Action::None => {}
                                Action::Acked => awaiting_ack = false,
                                Action::HeartbeatNow => {
                                    let beat = heartbeat_payload(sequence).to_string();
                                    sink.send(Message::text(beat)).await?;
                                }
                                Action::Reconnect => return Ok(SessionEnd::Reconnect),
                            }
                        }
                        Message::Close(frame) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            info!(close_code = ?code, "Discord gateway closed the connection");
                            return Ok(classify_close(code));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn identify_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "anonboard",
                    "device": "anonboard",
                },
            },
        })
    }

    fn handle_payload(&self, payload: GatewayPayload, self_id: &mut Option<u64>) -> Action {
        match payload.op {
            OP_HEARTBEAT_ACK => Action::Acked,
            OP_HEARTBEAT => Action::HeartbeatNow,
            OP_RECONNECT => Action::Reconnect,
            OP_INVALID_SESSION => {
                warn!("Discord gateway invalidated the session");
                Action::Reconnect
            }
            OP_DISPATCH => {
                self.handle_dispatch(payload.t.as_deref(), payload.d, self_id);
                Action::None
            }
            _ => Action::None,
        }
    }

    fn handle_dispatch(
        &self,
        event: Option<&str>,
        data: serde_json::Value,
        self_id: &mut Option<u64>,
    ) {
        match event {
            Some("READY") => match serde_json::from_value::<Ready>(data) {
                Ok(ready) => {
                    info!(
                        bot_id = ready.user.id,
                        "Discord gateway ready as {}", ready.user.username
                    );
                    *self_id = Some(ready.user.id);
                }
                Err(err) => warn!("Failed to decode READY: {}", err),
            },
            Some("MESSAGE_CREATE") => match serde_json::from_value::<DiscordMessage>(data) {
                Ok(message) => self.forward_message(&message, *self_id),
                Err(err) => warn!("Failed to decode MESSAGE_CREATE: {}", err),
            },
            _ => {}
        }
    }

    fn forward_message(&self, message: &DiscordMessage, self_id: Option<u64>) {
        let Some(envelope) = direct_message_envelope(message, self_id) else {
            return;
        };

        if let Some(event_bus) = &self.event_bus {
            if let Err(e) = event_bus.publish(envelope) {
                warn!("Failed to publish message to event bus: {}", e);
            }
        } else {
            info!("No event bus configured, message not forwarded");
        }
    }
}

fn heartbeat_payload(sequence: Option<u64>) -> serde_json::Value {
    serde_json::json!({ "op": OP_HEARTBEAT, "d": sequence })
}

fn classify_close(code: Option<u16>) -> SessionEnd {
    match code {
        Some(code) if FATAL_CLOSE_CODES.contains(&code) => {
            SessionEnd::Fatal(format!("close code {}", code))
        }
        _ => SessionEnd::Reconnect,
    }
}

/// Envelope for a human-authored, non-empty direct message; `None` otherwise.
fn direct_message_envelope(message: &DiscordMessage, self_id: Option<u64>) -> Option<Envelope> {
    if message.author.bot || Some(message.author.id) == self_id {
        return None;
    }
    if message.guild_id.is_some() {
        return None;
    }
    if message.content.trim().is_empty() {
        debug!(message_id = message.id, "Skipping direct message without text");
        return None;
    }

    Some(
        Envelope::new(
            "discord",
            MessageKind::Message {
                from: message.author.id,
                text: message.content.clone(),
            },
        )
        .with_channel_id(message.channel_id)
        .with_message_id(message.id),
    )
}
