//! Per-sender cool-down with a global sliding-window cap.

use anonboard_config::GateConfig;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::SenderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admit,
    /// Sender is still inside its own cool-down. State is left untouched.
    DenyFast,
    /// Too many distinct senders posted within the window. The sender's
    /// timestamp has already been recorded.
    DenyWindow,
}

#[derive(Debug)]
pub struct RateLimiter {
    cooldown: Duration,
    window: Duration,
    max_in_window: usize,
    last_send: HashMap<SenderId, DateTime<Utc>>,
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

impl RateLimiter {
    pub fn new(
        cooldown: std::time::Duration,
        window: std::time::Duration,
        max_in_window: usize,
    ) -> Self {
        Self {
            cooldown: to_chrono(cooldown),
            window: to_chrono(window),
            max_in_window,
            last_send: HashMap::new(),
        }
    }

    pub fn from_config(gate: &GateConfig) -> Self {
        Self::new(
            std::time::Duration::from_secs(gate.cooldown_secs),
            std::time::Duration::from_secs(gate.window_secs),
            gate.max_in_window,
        )
    }

    pub fn check_and_record(&mut self, sender: SenderId, now: DateTime<Utc>) -> RateDecision {
        self.evict_stale(now);

        if let Some(last) = self.last_send.get(&sender) {
            if now - *last < self.cooldown {
                return RateDecision::DenyFast;
            }
        }

        // Recorded before the window check: a DenyWindow still starts a new cool-down.
        self.last_send.insert(sender, now);

        let in_window = self
            .last_send
            .values()
            .filter(|sent_at| now - **sent_at < self.window)
            .count();
        if in_window >= self.max_in_window {
            return RateDecision::DenyWindow;
        }

        RateDecision::Admit
    }

    pub fn last_send_time(&self, sender: SenderId) -> Option<DateTime<Utc>> {
        self.last_send.get(&sender).copied()
    }

    pub fn tracked_senders(&self) -> usize {
        self.last_send.len()
    }

    /// Drops entries old enough to affect neither check. Future timestamps
    /// (wall clock stepped back) are kept.
    fn evict_stale(&mut self, now: DateTime<Utc>) {
        let horizon = self.cooldown.max(self.window);
        self.last_send.retain(|_, sent_at| now - *sent_at < horizon);
    }
}
