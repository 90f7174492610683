//! Anonboard Policy Engine
//!
//! Rate limiting, content validation, and the admission decision for
//! anonymous posts

mod content;
mod rate;

pub use content::{contains_url, ContentFilter, DEFAULT_FORBIDDEN_TERMS};
pub use rate::{RateDecision, RateLimiter};

use anonboard_config::GateConfig;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::debug;

/// Platform user id of the member sending a direct message.
pub type SenderId = u64;

const WARN_TOO_FAST: &str = "Warning: the interval between your messages is too short.";
const WARN_TOO_MANY: &str = "Warning: too many messages in the window, try again shortly.";
const WARN_URL: &str = "Warning: no URLs allowed, please do not send links.";
const WARN_FORBIDDEN: &str = "Warning! Your message contains violent language and was not posted.\n\
Please think it over and write it again!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Accepted,
    RejectedRateTooFast,
    RejectedTooManyInWindow,
    RejectedContainsUrl,
    RejectedForbiddenTerm(String),
}

impl AdmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Text sent privately to the sender. `None` for an accepted message.
    pub fn warning(&self) -> Option<&'static str> {
        match self {
            Self::Accepted => None,
            Self::RejectedRateTooFast => Some(WARN_TOO_FAST),
            Self::RejectedTooManyInWindow => Some(WARN_TOO_MANY),
            Self::RejectedContainsUrl => Some(WARN_URL),
            // The admonition deliberately does not echo the matched term.
            Self::RejectedForbiddenTerm(_) => Some(WARN_FORBIDDEN),
        }
    }

    /// Reason written to the moderators' warning log.
    pub fn audit_reason(&self) -> Option<&'static str> {
        match self {
            Self::Accepted => None,
            Self::RejectedRateTooFast => Some("interval too short"),
            Self::RejectedTooManyInWindow => Some("too many messages in window"),
            Self::RejectedContainsUrl => Some("message contains a URL"),
            Self::RejectedForbiddenTerm(_) => Some("forbidden term"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RejectedRateTooFast => "rejected_rate_too_fast",
            Self::RejectedTooManyInWindow => "rejected_too_many_in_window",
            Self::RejectedContainsUrl => "rejected_contains_url",
            Self::RejectedForbiddenTerm(_) => "rejected_forbidden_term",
        }
    }
}

impl fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered gate: cool-down, window cap, URL, forbidden term. The first
/// failing check decides the outcome and nothing after it runs.
#[derive(Debug)]
pub struct AdmissionPipeline {
    rate_limiter: RateLimiter,
    content: ContentFilter,
}

impl AdmissionPipeline {
    pub fn new(rate_limiter: RateLimiter, content: ContentFilter) -> Self {
        Self {
            rate_limiter,
            content,
        }
    }

    pub fn from_config(gate: &GateConfig) -> Self {
        Self::new(RateLimiter::from_config(gate), ContentFilter::default())
    }

    pub fn evaluate(
        &mut self,
        sender: SenderId,
        text: &str,
        now: DateTime<Utc>,
    ) -> AdmissionOutcome {
        let outcome = match self.rate_limiter.check_and_record(sender, now) {
            RateDecision::DenyFast => AdmissionOutcome::RejectedRateTooFast,
            RateDecision::DenyWindow => AdmissionOutcome::RejectedTooManyInWindow,
            RateDecision::Admit => {
                if self.content.contains_url(text) {
                    AdmissionOutcome::RejectedContainsUrl
                } else if let Some(term) = self.content.contains_forbidden_term(text) {
                    AdmissionOutcome::RejectedForbiddenTerm(term.to_string())
                } else {
                    AdmissionOutcome::Accepted
                }
            }
        };

        debug!(sender, outcome = %outcome, "admission evaluated");
        outcome
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
