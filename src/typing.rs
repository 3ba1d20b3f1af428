//! Typing indicators.
//!
//! Each peer has at most one live indicator. A repeated signal moves its
//! deadline forward instead of stacking a second timer, so the indicator
//! disappears `expiry` after the *last* signal. The tracker does not own a
//! timer task: the session loop sleeps until [`TypingTracker::next_deadline`]
//! and then calls [`TypingTracker::expire`], so dropping the loop cancels
//! every pending expiry at once.

use std::time::Duration;
use tokio::time::Instant;

use crate::model::ParticipantId;

#[derive(Debug, Clone, PartialEq)]
pub struct TypingIndicator {
    pub participant_id: ParticipantId,
    pub nickname: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    indicators: Vec<TypingIndicator>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            indicators: Vec::new(),
        }
    }

    /// Show (or refresh) the indicator for `participant_id`.
    ///
    /// Returns `true` if the indicator was not visible before.
    pub fn signal(&mut self, participant_id: ParticipantId, nickname: &str, now: Instant) -> bool {
        let expires_at = now + self.expiry;
        match self
            .indicators
            .iter_mut()
            .find(|i| i.participant_id == participant_id)
        {
            Some(existing) => {
                existing.expires_at = expires_at;
                existing.nickname = nickname.to_string();
                false
            }
            None => {
                self.indicators.push(TypingIndicator {
                    participant_id,
                    nickname: nickname.to_string(),
                    expires_at,
                });
                true
            }
        }
    }

    /// Hide the indicator immediately (explicit `stop_typing`).
    pub fn clear(&mut self, participant_id: &ParticipantId) -> bool {
        let before = self.indicators.len();
        self.indicators.retain(|i| &i.participant_id != participant_id);
        self.indicators.len() != before
    }

    /// Remove every indicator whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<TypingIndicator> {
        let (expired, live): (Vec<_>, Vec<_>) = self
            .indicators
            .drain(..)
            .partition(|i| i.expires_at <= now);
        self.indicators = live;
        expired
    }

    /// Earliest pending expiry, if any indicator is visible.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.indicators.iter().map(|i| i.expires_at).min()
    }

    pub fn clear_all(&mut self) -> bool {
        let had_any = !self.indicators.is_empty();
        self.indicators.clear();
        had_any
    }

    pub fn visible(&self) -> Vec<TypingIndicator> {
        self.indicators.clone()
    }

    pub fn is_typing(&self, participant_id: &ParticipantId) -> bool {
        self.indicators.iter().any(|i| &i.participant_id == participant_id)
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }
}

/// Throttle for this client's own outbound `typing` frames.
#[derive(Debug)]
pub struct OutboundTyping {
    throttle: Duration,
    last_sent: Option<Instant>,
}

impl OutboundTyping {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            last_sent: None,
        }
    }

    /// Whether a `typing` frame should go out now; records the send if so.
    pub fn should_send(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(at) if now.duration_since(at) < self.throttle => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Whether a `stop_typing` frame is owed; resets the throttle either way.
    pub fn take_stop(&mut self) -> bool {
        self.last_sent.take().is_some()
    }
}
