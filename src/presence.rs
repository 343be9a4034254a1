//! Typing presence
//!
//! Two deadline slots drive the state machine: the local quiet-period clear and
//! the forced expiry of the remote indicator. Re-arming a slot replaces its
//! deadline; nothing is left scheduled behind it. The owning session sleeps
//! until `next_deadline()` and calls `fire_due`.

use crate::messages::{TypingPayload, UserId};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// What the UI shows about the other participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub is_typing: bool,
    pub who: Option<UserId>,
}

/// Outcome of the timers that came due
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fired {
    /// "Stopped typing" to broadcast for the local user
    pub stop_broadcast: Option<TypingPayload>,
    /// The remote indicator timed out
    pub remote_expired: bool,
}

#[derive(Debug)]
pub struct PresenceSignal {
    me: UserId,
    other: UserId,
    quiet_period: Duration,
    expiry: Duration,
    local_typing: bool,
    local_clear_at: Option<Instant>,
    remote_expires_at: Option<Instant>,
}

impl PresenceSignal {
    pub fn new(me: UserId, other: UserId, quiet_period: Duration, expiry: Duration) -> Self {
        Self {
            me,
            other,
            quiet_period,
            expiry,
            local_typing: false,
            local_clear_at: None,
            remote_expires_at: None,
        }
    }

    fn payload(&self, is_typing: bool) -> TypingPayload {
        TypingPayload {
            user_id: self.me.clone(),
            is_typing,
        }
    }

    /// Local keystroke; returns the payload to broadcast right away
    pub fn on_local_input(&mut self, has_content: bool, now: Instant) -> TypingPayload {
        self.local_typing = has_content;
        self.local_clear_at = if has_content {
            Some(now + self.quiet_period)
        } else {
            None
        };
        self.payload(has_content)
    }

    /// A message went out; stop typing immediately
    pub fn on_send(&mut self) -> TypingPayload {
        self.local_typing = false;
        self.local_clear_at = None;
        self.payload(false)
    }

    /// Typing broadcast from the channel. Returns true if the visible state changed.
    pub fn on_remote_typing(&mut self, payload: &TypingPayload, now: Instant) -> bool {
        if payload.user_id != self.other {
            return false;
        }

        if payload.is_typing {
            let was_typing = self.remote_expires_at.is_some();
            self.remote_expires_at = Some(now + self.expiry);
            !was_typing
        } else {
            self.remote_expires_at.take().is_some()
        }
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.local_clear_at, self.remote_expires_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every slot whose deadline is at or before `now`
    pub fn fire_due(&mut self, now: Instant) -> Fired {
        let mut fired = Fired::default();

        if self.local_clear_at.is_some_and(|at| at <= now) {
            self.local_clear_at = None;
            self.local_typing = false;
            fired.stop_broadcast = Some(self.payload(false));
        }

        if self.remote_expires_at.is_some_and(|at| at <= now) {
            self.remote_expires_at = None;
            fired.remote_expired = true;
        }

        fired
    }

    pub fn local_typing(&self) -> bool {
        self.local_typing
    }

    pub fn view(&self) -> PresenceView {
        if self.remote_expires_at.is_some() {
            PresenceView {
                is_typing: true,
                who: Some(self.other.clone()),
            }
        } else {
            PresenceView::default()
        }
    }

    /// Drop all timers and return to idle
    pub fn reset(&mut self) {
        self.local_typing = false;
        self.local_clear_at = None;
        self.remote_expires_at = None;
    }
}
