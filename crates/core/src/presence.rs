//! Presence status classification and the snapshot participants broadcast.
//!
//! [`PresenceClassifier`] is a purely local state machine: input activity
//! keeps a participant `active`, 60 seconds without any input makes them
//! `idle`, and a hidden page makes them `away` regardless of input.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::DbId;

/// Quiet period after which an active participant becomes idle.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// PresenceStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Active => "active",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Away => "away",
        }
    }
}

// ---------------------------------------------------------------------------
// PresenceSnapshot
// ---------------------------------------------------------------------------

/// What one participant tells the other about themselves. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub user_id: DbId,
    pub avatar_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    pub goal_text: String,
    /// Epoch milliseconds at which the snapshot was taken.
    pub last_heartbeat: i64,
}

// ---------------------------------------------------------------------------
// PresenceClassifier
// ---------------------------------------------------------------------------

/// Local active/idle/away state machine.
///
/// Time is always passed in so the classifier can be driven by any clock.
#[derive(Debug, Clone)]
pub struct PresenceClassifier {
    idle_after: Duration,
    last_activity: Instant,
    hidden: bool,
}

impl PresenceClassifier {
    /// A classifier that considers the participant active as of `now`.
    pub fn new(idle_after: Duration, now: Instant) -> Self {
        Self {
            idle_after,
            last_activity: now,
            hidden: false,
        }
    }

    /// Pointer, key, touch or scroll input.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Page visibility change. Becoming visible counts as fresh activity.
    pub fn set_visibility(&mut self, visible: bool, now: Instant) {
        self.hidden = !visible;
        if visible {
            self.last_activity = now;
        }
    }

    pub fn status_at(&self, now: Instant) -> PresenceStatus {
        if self.hidden {
            PresenceStatus::Away
        } else if now.saturating_duration_since(self.last_activity) >= self.idle_after {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Active
        }
    }

    /// When the participant will turn idle if nothing else happens.
    /// `None` while the page is hidden.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.hidden {
            None
        } else {
            Some(self.last_activity + self.idle_after)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
