//! Session and participant rows, their status machines, and validation.
//!
//! A session's `started_at` is written exactly once, on `waiting -> active`,
//! and a terminal status never changes again. Participant statuses only ever
//! move forward (see [`ParticipantStatus::can_advance_to`]).

use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Duration constants
// ---------------------------------------------------------------------------

/// Shortest focus period a session may be created with.
pub const MIN_DURATION_MINUTES: u32 = 1;

/// Longest focus period a session may be created with (3 hours).
pub const MAX_DURATION_MINUTES: u32 = 180;

/// Upper bound on participants for a duo session.
pub const MAX_DUO_PARTICIPANTS: usize = 2;

// ---------------------------------------------------------------------------
// SessionMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Solo,
    Duo,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Solo => "solo",
            SessionMode::Duo => "duo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "solo" => Some(SessionMode::Solo),
            "duo" => Some(SessionMode::Duo),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    /// Statuses a session can still be moved out of.
    pub const OPEN: [SessionStatus; 2] = [SessionStatus::Waiting, SessionStatus::Active];

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(SessionStatus::Waiting),
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }

    /// Whether the store may move a session from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Waiting, SessionStatus::Active) => true,
            (SessionStatus::Waiting | SessionStatus::Active, s) => s.is_terminal(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ParticipantStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Waiting,
    Active,
    LeftEarly,
    Completed,
}

impl ParticipantStatus {
    /// Statuses a participant can still be moved out of.
    pub const PRESENT: [ParticipantStatus; 2] =
        [ParticipantStatus::Waiting, ParticipantStatus::Active];

    pub fn is_terminal(&self) -> bool {
        matches!(self, ParticipantStatus::LeftEarly | ParticipantStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Waiting => "waiting",
            ParticipantStatus::Active => "active",
            ParticipantStatus::LeftEarly => "left_early",
            ParticipantStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(ParticipantStatus::Waiting),
            "active" => Some(ParticipantStatus::Active),
            "left_early" => Some(ParticipantStatus::LeftEarly),
            "completed" => Some(ParticipantStatus::Completed),
            _ => None,
        }
    }

    /// Monotonic ordering: a participant never moves backwards, and the two
    /// terminal statuses never replace each other.
    pub fn can_advance_to(&self, next: ParticipantStatus) -> bool {
        match (self, next) {
            (ParticipantStatus::Waiting, ParticipantStatus::Waiting) => false,
            (ParticipantStatus::Waiting, _) => true,
            (ParticipantStatus::Active, s) => s.is_terminal(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One focus period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: DbId,
    pub mode: SessionMode,
    pub duration_minutes: u32,
    pub status: SessionStatus,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Session {
    pub fn total_seconds(&self) -> u32 {
        self.duration_minutes * 60
    }
}

/// One user's membership in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: DbId,
    pub user_id: DbId,
    pub status: ParticipantStatus,
    pub joined_at: Timestamp,
    pub left_at: Option<Timestamp>,
    /// Set once when the participant marks the match ready.
    pub ready_at: Option<Timestamp>,
    /// Refreshed by every heartbeat the participant sends.
    pub last_seen_at: Option<Timestamp>,
}

impl Participant {
    /// Last moment the server heard from this participant.
    pub fn last_sign_of_life(&self) -> Timestamp {
        self.last_seen_at.unwrap_or(self.joined_at)
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate a requested focus duration. Returns `Ok(())` or an error message.
pub fn validate_duration(minutes: u32) -> Result<(), String> {
    if minutes < MIN_DURATION_MINUTES {
        return Err(format!(
            "Duration must be at least {MIN_DURATION_MINUTES} minute(s), got {minutes}"
        ));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(format!(
            "Duration must be at most {MAX_DURATION_MINUTES} minutes, got {minutes}"
        ));
    }
    Ok(())
}

/// Whole minutes covered by `seconds`, as passed to the early-exit procedure.
pub fn whole_minutes(seconds: u32) -> u32 {
    seconds / 60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips_through_str() {
        for status in [
            SessionStatus::Waiting,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Abandoned,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("paused"), None);
    }

    #[test]
    fn terminal_session_never_transitions() {
        for terminal in [SessionStatus::Completed, SessionStatus::Abandoned] {
            for next in [
                SessionStatus::Waiting,
                SessionStatus::Active,
                SessionStatus::Completed,
                SessionStatus::Abandoned,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn active_session_cannot_restart() {
        assert!(SessionStatus::Waiting.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Waiting));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn participant_status_is_monotonic() {
        use ParticipantStatus::*;
        assert!(Waiting.can_advance_to(Active));
        assert!(Waiting.can_advance_to(LeftEarly));
        assert!(Active.can_advance_to(Completed));
        assert!(Active.can_advance_to(LeftEarly));
        assert!(!Active.can_advance_to(Waiting));
        assert!(!Completed.can_advance_to(Active));
        assert!(!Completed.can_advance_to(LeftEarly));
        assert!(!LeftEarly.can_advance_to(Completed));
    }

    #[test]
    fn participant_status_serializes_snake_case() {
        let json = serde_json::to_string(&ParticipantStatus::LeftEarly).unwrap();
        assert_eq!(json, "\"left_early\"");
    }

    #[test]
    fn duration_bounds() {
        assert!(validate_duration(25).is_ok());
        assert!(validate_duration(MIN_DURATION_MINUTES).is_ok());
        assert!(validate_duration(MAX_DURATION_MINUTES).is_ok());
        assert!(validate_duration(0).is_err());
        assert!(validate_duration(MAX_DURATION_MINUTES + 1).is_err());
    }

    #[test]
    fn whole_minutes_floors() {
        assert_eq!(whole_minutes(0), 0);
        assert_eq!(whole_minutes(59), 0);
        assert_eq!(whole_minutes(61), 1);
        assert_eq!(whole_minutes(1500), 25);
    }
}
