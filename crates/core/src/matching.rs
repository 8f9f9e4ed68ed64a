//! Duo match rows, the match state machine, and poll/push reconciliation.
//!
//! The heartbeat poll and the `match:{id}` push channel both report a match
//! state. [`MatchReconciler`] merges them with a fixed total order
//! (`broken > completed > active > preparing`): the higher rank wins, and
//! once a terminal state is held nothing replaces it. A broken match is never
//! repaired; requeueing produces a new match with a new id.

use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Themes
// ---------------------------------------------------------------------------

/// Theme used when a requeue does not name one.
pub const DEFAULT_THEME: &str = "rainy_cafe";

// ---------------------------------------------------------------------------
// MatchState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Preparing,
    Active,
    Broken,
    Completed,
}

impl MatchState {
    /// States a match can still leave.
    pub const LIVE: [MatchState; 2] = [MatchState::Preparing, MatchState::Active];

    /// Precedence used when two observations disagree.
    pub fn rank(&self) -> u8 {
        match self {
            MatchState::Preparing => 0,
            MatchState::Active => 1,
            MatchState::Completed => 2,
            MatchState::Broken => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchState::Broken | MatchState::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchState::Preparing => "preparing",
            MatchState::Active => "active",
            MatchState::Broken => "broken",
            MatchState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "preparing" => Some(MatchState::Preparing),
            "active" => Some(MatchState::Active),
            "broken" => Some(MatchState::Broken),
            "completed" => Some(MatchState::Completed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BrokenReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenReason {
    /// The partner stopped heartbeating past the server-side threshold.
    PartnerTimeout,
    /// A participant explicitly left.
    UserExit,
}

impl BrokenReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokenReason::PartnerTimeout => "partner_timeout",
            BrokenReason::UserExit => "user_exit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "partner_timeout" => Some(BrokenReason::PartnerTimeout),
            "user_exit" => Some(BrokenReason::UserExit),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rows and procedure replies
// ---------------------------------------------------------------------------

/// Pairing metadata layered over the two participants of a duo session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: DbId,
    pub session_id: DbId,
    pub state: MatchState,
    pub broken_reason: Option<BrokenReason>,
    pub pomodoro_duration: u32,
    pub theme: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// What a client needs to enter a match handed out by the matchmaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAssignment {
    pub match_id: DbId,
    pub session_id: DbId,
    pub duration_minutes: u32,
    pub theme: String,
}

impl From<&Match> for MatchAssignment {
    fn from(m: &Match) -> Self {
        Self {
            match_id: m.id,
            session_id: m.session_id,
            duration_minutes: m.pomodoro_duration,
            theme: m.theme.clone(),
        }
    }
}

/// Reply of the liveness-check procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub partner_alive: bool,
    pub match_state: MatchState,
    pub broken_reason: Option<BrokenReason>,
}

/// Reply of the mark-ready procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyReport {
    pub both_ready: bool,
    pub match_state: MatchState,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// A state change accepted by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchTransition {
    pub from: MatchState,
    pub to: MatchState,
    pub broken_reason: Option<BrokenReason>,
}

/// Locally observed state of one match id, fed by poll and push alike.
#[derive(Debug, Clone)]
pub struct MatchReconciler {
    state: MatchState,
    broken_reason: Option<BrokenReason>,
}

impl MatchReconciler {
    pub fn new(initial: MatchState) -> Self {
        Self {
            state: initial,
            broken_reason: None,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn broken_reason(&self) -> Option<BrokenReason> {
        self.broken_reason
    }

    /// Merge one observation. Returns the transition if the observation
    /// outranks the held state and the held state is not terminal.
    pub fn observe(
        &mut self,
        observed: MatchState,
        reason: Option<BrokenReason>,
    ) -> Option<MatchTransition> {
        if self.state.is_terminal() || observed.rank() <= self.state.rank() {
            return None;
        }

        let from = self.state;
        self.state = observed;
        if observed == MatchState::Broken {
            // A break reported without a reason came from a partner that
            // vanished rather than one that said goodbye.
            self.broken_reason = Some(reason.unwrap_or(BrokenReason::PartnerTimeout));
        }

        Some(MatchTransition {
            from,
            to: observed,
            broken_reason: self.broken_reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn rank_order_is_total() {
        assert!(MatchState::Broken.rank() > MatchState::Completed.rank());
        assert!(MatchState::Completed.rank() > MatchState::Active.rank());
        assert!(MatchState::Active.rank() > MatchState::Preparing.rank());
    }

    #[test]
    fn preparing_to_active_is_accepted() {
        let mut r = MatchReconciler::new(MatchState::Preparing);
        let t = r.observe(MatchState::Active, None);
        assert_matches!(
            t,
            Some(MatchTransition {
                from: MatchState::Preparing,
                to: MatchState::Active,
                broken_reason: None
            })
        );
        assert_eq!(r.state(), MatchState::Active);
    }

    #[test]
    fn stale_preparing_does_not_revert_active() {
        let mut r = MatchReconciler::new(MatchState::Preparing);
        r.observe(MatchState::Active, None);
        assert!(r.observe(MatchState::Preparing, None).is_none());
        assert_eq!(r.state(), MatchState::Active);
    }

    #[test]
    fn broken_is_sticky_against_later_active_pushes() {
        let mut r = MatchReconciler::new(MatchState::Preparing);
        r.observe(MatchState::Broken, Some(BrokenReason::PartnerTimeout));

        for _ in 0..3 {
            assert!(r.observe(MatchState::Active, None).is_none());
            assert!(r.observe(MatchState::Preparing, None).is_none());
        }
        assert_eq!(r.state(), MatchState::Broken);
        assert_eq!(r.broken_reason(), Some(BrokenReason::PartnerTimeout));
    }

    #[test]
    fn completed_is_not_replaced_by_broken() {
        let mut r = MatchReconciler::new(MatchState::Active);
        r.observe(MatchState::Completed, None);
        assert!(r
            .observe(MatchState::Broken, Some(BrokenReason::UserExit))
            .is_none());
        assert_eq!(r.state(), MatchState::Completed);
        assert_eq!(r.broken_reason(), None);
    }

    #[test]
    fn repeated_identical_observation_is_not_a_transition() {
        let mut r = MatchReconciler::new(MatchState::Active);
        assert!(r.observe(MatchState::Active, None).is_none());
    }

    #[test]
    fn broken_without_reason_defaults_to_partner_timeout() {
        let mut r = MatchReconciler::new(MatchState::Active);
        let t = r.observe(MatchState::Broken, None).unwrap();
        assert_eq!(t.broken_reason, Some(BrokenReason::PartnerTimeout));
    }

    #[test]
    fn heartbeat_report_wire_format() {
        let report = HeartbeatReport {
            partner_alive: false,
            match_state: MatchState::Broken,
            broken_reason: Some(BrokenReason::PartnerTimeout),
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["match_state"], "broken");
        assert_eq!(json["broken_reason"], "partner_timeout");
    }
}
