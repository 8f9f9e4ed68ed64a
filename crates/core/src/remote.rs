//! The remote procedures a client calls, and the beacon it fires on unload.
//!
//! Both sides of the wire implement these traits: the store-backed server
//! implementation in `tandem-db`, the HTTP client in `tandem-engine`, and the
//! fakes in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::matching::{BrokenReason, HeartbeatReport, Match, ReadyReport};
use crate::session::{Participant, Session, SessionMode};
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Scoring result of a completed session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub xp_earned: i32,
    pub trust_change: i32,
    pub new_streak: i32,
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The request never produced a response (connect, timeout, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The server answered with a body we could not interpret.
    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RemoteError {
    /// Failures worth retrying on the next scheduled tick.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Rejected { status, .. } => *status >= 500 || *status == 408,
            RemoteError::Malformed(_) | RemoteError::Core(_) => false,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

// ---------------------------------------------------------------------------
// RemoteProcedures
// ---------------------------------------------------------------------------

/// Procedures exposed by the durable store and its collaborators.
///
/// Every mutating procedure is a guarded update on the server: calling it
/// twice, or racing another client, converges instead of corrupting state.
#[async_trait]
pub trait RemoteProcedures: Send + Sync {
    /// Create a session and the caller's participant row; returns the id.
    async fn create_session(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        mode: SessionMode,
    ) -> RemoteResult<DbId>;

    /// Move `waiting -> active`, stamping `started_at`. A session that is
    /// already past `waiting` is returned unchanged.
    async fn transition_session_to_active(&self, session_id: DbId) -> RemoteResult<Session>;

    async fn complete_session(
        &self,
        session_id: DbId,
        user_id: DbId,
        goal_completed: bool,
    ) -> RemoteResult<CompletionOutcome>;

    async fn record_early_exit(
        &self,
        session_id: DbId,
        user_id: DbId,
        elapsed_minutes: u32,
        total_minutes: u32,
    ) -> RemoteResult<()>;

    /// Liveness check for the caller's partner in a match.
    async fn match_heartbeat(&self, match_id: DbId, user_id: DbId) -> RemoteResult<HeartbeatReport>;

    async fn mark_match_ready(&self, match_id: DbId, user_id: DbId) -> RemoteResult<ReadyReport>;

    /// Re-enter matchmaking after a break; returns a brand-new match id.
    async fn requeue_after_break(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        theme: &str,
    ) -> RemoteResult<DbId>;

    async fn break_match(&self, match_id: DbId, reason: BrokenReason) -> RemoteResult<()>;

    async fn fetch_session(&self, session_id: DbId) -> RemoteResult<Session>;

    async fn fetch_match(&self, match_id: DbId) -> RemoteResult<Match>;

    async fn list_participants(&self, session_id: DbId) -> RemoteResult<Vec<Participant>>;
}

// ---------------------------------------------------------------------------
// Beacon
// ---------------------------------------------------------------------------

/// A request that must be allowed to outlive the page that sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeaconRequest {
    /// Mark the session `abandoned` if it is still `waiting` or `active`.
    AbandonSession { session_id: DbId },
    /// Mark the participant `left_early` under the same condition.
    LeaveSession { session_id: DbId, user_id: DbId },
}

/// Fire-and-forget sender. Implementations must return immediately and
/// never report delivery; a dropped beacon is accepted residual risk.
pub trait Beacon: Send + Sync {
    fn send(&self, request: BeaconRequest);
}
