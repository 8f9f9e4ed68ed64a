//! The `SessionStore` seam and its Postgres implementation.
//!
//! Every mutating method is guarded on the row's current status and
//! returns `Ok(None)` when the guard misses. Callers treat a miss as
//! "someone got there first" and re-read, never as an error.

use async_trait::async_trait;
use tandem_core::error::CoreError;
use tandem_core::matching::{BrokenReason, Match, MatchState};
use tandem_core::session::{Participant, ParticipantStatus, Session, SessionStatus};
use tandem_core::types::{DbId, Timestamp};

use crate::repositories::{MatchRepo, ParticipantRepo, SessionRepo};
use crate::DbPool;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// A row held a value the domain types cannot represent.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> StoreResult<Session>;

    async fn get_session(&self, id: DbId) -> StoreResult<Option<Session>>;

    /// Guarded `waiting -> active`, stamping `started_at = at`.
    async fn activate_session(&self, id: DbId, at: Timestamp) -> StoreResult<Option<Session>>;

    /// Guarded `waiting|active -> status` where `status` is terminal.
    async fn close_session(
        &self,
        id: DbId,
        status: SessionStatus,
        at: Timestamp,
    ) -> StoreResult<Option<Session>>;

    /// Insert a participant; fails with [`CoreError::Conflict`] once the
    /// session holds `max` participants.
    async fn insert_participant(
        &self,
        participant: &Participant,
        max: usize,
    ) -> StoreResult<Participant>;

    async fn list_participants(&self, session_id: DbId) -> StoreResult<Vec<Participant>>;

    /// Guarded forward move of a participant whose status is in `from`.
    async fn advance_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        from: &[ParticipantStatus],
        to: ParticipantStatus,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>>;

    /// Stamp `ready_at` once on a present participant.
    async fn mark_participant_ready(
        &self,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>>;

    /// Record a heartbeat; `last_seen_at` never moves backwards.
    async fn touch_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>>;

    async fn insert_match(&self, m: &Match) -> StoreResult<Match>;

    async fn get_match(&self, id: DbId) -> StoreResult<Option<Match>>;

    async fn match_for_session(&self, session_id: DbId) -> StoreResult<Option<Match>>;

    /// Guarded match transition from any of `from` to `to`.
    async fn transition_match(
        &self,
        id: DbId,
        from: &[MatchState],
        to: MatchState,
        reason: Option<BrokenReason>,
        at: Timestamp,
    ) -> StoreResult<Option<Match>>;

    /// Confirm the backing store is reachable.
    async fn ping(&self) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// [`SessionStore`] over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn convert<R, T>(row: Option<R>) -> StoreResult<Option<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    row.map(T::try_from).transpose()
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<Session> {
        SessionRepo::create(&self.pool, session).await?.try_into()
    }

    async fn get_session(&self, id: DbId) -> StoreResult<Option<Session>> {
        convert(SessionRepo::find_by_id(&self.pool, id).await?)
    }

    async fn activate_session(&self, id: DbId, at: Timestamp) -> StoreResult<Option<Session>> {
        convert(SessionRepo::activate(&self.pool, id, at).await?)
    }

    async fn close_session(
        &self,
        id: DbId,
        status: SessionStatus,
        at: Timestamp,
    ) -> StoreResult<Option<Session>> {
        if !status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "Cannot close a session into non-terminal status '{}'",
                status.as_str()
            ))
            .into());
        }
        convert(SessionRepo::close(&self.pool, id, status, at).await?)
    }

    async fn insert_participant(
        &self,
        participant: &Participant,
        max: usize,
    ) -> StoreResult<Participant> {
        match ParticipantRepo::create_capped(&self.pool, participant, max).await? {
            Some(row) => row.try_into(),
            None => Err(CoreError::Conflict(format!(
                "Session {} already has {max} participant(s)",
                participant.session_id
            ))
            .into()),
        }
    }

    async fn list_participants(&self, session_id: DbId) -> StoreResult<Vec<Participant>> {
        ParticipantRepo::list_for_session(&self.pool, session_id)
            .await?
            .into_iter()
            .map(Participant::try_from)
            .collect()
    }

    async fn advance_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        from: &[ParticipantStatus],
        to: ParticipantStatus,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>> {
        convert(ParticipantRepo::advance(&self.pool, session_id, user_id, from, to, at).await?)
    }

    async fn mark_participant_ready(
        &self,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>> {
        convert(ParticipantRepo::mark_ready(&self.pool, session_id, user_id, at).await?)
    }

    async fn touch_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>> {
        convert(ParticipantRepo::touch(&self.pool, session_id, user_id, at).await?)
    }

    async fn insert_match(&self, m: &Match) -> StoreResult<Match> {
        MatchRepo::create(&self.pool, m).await?.try_into()
    }

    async fn get_match(&self, id: DbId) -> StoreResult<Option<Match>> {
        convert(MatchRepo::find_by_id(&self.pool, id).await?)
    }

    async fn match_for_session(&self, session_id: DbId) -> StoreResult<Option<Match>> {
        convert(MatchRepo::find_by_session(&self.pool, session_id).await?)
    }

    async fn transition_match(
        &self,
        id: DbId,
        from: &[MatchState],
        to: MatchState,
        reason: Option<BrokenReason>,
        at: Timestamp,
    ) -> StoreResult<Option<Match>> {
        convert(MatchRepo::transition(&self.pool, id, from, to, reason, at).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        crate::health_check(&self.pool).await?;
        Ok(())
    }
}
