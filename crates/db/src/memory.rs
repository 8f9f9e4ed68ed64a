//! In-memory [`SessionStore`] with the same guarded semantics as Postgres.
//!
//! Each method takes the table lock once and never holds it across an
//! await, so concurrent callers see the same "exactly one winner" behavior
//! as the conditional `UPDATE`s in [`crate::repositories`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tandem_core::error::CoreError;
use tandem_core::matching::{BrokenReason, Match, MatchState};
use tandem_core::session::{Participant, ParticipantStatus, Session, SessionStatus};
use tandem_core::types::{DbId, Timestamp};

use crate::store::{SessionStore, StoreResult};

#[derive(Default)]
struct Tables {
    sessions: HashMap<DbId, Session>,
    participants: HashMap<(DbId, DbId), Participant>,
    matches: HashMap<DbId, Match>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<Session> {
        let mut tables = self.lock();
        if tables.sessions.contains_key(&session.id) {
            return Err(CoreError::Conflict(format!("Session {} already exists", session.id)).into());
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn get_session(&self, id: DbId) -> StoreResult<Option<Session>> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    async fn activate_session(&self, id: DbId, at: Timestamp) -> StoreResult<Option<Session>> {
        let mut tables = self.lock();
        match tables.sessions.get_mut(&id) {
            Some(session) if session.status == SessionStatus::Waiting => {
                session.status = SessionStatus::Active;
                session.started_at = Some(at);
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
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
        let mut tables = self.lock();
        match tables.sessions.get_mut(&id) {
            Some(session) if SessionStatus::OPEN.contains(&session.status) => {
                session.status = status;
                session.ended_at = Some(at);
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_participant(
        &self,
        participant: &Participant,
        max: usize,
    ) -> StoreResult<Participant> {
        let mut tables = self.lock();
        if !tables.sessions.contains_key(&participant.session_id) {
            return Err(CoreError::NotFound {
                entity: "session",
                id: participant.session_id,
            }
            .into());
        }

        let key = (participant.session_id, participant.user_id);
        if tables.participants.contains_key(&key) {
            return Err(CoreError::Conflict(format!(
                "User {} already joined session {}",
                participant.user_id, participant.session_id
            ))
            .into());
        }

        let count = tables
            .participants
            .keys()
            .filter(|(session_id, _)| *session_id == participant.session_id)
            .count();
        if count >= max {
            return Err(CoreError::Conflict(format!(
                "Session {} already has {max} participant(s)",
                participant.session_id
            ))
            .into());
        }

        tables.participants.insert(key, participant.clone());
        Ok(participant.clone())
    }

    async fn list_participants(&self, session_id: DbId) -> StoreResult<Vec<Participant>> {
        let tables = self.lock();
        let mut rows: Vec<Participant> = tables
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.joined_at, p.user_id));
        Ok(rows)
    }

    async fn advance_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        from: &[ParticipantStatus],
        to: ParticipantStatus,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>> {
        let mut tables = self.lock();
        match tables.participants.get_mut(&(session_id, user_id)) {
            Some(p) if from.contains(&p.status) => {
                p.status = to;
                if to.is_terminal() {
                    p.left_at = Some(at);
                }
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_participant_ready(
        &self,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>> {
        let mut tables = self.lock();
        match tables.participants.get_mut(&(session_id, user_id)) {
            Some(p) if p.ready_at.is_none() && ParticipantStatus::PRESENT.contains(&p.status) => {
                p.ready_at = Some(at);
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn touch_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> StoreResult<Option<Participant>> {
        let mut tables = self.lock();
        Ok(tables
            .participants
            .get_mut(&(session_id, user_id))
            .map(|p| {
                p.last_seen_at = Some(p.last_seen_at.map_or(at, |seen| seen.max(at)));
                p.clone()
            }))
    }

    async fn insert_match(&self, m: &Match) -> StoreResult<Match> {
        let mut tables = self.lock();
        if tables.matches.contains_key(&m.id) {
            return Err(CoreError::Conflict(format!("Match {} already exists", m.id)).into());
        }
        if tables.matches.values().any(|other| other.session_id == m.session_id) {
            return Err(CoreError::Conflict(format!(
                "Session {} already has a match",
                m.session_id
            ))
            .into());
        }
        tables.matches.insert(m.id, m.clone());
        Ok(m.clone())
    }

    async fn get_match(&self, id: DbId) -> StoreResult<Option<Match>> {
        Ok(self.lock().matches.get(&id).cloned())
    }

    async fn match_for_session(&self, session_id: DbId) -> StoreResult<Option<Match>> {
        Ok(self
            .lock()
            .matches
            .values()
            .find(|m| m.session_id == session_id)
            .cloned())
    }

    async fn transition_match(
        &self,
        id: DbId,
        from: &[MatchState],
        to: MatchState,
        reason: Option<BrokenReason>,
        at: Timestamp,
    ) -> StoreResult<Option<Match>> {
        let mut tables = self.lock();
        match tables.matches.get_mut(&id) {
            Some(m) if from.contains(&m.state) => {
                m.state = to;
                m.broken_reason = reason;
                m.updated_at = at;
                Ok(Some(m.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
