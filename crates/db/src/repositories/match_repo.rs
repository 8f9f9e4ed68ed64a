//! Repository for the `focus_matches` table.

use sqlx::PgPool;
use tandem_core::matching::{BrokenReason, Match, MatchState};
use tandem_core::types::{DbId, Timestamp};

use super::status_list;
use crate::models::focus_match::MatchRow;

/// Column list shared across queries to avoid repetition.
const COLUMNS: &str =
    "id, session_id, state, broken_reason, pomodoro_duration, theme, created_at, updated_at";

/// Provides guarded reads and writes for duo matches.
pub struct MatchRepo;

impl MatchRepo {
    pub async fn create(pool: &PgPool, m: &Match) -> Result<MatchRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO focus_matches (id, session_id, state, broken_reason, pomodoro_duration, theme, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MatchRow>(&query)
            .bind(m.id)
            .bind(m.session_id)
            .bind(m.state.as_str())
            .bind(m.broken_reason.map(|r| r.as_str()))
            .bind(m.pomodoro_duration as i32)
            .bind(&m.theme)
            .bind(m.created_at)
            .bind(m.updated_at)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<MatchRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM focus_matches WHERE id = $1");
        sqlx::query_as::<_, MatchRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The match layered over a duo session, if any.
    pub async fn find_by_session(
        pool: &PgPool,
        session_id: DbId,
    ) -> Result<Option<MatchRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM focus_matches WHERE session_id = $1");
        sqlx::query_as::<_, MatchRow>(&query)
            .bind(session_id)
            .fetch_optional(pool)
            .await
    }

    /// Move a match to `to` if its current state is one of `from`.
    ///
    /// Returns `None` when the guard did not match (the match already moved
    /// on); a broken match is never written again.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: &[MatchState],
        to: MatchState,
        reason: Option<BrokenReason>,
        at: Timestamp,
    ) -> Result<Option<MatchRow>, sqlx::Error> {
        let query = format!(
            "UPDATE focus_matches
             SET state = $2, broken_reason = $3, updated_at = $4
             WHERE id = $1 AND state = ANY($5)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MatchRow>(&query)
            .bind(id)
            .bind(to.as_str())
            .bind(reason.map(|r| r.as_str()))
            .bind(at)
            .bind(status_list(from, MatchState::as_str))
            .fetch_optional(pool)
            .await
    }
}
