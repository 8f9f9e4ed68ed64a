//! Repository for the `focus_sessions` table.

use sqlx::PgPool;
use tandem_core::session::{Session, SessionStatus};
use tandem_core::types::{DbId, Timestamp};

use super::status_list;
use crate::models::session::SessionRow;

/// Column list shared across queries to avoid repetition.
const COLUMNS: &str = "id, mode, duration_minutes, status, started_at, ended_at, created_at";

/// Provides guarded reads and writes for focus sessions.
pub struct SessionRepo;

impl SessionRepo {
    /// Insert a new session, returning the created row.
    pub async fn create(pool: &PgPool, session: &Session) -> Result<SessionRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO focus_sessions (id, mode, duration_minutes, status, started_at, ended_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(session.id)
            .bind(session.mode.as_str())
            .bind(session.duration_minutes as i32)
            .bind(session.status.as_str())
            .bind(session.started_at)
            .bind(session.ended_at)
            .bind(session.created_at)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<SessionRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM focus_sessions WHERE id = $1");
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Move a session from `waiting` to `active`, stamping `started_at`.
    ///
    /// Returns `None` when the session is no longer `waiting`; the caller
    /// re-reads the row, since someone else got there first.
    pub async fn activate(
        pool: &PgPool,
        id: DbId,
        at: Timestamp,
    ) -> Result<Option<SessionRow>, sqlx::Error> {
        let query = format!(
            "UPDATE focus_sessions
             SET status = 'active', started_at = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(id)
            .bind(at)
            .fetch_optional(pool)
            .await
    }

    /// Move an open (`waiting`/`active`) session to a terminal status.
    ///
    /// Returns `None` if the session was already terminal.
    pub async fn close(
        pool: &PgPool,
        id: DbId,
        status: SessionStatus,
        at: Timestamp,
    ) -> Result<Option<SessionRow>, sqlx::Error> {
        let query = format!(
            "UPDATE focus_sessions
             SET status = $2, ended_at = $3, updated_at = NOW()
             WHERE id = $1 AND status = ANY($4)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(id)
            .bind(status.as_str())
            .bind(at)
            .bind(status_list(&SessionStatus::OPEN, SessionStatus::as_str))
            .fetch_optional(pool)
            .await
    }
}
