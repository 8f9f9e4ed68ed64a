//! Repository for the `session_participants` table.

use sqlx::PgPool;
use tandem_core::session::{Participant, ParticipantStatus};
use tandem_core::types::{DbId, Timestamp};

use super::status_list;
use crate::models::participant::ParticipantRow;

/// Column list shared across queries to avoid repetition.
const COLUMNS: &str = "session_id, user_id, status, joined_at, left_at, ready_at, last_seen_at";

/// Provides guarded reads and writes for session participants.
pub struct ParticipantRepo;

impl ParticipantRepo {
    /// Insert a participant unless the session already holds `max` of them.
    ///
    /// The parent session row is locked for the duration of the check so
    /// two concurrent joins cannot both squeeze under the cap. Returns
    /// `None` when the session is full.
    pub async fn create_capped(
        pool: &PgPool,
        participant: &Participant,
        max: usize,
    ) -> Result<Option<ParticipantRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("SELECT id FROM focus_sessions WHERE id = $1 FOR UPDATE")
            .bind(participant.session_id)
            .fetch_one(&mut *tx)
            .await?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM session_participants WHERE session_id = $1")
                .bind(participant.session_id)
                .fetch_one(&mut *tx)
                .await?;

        if count as usize >= max {
            tx.rollback().await?;
            return Ok(None);
        }

        let query = format!(
            "INSERT INTO session_participants (session_id, user_id, status, joined_at, left_at, ready_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, ParticipantRow>(&query)
            .bind(participant.session_id)
            .bind(participant.user_id)
            .bind(participant.status.as_str())
            .bind(participant.joined_at)
            .bind(participant.left_at)
            .bind(participant.ready_at)
            .bind(participant.last_seen_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row))
    }

    pub async fn list_for_session(
        pool: &PgPool,
        session_id: DbId,
    ) -> Result<Vec<ParticipantRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM session_participants
             WHERE session_id = $1
             ORDER BY joined_at, user_id"
        );
        sqlx::query_as::<_, ParticipantRow>(&query)
            .bind(session_id)
            .fetch_all(pool)
            .await
    }

    /// Move a participant forward if its current status is one of `from`.
    ///
    /// Terminal targets also stamp `left_at`. Returns `None` if the guard
    /// did not match.
    pub async fn advance(
        pool: &PgPool,
        session_id: DbId,
        user_id: DbId,
        from: &[ParticipantStatus],
        to: ParticipantStatus,
        at: Timestamp,
    ) -> Result<Option<ParticipantRow>, sqlx::Error> {
        let query = format!(
            "UPDATE session_participants
             SET status = $3,
                 left_at = CASE WHEN $5 THEN $4 ELSE left_at END
             WHERE session_id = $1 AND user_id = $2 AND status = ANY($6)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ParticipantRow>(&query)
            .bind(session_id)
            .bind(user_id)
            .bind(to.as_str())
            .bind(at)
            .bind(to.is_terminal())
            .bind(status_list(from, ParticipantStatus::as_str))
            .fetch_optional(pool)
            .await
    }

    /// Stamp `ready_at` once. Returns `None` if already ready or gone.
    pub async fn mark_ready(
        pool: &PgPool,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> Result<Option<ParticipantRow>, sqlx::Error> {
        let query = format!(
            "UPDATE session_participants
             SET ready_at = $3
             WHERE session_id = $1 AND user_id = $2
               AND ready_at IS NULL AND status = ANY($4)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ParticipantRow>(&query)
            .bind(session_id)
            .bind(user_id)
            .bind(at)
            .bind(status_list(&ParticipantStatus::PRESENT, ParticipantStatus::as_str))
            .fetch_optional(pool)
            .await
    }

    /// Record a heartbeat from a participant.
    pub async fn touch(
        pool: &PgPool,
        session_id: DbId,
        user_id: DbId,
        at: Timestamp,
    ) -> Result<Option<ParticipantRow>, sqlx::Error> {
        let query = format!(
            "UPDATE session_participants
             SET last_seen_at = GREATEST(COALESCE(last_seen_at, $3), $3)
             WHERE session_id = $1 AND user_id = $2
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ParticipantRow>(&query)
            .bind(session_id)
            .bind(user_id)
            .bind(at)
            .fetch_optional(pool)
            .await
    }
}
