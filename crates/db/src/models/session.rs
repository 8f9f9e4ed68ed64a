//! `focus_sessions` rows.

use sqlx::FromRow;
use tandem_core::session::{Session, SessionMode, SessionStatus};
use tandem_core::types::{DbId, Timestamp};

use super::{minutes_column, parse_column};
use crate::store::StoreError;

/// A row from the `focus_sessions` table.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: DbId,
    pub mode: String,
    pub duration_minutes: i32,
    pub status: String,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: row.id,
            mode: parse_column("focus_sessions.mode", &row.mode, SessionMode::parse)?,
            duration_minutes: minutes_column("focus_sessions", row.duration_minutes)?,
            status: parse_column("focus_sessions.status", &row.status, SessionStatus::parse)?,
            started_at: row.started_at,
            ended_at: row.ended_at,
            created_at: row.created_at,
        })
    }
}
