//! `focus_matches` rows.

use sqlx::FromRow;
use tandem_core::matching::{BrokenReason, Match, MatchState};
use tandem_core::types::{DbId, Timestamp};

use super::{minutes_column, parse_column};
use crate::store::StoreError;

/// A row from the `focus_matches` table.
#[derive(Debug, Clone, FromRow)]
pub struct MatchRow {
    pub id: DbId,
    pub session_id: DbId,
    pub state: String,
    pub broken_reason: Option<String>,
    pub pomodoro_duration: i32,
    pub theme: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<MatchRow> for Match {
    type Error = StoreError;

    fn try_from(row: MatchRow) -> Result<Self, Self::Error> {
        let broken_reason = row
            .broken_reason
            .as_deref()
            .map(|r| parse_column("focus_matches.broken_reason", r, BrokenReason::parse))
            .transpose()?;

        Ok(Match {
            id: row.id,
            session_id: row.session_id,
            state: parse_column("focus_matches.state", &row.state, MatchState::parse)?,
            broken_reason,
            pomodoro_duration: minutes_column("focus_matches", row.pomodoro_duration)?,
            theme: row.theme,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
