//! `session_participants` rows.

use sqlx::FromRow;
use tandem_core::session::{Participant, ParticipantStatus};
use tandem_core::types::{DbId, Timestamp};

use super::parse_column;
use crate::store::StoreError;

/// A row from the `session_participants` table.
#[derive(Debug, Clone, FromRow)]
pub struct ParticipantRow {
    pub session_id: DbId,
    pub user_id: DbId,
    pub status: String,
    pub joined_at: Timestamp,
    pub left_at: Option<Timestamp>,
    pub ready_at: Option<Timestamp>,
    pub last_seen_at: Option<Timestamp>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = StoreError;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        Ok(Participant {
            session_id: row.session_id,
            user_id: row.user_id,
            status: parse_column(
                "session_participants.status",
                &row.status,
                ParticipantStatus::parse,
            )?,
            joined_at: row.joined_at,
            left_at: row.left_at,
            ready_at: row.ready_at,
            last_seen_at: row.last_seen_at,
        })
    }
}
