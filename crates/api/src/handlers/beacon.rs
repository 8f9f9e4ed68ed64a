//! Fire-and-forget endpoints hit while a page unloads.
//!
//! Both answer `202 Accepted` whether or not the row changed; a beacon
//! arriving after the session closed is a normal no-op.

use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::error::AppResult;
use crate::state::AppState;
use tandem_core::types::DbId;

/// POST /api/v1/beacon/sessions/{id}/abandon
pub async fn abandon(State(state): State<AppState>, Path(id): Path<DbId>) -> AppResult<StatusCode> {
    state.procedures.abandon_session(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/beacon/sessions/{id}/participants/{user_id}/leave
pub async fn leave(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(DbId, DbId)>,
) -> AppResult<StatusCode> {
    state.procedures.leave_session(id, user_id).await?;
    Ok(StatusCode::ACCEPTED)
}
