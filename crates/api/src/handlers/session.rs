//! Handlers for the `/sessions` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tandem_core::remote::{CompletionOutcome, RemoteProcedures};
use tandem_core::session::{Participant, Session};
use tandem_core::types::DbId;
use tandem_core::wire::{
    CompleteSessionRequest, CreateSessionRequest, CreatedSession, EarlyExitRequest,
};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/sessions
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionRequest>,
) -> AppResult<(StatusCode, Json<DataResponse<CreatedSession>>)> {
    let session_id = state
        .procedures
        .create_session(input.user_id, input.duration_minutes, input.mode)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: CreatedSession { session_id },
        }),
    ))
}

/// GET /api/v1/sessions/{id}
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<Session>>> {
    let session = state.procedures.fetch_session(id).await?;
    Ok(Json(DataResponse { data: session }))
}

/// GET /api/v1/sessions/{id}/participants
pub async fn participants(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<Vec<Participant>>>> {
    let rows = state.procedures.list_participants(id).await?;
    Ok(Json(DataResponse { data: rows }))
}

/// POST /api/v1/sessions/{id}/activate
///
/// Idempotent: a duplicate answers with the already-active row.
pub async fn activate(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<Session>>> {
    let session = state.procedures.transition_session_to_active(id).await?;
    Ok(Json(DataResponse { data: session }))
}

/// POST /api/v1/sessions/{id}/complete
pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<CompleteSessionRequest>,
) -> AppResult<Json<DataResponse<CompletionOutcome>>> {
    let outcome = state
        .procedures
        .complete_session(id, input.user_id, input.goal_completed)
        .await?;
    Ok(Json(DataResponse { data: outcome }))
}

/// POST /api/v1/sessions/{id}/early-exit
pub async fn early_exit(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<EarlyExitRequest>,
) -> AppResult<StatusCode> {
    state
        .procedures
        .record_early_exit(id, input.user_id, input.elapsed_minutes, input.total_minutes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
