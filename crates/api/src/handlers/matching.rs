//! Handlers for the `/matches` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tandem_core::matching::{HeartbeatReport, Match, ReadyReport};
use tandem_core::remote::RemoteProcedures;
use tandem_core::types::DbId;
use tandem_core::wire::{
    BreakMatchRequest, CallerRequest, PairRequest, RequeueRequest, RequeuedMatch,
};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/matches/{id}
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<Match>>> {
    let m = state.procedures.fetch_match(id).await?;
    Ok(Json(DataResponse { data: m }))
}

/// POST /api/v1/matches/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<CallerRequest>,
) -> AppResult<Json<DataResponse<HeartbeatReport>>> {
    let report = state.procedures.match_heartbeat(id, input.user_id).await?;
    Ok(Json(DataResponse { data: report }))
}

/// POST /api/v1/matches/{id}/ready
pub async fn ready(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<CallerRequest>,
) -> AppResult<Json<DataResponse<ReadyReport>>> {
    let report = state.procedures.mark_match_ready(id, input.user_id).await?;
    Ok(Json(DataResponse { data: report }))
}

/// POST /api/v1/matches/{id}/break
///
/// No-op on a match that already settled.
pub async fn break_match(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<BreakMatchRequest>,
) -> AppResult<StatusCode> {
    state.procedures.break_match(id, input.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/matches/requeue
pub async fn requeue(
    State(state): State<AppState>,
    Json(input): Json<RequeueRequest>,
) -> AppResult<(StatusCode, Json<DataResponse<RequeuedMatch>>)> {
    let match_id = state
        .procedures
        .requeue_after_break(input.user_id, input.duration_minutes, &input.theme)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: RequeuedMatch { match_id },
        }),
    ))
}

/// POST /api/v1/matches/pair
pub async fn pair(
    State(state): State<AppState>,
    Json(input): Json<PairRequest>,
) -> AppResult<(StatusCode, Json<DataResponse<Match>>)> {
    let m = state
        .procedures
        .pair_users(input.first, input.second, input.duration_minutes, &input.theme)
        .await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: m })))
}

/// POST /api/v1/matches/{id}/seat
pub async fn seat(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<CallerRequest>,
) -> AppResult<Json<DataResponse<Match>>> {
    let m = state.procedures.seat_user(id, input.user_id).await?;
    Ok(Json(DataResponse { data: m }))
}
