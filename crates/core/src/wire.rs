//! JSON request and reply bodies shared by the HTTP server and client.

use serde::{Deserialize, Serialize};

use crate::matching::BrokenReason;
use crate::session::SessionMode;
use crate::types::DbId;

/// Successful replies are wrapped as `{ "data": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

/// Failed replies carry `{ "error": ..., "code": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: DbId,
    pub duration_minutes: u32,
    pub mode: SessionMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: DbId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteSessionRequest {
    pub user_id: DbId,
    pub goal_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyExitRequest {
    pub user_id: DbId,
    pub elapsed_minutes: u32,
    pub total_minutes: u32,
}

/// Body of the heartbeat and ready calls: who is calling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CallerRequest {
    pub user_id: DbId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakMatchRequest {
    pub reason: BrokenReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueRequest {
    pub user_id: DbId,
    pub duration_minutes: u32,
    pub theme: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequeuedMatch {
    pub match_id: DbId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequest {
    pub first: DbId,
    pub second: DbId,
    pub duration_minutes: u32,
    pub theme: String,
}
