//! HTTP client for the remote procedures, talking to `tandem-api`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tandem_core::matching::{BrokenReason, HeartbeatReport, Match, ReadyReport};
use tandem_core::remote::{
    Beacon, BeaconRequest, CompletionOutcome, RemoteError, RemoteProcedures, RemoteResult,
};
use tandem_core::session::{Participant, Session, SessionMode};
use tandem_core::types::DbId;
use tandem_core::wire::{
    BreakMatchRequest, CallerRequest, CompleteSessionRequest, CreateSessionRequest,
    CreatedSession, DataEnvelope, EarlyExitRequest, ErrorBody, RequeueRequest, RequeuedMatch,
};

use crate::config::EngineConfig;
use crate::error::EngineError;

#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::new(config.api_url.clone(), config.request_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        self.dispatch(self.client.get(self.url(path))).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> RemoteResult<T> {
        self.dispatch(self.client.post(self.url(path)).json(body)).await
    }

    /// POST whose reply carries no data (`204 No Content`).
    async fn post_empty<B: Serialize + Sync>(&self, path: &str, body: &B) -> RemoteResult<()> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(network)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejected(response).await)
        }
    }

    async fn dispatch<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let response = request.send().await.map_err(network)?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let envelope: DataEnvelope<T> = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(envelope.data)
    }
}

fn network(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

async fn rejected(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string(),
    };
    RemoteError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl RemoteProcedures for HttpRemote {
    async fn create_session(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        mode: SessionMode,
    ) -> RemoteResult<DbId> {
        let body = CreateSessionRequest {
            user_id,
            duration_minutes,
            mode,
        };
        let created: CreatedSession = self.post("/sessions", &body).await?;
        Ok(created.session_id)
    }

    async fn transition_session_to_active(&self, session_id: DbId) -> RemoteResult<Session> {
        self.post(&format!("/sessions/{session_id}/activate"), &serde_json::json!({}))
            .await
    }

    async fn complete_session(
        &self,
        session_id: DbId,
        user_id: DbId,
        goal_completed: bool,
    ) -> RemoteResult<CompletionOutcome> {
        let body = CompleteSessionRequest {
            user_id,
            goal_completed,
        };
        self.post(&format!("/sessions/{session_id}/complete"), &body)
            .await
    }

    async fn record_early_exit(
        &self,
        session_id: DbId,
        user_id: DbId,
        elapsed_minutes: u32,
        total_minutes: u32,
    ) -> RemoteResult<()> {
        let body = EarlyExitRequest {
            user_id,
            elapsed_minutes,
            total_minutes,
        };
        self.post_empty(&format!("/sessions/{session_id}/early-exit"), &body)
            .await
    }

    async fn match_heartbeat(&self, match_id: DbId, user_id: DbId) -> RemoteResult<HeartbeatReport> {
        self.post(&format!("/matches/{match_id}/heartbeat"), &CallerRequest { user_id })
            .await
    }

    async fn mark_match_ready(&self, match_id: DbId, user_id: DbId) -> RemoteResult<ReadyReport> {
        self.post(&format!("/matches/{match_id}/ready"), &CallerRequest { user_id })
            .await
    }

    async fn requeue_after_break(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        theme: &str,
    ) -> RemoteResult<DbId> {
        let body = RequeueRequest {
            user_id,
            duration_minutes,
            theme: theme.to_string(),
        };
        let requeued: RequeuedMatch = self.post("/matches/requeue", &body).await?;
        Ok(requeued.match_id)
    }

    async fn break_match(&self, match_id: DbId, reason: BrokenReason) -> RemoteResult<()> {
        self.post_empty(&format!("/matches/{match_id}/break"), &BreakMatchRequest { reason })
            .await
    }

    async fn fetch_session(&self, session_id: DbId) -> RemoteResult<Session> {
        self.get(&format!("/sessions/{session_id}")).await
    }

    async fn fetch_match(&self, match_id: DbId) -> RemoteResult<Match> {
        self.get(&format!("/matches/{match_id}")).await
    }

    async fn list_participants(&self, session_id: DbId) -> RemoteResult<Vec<Participant>> {
        self.get(&format!("/sessions/{session_id}/participants"))
            .await
    }
}

impl Beacon for HttpRemote {
    /// Spawn the request detached from the caller. Without a runtime the
    /// beacon is dropped.
    fn send(&self, request: BeaconRequest) {
        let path = match request {
            BeaconRequest::AbandonSession { session_id } => {
                format!("/beacon/sessions/{session_id}/abandon")
            }
            BeaconRequest::LeaveSession {
                session_id,
                user_id,
            } => format!("/beacon/sessions/{session_id}/participants/{user_id}/leave"),
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(?request, "No runtime, beacon dropped");
            return;
        };

        let post = self.client.post(self.url(&path));
        runtime.spawn(async move {
            match post.send().await {
                Ok(response) if response.status() == StatusCode::ACCEPTED => {}
                Ok(response) => {
                    tracing::debug!(?request, status = %response.status(), "Beacon answered")
                }
                Err(e) => tracing::debug!(?request, error = %e, "Beacon not delivered"),
            }
        });
    }
}
