use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tandem_core::clock::ManualClock;
use tandem_core::matching::{BrokenReason, HeartbeatReport, Match, ReadyReport};
use tandem_core::remote::{
    Beacon, BeaconRequest, CompletionOutcome, RemoteError, RemoteProcedures, RemoteResult,
};
use tandem_core::session::{Participant, Session, SessionMode};
use tandem_core::types::{new_id, DbId};
use tandem_db::{MemoryStore, StoreProcedures};
use tandem_engine::{ControllerEvent, EngineConfig, PresenceProfile, SessionController};
use tandem_events::ChannelHub;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Server procedures with call counters and injectable completion failures.
pub struct CountingRemote {
    inner: Arc<StoreProcedures>,
    pub completions: AtomicUsize,
    pub early_exits: AtomicUsize,
    failing_completions: AtomicUsize,
    failing_activations: AtomicUsize,
}

impl CountingRemote {
    pub fn new(inner: Arc<StoreProcedures>) -> Self {
        Self {
            inner,
            completions: AtomicUsize::new(0),
            early_exits: AtomicUsize::new(0),
            failing_completions: AtomicUsize::new(0),
            failing_activations: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` completion calls fail with a network error.
    pub fn fail_completions(&self, n: usize) {
        self.failing_completions.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` waiting -> active calls fail with a network error.
    pub fn fail_activations(&self, n: usize) {
        self.failing_activations.store(n, Ordering::SeqCst);
    }
}

/// Consume one injected failure from `counter`, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteProcedures for CountingRemote {
    async fn create_session(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        mode: SessionMode,
    ) -> RemoteResult<DbId> {
        self.inner.create_session(user_id, duration_minutes, mode).await
    }

    async fn transition_session_to_active(&self, session_id: DbId) -> RemoteResult<Session> {
        if take_failure(&self.failing_activations) {
            return Err(RemoteError::Network("connection reset".into()));
        }
        self.inner.transition_session_to_active(session_id).await
    }

    async fn complete_session(
        &self,
        session_id: DbId,
        user_id: DbId,
        goal_completed: bool,
    ) -> RemoteResult<CompletionOutcome> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_completions) {
            return Err(RemoteError::Network("connection reset".into()));
        }
        self.inner
            .complete_session(session_id, user_id, goal_completed)
            .await
    }

    async fn record_early_exit(
        &self,
        session_id: DbId,
        user_id: DbId,
        elapsed_minutes: u32,
        total_minutes: u32,
    ) -> RemoteResult<()> {
        self.early_exits.fetch_add(1, Ordering::SeqCst);
        self.inner
            .record_early_exit(session_id, user_id, elapsed_minutes, total_minutes)
            .await
    }

    async fn match_heartbeat(&self, match_id: DbId, user_id: DbId) -> RemoteResult<HeartbeatReport> {
        self.inner.match_heartbeat(match_id, user_id).await
    }

    async fn mark_match_ready(&self, match_id: DbId, user_id: DbId) -> RemoteResult<ReadyReport> {
        self.inner.mark_match_ready(match_id, user_id).await
    }

    async fn requeue_after_break(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        theme: &str,
    ) -> RemoteResult<DbId> {
        self.inner
            .requeue_after_break(user_id, duration_minutes, theme)
            .await
    }

    async fn break_match(&self, match_id: DbId, reason: BrokenReason) -> RemoteResult<()> {
        self.inner.break_match(match_id, reason).await
    }

    async fn fetch_session(&self, session_id: DbId) -> RemoteResult<Session> {
        self.inner.fetch_session(session_id).await
    }

    async fn fetch_match(&self, match_id: DbId) -> RemoteResult<Match> {
        self.inner.fetch_match(match_id).await
    }

    async fn list_participants(&self, session_id: DbId) -> RemoteResult<Vec<Participant>> {
        self.inner.list_participants(session_id).await
    }
}

#[derive(Default)]
pub struct RecordingBeacon {
    pub sent: Mutex<Vec<BeaconRequest>>,
}

impl Beacon for RecordingBeacon {
    fn send(&self, request: BeaconRequest) {
        self.sent.lock().unwrap().push(request);
    }
}

/// One server plus as many clients as a test needs.
pub struct World {
    pub procedures: Arc<StoreProcedures>,
    pub remote: Arc<CountingRemote>,
    pub hub: Arc<ChannelHub>,
    pub clock: Arc<ManualClock>,
    pub beacon: Arc<RecordingBeacon>,
}

impl World {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hub = Arc::new(ChannelHub::default());
        let procedures = Arc::new(StoreProcedures::new(
            Arc::new(MemoryStore::new()),
            hub.clone(),
            clock.clone(),
        ));
        Self {
            remote: Arc::new(CountingRemote::new(procedures.clone())),
            procedures,
            hub,
            clock,
            beacon: Arc::new(RecordingBeacon::default()),
        }
    }

    /// A client for a fresh user. Returns the controller and the user id.
    pub fn client(&self, name: &str) -> (SessionController, DbId) {
        let user_id = new_id();
        let profile = PresenceProfile {
            user_id,
            avatar_id: "fox".into(),
            display_name: name.into(),
            goal_text: "write the report".into(),
        };
        let controller = SessionController::new(
            profile,
            self.remote.clone(),
            self.hub.clone(),
            self.beacon.clone(),
            self.clock.clone(),
            EngineConfig::default(),
        );
        (controller, user_id)
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}

/// Wait (in paused time) for the first event matching `pred`.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<ControllerEvent>, mut pred: F) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    let seen = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("controller dropped"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), seen)
        .await
        .expect("event not seen in time")
}
