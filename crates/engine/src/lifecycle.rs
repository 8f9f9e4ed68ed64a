//! Session lifecycle controller: the engine's public API for the UI layer.
//!
//! Solo: `create -> waiting -> active -> completed | abandoned`.
//! Duo: `join -> waiting (match preparing) -> active -> completed | left early
//! | broken`, where a break before the start offers a requeue and a partner
//! leaving mid-session offers "continue alone" or "end now".
//!
//! Local state lives behind a `std::sync::Mutex` that is never held across
//! an await. Every background task of a session (timer, presence, heartbeat,
//! driver, requeue countdown) is owned by that session's [`SessionTasks`], so
//! replacing or clearing the session tears them all down.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tandem_core::clock::Clock;
use tandem_core::error::CoreError;
use tandem_core::matching::{BrokenReason, MatchAssignment, MatchState, ReadyReport, DEFAULT_THEME};
use tandem_core::presence::PresenceSnapshot;
use tandem_core::remote::{
    Beacon, CompletionOutcome, RemoteError, RemoteProcedures, RemoteResult,
};
use tandem_core::session::{
    validate_duration, whole_minutes, ParticipantStatus, Session, SessionMode,
};
use tandem_core::timer::remaining_seconds;
use tandem_core::types::{DbId, Timestamp};
use tandem_events::{ChannelEvent, PushChannels, Topic};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::heartbeat::{HeartbeatMonitor, MonitorEvent};
use crate::presence::{PresenceBroadcaster, PresenceProfile};
use crate::tasks::SessionTasks;
use crate::teardown::TeardownGuard;
use crate::timer::{SessionTimer, TimerEvent, TimerHandle};

const EVENT_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created; solo is about to start, duo waits for both to be ready.
    Waiting,
    Active,
    /// The match broke before it started; a requeue is on offer.
    Broken(BrokenReason),
    Requeueing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(CompletionOutcome),
    ExitedEarly,
    /// The terminal call failed twice. Local state moved on regardless.
    Unconfirmed,
    /// The requeue offer after a break was declined.
    Dismissed,
    /// A terminal call had already been made for this session.
    AlreadyFinished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Waiting {
        session_id: DbId,
        match_id: Option<DbId>,
    },
    Active {
        session_id: DbId,
        started_at: Timestamp,
    },
    Tick {
        remaining_seconds: u32,
    },
    MatchBroken {
        reason: BrokenReason,
    },
    /// The partner left mid-session: continue alone or end now.
    PartnerLeft,
    PartnerReachable(bool),
    PartnerPresence(Option<PresenceSnapshot>),
    RequeueCountdown {
        seconds_left: u32,
    },
    Requeued(MatchAssignment),
    Finished {
        session_id: DbId,
        outcome: SessionOutcome,
    },
}

/// Point-in-time view of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session_id: DbId,
    pub match_id: Option<DbId>,
    pub mode: SessionMode,
    pub phase: Phase,
    pub duration_minutes: u32,
    pub started_at: Option<Timestamp>,
    pub partner_left: bool,
    pub continuing_alone: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Current {
    session_id: DbId,
    match_id: Option<DbId>,
    mode: SessionMode,
    duration_minutes: u32,
    theme: String,
    phase: Phase,
    started_at: Option<Timestamp>,
    partner_left: bool,
    alone: bool,
    terminal_claimed: bool,
    /// The terminal call never reached the server; its row may still be open.
    unconfirmed: bool,
    tasks: SessionTasks,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer: Option<TimerHandle>,
    presence: Option<PresenceBroadcaster>,
}

impl Current {
    fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id,
            match_id: self.match_id,
            mode: self.mode,
            phase: self.phase,
            duration_minutes: self.duration_minutes,
            started_at: self.started_at,
            partner_left: self.partner_left,
            continuing_alone: self.alone,
        }
    }
}

/// What a terminal call needs, captured under the lock.
struct Claim {
    session_id: DbId,
    match_id: Option<DbId>,
    mode: SessionMode,
}

struct Inner {
    profile: PresenceProfile,
    remote: Arc<dyn RemoteProcedures>,
    channels: Arc<dyn PushChannels>,
    teardown: TeardownGuard,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    events: broadcast::Sender<ControllerEvent>,
    current: Mutex<Option<Current>>,
}

// ---------------------------------------------------------------------------
// SessionController
// ---------------------------------------------------------------------------

pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        profile: PresenceProfile,
        remote: Arc<dyn RemoteProcedures>,
        channels: Arc<dyn PushChannels>,
        beacon: Arc<dyn Beacon>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                profile,
                remote,
                channels,
                teardown: TeardownGuard::new(beacon),
                clock,
                config,
                events,
                current: Mutex::new(None),
            }),
        }
    }

    /// Stream of everything the UI needs to render.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    pub fn view(&self) -> Option<SessionView> {
        self.inner.lock().as_ref().map(Current::view)
    }

    /// Seconds left, recomputed from the wall clock.
    pub fn remaining_seconds(&self) -> Option<u32> {
        let guard = self.inner.lock();
        let cur = guard.as_ref()?;
        let started_at = cur.started_at?;
        Some(remaining_seconds(
            started_at,
            cur.duration_minutes,
            self.inner.clock.now(),
        ))
    }

    /// Latest snapshot of the partner, if one is connected.
    pub fn partner(&self) -> Option<PresenceSnapshot> {
        self.inner
            .lock()
            .as_ref()
            .and_then(|cur| cur.presence.as_ref())
            .and_then(PresenceBroadcaster::partner)
    }

    /// Create a solo session and start it.
    pub async fn start(&self, duration_minutes: u32) -> EngineResult<Session> {
        self.inner.ensure_idle()?;
        validate_duration(duration_minutes).map_err(CoreError::Validation)?;

        let user_id = self.inner.profile.user_id;
        let session_id = self
            .inner
            .remote
            .create_session(user_id, duration_minutes, SessionMode::Solo)
            .await?;
        self.inner.install(
            session_id,
            None,
            SessionMode::Solo,
            duration_minutes,
            DEFAULT_THEME.to_string(),
        )?;

        // A racing duplicate is a no-op on the server that returns the
        // current row, so both callers see the same started_at.
        let started = retry_once(session_id, || {
            self.inner.remote.transition_session_to_active(session_id)
        })
        .await;
        match started {
            Ok(session) => {
                self.inner.activate(session_id, &session);
                Ok(session)
            }
            Err(e) => {
                tracing::error!(%session_id, error = %e, "Session never started, discarding it");
                self.inner.discard(session_id);
                Err(e.into())
            }
        }
    }

    /// Enter a duo session handed out by the matchmaker.
    pub fn join_match(&self, assignment: MatchAssignment) -> EngineResult<()> {
        self.inner.ensure_idle()?;
        self.inner.install(
            assignment.session_id,
            Some(assignment.match_id),
            SessionMode::Duo,
            assignment.duration_minutes,
            assignment.theme,
        )
    }

    /// Tell the server this participant is ready. When the reply says both
    /// are, the session starts right away instead of waiting for the push.
    pub async fn mark_ready(&self) -> EngineResult<ReadyReport> {
        let (session_id, match_id) = {
            let guard = self.inner.lock();
            let cur = guard.as_ref().ok_or(EngineError::NoActiveSession)?;
            match (cur.match_id, cur.phase) {
                (Some(match_id), Phase::Waiting) => (cur.session_id, match_id),
                (None, _) => {
                    return Err(EngineError::InvalidState("Solo sessions have no match".into()))
                }
                (_, phase) => {
                    return Err(EngineError::InvalidState(format!(
                        "Cannot mark ready while {phase:?}"
                    )))
                }
            }
        };

        let report = self
            .inner
            .remote
            .mark_match_ready(match_id, self.inner.profile.user_id)
            .await?;
        tracing::info!(%match_id, both_ready = report.both_ready, "Marked ready");
        if report.both_ready && report.match_state == MatchState::Active {
            self.inner.activate_duo(session_id).await?;
        }
        Ok(report)
    }

    /// Complete the session on timer expiry or user action.
    ///
    /// The completion procedure runs at most once per session; later calls
    /// return [`SessionOutcome::AlreadyFinished`].
    pub async fn finish_now(&self, goal_completed: bool) -> EngineResult<SessionOutcome> {
        self.inner.finish(goal_completed).await
    }

    /// Leave before the timer runs out.
    ///
    /// Duo records the early exit (with its penalty) and breaks the match;
    /// solo ends with a neutral completion and no penalty.
    pub async fn exit_early(
        &self,
        elapsed_seconds: u32,
        total_seconds: u32,
    ) -> EngineResult<SessionOutcome> {
        self.inner.exit_early(elapsed_seconds, total_seconds).await
    }

    /// Register that the partner left mid-session and raise the
    /// continue-alone / end-now offer. Returns whether an offer was raised.
    pub fn handle_partner_left(&self) -> bool {
        let Some(session_id) = self.inner.current_session_id() else {
            return false;
        };
        self.inner.mark_partner_left(session_id)
    }

    /// Answer the partner-left offer by keeping the timer running.
    pub fn continue_alone(&self) -> EngineResult<()> {
        let mut guard = self.inner.lock();
        let cur = guard.as_mut().ok_or(EngineError::NoActiveSession)?;
        if !cur.partner_left || cur.phase != Phase::Active {
            return Err(EngineError::InvalidState(
                "No partner-left offer is pending".into(),
            ));
        }
        cur.alone = true;
        tracing::info!(session_id = %cur.session_id, "Continuing alone");
        Ok(())
    }

    /// Answer the partner-left offer by ending with a neutral completion.
    pub async fn end_now(&self) -> EngineResult<SessionOutcome> {
        {
            let guard = self.inner.lock();
            let cur = guard.as_ref().ok_or(EngineError::NoActiveSession)?;
            if !cur.partner_left {
                return Err(EngineError::InvalidState(
                    "No partner-left offer is pending".into(),
                ));
            }
        }
        self.inner.finish(false).await
    }

    /// Requeue now instead of waiting for the countdown.
    pub async fn requeue_now(&self) -> EngineResult<MatchAssignment> {
        let session_id = self
            .inner
            .current_session_id()
            .ok_or(EngineError::NoActiveSession)?;
        self.inner.requeue(session_id).await
    }

    /// Decline the requeue offer after a break.
    pub fn dismiss_requeue(&self) -> EngineResult<()> {
        let session_id = {
            let mut guard = self.inner.lock();
            let cur = guard.as_mut().ok_or(EngineError::NoActiveSession)?;
            if !matches!(cur.phase, Phase::Broken(_)) {
                return Err(EngineError::InvalidState("No requeue is on offer".into()));
            }
            cur.tasks.cancel();
            cur.phase = Phase::Finished;
            cur.session_id
        };
        tracing::info!(%session_id, "Requeue dismissed");
        self.inner.emit(ControllerEvent::Finished {
            session_id,
            outcome: SessionOutcome::Dismissed,
        });
        Ok(())
    }

    pub fn record_activity(&self) {
        if let Some(presence) = self.inner.presence() {
            presence.record_activity();
        }
    }

    pub fn set_visibility(&self, visible: bool) {
        if let Some(presence) = self.inner.presence() {
            presence.set_visibility(visible);
        }
        if visible {
            self.resume();
        }
    }

    /// Recompute the timer immediately, e.g. after the tab was suspended.
    pub fn resume(&self) {
        let timer = self.inner.lock().as_ref().and_then(|cur| cur.timer.clone());
        if let Some(timer) = timer {
            timer.resume();
        }
    }

    /// Page is going away: fire the teardown beacons for an open session and
    /// drop every local task. Returns the number of beacons sent.
    ///
    /// A session whose terminal call was never confirmed still counts as
    /// open; the server only acts on rows that are still waiting or active.
    pub fn on_page_unload(&self) -> usize {
        let Some(cur) = self.inner.lock().take() else {
            return 0;
        };
        let open = match cur.phase {
            Phase::Waiting | Phase::Active => true,
            Phase::Finished => cur.unconfirmed,
            Phase::Broken(_) | Phase::Requeueing => false,
        };
        if open {
            self.inner
                .teardown
                .fire(cur.session_id, self.inner.profile.user_id)
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Inner: state transitions
// ---------------------------------------------------------------------------

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<Current>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn current_session_id(&self) -> Option<DbId> {
        self.lock().as_ref().map(|cur| cur.session_id)
    }

    fn presence(&self) -> Option<PresenceBroadcaster> {
        self.lock().as_ref().and_then(|cur| cur.presence.clone())
    }

    fn is_phase(&self, session_id: DbId, phase: Phase) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|cur| cur.session_id == session_id && cur.phase == phase)
    }

    fn ensure_idle(&self) -> EngineResult<()> {
        match self.lock().as_ref() {
            Some(cur) if cur.phase != Phase::Finished => Err(EngineError::InvalidState(format!(
                "Session {} is still {:?}",
                cur.session_id, cur.phase
            ))),
            _ => Ok(()),
        }
    }

    /// Make `session_id` the current session and start its background
    /// tasks. Whatever session was current before is torn down.
    fn install(
        self: &Arc<Self>,
        session_id: DbId,
        match_id: Option<DbId>,
        mode: SessionMode,
        duration_minutes: u32,
        theme: String,
    ) -> EngineResult<()> {
        let mut tasks = SessionTasks::new();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let participants = self.channels.subscribe(&Topic::Session(session_id))?;

        let (presence, presence_task) = PresenceBroadcaster::start(
            self.channels.clone(),
            self.clock.clone(),
            session_id,
            self.profile.clone(),
            self.config.idle_threshold,
            self.config.presence_interval,
            tasks.token(),
        )?;
        tasks.spawn(presence_task);

        let monitor = match match_id {
            Some(match_id) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = HeartbeatMonitor::start(
                    self.remote.clone(),
                    self.channels.as_ref(),
                    match_id,
                    self.profile.user_id,
                    MatchState::Preparing,
                    self.config.heartbeat_interval,
                    tx,
                    tasks.token(),
                )?;
                tasks.spawn(task);
                Some(rx)
            }
            None => None,
        };

        let inputs = DriverInputs {
            timer: timer_rx,
            monitor,
            participants: Some(participants),
            partner: Some(presence.on_partner_snapshot()),
        };
        tasks.spawn(drive(
            Arc::downgrade(self),
            session_id,
            self.profile.user_id,
            inputs,
            tasks.token(),
        ));

        let current = Current {
            session_id,
            match_id,
            mode,
            duration_minutes,
            theme,
            phase: Phase::Waiting,
            started_at: None,
            partner_left: false,
            alone: false,
            terminal_claimed: false,
            unconfirmed: false,
            tasks,
            timer_tx,
            timer: None,
            presence: Some(presence),
        };
        // The previous session's tasks are cancelled when it drops here.
        let previous = self.lock().replace(current);
        drop(previous);

        tracing::info!(%session_id, match_id = ?match_id, mode = mode.as_str(), "Session installed");
        self.emit(ControllerEvent::Waiting {
            session_id,
            match_id,
        });
        Ok(())
    }

    /// Forget a session that never got going and ask the server to close
    /// its row.
    fn discard(&self, session_id: DbId) {
        let discarded = {
            let mut guard = self.lock();
            match guard.as_ref() {
                Some(cur) if cur.session_id == session_id => guard.take(),
                _ => None,
            }
        };
        if discarded.is_some() {
            self.teardown.fire(session_id, self.profile.user_id);
        }
    }

    /// `waiting -> active` locally, starting the timer from the server's
    /// `started_at`.
    fn activate(&self, session_id: DbId, session: &Session) {
        let Some(started_at) = session.started_at else {
            tracing::warn!(%session_id, status = session.status.as_str(), "Session not started yet");
            return;
        };

        {
            let mut guard = self.lock();
            let Some(cur) = guard
                .as_mut()
                .filter(|cur| cur.session_id == session_id && cur.phase == Phase::Waiting)
            else {
                return;
            };
            cur.phase = Phase::Active;
            cur.started_at = Some(started_at);
            cur.duration_minutes = session.duration_minutes;

            let timer = SessionTimer::new(self.clock.clone(), started_at, session.duration_minutes);
            let (handle, task) = timer.run(cur.timer_tx.clone(), cur.tasks.token());
            cur.tasks.spawn(task);
            cur.timer = Some(handle);
        }

        tracing::info!(%session_id, %started_at, "Session active");
        self.emit(ControllerEvent::Active {
            session_id,
            started_at,
        });
    }

    /// Activate the duo session on the server (guarded) and locally.
    async fn activate_duo(&self, session_id: DbId) -> EngineResult<()> {
        let session = self.remote.transition_session_to_active(session_id).await?;
        self.activate(session_id, &session);
        Ok(())
    }

    /// Retry duo activation in the background until it sticks.
    fn spawn_activation(self: &Arc<Self>, session_id: DbId) {
        let weak = Arc::downgrade(self);
        let retry_every = self.config.heartbeat_interval;

        let mut guard = self.lock();
        let Some(cur) = guard.as_mut().filter(|cur| cur.session_id == session_id) else {
            return;
        };
        let cancel = cur.tasks.token();
        cur.tasks.spawn(async move {
            loop {
                {
                    let Some(inner) = weak.upgrade() else { return };
                    if !inner.is_phase(session_id, Phase::Waiting) {
                        return;
                    }
                    match inner.activate_duo(session_id).await {
                        Ok(()) => return,
                        Err(e) => {
                            tracing::warn!(%session_id, error = %e, "Activation failed, retrying")
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry_every) => {}
                }
            }
        });
    }

    fn mark_partner_left(&self, session_id: DbId) -> bool {
        {
            let mut guard = self.lock();
            let Some(cur) = guard.as_mut().filter(|cur| cur.session_id == session_id) else {
                return false;
            };
            if cur.mode != SessionMode::Duo
                || cur.phase != Phase::Active
                || cur.partner_left
                || cur.terminal_claimed
            {
                return false;
            }
            cur.partner_left = true;
        }
        tracing::info!(%session_id, "Partner left, offering continue alone or end now");
        self.emit(ControllerEvent::PartnerLeft);
        true
    }

    fn on_broken(self: &Arc<Self>, session_id: DbId, reason: BrokenReason) {
        let phase = {
            let mut guard = self.lock();
            let Some(cur) = guard.as_mut().filter(|cur| cur.session_id == session_id) else {
                return;
            };
            if cur.terminal_claimed {
                return;
            }
            let phase = cur.phase;
            if phase == Phase::Waiting {
                // Nothing started: stop monitoring and offer a requeue.
                cur.phase = Phase::Broken(reason);
                cur.presence = None;
                cur.timer = None;
                cur.tasks = SessionTasks::new();
                let countdown = requeue_countdown(
                    Arc::downgrade(self),
                    session_id,
                    self.config.requeue_countdown,
                    cur.tasks.token(),
                );
                cur.tasks.spawn(countdown);
            }
            phase
        };

        match phase {
            Phase::Waiting => {
                tracing::warn!(%session_id, reason = reason.as_str(), "Match broke before start");
                self.emit(ControllerEvent::MatchBroken { reason });
            }
            Phase::Active => {
                // The session is running: the partner is gone, not the session.
                tracing::warn!(%session_id, reason = reason.as_str(), "Match broke mid-session");
                self.emit(ControllerEvent::MatchBroken { reason });
                self.mark_partner_left(session_id);
            }
            _ => {}
        }
    }

    async fn requeue(self: &Arc<Self>, session_id: DbId) -> EngineResult<MatchAssignment> {
        let (duration_minutes, theme, reason) = {
            let mut guard = self.lock();
            let cur = guard
                .as_mut()
                .filter(|cur| cur.session_id == session_id)
                .ok_or(EngineError::NoActiveSession)?;
            let Phase::Broken(reason) = cur.phase else {
                return Err(EngineError::InvalidState(format!(
                    "Cannot requeue while {:?}",
                    cur.phase
                )));
            };
            cur.phase = Phase::Requeueing;
            cur.tasks.cancel();
            (cur.duration_minutes, cur.theme.clone(), reason)
        };

        let user_id = self.profile.user_id;
        let result = async {
            let match_id = self
                .remote
                .requeue_after_break(user_id, duration_minutes, &theme)
                .await?;
            let m = self.remote.fetch_match(match_id).await?;
            Ok::<_, RemoteError>(MatchAssignment::from(&m))
        }
        .await;

        match result {
            Ok(assignment) => {
                tracing::info!(
                    %session_id,
                    match_id = %assignment.match_id,
                    "Requeued into a new match"
                );
                self.install(
                    assignment.session_id,
                    Some(assignment.match_id),
                    SessionMode::Duo,
                    assignment.duration_minutes,
                    assignment.theme.clone(),
                )?;
                self.emit(ControllerEvent::Requeued(assignment.clone()));
                Ok(assignment)
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Requeue failed");
                if let Some(cur) = self
                    .lock()
                    .as_mut()
                    .filter(|cur| cur.session_id == session_id && cur.phase == Phase::Requeueing)
                {
                    cur.phase = Phase::Broken(reason);
                }
                Err(e.into())
            }
        }
    }

    // -- terminal calls ------------------------------------------------------

    /// Claim the right to make this session's terminal call. `None` means
    /// someone already did.
    fn claim_terminal(&self) -> EngineResult<Option<Claim>> {
        let mut guard = self.lock();
        let cur = guard.as_mut().ok_or(EngineError::NoActiveSession)?;
        if cur.terminal_claimed || cur.phase == Phase::Finished {
            return Ok(None);
        }
        if !matches!(cur.phase, Phase::Waiting | Phase::Active) {
            return Err(EngineError::InvalidState(format!(
                "Cannot end a session while {:?}",
                cur.phase
            )));
        }
        cur.terminal_claimed = true;
        Ok(Some(Claim {
            session_id: cur.session_id,
            match_id: cur.match_id,
            mode: cur.mode,
        }))
    }

    /// Local state becomes terminal whatever the server said.
    fn conclude(&self, session_id: DbId, outcome: SessionOutcome) {
        {
            let mut guard = self.lock();
            let Some(cur) = guard.as_mut().filter(|cur| cur.session_id == session_id) else {
                return;
            };
            cur.phase = Phase::Finished;
            cur.unconfirmed = outcome == SessionOutcome::Unconfirmed;
            cur.timer = None;
            cur.presence = None;
            cur.tasks.cancel();
        }
        tracing::info!(%session_id, ?outcome, "Session finished");
        self.emit(ControllerEvent::Finished {
            session_id,
            outcome,
        });
    }

    /// Whether our participant row still needs a terminal call.
    async fn still_present(&self, session_id: DbId) -> bool {
        match self.remote.list_participants(session_id).await {
            Ok(rows) => rows
                .iter()
                .find(|p| p.user_id == self.profile.user_id)
                .map_or(true, |p| ParticipantStatus::PRESENT.contains(&p.status)),
            Err(e) => {
                tracing::debug!(%session_id, error = %e, "Could not re-read participant");
                true
            }
        }
    }

    async fn finish(&self, goal_completed: bool) -> EngineResult<SessionOutcome> {
        let Some(claim) = self.claim_terminal()? else {
            return Ok(SessionOutcome::AlreadyFinished);
        };
        let session_id = claim.session_id;
        let outcome = self.complete(session_id, goal_completed).await;
        self.conclude(session_id, outcome.clone());
        Ok(outcome)
    }

    async fn complete(&self, session_id: DbId, goal_completed: bool) -> SessionOutcome {
        if !self.still_present(session_id).await {
            tracing::info!(%session_id, "Completion already recorded by the store");
            return SessionOutcome::Completed(CompletionOutcome::default());
        }

        let user_id = self.profile.user_id;
        match retry_once(session_id, || {
            self.remote
                .complete_session(session_id, user_id, goal_completed)
        })
        .await
        {
            Ok(outcome) => SessionOutcome::Completed(outcome),
            Err(e) => {
                tracing::error!(
                    %session_id,
                    error = %e,
                    "Completion not recorded; closing locally anyway"
                );
                SessionOutcome::Unconfirmed
            }
        }
    }

    async fn exit_early(
        &self,
        elapsed_seconds: u32,
        total_seconds: u32,
    ) -> EngineResult<SessionOutcome> {
        let Some(claim) = self.claim_terminal()? else {
            return Ok(SessionOutcome::AlreadyFinished);
        };
        let session_id = claim.session_id;

        let outcome = match (claim.mode, claim.match_id) {
            (SessionMode::Solo, _) | (SessionMode::Duo, None) => {
                self.complete(session_id, false).await
            }
            (SessionMode::Duo, Some(match_id)) => {
                let user_id = self.profile.user_id;
                let (elapsed, total) = (whole_minutes(elapsed_seconds), whole_minutes(total_seconds));
                let recorded = retry_once(session_id, || {
                    self.remote
                        .record_early_exit(session_id, user_id, elapsed, total)
                })
                .await;

                if let Err(e) = self.remote.break_match(match_id, BrokenReason::UserExit).await {
                    tracing::warn!(%match_id, error = %e, "Break on exit failed");
                }

                match recorded {
                    Ok(()) => SessionOutcome::ExitedEarly,
                    Err(e) => {
                        tracing::error!(
                            %session_id,
                            error = %e,
                            "Early exit not recorded; closing locally anyway"
                        );
                        SessionOutcome::Unconfirmed
                    }
                }
            }
        };

        self.conclude(session_id, outcome.clone());
        Ok(outcome)
    }

    // -- background events ---------------------------------------------------

    async fn on_timer(&self, session_id: DbId, event: TimerEvent) {
        match event {
            TimerEvent::Tick { remaining_seconds } => {
                self.emit(ControllerEvent::Tick { remaining_seconds });
            }
            TimerEvent::Expired => {
                if self.current_session_id() != Some(session_id) {
                    return;
                }
                tracing::info!(%session_id, "Timer expired");
                if let Err(e) = self.finish(true).await {
                    tracing::warn!(%session_id, error = %e, "Completion on expiry skipped");
                }
            }
        }
    }

    async fn on_monitor(self: &Arc<Self>, session_id: DbId, event: MonitorEvent) {
        match event {
            MonitorEvent::Active => self.spawn_activation(session_id),
            MonitorEvent::Broken(reason) => self.on_broken(session_id, reason),
            MonitorEvent::Completed => {
                tracing::debug!(%session_id, "Match completed");
            }
            MonitorEvent::PartnerAlive(alive) => {
                self.emit(ControllerEvent::PartnerReachable(alive));
                if !alive && self.is_phase(session_id, Phase::Active) {
                    self.check_partner_left(session_id).await;
                }
            }
        }
    }

    /// Poll path of partner-left detection.
    async fn check_partner_left(&self, session_id: DbId) {
        match self.remote.list_participants(session_id).await {
            Ok(rows) => {
                let left = rows.iter().any(|p| {
                    p.user_id != self.profile.user_id && p.status == ParticipantStatus::LeftEarly
                });
                if left {
                    self.mark_partner_left(session_id);
                }
            }
            Err(e) => tracing::warn!(%session_id, error = %e, "Participant re-read failed"),
        }
    }
}

/// Run a terminal call, retrying once on failure.
async fn retry_once<T, F, Fut>(session_id: DbId, call: F) -> RemoteResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "Terminal call failed, retrying once");
            call().await
        }
    }
}

async fn requeue_countdown(
    inner: Weak<Inner>,
    session_id: DbId,
    total: Duration,
    cancel: CancellationToken,
) {
    let seconds = u32::try_from(total.as_secs()).unwrap_or(u32::MAX);
    for seconds_left in (1..=seconds).rev() {
        match inner.upgrade() {
            Some(inner) => inner.emit(ControllerEvent::RequeueCountdown { seconds_left }),
            None => return,
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    let Some(inner) = inner.upgrade() else { return };
    if let Err(e) = inner.requeue(session_id).await {
        tracing::warn!(%session_id, error = %e, "Automatic requeue failed");
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct DriverInputs {
    timer: mpsc::UnboundedReceiver<TimerEvent>,
    monitor: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
    participants: Option<broadcast::Receiver<ChannelEvent>>,
    partner: Option<watch::Receiver<Option<PresenceSnapshot>>>,
}

/// Serialises every background event of one session into controller calls.
async fn drive(
    inner: Weak<Inner>,
    session_id: DbId,
    user_id: DbId,
    mut inputs: DriverInputs,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = inputs.timer.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_timer(session_id, event).await;
            }
            event = recv_monitor(&mut inputs.monitor) => match event {
                Some(event) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_monitor(session_id, event).await;
                }
                None => inputs.monitor = None,
            },
            event = recv_participant(&mut inputs.participants) => match event {
                Ok(ChannelEvent::ParticipantUpdated { session_id: sid, user_id: other, status })
                    if sid == session_id && other != user_id && status == ParticipantStatus::LeftEarly =>
                {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.mark_partner_left(session_id);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(%session_id, skipped, "Session receiver lagged");
                }
                Err(RecvError::Closed) => inputs.participants = None,
            },
            changed = partner_changed(&mut inputs.partner) => match changed {
                Some(snapshot) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.emit(ControllerEvent::PartnerPresence(snapshot));
                }
                None => inputs.partner = None,
            },
        }
    }
    tracing::debug!(%session_id, "Session driver stopped");
}

async fn recv_monitor(rx: &mut Option<mpsc::UnboundedReceiver<MonitorEvent>>) -> Option<MonitorEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_participant(
    rx: &mut Option<broadcast::Receiver<ChannelEvent>>,
) -> Result<ChannelEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Next partner snapshot change; `None` once the broadcaster is gone.
async fn partner_changed(
    rx: &mut Option<watch::Receiver<Option<PresenceSnapshot>>>,
) -> Option<Option<PresenceSnapshot>> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
