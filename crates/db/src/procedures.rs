//! Server side of the remote procedures, built on any [`SessionStore`].
//!
//! Every mutation goes through a guarded store update. When a guard misses
//! the procedure re-reads the row and answers from what it finds, so a
//! duplicate or racing call converges on the same result instead of failing.
//! Each row that actually changed is reported to the [`ChangeFeed`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tandem_core::clock::Clock;
use tandem_core::error::CoreError;
use tandem_core::feed::ChangeFeed;
use tandem_core::matching::{
    BrokenReason, HeartbeatReport, Match, MatchState, ReadyReport, DEFAULT_THEME,
};
use tandem_core::remote::{CompletionOutcome, RemoteError, RemoteProcedures, RemoteResult};
use tandem_core::session::{
    validate_duration, Participant, ParticipantStatus, Session, SessionMode, SessionStatus,
    MAX_DUO_PARTICIPANTS,
};
use tandem_core::types::{new_id, DbId, Timestamp};

use crate::store::{SessionStore, StoreError};

/// Heartbeat silence after which a partner counts as gone.
pub const DEFAULT_PARTNER_TIMEOUT: Duration = Duration::from_secs(20);

impl From<StoreError> for RemoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(core) => RemoteError::Core(core),
            StoreError::Database(e) => RemoteError::Core(CoreError::Internal(e.to_string())),
            StoreError::Corrupt(msg) => RemoteError::Core(CoreError::Internal(msg)),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ProcedureConfig {
    pub partner_timeout: Duration,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            partner_timeout: DEFAULT_PARTNER_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Reputation and reward collaborator consulted on terminal calls.
#[async_trait]
pub trait Scoring: Send + Sync {
    async fn score_completion(
        &self,
        session: &Session,
        user_id: DbId,
        goal_completed: bool,
    ) -> CompletionOutcome;

    async fn score_early_exit(
        &self,
        session: &Session,
        user_id: DbId,
        elapsed_minutes: u32,
        total_minutes: u32,
    );
}

/// Scores nothing: zero XP, no trust change, no streak.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralScoring;

#[async_trait]
impl Scoring for NeutralScoring {
    async fn score_completion(
        &self,
        _session: &Session,
        _user_id: DbId,
        _goal_completed: bool,
    ) -> CompletionOutcome {
        CompletionOutcome::default()
    }

    async fn score_early_exit(
        &self,
        _session: &Session,
        _user_id: DbId,
        _elapsed_minutes: u32,
        _total_minutes: u32,
    ) {
    }
}

// ---------------------------------------------------------------------------
// StoreProcedures
// ---------------------------------------------------------------------------

pub struct StoreProcedures {
    store: Arc<dyn SessionStore>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    scoring: Arc<dyn Scoring>,
    config: ProcedureConfig,
}

impl StoreProcedures {
    pub fn new(
        store: Arc<dyn SessionStore>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            feed,
            clock,
            scoring: Arc::new(NeutralScoring),
            config: ProcedureConfig::default(),
        }
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn Scoring>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_config(mut self, config: ProcedureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Stand-in for the external matchmaker: put two users into a fresh duo
    /// session with a `preparing` match.
    pub async fn pair_users(
        &self,
        first: DbId,
        second: DbId,
        duration_minutes: u32,
        theme: &str,
    ) -> RemoteResult<Match> {
        if first == second {
            return Err(CoreError::Validation("Cannot pair a user with themselves".into()).into());
        }
        let m = self
            .open_duo(&[first, second], duration_minutes, theme)
            .await?;
        tracing::info!(
            match_id = %m.id,
            session_id = %m.session_id,
            %first,
            %second,
            "Paired users into a new match"
        );
        Ok(m)
    }

    /// Stand-in for the matchmaker filling a requeued match: seat `user_id`
    /// as the second participant while the match is still `preparing`.
    pub async fn seat_user(&self, match_id: DbId, user_id: DbId) -> RemoteResult<Match> {
        let m = self.require_match(match_id).await?;
        if m.state != MatchState::Preparing {
            return Err(CoreError::Conflict(format!(
                "Match {match_id} is {} and takes no new participants",
                m.state.as_str()
            ))
            .into());
        }
        let now = self.clock.now();
        self.insert_participant(m.session_id, user_id, MAX_DUO_PARTICIPANTS, now)
            .await?;
        tracing::info!(%match_id, %user_id, "Seated user in match");
        Ok(m)
    }

    /// Beacon: mark the session `abandoned` if it is still open.
    ///
    /// Returns whether this call changed the row.
    pub async fn abandon_session(&self, session_id: DbId) -> RemoteResult<bool> {
        let now = self.clock.now();
        let closed = self
            .store
            .close_session(session_id, SessionStatus::Abandoned, now)
            .await?;
        if closed.is_some() {
            tracing::info!(%session_id, "Session abandoned on unload");
        }
        Ok(closed.is_some())
    }

    /// Beacon: mark the participant `left_early` if still present.
    pub async fn leave_session(&self, session_id: DbId, user_id: DbId) -> RemoteResult<bool> {
        let now = self.clock.now();
        let left = self
            .store
            .advance_participant(
                session_id,
                user_id,
                &ParticipantStatus::PRESENT,
                ParticipantStatus::LeftEarly,
                now,
            )
            .await?;
        match &left {
            Some(row) => {
                tracing::info!(%session_id, %user_id, "Participant left on unload");
                self.feed.participant_changed(row);
            }
            None => tracing::debug!(%session_id, %user_id, "Leave beacon found participant gone"),
        }
        Ok(left.is_some())
    }

    // -- helpers ------------------------------------------------------------

    async fn require_session(&self, id: DbId) -> RemoteResult<Session> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| CoreError::NotFound { entity: "session", id }.into())
    }

    async fn require_match(&self, id: DbId) -> RemoteResult<Match> {
        self.store
            .get_match(id)
            .await?
            .ok_or_else(|| CoreError::NotFound { entity: "match", id }.into())
    }

    async fn insert_session(
        &self,
        mode: SessionMode,
        duration_minutes: u32,
        now: Timestamp,
    ) -> RemoteResult<Session> {
        validate_duration(duration_minutes).map_err(CoreError::Validation)?;
        let session = Session {
            id: new_id(),
            mode,
            duration_minutes,
            status: SessionStatus::Waiting,
            started_at: None,
            ended_at: None,
            created_at: now,
        };
        Ok(self.store.insert_session(&session).await?)
    }

    async fn insert_participant(
        &self,
        session_id: DbId,
        user_id: DbId,
        max: usize,
        now: Timestamp,
    ) -> RemoteResult<Participant> {
        let row = Participant {
            session_id,
            user_id,
            status: ParticipantStatus::Waiting,
            joined_at: now,
            left_at: None,
            ready_at: None,
            last_seen_at: None,
        };
        let row = self.store.insert_participant(&row, max).await?;
        self.feed.participant_changed(&row);
        Ok(row)
    }

    async fn open_duo(
        &self,
        users: &[DbId],
        duration_minutes: u32,
        theme: &str,
    ) -> RemoteResult<Match> {
        let now = self.clock.now();
        let session = self
            .insert_session(SessionMode::Duo, duration_minutes, now)
            .await?;
        for user_id in users {
            self.insert_participant(session.id, *user_id, MAX_DUO_PARTICIPANTS, now)
                .await?;
        }

        let theme = if theme.trim().is_empty() {
            DEFAULT_THEME
        } else {
            theme
        };
        let m = Match {
            id: new_id(),
            session_id: session.id,
            state: MatchState::Preparing,
            broken_reason: None,
            pomodoro_duration: duration_minutes,
            theme: theme.to_string(),
            created_at: now,
            updated_at: now,
        };
        Ok(self.store.insert_match(&m).await?)
    }

    /// Close the session once nobody is still waiting or active in it, and
    /// complete its match if the match made it to `active`.
    async fn settle_session(&self, session: &Session, status: SessionStatus) -> RemoteResult<()> {
        let participants = self.store.list_participants(session.id).await?;
        if participants
            .iter()
            .any(|p| ParticipantStatus::PRESENT.contains(&p.status))
        {
            return Ok(());
        }

        let now = self.clock.now();
        if self
            .store
            .close_session(session.id, status, now)
            .await?
            .is_some()
        {
            tracing::info!(session_id = %session.id, status = status.as_str(), "Session closed");
        }

        if status == SessionStatus::Completed {
            if let Some(m) = self.store.match_for_session(session.id).await? {
                if let Some(done) = self
                    .store
                    .transition_match(m.id, &[MatchState::Active], MatchState::Completed, None, now)
                    .await?
                {
                    tracing::info!(match_id = %done.id, "Match completed");
                    self.feed.match_changed(&done);
                }
            }
        }
        Ok(())
    }

    /// Break a live match. A match broken before it went active takes its
    /// never-started session down with it; an active one leaves the session
    /// to whoever is still focusing.
    async fn break_live(
        &self,
        match_id: DbId,
        reason: BrokenReason,
        now: Timestamp,
    ) -> RemoteResult<Option<Match>> {
        if let Some(broken) = self
            .store
            .transition_match(
                match_id,
                &[MatchState::Preparing],
                MatchState::Broken,
                Some(reason),
                now,
            )
            .await?
        {
            self.feed.match_changed(&broken);
            if self
                .store
                .close_session(broken.session_id, SessionStatus::Abandoned, now)
                .await?
                .is_some()
            {
                tracing::info!(session_id = %broken.session_id, "Unstarted session abandoned");
            }
            return Ok(Some(broken));
        }

        let broken = self
            .store
            .transition_match(
                match_id,
                &[MatchState::Active],
                MatchState::Broken,
                Some(reason),
                now,
            )
            .await?;
        if let Some(row) = &broken {
            self.feed.match_changed(row);
        }
        Ok(broken)
    }

    async fn participant_of(&self, session_id: DbId, user_id: DbId) -> RemoteResult<Participant> {
        self.store
            .list_participants(session_id)
            .await?
            .into_iter()
            .find(|p| p.user_id == user_id)
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "participant",
                    id: user_id,
                }
                .into()
            })
    }
}

#[async_trait]
impl RemoteProcedures for StoreProcedures {
    async fn create_session(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        mode: SessionMode,
    ) -> RemoteResult<DbId> {
        let now = self.clock.now();
        let session = self.insert_session(mode, duration_minutes, now).await?;
        let max = match mode {
            SessionMode::Solo => 1,
            SessionMode::Duo => MAX_DUO_PARTICIPANTS,
        };
        self.insert_participant(session.id, user_id, max, now).await?;
        tracing::info!(session_id = %session.id, %user_id, mode = mode.as_str(), "Session created");
        Ok(session.id)
    }

    async fn transition_session_to_active(&self, session_id: DbId) -> RemoteResult<Session> {
        let now = self.clock.now();
        let Some(session) = self.store.activate_session(session_id, now).await? else {
            // Lost the race or already past waiting: answer with the row as it is.
            return self.require_session(session_id).await;
        };

        for p in self.store.list_participants(session_id).await? {
            if let Some(row) = self
                .store
                .advance_participant(
                    session_id,
                    p.user_id,
                    &[ParticipantStatus::Waiting],
                    ParticipantStatus::Active,
                    now,
                )
                .await?
            {
                self.feed.participant_changed(&row);
            }
        }
        tracing::info!(%session_id, "Session active");
        Ok(session)
    }

    async fn complete_session(
        &self,
        session_id: DbId,
        user_id: DbId,
        goal_completed: bool,
    ) -> RemoteResult<CompletionOutcome> {
        let session = self.require_session(session_id).await?;
        let now = self.clock.now();

        let Some(row) = self
            .store
            .advance_participant(
                session_id,
                user_id,
                &ParticipantStatus::PRESENT,
                ParticipantStatus::Completed,
                now,
            )
            .await?
        else {
            // Already terminal: a repeated call scores nothing.
            self.participant_of(session_id, user_id).await?;
            tracing::debug!(%session_id, %user_id, "Completion already recorded");
            return Ok(CompletionOutcome::default());
        };
        self.feed.participant_changed(&row);

        let outcome = self
            .scoring
            .score_completion(&session, user_id, goal_completed)
            .await;
        self.settle_session(&session, SessionStatus::Completed)
            .await?;
        tracing::info!(%session_id, %user_id, goal_completed, xp = outcome.xp_earned, "Session completed");
        Ok(outcome)
    }

    async fn record_early_exit(
        &self,
        session_id: DbId,
        user_id: DbId,
        elapsed_minutes: u32,
        total_minutes: u32,
    ) -> RemoteResult<()> {
        let session = self.require_session(session_id).await?;
        let now = self.clock.now();

        let Some(row) = self
            .store
            .advance_participant(
                session_id,
                user_id,
                &ParticipantStatus::PRESENT,
                ParticipantStatus::LeftEarly,
                now,
            )
            .await?
        else {
            self.participant_of(session_id, user_id).await?;
            tracing::debug!(%session_id, %user_id, "Early exit already recorded");
            return Ok(());
        };
        self.feed.participant_changed(&row);

        self.scoring
            .score_early_exit(&session, user_id, elapsed_minutes, total_minutes)
            .await;
        self.settle_session(&session, SessionStatus::Abandoned)
            .await?;
        tracing::info!(%session_id, %user_id, elapsed_minutes, total_minutes, "Early exit recorded");
        Ok(())
    }

    async fn match_heartbeat(&self, match_id: DbId, user_id: DbId) -> RemoteResult<HeartbeatReport> {
        let m = self.require_match(match_id).await?;
        let now = self.clock.now();

        if self
            .store
            .touch_participant(m.session_id, user_id, now)
            .await?
            .is_none()
        {
            return Err(CoreError::NotFound {
                entity: "participant",
                id: user_id,
            }
            .into());
        }

        let participants = self.store.list_participants(m.session_id).await?;
        let Some(partner) = participants.iter().find(|p| p.user_id != user_id) else {
            // Requeued match still waiting for the matchmaker to seat someone.
            return Ok(HeartbeatReport {
                partner_alive: false,
                match_state: m.state,
                broken_reason: m.broken_reason,
            });
        };
        let timeout = chrono::Duration::from_std(self.config.partner_timeout)
            .map_err(|e| CoreError::Internal(format!("Invalid partner timeout: {e}")))?;

        let partner_present = ParticipantStatus::PRESENT.contains(&partner.status);
        let partner_fresh = now - partner.last_sign_of_life() <= timeout;
        let partner_alive = partner_present && partner_fresh;

        let report = |m: &Match, partner_alive: bool| HeartbeatReport {
            partner_alive,
            match_state: m.state,
            broken_reason: m.broken_reason,
        };

        if m.state.is_terminal() || partner_alive {
            return Ok(report(&m, partner_alive));
        }

        // A partner who left on purpose mid-session is reported gone without
        // breaking anything; one who left before the start ends the match.
        let reason = if partner_present {
            BrokenReason::PartnerTimeout
        } else if m.state == MatchState::Preparing {
            BrokenReason::UserExit
        } else {
            return Ok(report(&m, false));
        };

        match self.break_live(match_id, reason, now).await? {
            Some(broken) => {
                tracing::warn!(%match_id, %user_id, reason = reason.as_str(), "Partner gone, match broken");
                Ok(report(&broken, false))
            }
            None => {
                let current = self.require_match(match_id).await?;
                Ok(report(&current, false))
            }
        }
    }

    async fn mark_match_ready(&self, match_id: DbId, user_id: DbId) -> RemoteResult<ReadyReport> {
        let m = self.require_match(match_id).await?;
        if m.state != MatchState::Preparing {
            return Ok(ReadyReport {
                both_ready: m.state == MatchState::Active,
                match_state: m.state,
            });
        }

        let now = self.clock.now();
        if self
            .store
            .mark_participant_ready(m.session_id, user_id, now)
            .await?
            .is_none()
        {
            // Either already ready or not a present participant at all.
            let me = self.participant_of(m.session_id, user_id).await?;
            if me.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "User {user_id} already left match {match_id}"
                ))
                .into());
            }
        }

        let participants = self.store.list_participants(m.session_id).await?;
        let both_ready = participants.len() == MAX_DUO_PARTICIPANTS
            && participants
                .iter()
                .all(|p| p.ready_at.is_some() && ParticipantStatus::PRESENT.contains(&p.status));
        if !both_ready {
            tracing::debug!(%match_id, %user_id, "Waiting for partner to be ready");
            return Ok(ReadyReport {
                both_ready: false,
                match_state: MatchState::Preparing,
            });
        }

        let Some(active) = self
            .store
            .transition_match(
                match_id,
                &[MatchState::Preparing],
                MatchState::Active,
                None,
                now,
            )
            .await?
        else {
            let current = self.require_match(match_id).await?;
            return Ok(ReadyReport {
                both_ready: current.state == MatchState::Active,
                match_state: current.state,
            });
        };

        // The session's own guard makes this safe if the other ready call
        // got here too.
        self.transition_session_to_active(m.session_id).await?;
        tracing::info!(%match_id, session_id = %m.session_id, "Both ready, match active");
        self.feed.match_changed(&active);

        Ok(ReadyReport {
            both_ready: true,
            match_state: MatchState::Active,
        })
    }

    async fn requeue_after_break(
        &self,
        user_id: DbId,
        duration_minutes: u32,
        theme: &str,
    ) -> RemoteResult<DbId> {
        let m = self.open_duo(&[user_id], duration_minutes, theme).await?;
        tracing::info!(match_id = %m.id, %user_id, theme = %m.theme, "Requeued after break");
        Ok(m.id)
    }

    async fn break_match(&self, match_id: DbId, reason: BrokenReason) -> RemoteResult<()> {
        let now = self.clock.now();
        match self.break_live(match_id, reason, now).await? {
            Some(_) => tracing::info!(%match_id, reason = reason.as_str(), "Match broken"),
            None => {
                let current = self.require_match(match_id).await?;
                tracing::debug!(%match_id, state = current.state.as_str(), "Break ignored, match already settled");
            }
        }
        Ok(())
    }

    async fn fetch_session(&self, session_id: DbId) -> RemoteResult<Session> {
        self.require_session(session_id).await
    }

    async fn fetch_match(&self, match_id: DbId) -> RemoteResult<Match> {
        self.require_match(match_id).await
    }

    async fn list_participants(&self, session_id: DbId) -> RemoteResult<Vec<Participant>> {
        self.require_session(session_id).await?;
        Ok(self.store.list_participants(session_id).await?)
    }
}
