//! Match heartbeat monitor.
//!
//! Two sources report the state of one match: a `match_heartbeat` poll on a
//! fixed interval and pushes on `match:{id}`. Both feed a single
//! [`MatchReconciler`], so whichever arrives first wins and a late or stale
//! report can never move the match backwards. The monitor stops on its own
//! once the match reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::matching::{BrokenReason, MatchReconciler, MatchState, MatchTransition};
use tandem_core::remote::RemoteProcedures;
use tandem_core::types::DbId;
use tandem_events::{ChannelError, ChannelEvent, PushChannels, Topic};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// `preparing -> active`: both participants are ready.
    Active,
    Broken(BrokenReason),
    Completed,
    /// The poll's view of the partner changed.
    PartnerAlive(bool),
}

pub struct HeartbeatMonitor {
    remote: Arc<dyn RemoteProcedures>,
    match_id: DbId,
    user_id: DbId,
    interval: Duration,
    reconciler: MatchReconciler,
    partner_alive: Option<bool>,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl HeartbeatMonitor {
    /// Subscribe to the match topic and build the monitor task.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        remote: Arc<dyn RemoteProcedures>,
        channels: &dyn PushChannels,
        match_id: DbId,
        user_id: DbId,
        initial: MatchState,
        interval: Duration,
        events: mpsc::UnboundedSender<MonitorEvent>,
        cancel: CancellationToken,
    ) -> Result<impl std::future::Future<Output = ()> + Send + 'static, ChannelError> {
        let rx = channels.subscribe(&Topic::Match(match_id))?;
        let monitor = Self {
            remote,
            match_id,
            user_id,
            interval,
            reconciler: MatchReconciler::new(initial),
            partner_alive: None,
            events,
        };
        Ok(monitor.run(rx, cancel))
    }

    async fn run(mut self, rx: broadcast::Receiver<ChannelEvent>, cancel: CancellationToken) {
        let mut rx = Some(rx);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.reconciler.state().is_terminal() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(match_id = %self.match_id, "Heartbeat monitor cancelled");
                    return;
                }
                _ = interval.tick() => self.poll().await,
                event = recv_opt(&mut rx) => match event {
                    Ok(ChannelEvent::MatchUpdated { match_id, state, broken_reason })
                        if match_id == self.match_id =>
                    {
                        self.apply(state, broken_reason);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        // The next poll covers whatever was skipped.
                        tracing::debug!(match_id = %self.match_id, skipped, "Match receiver lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!(match_id = %self.match_id, "Match channel closed, polling only");
                        rx = None;
                    }
                },
            }
        }

        tracing::info!(
            match_id = %self.match_id,
            state = self.reconciler.state().as_str(),
            "Match settled, heartbeat stopped"
        );
    }

    async fn poll(&mut self) {
        match self.remote.match_heartbeat(self.match_id, self.user_id).await {
            Ok(report) => {
                if self.partner_alive != Some(report.partner_alive) {
                    self.partner_alive = Some(report.partner_alive);
                    self.emit(MonitorEvent::PartnerAlive(report.partner_alive));
                }
                self.apply(report.match_state, report.broken_reason);
            }
            Err(e) => {
                // Retried on the next scheduled tick only.
                tracing::warn!(match_id = %self.match_id, error = %e, "Heartbeat failed");
            }
        }
    }

    fn apply(&mut self, state: MatchState, reason: Option<BrokenReason>) {
        let Some(MatchTransition { from, to, broken_reason }) = self.reconciler.observe(state, reason)
        else {
            return;
        };
        tracing::info!(
            match_id = %self.match_id,
            from = from.as_str(),
            to = to.as_str(),
            "Match state changed"
        );
        match to {
            MatchState::Active => self.emit(MonitorEvent::Active),
            MatchState::Completed => self.emit(MonitorEvent::Completed),
            MatchState::Broken => self.emit(MonitorEvent::Broken(
                broken_reason.unwrap_or(BrokenReason::PartnerTimeout),
            )),
            MatchState::Preparing => {}
        }
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }
}

async fn recv_opt(
    rx: &mut Option<broadcast::Receiver<ChannelEvent>>,
) -> Result<ChannelEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tandem_core::matching::{HeartbeatReport, Match, ReadyReport};
    use tandem_core::remote::{CompletionOutcome, RemoteError, RemoteResult};
    use tandem_core::session::{Participant, Session, SessionMode};
    use tandem_events::ChannelHub;

    /// Answers every heartbeat with a scripted report.
    struct ScriptedHeartbeat {
        report: Mutex<RemoteResult<HeartbeatReport>>,
        calls: AtomicUsize,
    }

    impl ScriptedHeartbeat {
        fn new(state: MatchState) -> Self {
            Self {
                report: Mutex::new(Ok(HeartbeatReport {
                    partner_alive: true,
                    match_state: state,
                    broken_reason: None,
                })),
                calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, report: RemoteResult<HeartbeatReport>) {
            *self.report.lock().unwrap() = report;
        }
    }

    fn unused<T>() -> RemoteResult<T> {
        Err(RemoteError::Malformed("not scripted".into()))
    }

    #[async_trait]
    impl RemoteProcedures for ScriptedHeartbeat {
        async fn create_session(&self, _: DbId, _: u32, _: SessionMode) -> RemoteResult<DbId> {
            unused()
        }
        async fn transition_session_to_active(&self, _: DbId) -> RemoteResult<Session> {
            unused()
        }
        async fn complete_session(&self, _: DbId, _: DbId, _: bool) -> RemoteResult<CompletionOutcome> {
            unused()
        }
        async fn record_early_exit(&self, _: DbId, _: DbId, _: u32, _: u32) -> RemoteResult<()> {
            unused()
        }
        async fn match_heartbeat(&self, _: DbId, _: DbId) -> RemoteResult<HeartbeatReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.report.lock().unwrap() {
                Ok(report) => Ok(*report),
                Err(_) => Err(RemoteError::Network("connection reset".into())),
            }
        }
        async fn mark_match_ready(&self, _: DbId, _: DbId) -> RemoteResult<ReadyReport> {
            unused()
        }
        async fn requeue_after_break(&self, _: DbId, _: u32, _: &str) -> RemoteResult<DbId> {
            unused()
        }
        async fn break_match(&self, _: DbId, _: BrokenReason) -> RemoteResult<()> {
            unused()
        }
        async fn fetch_session(&self, _: DbId) -> RemoteResult<Session> {
            unused()
        }
        async fn fetch_match(&self, _: DbId) -> RemoteResult<Match> {
            unused()
        }
        async fn list_participants(&self, _: DbId) -> RemoteResult<Vec<Participant>> {
            unused()
        }
    }

    struct Running {
        remote: Arc<ScriptedHeartbeat>,
        hub: Arc<ChannelHub>,
        match_id: DbId,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
        join: tokio::task::JoinHandle<()>,
        cancel: CancellationToken,
    }

    fn spawn_monitor(initial: MatchState) -> Running {
        let remote = Arc::new(ScriptedHeartbeat::new(initial));
        let hub = Arc::new(ChannelHub::default());
        let match_id = uuid::Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = HeartbeatMonitor::start(
            remote.clone(),
            hub.as_ref(),
            match_id,
            uuid::Uuid::now_v7(),
            initial,
            Duration::from_secs(5),
            tx,
            cancel.clone(),
        )
        .unwrap();
        Running {
            remote,
            hub,
            match_id,
            events: rx,
            join: tokio::spawn(task),
            cancel,
        }
    }

    fn push(run: &Running, state: MatchState, reason: Option<BrokenReason>) {
        run.hub
            .publish(
                &Topic::Match(run.match_id),
                ChannelEvent::MatchUpdated {
                    match_id: run.match_id,
                    state,
                    broken_reason: reason,
                },
            )
            .unwrap();
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Option<MonitorEvent> {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn push_applies_before_next_poll() {
        let mut run = spawn_monitor(MatchState::Preparing);
        assert_eq!(next(&mut run.events).await, Some(MonitorEvent::PartnerAlive(true)));

        push(&run, MatchState::Active, None);
        assert_eq!(next(&mut run.events).await, Some(MonitorEvent::Active));
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn broken_is_never_reverted_by_later_pushes() {
        let mut run = spawn_monitor(MatchState::Active);
        next(&mut run.events).await;

        push(&run, MatchState::Broken, Some(BrokenReason::PartnerTimeout));
        push(&run, MatchState::Active, None);
        push(&run, MatchState::Active, None);

        assert_eq!(
            next(&mut run.events).await,
            Some(MonitorEvent::Broken(BrokenReason::PartnerTimeout))
        );
        // The monitor stops on the terminal state: nothing else arrives.
        run.join.await.unwrap();
        assert_eq!(next(&mut run.events).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reports_break_and_stops_polling() {
        let mut run = spawn_monitor(MatchState::Preparing);
        next(&mut run.events).await;

        run.remote.set(Ok(HeartbeatReport {
            partner_alive: false,
            match_state: MatchState::Broken,
            broken_reason: Some(BrokenReason::PartnerTimeout),
        }));
        assert_eq!(next(&mut run.events).await, Some(MonitorEvent::PartnerAlive(false)));
        assert_matches!(
            next(&mut run.events).await,
            Some(MonitorEvent::Broken(BrokenReason::PartnerTimeout))
        );

        run.join.await.unwrap();
        let calls = run.remote.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(run.remote.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_retried_on_next_tick() {
        let mut run = spawn_monitor(MatchState::Preparing);
        next(&mut run.events).await;
        run.remote.set(Err(RemoteError::Network("down".into())));

        tokio::time::sleep(Duration::from_secs(11)).await;
        let failed_calls = run.remote.calls.load(Ordering::SeqCst);
        assert!(failed_calls >= 3);

        run.remote.set(Ok(HeartbeatReport {
            partner_alive: true,
            match_state: MatchState::Active,
            broken_reason: None,
        }));
        assert_eq!(next(&mut run.events).await, Some(MonitorEvent::Active));
        run.cancel.cancel();
        run.join.await.unwrap();
    }
}
