//! Presence broadcaster for one session.
//!
//! Publishes the local participant's snapshot on `session:{id}` every
//! `presence_interval` and right after each classifier change, and keeps
//! the latest snapshot received from the counterpart. Publishing is fire
//! and forget: a failed `track` is logged and the next interval tries again.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::clock::Clock;
use tandem_core::presence::{PresenceClassifier, PresenceSnapshot, PresenceStatus};
use tandem_core::types::{DbId, Timestamp};
use tandem_events::{ChannelEvent, ChannelError, PushChannels, Topic};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Identity the local participant shows to their partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceProfile {
    pub user_id: DbId,
    pub avatar_id: String,
    pub display_name: String,
    pub goal_text: String,
}

impl PresenceProfile {
    pub fn snapshot(&self, status: PresenceStatus, now: Timestamp) -> PresenceSnapshot {
        PresenceSnapshot {
            user_id: self.user_id,
            avatar_id: self.avatar_id.clone(),
            display_name: self.display_name.clone(),
            status,
            goal_text: self.goal_text.clone(),
            last_heartbeat: now.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PresenceInput {
    Activity,
    Visibility(bool),
}

/// Handle to a running broadcaster. Cheap to clone.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    inputs: mpsc::UnboundedSender<PresenceInput>,
    local: watch::Receiver<PresenceStatus>,
    partner: watch::Receiver<Option<PresenceSnapshot>>,
}

impl PresenceBroadcaster {
    /// Subscribe to the session topic and build the broadcaster task.
    ///
    /// The returned future runs until `cancel` fires, then publishes a
    /// leave for the local participant.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        channels: Arc<dyn PushChannels>,
        clock: Arc<dyn Clock>,
        session_id: DbId,
        profile: PresenceProfile,
        idle_after: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(Self, impl std::future::Future<Output = ()> + Send + 'static), ChannelError> {
        let topic = Topic::Session(session_id);
        let rx = channels.subscribe(&topic)?;

        let initial_partner = channels
            .presence_sync(&topic)
            .into_iter()
            .find(|s| s.user_id != profile.user_id);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = watch::channel(PresenceStatus::Active);
        let (partner_tx, partner_rx) = watch::channel(initial_partner);

        let worker = Worker {
            channels,
            clock,
            topic,
            profile,
            classifier: PresenceClassifier::new(idle_after, Instant::now().into_std()),
            interval,
            local: local_tx,
            partner: partner_tx,
        };

        let handle = Self {
            inputs: input_tx,
            local: local_rx,
            partner: partner_rx,
        };
        Ok((handle, worker.run(rx, input_rx, cancel)))
    }

    /// Pointer, key, touch or scroll input.
    pub fn record_activity(&self) {
        let _ = self.inputs.send(PresenceInput::Activity);
    }

    pub fn set_visibility(&self, visible: bool) {
        let _ = self.inputs.send(PresenceInput::Visibility(visible));
    }

    /// The local participant's current classification.
    pub fn status(&self) -> PresenceStatus {
        *self.local.borrow()
    }

    /// Latest counterpart snapshot, `None` once they disconnect.
    pub fn partner(&self) -> Option<PresenceSnapshot> {
        self.partner.borrow().clone()
    }

    /// Change notifications for the counterpart snapshot.
    pub fn on_partner_snapshot(&self) -> watch::Receiver<Option<PresenceSnapshot>> {
        self.partner.clone()
    }
}

struct Worker {
    channels: Arc<dyn PushChannels>,
    clock: Arc<dyn Clock>,
    topic: Topic,
    profile: PresenceProfile,
    classifier: PresenceClassifier,
    interval: Duration,
    local: watch::Sender<PresenceStatus>,
    partner: watch::Sender<Option<PresenceSnapshot>>,
}

impl Worker {
    async fn run(
        mut self,
        rx: broadcast::Receiver<ChannelEvent>,
        mut inputs: mpsc::UnboundedReceiver<PresenceInput>,
        cancel: CancellationToken,
    ) {
        let mut rx = Some(rx);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let idle_at = self
                .classifier
                .idle_deadline()
                .filter(|_| *self.local.borrow() == PresenceStatus::Active)
                .map(Instant::from_std);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.refresh();
                    self.track();
                }
                Some(input) = inputs.recv() => {
                    let now = Instant::now().into_std();
                    match input {
                        PresenceInput::Activity => self.classifier.record_activity(now),
                        PresenceInput::Visibility(visible) => {
                            self.classifier.set_visibility(visible, now)
                        }
                    }
                    if self.refresh() {
                        self.track();
                    }
                }
                _ = sleep_until_opt(idle_at) => {
                    if self.refresh() {
                        self.track();
                    }
                }
                event = recv_opt(&mut rx) => match event {
                    Ok(event) => self.on_channel_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(topic = %self.topic, skipped, "Presence receiver lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!(topic = %self.topic, "Presence channel closed");
                        self.partner.send_replace(None);
                        rx = None;
                    }
                },
            }
        }

        let leave = ChannelEvent::PresenceLeave {
            user_id: self.profile.user_id,
        };
        if let Err(e) = self.channels.publish(&self.topic, leave) {
            tracing::debug!(topic = %self.topic, error = %e, "Presence leave not delivered");
        }
    }

    /// Recompute the local status. Returns whether it changed.
    fn refresh(&mut self) -> bool {
        let status = self.classifier.status_at(Instant::now().into_std());
        self.local.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    fn track(&self) {
        let snapshot = self.profile.snapshot(*self.local.borrow(), self.clock.now());
        if let Err(e) = self
            .channels
            .publish(&self.topic, ChannelEvent::PresenceTrack { snapshot })
        {
            tracing::warn!(topic = %self.topic, error = %e, "Presence track failed");
        }
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::PresenceTrack { snapshot } if snapshot.user_id != self.profile.user_id => {
                self.partner.send_replace(Some(snapshot));
            }
            ChannelEvent::PresenceLeave { user_id } if user_id != self.profile.user_id => {
                self.partner.send_replace(None);
            }
            _ => {}
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
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
    use chrono::Utc;
    use tandem_core::clock::ManualClock;
    use tandem_events::ChannelHub;

    fn profile(name: &str) -> PresenceProfile {
        PresenceProfile {
            user_id: uuid::Uuid::now_v7(),
            avatar_id: "owl".into(),
            display_name: name.into(),
            goal_text: "finish chapter 3".into(),
        }
    }

    fn start(
        hub: &Arc<ChannelHub>,
        session_id: DbId,
        profile: PresenceProfile,
        cancel: &CancellationToken,
    ) -> PresenceBroadcaster {
        start_with_clock(hub, Arc::new(ManualClock::new(Utc::now())), session_id, profile, cancel)
    }

    fn start_with_clock(
        hub: &Arc<ChannelHub>,
        clock: Arc<dyn Clock>,
        session_id: DbId,
        profile: PresenceProfile,
        cancel: &CancellationToken,
    ) -> PresenceBroadcaster {
        let (handle, task) = PresenceBroadcaster::start(
            hub.clone(),
            clock,
            session_id,
            profile,
            Duration::from_secs(60),
            Duration::from_secs(10),
            cancel.clone(),
        )
        .unwrap();
        tokio::spawn(task);
        handle
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partners_see_each_other() {
        let hub = Arc::new(ChannelHub::default());
        let session_id = uuid::Uuid::now_v7();
        let cancel = CancellationToken::new();
        let ada = profile("Ada");
        let bo = profile("Bo");

        let a = start(&hub, session_id, ada.clone(), &cancel);
        let b = start(&hub, session_id, bo.clone(), &cancel);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(a.partner().map(|s| s.user_id), Some(bo.user_id));
        assert_eq!(b.partner().map(|s| s.user_id), Some(ada.user_id));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_participant_turns_idle_and_activity_restores() {
        let hub = Arc::new(ChannelHub::default());
        let session_id = uuid::Uuid::now_v7();
        let cancel = CancellationToken::new();
        let a = start(&hub, session_id, profile("Ada"), &cancel);
        settle().await;
        assert_eq!(a.status(), PresenceStatus::Active);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(a.status(), PresenceStatus::Active);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(a.status(), PresenceStatus::Idle);

        a.record_activity();
        settle().await;
        assert_eq!(a.status(), PresenceStatus::Active);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_page_is_away_at_once_and_published() {
        let hub = Arc::new(ChannelHub::default());
        let session_id = uuid::Uuid::now_v7();
        let cancel = CancellationToken::new();
        let ada = profile("Ada");
        let a = start(&hub, session_id, ada.clone(), &cancel);
        settle().await;

        a.set_visibility(false);
        settle().await;
        assert_eq!(a.status(), PresenceStatus::Away);

        let synced = hub.presence_sync(&Topic::Session(session_id));
        let mine = synced.iter().find(|s| s.user_id == ada.user_id).unwrap();
        assert_eq!(mine.status, PresenceStatus::Away);

        a.set_visibility(true);
        settle().await;
        assert_eq!(a.status(), PresenceStatus::Active);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_stamped_by_the_injected_clock() {
        let hub = Arc::new(ChannelHub::default());
        let session_id = uuid::Uuid::now_v7();
        let cancel = CancellationToken::new();
        let ada = profile("Ada");
        let t0 = Utc::now() - chrono::Duration::days(3);
        let clock = Arc::new(ManualClock::new(t0));

        let _a = start_with_clock(&hub, clock.clone(), session_id, ada.clone(), &cancel);
        settle().await;
        let synced = hub.presence_sync(&Topic::Session(session_id));
        assert_eq!(synced[0].last_heartbeat, t0.timestamp_millis());

        clock.advance(chrono::Duration::seconds(30));
        tokio::time::sleep(Duration::from_secs(11)).await;
        let synced = hub.presence_sync(&Topic::Session(session_id));
        assert_eq!(
            synced[0].last_heartbeat,
            (t0 + chrono::Duration::seconds(30)).timestamp_millis()
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn partner_leave_clears_snapshot() {
        let hub = Arc::new(ChannelHub::default());
        let session_id = uuid::Uuid::now_v7();
        let a_cancel = CancellationToken::new();
        let b_cancel = CancellationToken::new();

        let a = start(&hub, session_id, profile("Ada"), &a_cancel);
        let _b = start(&hub, session_id, profile("Bo"), &b_cancel);
        settle().await;
        assert!(a.partner().is_some());

        b_cancel.cancel();
        settle().await;
        assert!(a.partner().is_none());
        a_cancel.cancel();
    }
}
