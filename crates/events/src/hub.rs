//! In-process channel hub backed by `tokio::sync::broadcast`.
//!
//! [`ChannelHub`] keeps one broadcast sender per [`Topic`] plus the latest
//! presence snapshot of everyone tracked on a `session:{id}` topic, so a
//! participant who joins late receives a sync of who is already there. It is
//! designed to be shared via `Arc<ChannelHub>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tandem_core::feed::ChangeFeed;
use tandem_core::matching::Match;
use tandem_core::presence::PresenceSnapshot;
use tandem_core::session::Participant;
use tandem_core::types::DbId;
use tokio::sync::broadcast;

use crate::topic::{ChannelEvent, Topic};

/// Default buffer capacity for each topic's broadcast channel.
const DEFAULT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// PushChannels
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The hub has been shut down; no further traffic is accepted.
    #[error("Channel hub is closed")]
    Closed,

    /// The push connection to the server could not be opened.
    #[error("Push connection failed: {0}")]
    Connection(String),
}

/// Subscribe/publish seam consumed by the client engine.
pub trait PushChannels: Send + Sync {
    /// Receive every event published on `topic` from now on.
    fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<ChannelEvent>, ChannelError>;

    /// Publish an event to every current subscriber of `topic`.
    fn publish(&self, topic: &Topic, event: ChannelEvent) -> Result<(), ChannelError>;

    /// Latest presence snapshot of everyone currently tracked on `topic`.
    fn presence_sync(&self, topic: &Topic) -> Vec<PresenceSnapshot>;
}

// ---------------------------------------------------------------------------
// ChannelHub
// ---------------------------------------------------------------------------

struct TopicState {
    sender: broadcast::Sender<ChannelEvent>,
    presence: HashMap<DbId, PresenceSnapshot>,
}

pub struct ChannelHub {
    topics: RwLock<HashMap<Topic, TopicState>>,
    capacity: usize,
    closed: AtomicBool,
}

impl ChannelHub {
    /// Create a hub whose topics buffer up to `capacity` events.
    ///
    /// A subscriber that falls further behind observes
    /// `RecvError::Lagged` and skips ahead.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of topics with live state.
    pub fn topic_count(&self) -> usize {
        self.read().len()
    }

    /// Whether `topic` still has live state in this hub.
    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.read().contains_key(topic)
    }

    /// Drop topics nobody listens to and nobody is tracked on.
    pub fn prune(&self) -> usize {
        let mut topics = self.write();
        let before = topics.len();
        topics.retain(|_, state| state.sender.receiver_count() > 0 || !state.presence.is_empty());
        before - topics.len()
    }

    /// Close every channel. Subscribers observe `RecvError::Closed`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut topics = self.write();
        let count = topics.len();
        topics.clear();
        tracing::info!(count, "Closed all push channels");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Topic, TopicState>> {
        self.topics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Topic, TopicState>> {
        self.topics.write().unwrap_or_else(|e| e.into_inner())
    }

    fn new_topic(&self) -> TopicState {
        let (sender, _) = broadcast::channel(self.capacity);
        TopicState {
            sender,
            presence: HashMap::new(),
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PushChannels for ChannelHub {
    fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<ChannelEvent>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut topics = self.write();
        let state = topics.entry(*topic).or_insert_with(|| self.new_topic());
        Ok(state.sender.subscribe())
    }

    fn publish(&self, topic: &Topic, event: ChannelEvent) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut topics = self.write();
        let state = topics.entry(*topic).or_insert_with(|| self.new_topic());

        match &event {
            ChannelEvent::PresenceTrack { snapshot } => {
                state.presence.insert(snapshot.user_id, snapshot.clone());
            }
            ChannelEvent::PresenceLeave { user_id } => {
                state.presence.remove(user_id);
            }
            _ => {}
        }

        // A SendError only means there are zero receivers right now.
        let _ = state.sender.send(event);
        Ok(())
    }

    fn presence_sync(&self, topic: &Topic) -> Vec<PresenceSnapshot> {
        self.read()
            .get(topic)
            .map(|state| state.presence.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl ChangeFeed for ChannelHub {
    fn match_changed(&self, row: &Match) {
        let event = ChannelEvent::MatchUpdated {
            match_id: row.id,
            state: row.state,
            broken_reason: row.broken_reason,
        };
        if let Err(e) = self.publish(&Topic::Match(row.id), event) {
            tracing::debug!(match_id = %row.id, error = %e, "Dropped match update");
        }
    }

    fn participant_changed(&self, row: &Participant) {
        let event = ChannelEvent::ParticipantUpdated {
            session_id: row.session_id,
            user_id: row.user_id,
            status: row.status,
        };
        if let Err(e) = self.publish(&Topic::Session(row.session_id), event) {
            tracing::debug!(
                session_id = %row.session_id,
                user_id = %row.user_id,
                error = %e,
                "Dropped participant update"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
