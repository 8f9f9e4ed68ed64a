//! Frames exchanged over the `/ws` push connection.
//!
//! A client subscribes to topics and publishes its own presence; the server
//! forwards every event of a subscribed topic. Both directions are JSON text
//! frames tagged by `op`.

use serde::{Deserialize, Serialize};

use crate::topic::{ChannelEvent, Topic};

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    /// Only presence track/leave is accepted from clients.
    Publish { topic: Topic, event: ChannelEvent },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Event { topic: Topic, event: ChannelEvent },
    Error { message: String },
}

impl ChannelEvent {
    /// Whether a client may publish this event itself.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            ChannelEvent::PresenceTrack { .. } | ChannelEvent::PresenceLeave { .. }
        )
    }
}
