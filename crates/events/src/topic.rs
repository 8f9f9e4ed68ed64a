//! Channel names and the events they carry.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tandem_core::matching::{BrokenReason, MatchState};
use tandem_core::presence::PresenceSnapshot;
use tandem_core::session::ParticipantStatus;
use tandem_core::types::DbId;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `match:{id}`: match row updates.
    Match(DbId),
    /// `session:{id}`: presence track/leave and participant row updates.
    Session(DbId),
}

impl Topic {
    pub fn parse(value: &str) -> Option<Self> {
        let (kind, id) = value.split_once(':')?;
        let id = id.parse::<DbId>().ok()?;
        match kind {
            "match" => Some(Topic::Match(id)),
            "session" => Some(Topic::Session(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Match(id) => write!(f, "match:{id}"),
            Topic::Session(id) => write!(f, "session:{id}"),
        }
    }
}

// Topics travel as their display form, e.g. `"match:0190…"`.
impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(&raw).ok_or_else(|| de::Error::custom(format!("unknown topic '{raw}'")))
    }
}

// ---------------------------------------------------------------------------
// ChannelEvent
// ---------------------------------------------------------------------------

/// Everything that travels over a push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    /// A match row was updated.
    #[serde(rename = "match.updated")]
    MatchUpdated {
        match_id: DbId,
        state: MatchState,
        broken_reason: Option<BrokenReason>,
    },

    /// A participant row was updated.
    #[serde(rename = "participant.updated")]
    ParticipantUpdated {
        session_id: DbId,
        user_id: DbId,
        status: ParticipantStatus,
    },

    /// A participant published a fresh presence snapshot.
    #[serde(rename = "presence.track")]
    PresenceTrack { snapshot: PresenceSnapshot },

    /// A participant's channel went away.
    #[serde(rename = "presence.leave")]
    PresenceLeave { user_id: DbId },
}
