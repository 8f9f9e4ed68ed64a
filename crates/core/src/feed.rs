//! Notification seam for row changes.
//!
//! The store-backed procedures report every match and participant row they
//! change; the push-channel hub turns those reports into `match:{id}` and
//! `session:{id}` events.

use crate::matching::Match;
use crate::session::Participant;

pub trait ChangeFeed: Send + Sync {
    fn match_changed(&self, row: &Match);

    fn participant_changed(&self, row: &Participant);
}

/// Feed that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFeed;

impl ChangeFeed for NoopFeed {
    fn match_changed(&self, _row: &Match) {}

    fn participant_changed(&self, _row: &Participant) {}
}
