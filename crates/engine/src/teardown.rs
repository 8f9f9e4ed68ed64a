//! Best-effort cleanup fired while the page unloads.
//!
//! Two beacons go out: one asking the server to abandon the session, one
//! marking the local participant `left_early`. The server applies each only
//! while the row is still `waiting` or `active`. Nothing is awaited and
//! nothing is retried; a beacon lost with the page is accepted.

use std::sync::Arc;

use tandem_core::remote::{Beacon, BeaconRequest};
use tandem_core::types::DbId;

#[derive(Clone)]
pub struct TeardownGuard {
    beacon: Arc<dyn Beacon>,
}

impl TeardownGuard {
    pub fn new(beacon: Arc<dyn Beacon>) -> Self {
        Self { beacon }
    }

    /// Fire both beacons for `session_id`. Returns the number sent.
    pub fn fire(&self, session_id: DbId, user_id: DbId) -> usize {
        let requests = [
            BeaconRequest::AbandonSession { session_id },
            BeaconRequest::LeaveSession {
                session_id,
                user_id,
            },
        ];
        for request in requests {
            self.beacon.send(request);
        }
        tracing::info!(%session_id, %user_id, "Unload beacons sent");
        requests.len()
    }
}
