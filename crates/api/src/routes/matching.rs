use axum::routing::{get, post};
use axum::Router;

use crate::handlers::matching;
use crate::state::AppState;

/// Routes mounted at `/matches`.
///
/// ```text
/// POST   /pair                   -> pair
/// POST   /requeue                -> requeue
/// GET    /{id}                   -> get_by_id
/// POST   /{id}/heartbeat         -> heartbeat
/// POST   /{id}/ready             -> ready
/// POST   /{id}/break             -> break_match
/// POST   /{id}/seat              -> seat
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pair", post(matching::pair))
        .route("/requeue", post(matching::requeue))
        .route("/{id}", get(matching::get_by_id))
        .route("/{id}/heartbeat", post(matching::heartbeat))
        .route("/{id}/ready", post(matching::ready))
        .route("/{id}/break", post(matching::break_match))
        .route("/{id}/seat", post(matching::seat))
}
