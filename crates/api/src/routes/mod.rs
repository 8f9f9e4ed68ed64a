pub mod beacon;
pub mod health;
pub mod matching;
pub mod session;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /sessions/...                                    session procedures
/// /matches/...                                     match procedures, matchmaking stand-ins
/// /beacon/sessions/...                             unload beacons
/// /ws                                              push connection upgrade
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/sessions", session::router())
        .nest("/matches", matching::router())
        .nest("/beacon/sessions", beacon::router())
        .route("/ws", get(ws::ws_handler))
}
